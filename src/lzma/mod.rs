mod decoder;
mod lz;
mod lzma2_reader;
mod lzma_reader;
mod range_codec;
mod state;

pub use lzma2_reader::dict_size_from_prop as lzma2_dict_size;
pub use lzma2_reader::get_memory_usage as lzma2_get_memory_usage;
pub use lzma2_reader::Lzma2Reader;
pub use lzma_reader::get_memory_usage as lzma_get_memory_usage;
pub use lzma_reader::get_memory_usage_by_props as lzma_get_memory_usage_by_props;
pub use lzma_reader::LzmaReader;

pub(crate) use decoder::LzmaDecoder;
pub(crate) use lz::LzDecoder;
pub(crate) use range_codec::{RangeDecoder, RangeDecoderBuffer};
use state::*;

pub const DICT_SIZE_MIN: u32 = 4096;
pub const DICT_SIZE_MAX: u32 = u32::MAX & !15;

const LOW_SYMBOLS: usize = 1 << 3;
const MID_SYMBOLS: usize = 1 << 3;
const HIGH_SYMBOLS: usize = 1 << 8;

const POS_STATES_MAX: usize = 1 << 4;
const MATCH_LEN_MIN: usize = 2;

const DIST_STATES: usize = 4;
const DIST_SLOTS: usize = 1 << 6;
const DIST_MODEL_START: usize = 4;
const DIST_MODEL_END: usize = 14;

const ALIGN_BITS: usize = 4;
const ALIGN_SIZE: usize = 1 << ALIGN_BITS;

const REPS: usize = 4;

const SHIFT_BITS: u32 = 8;
const TOP_MASK: u32 = 0xFF00_0000;
const BIT_MODEL_TOTAL_BITS: u32 = 11;
const BIT_MODEL_TOTAL: u32 = 1 << BIT_MODEL_TOTAL_BITS;
const PROB_INIT: u16 = (BIT_MODEL_TOTAL / 2) as u16;
const MOVE_BITS: u32 = 5;

/// Probability banks shared by every LZMA decode path.
#[derive(Debug)]
pub(crate) struct LzmaCoder {
    pub(crate) pos_mask: u32,
    pub(crate) reps: [i32; REPS],
    pub(crate) state: State,
    pub(crate) is_match: [[u16; POS_STATES_MAX]; STATES],
    pub(crate) is_rep: [u16; STATES],
    pub(crate) is_rep0: [u16; STATES],
    pub(crate) is_rep1: [u16; STATES],
    pub(crate) is_rep2: [u16; STATES],
    pub(crate) is_rep0_long: [[u16; POS_STATES_MAX]; STATES],
    pub(crate) dist_slots: [[u16; DIST_SLOTS]; DIST_STATES],
    dist_special: (
        [u16; 2],
        [u16; 2],
        [u16; 4],
        [u16; 4],
        [u16; 8],
        [u16; 8],
        [u16; 16],
        [u16; 16],
        [u16; 32],
        [u16; 32],
    ),
    pub(crate) dist_align: [u16; ALIGN_SIZE],
}

/// Distance-slot bank selection by match length.
pub(crate) fn dist_state(len: usize) -> usize {
    if len < DIST_STATES + MATCH_LEN_MIN {
        len - MATCH_LEN_MIN
    } else {
        DIST_STATES - 1
    }
}

impl LzmaCoder {
    pub fn new(pb: u32) -> Self {
        let mut c = Self {
            pos_mask: (1 << pb) - 1,
            reps: Default::default(),
            state: Default::default(),
            is_match: Default::default(),
            is_rep: Default::default(),
            is_rep0: Default::default(),
            is_rep1: Default::default(),
            is_rep2: Default::default(),
            is_rep0_long: Default::default(),
            dist_slots: [[0; DIST_SLOTS]; DIST_STATES],
            dist_special: Default::default(),
            dist_align: Default::default(),
        };
        c.reset();
        c
    }

    pub fn reset(&mut self) {
        self.reps = [0; REPS];
        self.state.reset();
        for ele in self.is_match.iter_mut() {
            init_probs(ele);
        }
        init_probs(&mut self.is_rep);
        init_probs(&mut self.is_rep0);
        init_probs(&mut self.is_rep1);
        init_probs(&mut self.is_rep2);
        for ele in self.is_rep0_long.iter_mut() {
            init_probs(ele);
        }
        for ele in self.dist_slots.iter_mut() {
            init_probs(ele);
        }
        for i in 0..DIST_MODEL_END - DIST_MODEL_START {
            init_probs(self.dist_special(i));
        }
        init_probs(&mut self.dist_align);
    }

    /// Reverse bit-tree bank for dist slots 4..14, one per slot.
    pub fn dist_special(&mut self, i: usize) -> &mut [u16] {
        match i {
            0 => &mut self.dist_special.0,
            1 => &mut self.dist_special.1,
            2 => &mut self.dist_special.2,
            3 => &mut self.dist_special.3,
            4 => &mut self.dist_special.4,
            5 => &mut self.dist_special.5,
            6 => &mut self.dist_special.6,
            7 => &mut self.dist_special.7,
            8 => &mut self.dist_special.8,
            9 => &mut self.dist_special.9,
            _ => unreachable!("dist slot out of range"),
        }
    }
}

#[inline(always)]
pub(crate) fn init_probs(probs: &mut [u16]) {
    probs.fill(PROB_INIT);
}

#[derive(Debug)]
pub(crate) struct LiteralCoder {
    lc: u32,
    literal_pos_mask: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct LiteralSubcoder {
    probs: [u16; 0x300],
}

impl LiteralSubcoder {
    pub fn new() -> Self {
        Self {
            probs: [PROB_INIT; 0x300],
        }
    }

    pub fn reset(&mut self) {
        init_probs(&mut self.probs);
    }
}

impl LiteralCoder {
    pub fn new(lc: u32, lp: u32) -> Self {
        Self {
            lc,
            literal_pos_mask: (1 << lp) - 1,
        }
    }

    pub(crate) fn sub_coder_index(&self, prev_byte: u32, pos: u32) -> u32 {
        let low = prev_byte >> (8 - self.lc);
        let high = (pos & self.literal_pos_mask) << self.lc;
        low + high
    }
}

#[derive(Debug)]
pub(crate) struct LengthCoder {
    choice: [u16; 2],
    low: [[u16; LOW_SYMBOLS]; POS_STATES_MAX],
    mid: [[u16; MID_SYMBOLS]; POS_STATES_MAX],
    high: [u16; HIGH_SYMBOLS],
}

impl LengthCoder {
    pub fn new() -> Self {
        Self {
            choice: Default::default(),
            low: Default::default(),
            mid: Default::default(),
            high: [0; HIGH_SYMBOLS],
        }
    }

    pub fn reset(&mut self) {
        init_probs(&mut self.choice);
        for ele in self.low.iter_mut() {
            init_probs(ele);
        }
        for ele in self.mid.iter_mut() {
            init_probs(ele);
        }
        init_probs(&mut self.high);
    }
}
