//! PPMd context-model decoders: variant H (7-Zip) and variant I rev.1 (Zip).
//!
//! Both variants share the 12-byte-unit suballocator layout and the SEE
//! (secondary escape estimation) machinery; they differ in context layout,
//! range coder and model-update formulas, so each gets its own module.

mod alloc;
mod model_h;
mod model_i;
mod range_codec;
mod reader;

pub use reader::{PpmdHReader, PpmdIReader};

pub(crate) use alloc::Arena;
pub(crate) use range_codec::{RangeDecoderH, RangeDecoderI};

pub(crate) const UNIT_SIZE: u32 = 12;
pub(crate) const NUM_INDEXES: usize = 38;
pub(crate) const MAX_FREQ: u8 = 124;
pub(crate) const PERIOD_BITS: u32 = 7;
pub(crate) const BIN_SCALE: u32 = 1 << (PERIOD_BITS + 7);

pub(crate) static K_EXP_ESCAPE: [u8; 16] = [25, 14, 9, 7, 5, 5, 4, 4, 4, 3, 3, 3, 2, 2, 2, 2];

pub(crate) static K_INIT_BIN_ESC: [u16; 8] = [
    0x3CDD, 0x1F3F, 0x59BF, 0x48F3, 0x64A1, 0x5ABC, 0x6632, 0x6051,
];

/// Secondary escape estimation cell: an adaptive escape-frequency mean.
#[derive(Copy, Clone, Default, Debug)]
pub(crate) struct See {
    pub summ: u16,
    pub shift: u8,
    pub count: u8,
}

impl See {
    pub fn update(&mut self) {
        if self.shift < PERIOD_BITS as u8 && {
            self.count -= 1;
            self.count == 0
        } {
            self.summ <<= 1;
            let shift = self.shift;
            self.shift += 1;
            self.count = 3 << shift;
        }
    }
}

/// Which SEE cell a `make_esc_freq` lookup resolved to, so the follow-up
/// update can find it again without holding a borrow across the decode.
#[derive(Copy, Clone, Debug)]
pub(crate) enum SeeSource {
    Dummy,
    Table(usize, usize),
}

/// Size-class tables: `index2units[i]` is the unit count of class `i`,
/// `units2index[n - 1]` the smallest class holding `n` units.
pub(crate) fn build_unit_tables() -> ([u8; 40], [u8; 128]) {
    let mut index2units = [0u8; 40];
    let mut units2index = [0u8; 128];
    let mut k = 0usize;
    for i in 0..NUM_INDEXES {
        let step = if i >= 12 { 4 } else { (i >> 2) + 1 };
        for _ in 0..step {
            units2index[k] = i as u8;
            k += 1;
        }
        index2units[i] = k as u8;
    }
    (index2units, units2index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_tables_are_consistent() {
        let (index2units, units2index) = build_unit_tables();
        // every possible unit count maps to a class at least that large
        for n in 1..=128usize {
            let i = units2index[n - 1] as usize;
            assert!(index2units[i] as usize >= n);
            if i > 0 {
                assert!((index2units[i - 1] as usize) < n);
            }
        }
        assert_eq!(index2units[NUM_INDEXES - 1], 128);
    }

    #[test]
    fn see_update_doubles_and_saturates() {
        let mut see = See {
            summ: 100,
            shift: 3,
            count: 1,
        };
        see.update();
        assert_eq!(see.summ, 200);
        assert_eq!(see.shift, 4);
        assert_eq!(see.count, 3 << 3);

        // at PERIOD_BITS the cell stops adapting
        let mut frozen = See {
            summ: 100,
            shift: PERIOD_BITS as u8,
            count: 64,
        };
        frozen.update();
        assert_eq!(frozen.summ, 100);
        assert_eq!(frozen.count, 64);
    }
}
