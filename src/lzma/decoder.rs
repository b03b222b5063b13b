use super::lz::LzDecoder;
use super::range_codec::RangeDecoder;
use super::*;

use std::io::{Read, Result};

/// Token decoder: turns range-coded bits into literals and matches.
///
/// Owns every probability bank; the window and the range decoder are
/// borrowed per call so the surrounding reader keeps ownership of both.
#[derive(Debug)]
pub(crate) struct LzmaDecoder {
    coder: LzmaCoder,
    literal: LiteralDecoder,
    match_len: LengthCoder,
    rep_len: LengthCoder,
    end_reached: bool,
}

impl LzmaDecoder {
    pub fn new(lc: u32, lp: u32, pb: u32) -> Self {
        let mut literal = LiteralDecoder::new(lc, lp);
        literal.reset();
        let mut match_len = LengthCoder::new();
        match_len.reset();
        let mut rep_len = LengthCoder::new();
        rep_len.reset();
        Self {
            coder: LzmaCoder::new(pb),
            literal,
            match_len,
            rep_len,
            end_reached: false,
        }
    }

    /// Full probability reset, as performed between LZMA2 chunks with the
    /// state-reset flag. The window is untouched.
    pub fn reset(&mut self) {
        self.coder.reset();
        self.literal.reset();
        self.match_len.reset();
        self.rep_len.reset();
        self.end_reached = false;
    }

    pub fn end_marker_detected(&self) -> bool {
        self.end_reached
    }

    /// Decodes tokens until the window limit is reached, the end marker is
    /// seen, or input fails.
    pub fn decode<R: Read>(
        &mut self,
        lz: &mut LzDecoder,
        rc: &mut RangeDecoder<R>,
    ) -> Result<()> {
        lz.repeat_pending()?;
        while lz.has_space() {
            let pos_state = lz.pos() as u32 & self.coder.pos_mask;
            let i = self.coder.state.index();
            if rc.decode_bit(&mut self.coder.is_match[i], pos_state as usize)? == 0 {
                self.literal.decode(&mut self.coder, lz, rc)?;
            } else {
                let i = self.coder.state.index();
                let len = if rc.decode_bit(&mut self.coder.is_rep, i)? == 0 {
                    self.decode_match(pos_state, rc)?
                } else {
                    self.decode_rep_match(pos_state, rc)?
                };
                // distance u32::MAX is the end-of-stream marker
                if self.coder.reps[0] == -1 {
                    self.end_reached = true;
                    return Ok(());
                }
                lz.repeat(self.coder.reps[0], len as usize)?;
            }
        }
        rc.normalize()?;
        Ok(())
    }

    fn decode_match<R: Read>(&mut self, pos_state: u32, rc: &mut RangeDecoder<R>) -> Result<u32> {
        self.coder.state.update_match();
        self.coder.reps[3] = self.coder.reps[2];
        self.coder.reps[2] = self.coder.reps[1];
        self.coder.reps[1] = self.coder.reps[0];

        let len = self.match_len.decode(pos_state as usize, rc)?;
        let dist_slot =
            rc.decode_bit_tree(&mut self.coder.dist_slots[dist_state(len as usize)])? as usize;

        if dist_slot < DIST_MODEL_START {
            self.coder.reps[0] = dist_slot as i32;
        } else {
            let limit = (dist_slot >> 1) - 1;
            let mut rep0 = ((2 | (dist_slot & 1)) << limit) as u32;
            if dist_slot < DIST_MODEL_END {
                let probs = self.coder.dist_special(dist_slot - DIST_MODEL_START);
                rep0 |= rc.decode_reverse_bit_tree(probs)?;
            } else {
                rep0 |= rc.decode_direct_bits(limit as u32 - ALIGN_BITS as u32)? << ALIGN_BITS;
                rep0 |= rc.decode_reverse_bit_tree(&mut self.coder.dist_align)?;
            }
            self.coder.reps[0] = rep0 as i32;
        }

        Ok(len)
    }

    fn decode_rep_match<R: Read>(
        &mut self,
        pos_state: u32,
        rc: &mut RangeDecoder<R>,
    ) -> Result<u32> {
        let i = self.coder.state.index();
        if rc.decode_bit(&mut self.coder.is_rep0, i)? == 0 {
            if rc.decode_bit(&mut self.coder.is_rep0_long[i], pos_state as usize)? == 0 {
                self.coder.state.update_short_rep();
                return Ok(1);
            }
        } else {
            let tmp;
            if rc.decode_bit(&mut self.coder.is_rep1, i)? == 0 {
                tmp = self.coder.reps[1];
            } else {
                if rc.decode_bit(&mut self.coder.is_rep2, i)? == 0 {
                    tmp = self.coder.reps[2];
                } else {
                    tmp = self.coder.reps[3];
                    self.coder.reps[3] = self.coder.reps[2];
                }
                self.coder.reps[2] = self.coder.reps[1];
            }
            self.coder.reps[1] = self.coder.reps[0];
            self.coder.reps[0] = tmp;
        }

        self.coder.state.update_long_rep();
        self.rep_len.decode(pos_state as usize, rc)
    }
}

#[derive(Debug)]
struct LiteralDecoder {
    coder: LiteralCoder,
    sub_decoders: Vec<LiteralSubcoder>,
}

impl LiteralDecoder {
    fn new(lc: u32, lp: u32) -> Self {
        Self {
            coder: LiteralCoder::new(lc, lp),
            sub_decoders: vec![LiteralSubcoder::new(); 1 << (lc + lp)],
        }
    }

    fn reset(&mut self) {
        for ele in self.sub_decoders.iter_mut() {
            ele.reset();
        }
    }

    fn decode<R: Read>(
        &mut self,
        coder: &mut LzmaCoder,
        lz: &mut LzDecoder,
        rc: &mut RangeDecoder<R>,
    ) -> Result<()> {
        let i = self
            .coder
            .sub_coder_index(lz.get_byte(0) as u32, lz.pos() as u32);
        let probs = &mut self.sub_decoders[i as usize].probs;

        let mut symbol: u32 = 1;
        if coder.state.is_literal() {
            while symbol < 0x100 {
                symbol = (symbol << 1) | rc.decode_bit(probs, symbol as usize)?;
            }
        } else {
            // Matched literal: follow the byte at the last match distance
            // until the decoded prefix diverges, then decode plainly.
            let mut match_byte = lz.get_byte(coder.reps[0] as usize) as u32;
            let mut offset = 0x100;
            while symbol < 0x100 {
                match_byte <<= 1;
                let match_bit = match_byte & offset;
                let bit = rc.decode_bit(probs, (offset + match_bit + symbol) as usize)?;
                symbol = (symbol << 1) | bit;
                offset &= 0u32.wrapping_sub(bit) ^ !match_bit;
            }
        }
        lz.put_byte(symbol as u8);
        coder.state.update_literal();
        Ok(())
    }
}

impl LengthCoder {
    fn decode<R: Read>(&mut self, pos_state: usize, rc: &mut RangeDecoder<R>) -> Result<u32> {
        if rc.decode_bit(&mut self.choice, 0)? == 0 {
            return Ok(rc.decode_bit_tree(&mut self.low[pos_state])? + MATCH_LEN_MIN as u32);
        }

        if rc.decode_bit(&mut self.choice, 1)? == 0 {
            return Ok(rc.decode_bit_tree(&mut self.mid[pos_state])?
                + (MATCH_LEN_MIN + LOW_SYMBOLS) as u32);
        }

        Ok(rc.decode_bit_tree(&mut self.high)?
            + (MATCH_LEN_MIN + LOW_SYMBOLS + MID_SYMBOLS) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // All-zero payload: every adaptive bit is 0, so each symbol is the
    // literal 0x00 through the plain literal path.
    #[test]
    fn zero_payload_decodes_zero_literals() {
        let mut decoder = LzmaDecoder::new(3, 0, 2);
        let mut lz = LzDecoder::new(1 << 12, None);
        let mut rc = RangeDecoder::new_stream(&[0u8; 32][..]).unwrap();
        lz.set_limit(8);
        decoder.decode(&mut lz, &mut rc).unwrap();
        let mut out = [0xFFu8; 16];
        let n = lz.flush(&mut out, 0);
        assert_eq!(&out[..n], &[0u8; 8]);
        assert!(!decoder.end_marker_detected());
    }

    #[test]
    fn length_bases_line_up() {
        // choice bits both 1 on a stream of 0xFF bytes is not easily forced;
        // instead check the low path base via a zero stream.
        let mut len_coder = LengthCoder::new();
        len_coder.reset();
        let mut rc = RangeDecoder::new_stream(&[0u8; 16][..]).unwrap();
        let len = len_coder.decode(0, &mut rc).unwrap();
        assert_eq!(len, MATCH_LEN_MIN as u32);
    }
}
