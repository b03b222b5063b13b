use byteorder::{BigEndian, ReadBytesExt};

use super::*;
use crate::error::corrupt_io;
use std::io::{Read, Result};

/// Binary arithmetic decoder over a normalized 32-bit `range`/`code` pair.
///
/// `R` is either a streaming source (raw LZMA) or a [`RangeDecoderBuffer`]
/// holding exactly one LZMA2 chunk.
#[derive(Debug)]
pub struct RangeDecoder<R> {
    inner: R,
    range: u32,
    code: u32,
}

impl RangeDecoder<RangeDecoderBuffer> {
    pub fn new_buffer(len: usize) -> Self {
        Self {
            inner: RangeDecoderBuffer::new(len - 5),
            code: 0,
            range: 0,
        }
    }
}

impl<R: Read> RangeDecoder<R> {
    pub fn new_stream(mut inner: R) -> Result<Self> {
        let b = inner.read_u8()?;
        if b != 0x00 {
            return Err(corrupt_io("range coder init byte is not zero"));
        }
        let code = inner.read_u32::<BigEndian>()?;
        Ok(Self {
            inner,
            code,
            range: 0xFFFF_FFFF,
        })
    }

    pub fn is_stream_finished(&self) -> bool {
        self.code == 0
    }
}

impl<R: Read> RangeDecoder<R> {
    pub(crate) fn normalize(&mut self) -> Result<()> {
        if self.range & TOP_MASK == 0 {
            let b = self.inner.read_u8()? as u32;
            self.code = (self.code << SHIFT_BITS) | b;
            self.range <<= SHIFT_BITS;
        }
        Ok(())
    }

    pub fn decode_bit(&mut self, probs: &mut [u16], index: usize) -> Result<u32> {
        self.normalize()?;
        let prob = probs[index] as u32;
        let bound = (self.range >> BIT_MODEL_TOTAL_BITS) * prob;
        // unsigned compare via sign-bit flip, as the reference codec does
        let cm = self.code ^ 0x8000_0000;
        let bm = bound ^ 0x8000_0000;
        if (cm as i32) < (bm as i32) {
            self.range = bound;
            probs[index] = (prob + ((BIT_MODEL_TOTAL - prob) >> MOVE_BITS)) as u16;
            Ok(0)
        } else {
            self.range -= bound;
            self.code = self.code.wrapping_sub(bound);
            probs[index] = (prob - (prob >> MOVE_BITS)) as u16;
            Ok(1)
        }
    }

    pub fn decode_bit_tree(&mut self, probs: &mut [u16]) -> Result<u32> {
        let mut symbol: u32 = 1;
        loop {
            symbol = (symbol << 1) | self.decode_bit(probs, symbol as usize)?;
            if symbol as usize >= probs.len() {
                break;
            }
        }
        Ok(symbol - probs.len() as u32)
    }

    /// Least-significant-bit-first variant, used for distance align bits.
    pub fn decode_reverse_bit_tree(&mut self, probs: &mut [u16]) -> Result<u32> {
        let mut symbol: u32 = 1;
        let mut i = 0;
        let mut result = 0;
        loop {
            let bit = self.decode_bit(probs, symbol as usize)?;
            symbol = (symbol << 1) | bit;
            result |= bit << i;
            i += 1;
            if symbol as usize >= probs.len() {
                break;
            }
        }
        Ok(result)
    }

    pub fn decode_direct_bits(&mut self, count: u32) -> Result<u32> {
        let mut result = 0;
        for _ in 0..count {
            self.normalize()?;
            self.range >>= 1;
            let t = self.code.wrapping_sub(self.range) >> 31;
            self.code -= self.range & t.wrapping_sub(1);
            result = (result << 1) | (1 - t);
        }
        Ok(result)
    }
}

/// Backing store for one LZMA2 chunk's compressed payload.
#[derive(Debug)]
pub struct RangeDecoderBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl RangeDecoder<RangeDecoderBuffer> {
    /// Loads the next chunk: 5 range-coder init bytes, then `len - 5`
    /// payload bytes into the tail of the internal buffer.
    pub fn prepare<R: Read>(&mut self, mut reader: R, len: usize) -> Result<()> {
        if len < 5 {
            return Err(corrupt_io("LZMA2 chunk shorter than range coder init"));
        }

        let b = reader.read_u8()?;
        if b != 0x00 {
            return Err(corrupt_io("range coder init byte is not zero"));
        }
        self.code = reader.read_u32::<BigEndian>()?;
        self.range = 0xFFFF_FFFF;

        let len = len - 5;
        let pos = self.inner.buf.len() - len;
        self.inner.pos = pos;
        reader.read_exact(&mut self.inner.buf[pos..])
    }

    /// A chunk must consume its payload exactly and end with `code == 0`.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.pos == self.inner.buf.len() && self.code == 0
    }
}

impl RangeDecoderBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            pos: len,
        }
    }
}

impl Read for RangeDecoderBuffer {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.pos == self.buf.len() {
            return Ok(0);
        }
        let len = buf.len().min(self.buf.len() - self.pos);
        buf[..len].copy_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An all-zero payload keeps code == 0, so every adaptive decision takes
    // the zero branch and probabilities climb toward certainty.
    #[test]
    fn zero_stream_decodes_zero_bits() {
        let data = [0u8; 16];
        let mut rc = RangeDecoder::new_stream(&data[..]).unwrap();
        let mut probs = [PROB_INIT; 2];
        for _ in 0..20 {
            assert_eq!(rc.decode_bit(&mut probs, 1).unwrap(), 0);
        }
        assert!(probs[1] > PROB_INIT);
        assert!(rc.is_stream_finished());
    }

    #[test]
    fn nonzero_init_byte_rejected() {
        let data = [1u8, 0, 0, 0, 0];
        let err = RangeDecoder::new_stream(&data[..]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn direct_bits_follow_code() {
        // code = 0xF0000000 stays at or above the halved range for four
        // rounds (0x70000001, 0x30000002, 0x10000003, 4), so every decoded
        // direct bit is a one.
        let data = [0u8, 0xF0, 0x00, 0x00, 0x00];
        let mut rc = RangeDecoder::new_stream(&data[..]).unwrap();
        assert_eq!(rc.decode_direct_bits(4).unwrap(), 0xF);
    }

    #[test]
    fn truncated_stream_surfaces_eof() {
        let data = [0u8, 0, 0];
        let err = RangeDecoder::new_stream(&data[..]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn bit_tree_on_zero_stream_returns_zero_symbol() {
        let data = [0u8; 8];
        let mut rc = RangeDecoder::new_stream(&data[..]).unwrap();
        let mut probs = [PROB_INIT; 8];
        assert_eq!(rc.decode_bit_tree(&mut probs).unwrap(), 0);
        let mut probs = [PROB_INIT; 16];
        assert_eq!(rc.decode_reverse_bit_tree(&mut probs).unwrap(), 0);
    }
}
