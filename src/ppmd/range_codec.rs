use byteorder::{BigEndian, ReadBytesExt};

use crate::error::corrupt_io;
use std::io::{Read, Result};

const TOP: u32 = 1 << 24;
const BOT: u32 = 1 << 15;

/// Range decoder for PPMd variant H, as framed inside 7-Zip streams:
/// a zero lead byte, then the 32-bit code, normalizing at `2^24`.
#[derive(Debug)]
pub(crate) struct RangeDecoderH<R> {
    inner: R,
    pub range: u32,
    pub code: u32,
}

impl<R: Read> RangeDecoderH<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let b = inner.read_u8()?;
        if b != 0x00 {
            return Err(corrupt_io("range coder init byte is not zero"));
        }
        let code = inner.read_u32::<BigEndian>()?;
        if code == u32::MAX {
            return Err(corrupt_io("range coder init code out of range"));
        }
        Ok(Self {
            inner,
            range: u32::MAX,
            code,
        })
    }

    pub fn normalize(&mut self) -> Result<()> {
        while self.range < TOP {
            let b = self.inner.read_u8()? as u32;
            self.code = (self.code << 8) | b;
            self.range <<= 8;
        }
        Ok(())
    }

    /// Divides the range into `total` slots and returns the slot the code
    /// currently falls in.
    pub fn threshold(&mut self, total: u32) -> u32 {
        self.range /= total;
        self.code / self.range
    }

    /// Commits the decision for a symbol spanning `[start, start + size)`.
    pub fn decode(&mut self, start: u32, size: u32) -> Result<()> {
        self.code = self.code.wrapping_sub(start.wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(size);
        self.normalize()
    }

    /// Binary-context decision: `size0` is the scaled zero-branch width.
    /// Returns true when the zero branch (the context's single symbol) hit.
    pub fn decode_bin(&mut self, size0: u32) -> Result<bool> {
        if self.code < size0 {
            self.range = size0;
            self.normalize()?;
            Ok(true)
        } else {
            self.code -= size0;
            self.range -= size0;
            Ok(false)
        }
    }
}

/// Carryless range decoder for PPMd variant I rev.1: tracks `low`
/// explicitly and renormalizes on both the `2^24` window match and the
/// `2^15` underflow guard.
#[derive(Debug)]
pub(crate) struct RangeDecoderI<R> {
    inner: R,
    pub range: u32,
    pub code: u32,
    pub low: u32,
}

impl<R: Read> RangeDecoderI<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let code = inner.read_u32::<BigEndian>()?;
        if code == u32::MAX {
            return Err(corrupt_io("range coder init code out of range"));
        }
        Ok(Self {
            inner,
            range: u32::MAX,
            code,
            low: 0,
        })
    }

    pub fn normalize(&mut self) -> Result<()> {
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) < TOP {
                // top byte settled, shift it out
            } else if self.range < BOT {
                self.range = 0u32.wrapping_sub(self.low) & (BOT - 1);
            } else {
                return Ok(());
            }
            let b = self.inner.read_u8()? as u32;
            self.code = (self.code << 8) | b;
            self.range <<= 8;
            self.low <<= 8;
        }
    }

    pub fn threshold(&mut self, total: u32) -> u32 {
        self.range /= total;
        self.code / self.range
    }

    pub fn decode(&mut self, start: u32, size: u32) -> Result<()> {
        let start = start.wrapping_mul(self.range);
        self.low = self.low.wrapping_add(start);
        self.code = self.code.wrapping_sub(start);
        self.range = self.range.wrapping_mul(size);
        self.normalize()
    }

    /// Same as [`decode`], but leaves normalization to the caller; the
    /// escape paths defer it to the top of the next context walk.
    pub fn decode_no_norm(&mut self, start: u32, size: u32) {
        let start = start.wrapping_mul(self.range);
        self.low = self.low.wrapping_add(start);
        self.code = self.code.wrapping_sub(start);
        self.range = self.range.wrapping_mul(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h_init_requires_zero_lead_byte() {
        let data = [1u8, 0, 0, 0, 0];
        let err = RangeDecoderH::new(&data[..]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn h_init_rejects_saturated_code() {
        let data = [0u8, 0xFF, 0xFF, 0xFF, 0xFF];
        let err = RangeDecoderH::new(&data[..]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn h_threshold_partitions_range() {
        let data = [0u8, 0x80, 0, 0, 0];
        let mut rc = RangeDecoderH::new(&data[..]).unwrap();
        // code = 0x80000000, range = 0xFFFFFFFF: slot 2 of 4
        assert_eq!(rc.threshold(4), 2);
    }

    #[test]
    fn i_init_rejects_saturated_code() {
        let data = [0xFFu8, 0xFF, 0xFF, 0xFF];
        let err = RangeDecoderI::new(&data[..]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn i_truncated_stream_surfaces_eof() {
        let data = [0u8, 0];
        let err = RangeDecoderI::new(&data[..]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
