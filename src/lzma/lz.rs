use std::io::{Read, Result};

use crate::error::corrupt_io;

/// Sliding dictionary the decoded stream is written through.
///
/// Matches copy from earlier positions in the same buffer; `full` tracks
/// how many bytes are valid so corrupt distances can be rejected instead
/// of reading stale memory.
#[derive(Debug)]
pub(crate) struct LzDecoder {
    buf: Vec<u8>,
    start: usize,
    pos: usize,
    full: usize,
    limit: usize,
    pending_len: usize,
    pending_dist: usize,
}

impl LzDecoder {
    pub fn new(dict_size: usize, preset_dict: Option<&[u8]>) -> Self {
        let mut dec = Self {
            buf: vec![0; dict_size],
            start: 0,
            pos: 0,
            full: 0,
            limit: 0,
            pending_len: 0,
            pending_dist: 0,
        };
        if let Some(preset) = preset_dict {
            dec.set_preset_dict(preset);
        }
        dec
    }

    fn set_preset_dict(&mut self, preset: &[u8]) {
        let copy = preset.len().min(self.buf.len());
        self.buf[..copy].copy_from_slice(&preset[preset.len() - copy..]);
        self.pos = copy;
        self.full = copy;
        self.start = copy;
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.pos = 0;
        self.full = 0;
        self.limit = 0;
        if let Some(last) = self.buf.last_mut() {
            *last = 0;
        }
    }

    /// Caps how far decoding may advance before the next flush.
    pub fn set_limit(&mut self, out_max: usize) {
        self.limit = if self.buf.len() - self.pos <= out_max {
            self.buf.len()
        } else {
            self.pos + out_max
        };
    }

    #[inline]
    pub fn has_space(&self) -> bool {
        self.pos < self.limit
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_len > 0
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Byte `dist` positions back from the write head, wrapping.
    pub fn get_byte(&self, dist: usize) -> u8 {
        let offset = if dist >= self.pos {
            self.buf.len() + self.pos - dist - 1
        } else {
            self.pos - dist - 1
        };
        self.buf[offset]
    }

    pub fn put_byte(&mut self, b: u8) {
        self.buf[self.pos] = b;
        self.pos += 1;
        if self.full < self.pos {
            self.full = self.pos;
        }
    }

    /// Copies `len` bytes from `dist` back. A distance reaching beyond the
    /// bytes produced so far is a corrupt stream, not a crash.
    pub fn repeat(&mut self, dist: i32, len: usize) -> Result<()> {
        if dist < 0 || dist as usize >= self.full {
            return Err(corrupt_io("match distance exceeds window contents"));
        }
        let dist = dist as usize;

        let mut left = (self.limit - self.pos).min(len);
        self.pending_len = len - left;
        self.pending_dist = dist;

        let mut back = if dist >= self.pos {
            self.buf.len() + self.pos - dist - 1
        } else {
            self.pos - dist - 1
        };
        while left > 0 {
            self.buf[self.pos] = self.buf[back];
            self.pos += 1;
            back += 1;
            if back == self.buf.len() {
                back = 0;
            }
            left -= 1;
        }
        if self.full < self.pos {
            self.full = self.pos;
        }
        Ok(())
    }

    /// Continues a match that ran into the limit on the previous call.
    pub fn repeat_pending(&mut self) -> Result<()> {
        if self.pending_len > 0 {
            let len = self.pending_len;
            self.pending_len = 0;
            self.repeat(self.pending_dist as i32, len)?;
        }
        Ok(())
    }

    /// Reads raw bytes straight into the window (LZMA2 uncompressed chunks).
    pub fn copy_uncompressed<R: Read>(&mut self, mut reader: R, len: usize) -> Result<usize> {
        let copy_size = (self.buf.len() - self.pos).min(len);
        reader.read_exact(&mut self.buf[self.pos..self.pos + copy_size])?;
        self.pos += copy_size;
        if self.full < self.pos {
            self.full = self.pos;
        }
        Ok(copy_size)
    }

    /// Moves everything decoded since the last flush into `out`.
    pub fn flush(&mut self, out: &mut [u8], out_off: usize) -> usize {
        let copy_size = self.pos - self.start;
        if self.pos == self.buf.len() {
            self.pos = 0;
        }
        out[out_off..out_off + copy_size].copy_from_slice(&self.buf[self.start..self.start + copy_size]);
        self.start = self.pos;
        copy_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(size: usize) -> LzDecoder {
        let mut lz = LzDecoder::new(size, None);
        lz.set_limit(size);
        lz
    }

    #[test]
    fn literal_then_match_round_trip() {
        let mut lz = window(32);
        for b in b"abc" {
            lz.put_byte(*b);
        }
        lz.repeat(2, 3).unwrap();
        let mut out = [0u8; 32];
        let n = lz.flush(&mut out, 0);
        assert_eq!(&out[..n], b"abcabc");
    }

    #[test]
    fn max_valid_distance_is_full_minus_one() {
        let mut lz = window(16);
        for b in b"xyz" {
            lz.put_byte(*b);
        }
        lz.repeat(2, 1).unwrap();
        let mut out = [0u8; 16];
        let n = lz.flush(&mut out, 0);
        assert_eq!(&out[..n], b"xyzx");
    }

    #[test]
    fn out_of_window_distance_rejected() {
        let mut lz = window(16);
        lz.put_byte(b'a');
        let err = lz.repeat(1, 4).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        let err = lz.repeat(-1, 1).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn pending_match_resumes_after_flush() {
        let mut lz = LzDecoder::new(16, None);
        lz.set_limit(4);
        for b in b"ab" {
            lz.put_byte(*b);
        }
        lz.repeat(1, 6).unwrap();
        assert!(lz.has_pending());
        let mut out = [0u8; 16];
        let n = lz.flush(&mut out, 0);
        assert_eq!(&out[..n], b"abab");

        lz.set_limit(16);
        lz.repeat_pending().unwrap();
        let n = lz.flush(&mut out, 0);
        assert_eq!(&out[..n], b"abab");
    }

    #[test]
    fn preset_dict_seeds_window() {
        let mut lz = LzDecoder::new(8, Some(b"0123456789"));
        lz.set_limit(8);
        // only the tail of an oversized preset fits
        assert_eq!(lz.get_byte(0), b'9');
        assert_eq!(lz.get_byte(7), b'2');
    }

    #[test]
    fn uncompressed_copy_lands_in_window() {
        let mut lz = window(8);
        let n = lz.copy_uncompressed(&b"hello"[..], 5).unwrap();
        assert_eq!(n, 5);
        let mut out = [0u8; 8];
        let n = lz.flush(&mut out, 0);
        assert_eq!(&out[..n], b"hello");
    }
}
