use std::io;

/// Backing store for a PPMd model: one flat allocation addressed by `u32`
/// offsets, with offset 0 reserved as the null reference.
///
/// States are 6 bytes (`symbol`, `freq`, 32-bit successor) and contexts are
/// 12 bytes; a context's single-symbol state overlays its bytes 2..8, so
/// `ctx + 2` reads as a plain state. Both model variants rely on that
/// overlay the same way the reference layout does.
#[derive(Debug)]
pub(crate) struct Arena {
    mem: Vec<u8>,
    align_offset: u32,
}

impl Arena {
    pub fn new(size: u32) -> crate::Result<Self> {
        let align_offset = 4u32.wrapping_sub(size) & 3;
        let total = (align_offset + size) as usize;
        let mut mem = Vec::new();
        mem.try_reserve_exact(total)
            .map_err(|_| crate::Error::Io(io::ErrorKind::OutOfMemory.into()))?;
        mem.resize(total, 0);
        Ok(Self { mem, align_offset })
    }

    /// Offset of the first usable byte; guarantees raw-text references are
    /// never 0 even when no padding was needed.
    #[inline]
    pub fn start(&self) -> u32 {
        self.align_offset
    }

    #[inline]
    pub fn u8(&self, off: u32) -> u8 {
        self.mem[off as usize]
    }

    #[inline]
    pub fn set_u8(&mut self, off: u32, v: u8) {
        self.mem[off as usize] = v;
    }

    #[inline]
    pub fn u16(&self, off: u32) -> u16 {
        let i = off as usize;
        u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
    }

    #[inline]
    pub fn set_u16(&mut self, off: u32, v: u16) {
        self.mem[off as usize..off as usize + 2].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn u32(&self, off: u32) -> u32 {
        let i = off as usize;
        u32::from_le_bytes([self.mem[i], self.mem[i + 1], self.mem[i + 2], self.mem[i + 3]])
    }

    #[inline]
    pub fn set_u32(&mut self, off: u32, v: u32) {
        self.mem[off as usize..off as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    // State field views (6 bytes at `s`).

    #[inline]
    pub fn sym(&self, s: u32) -> u8 {
        self.u8(s)
    }

    #[inline]
    pub fn set_sym(&mut self, s: u32, v: u8) {
        self.set_u8(s, v);
    }

    #[inline]
    pub fn freq(&self, s: u32) -> u8 {
        self.u8(s + 1)
    }

    #[inline]
    pub fn set_freq(&mut self, s: u32, v: u8) {
        self.set_u8(s + 1, v);
    }

    #[inline]
    pub fn successor(&self, s: u32) -> u32 {
        self.u32(s + 2)
    }

    #[inline]
    pub fn set_successor(&mut self, s: u32, v: u32) {
        self.set_u32(s + 2, v);
    }

    pub fn state_bytes(&self, s: u32) -> [u8; 6] {
        let i = s as usize;
        let mut out = [0u8; 6];
        out.copy_from_slice(&self.mem[i..i + 6]);
        out
    }

    pub fn write_state_bytes(&mut self, s: u32, bytes: [u8; 6]) {
        let i = s as usize;
        self.mem[i..i + 6].copy_from_slice(&bytes);
    }

    pub fn copy_state(&mut self, dst: u32, src: u32) {
        let (d, s) = (dst as usize, src as usize);
        self.mem.copy_within(s..s + 6, d);
    }

    pub fn swap_states(&mut self, a: u32, b: u32) {
        for k in 0..6u32 {
            self.mem
                .swap((a + k) as usize, (b + k) as usize);
        }
    }

    /// Copies `nu` whole 12-byte units; ranges never overlap here because
    /// the destination is a freshly allocated block.
    pub fn copy_units(&mut self, dst: u32, src: u32, nu: u32) {
        let n = (nu * super::UNIT_SIZE) as usize;
        self.mem.copy_within(src as usize..src as usize + n, dst as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_overlay_round_trips() {
        let mut a = Arena::new(64).unwrap();
        let s = a.start() + 12;
        a.set_sym(s, 0x41);
        a.set_freq(s, 7);
        a.set_successor(s, 0x0001_0002);
        assert_eq!(a.sym(s), 0x41);
        assert_eq!(a.freq(s), 7);
        assert_eq!(a.successor(s), 0x0001_0002);
        // successor halves land in the two trailing 16-bit slots
        assert_eq!(a.u16(s + 2), 0x0002);
        assert_eq!(a.u16(s + 4), 0x0001);
    }

    #[test]
    fn unit_copy_moves_whole_records() {
        let mut a = Arena::new(120).unwrap();
        let base = a.start();
        for i in 0..12u32 {
            a.set_u8(base + i, i as u8);
        }
        a.copy_units(base + 24, base, 1);
        for i in 0..12u32 {
            assert_eq!(a.u8(base + 24 + i), i as u8);
        }
    }

    #[test]
    fn alignment_keeps_offset_zero_unused() {
        for size in [4093u32, 4094, 4095, 4096] {
            let a = Arena::new(size).unwrap();
            assert_eq!((a.start() + size) % 4, 0);
        }
    }
}
