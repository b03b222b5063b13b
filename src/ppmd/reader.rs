use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use std::io::{Read, Result};

use super::model_h::{self, ModelH, SYM_END};
use super::model_i::{self, ModelI, RestoreMethod};
use super::{RangeDecoderH, RangeDecoderI};
use crate::error::{corrupt_io, Error};

/// Pull reader over a PPMd variant H stream, as stored by 7-Zip: a 5-byte
/// property blob (order, then the model memory size as a 32-bit LE word)
/// and the range-coded payload. The format carries no end marker, so the
/// caller must supply the uncompressed size.
#[derive(Debug)]
pub struct PpmdHReader<R> {
    model: ModelH,
    rc: RangeDecoderH<R>,
    remaining: u64,
    error: Option<std::io::Error>,
}

impl<R: Read> PpmdHReader<R> {
    pub fn new(inner: R, props: &[u8], unpack_size: u64) -> crate::Result<Self> {
        if props.len() != 5 {
            return Err(Error::malformed("PPMd properties must be 5 bytes"));
        }
        let order = props[0] as u32;
        let mem_size = LittleEndian::read_u32(&props[1..5]);
        if !(model_h::ORDER_MIN..=model_h::ORDER_MAX).contains(&order) {
            return Err(Error::malformed("PPMd model order out of range"));
        }
        if !(model_h::MEM_MIN..=model_h::MEM_MAX).contains(&mem_size) {
            return Err(Error::malformed("PPMd memory size out of range"));
        }
        trace!("ppmd-h: order {order} mem {mem_size}");
        Ok(Self {
            model: ModelH::new(order, mem_size)?,
            rc: RangeDecoderH::new(inner)?,
            remaining: unpack_size,
            error: None,
        })
    }

    fn read_decode(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let mut n = 0;
        while n < want {
            let sym = self.model.decode_symbol(&mut self.rc)?;
            if sym < 0 {
                return Err(corrupt_io("PPMd stream is corrupted"));
            }
            buf[n] = sym as u8;
            n += 1;
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<R: Read> Read for PpmdHReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(e) = &self.error {
            return Err(std::io::Error::new(e.kind(), e.to_string()));
        }
        match self.read_decode(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let out = std::io::Error::new(e.kind(), e.to_string());
                self.error = Some(e);
                Err(out)
            }
        }
    }
}

/// Pull reader over a PPMd variant I rev.1 stream, as stored in Zip
/// archives: a 16-bit LE property word packing the order, the model memory
/// size in MiB and the restore method, then the range-coded payload. The
/// stream terminates itself with an escape below the order-0 root.
#[derive(Debug)]
pub struct PpmdIReader<R> {
    model: ModelI,
    rc: RangeDecoderI<R>,
    end_reached: bool,
    error: Option<std::io::Error>,
}

impl<R: Read> PpmdIReader<R> {
    pub fn new(inner: R, props: &[u8]) -> crate::Result<Self> {
        if props.len() != 2 {
            return Err(Error::malformed("PPMd properties must be 2 bytes"));
        }
        let word = LittleEndian::read_u16(props) as u32;
        let order = (word & 0x0F) + 1;
        let mem_size = (((word >> 4) & 0xFF) + 1) << 20;
        let restore = match word >> 12 {
            0 => RestoreMethod::Restart,
            1 => RestoreMethod::CutOff,
            _ => {
                return Err(Error::unsupported(
                    "PPMd freeze restore method is not supported",
                ))
            }
        };
        if !(model_i::ORDER_MIN..=model_i::ORDER_MAX).contains(&order) {
            return Err(Error::malformed("PPMd model order out of range"));
        }
        trace!("ppmd-i: order {order} mem {mem_size} restore {restore:?}");
        Ok(Self {
            model: ModelI::new(order, mem_size, restore)?,
            rc: RangeDecoderI::new(inner)?,
            end_reached: false,
            error: None,
        })
    }

    fn read_decode(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.end_reached {
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            let sym = self.model.decode_symbol(&mut self.rc)?;
            if sym == SYM_END {
                self.end_reached = true;
                break;
            }
            if sym < 0 {
                return Err(corrupt_io("PPMd stream is corrupted"));
            }
            buf[n] = sym as u8;
            n += 1;
        }
        Ok(n)
    }
}

impl<R: Read> Read for PpmdIReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(e) = &self.error {
            return Err(std::io::Error::new(e.kind(), e.to_string()));
        }
        match self.read_decode(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                let out = std::io::Error::new(e.kind(), e.to_string());
                self.error = Some(e);
                Err(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h_props(order: u8, mem: u32) -> [u8; 5] {
        let mut p = [0u8; 5];
        p[0] = order;
        LittleEndian::write_u32(&mut p[1..5], mem);
        p
    }

    #[test]
    fn h_rejects_bad_properties() {
        let rc = [0u8, 0, 0, 0, 0];
        assert!(matches!(
            PpmdHReader::new(&rc[..], &[6u8, 0, 0], 0),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            PpmdHReader::new(&rc[..], &h_props(1, 1 << 20), 0),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            PpmdHReader::new(&rc[..], &h_props(65, 1 << 20), 0),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            PpmdHReader::new(&rc[..], &h_props(6, 100), 0),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn h_zero_length_output_needs_no_symbols() {
        let rc = [0u8, 0, 0, 0, 0];
        let mut r = PpmdHReader::new(&rc[..], &h_props(6, 1 << 20), 0).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn i_property_word_unpacks() {
        // order 16, 256 MiB would be huge; use order 8, 2 MiB, cut-off
        let word: u16 = (8 - 1) | (1 << 4) | (1 << 12);
        let props = word.to_le_bytes();
        let rc = [0u8, 0, 0, 0];
        assert!(PpmdIReader::new(&rc[..], &props).is_ok());
    }

    #[test]
    fn i_rejects_freeze_restore() {
        let word: u16 = (8 - 1) | (1 << 4) | (2 << 12);
        let props = word.to_le_bytes();
        let rc = [0u8, 0, 0, 0];
        assert!(matches!(
            PpmdIReader::new(&rc[..], &props),
            Err(Error::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn i_rejects_order_below_minimum() {
        let word: u16 = 0; // order 1
        let props = word.to_le_bytes();
        let rc = [0u8, 0, 0, 0];
        assert!(matches!(
            PpmdIReader::new(&rc[..], &props),
            Err(Error::MalformedHeader(_))
        ));
    }
}
