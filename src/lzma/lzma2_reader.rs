use super::*;
use crate::error::{corrupt_io, Error};
use byteorder::{BigEndian, ReadBytesExt};
use log::trace;
use std::io::{Read, Result};

pub const COMPRESSED_SIZE_MAX: u32 = 1 << 16;

/// Memory needed for decoding, in KiB.
#[inline]
pub fn get_memory_usage(dict_size: u32) -> u32 {
    40 + COMPRESSED_SIZE_MAX / 1024 + get_dict_size(dict_size) / 1024
}

#[inline]
fn get_dict_size(dict_size: u32) -> u32 {
    (dict_size + 15) & !15
}

/// Expands the single dictionary-size byte found in container metadata
/// (2^12 .. 2^32 in `2^n`/`3*2^n` steps).
pub fn dict_size_from_prop(prop: u8) -> crate::Result<u32> {
    if prop > 40 {
        return Err(Error::malformed("invalid LZMA2 dictionary size byte"));
    }
    if prop == 40 {
        return Ok(u32::MAX);
    }
    Ok((2 | (prop as u32 & 1)) << (prop / 2 + 11))
}

/// Pull reader over an LZMA2 chunk sequence.
///
/// Each chunk is either a raw copy into the window or an LZMA payload
/// decoded with the carried-over probability state, subject to the reset
/// level in the control byte. Control byte 0x00 terminates the stream.
#[derive(Debug)]
pub struct Lzma2Reader<R> {
    inner: R,
    lz: LzDecoder,
    rc: RangeDecoder<RangeDecoderBuffer>,
    lzma: Option<LzmaDecoder>,
    uncompressed_size: usize,
    is_lzma_chunk: bool,
    need_dict_reset: bool,
    need_props: bool,
    end_reached: bool,
    error: Option<std::io::Error>,
}

impl<R: Read> Lzma2Reader<R> {
    pub fn new(inner: R, dict_size: u32, preset_dict: Option<&[u8]>) -> Self {
        let has_preset = preset_dict.map(|d| !d.is_empty()).unwrap_or(false);
        Self {
            inner,
            lz: LzDecoder::new(get_dict_size(dict_size) as usize, preset_dict),
            rc: RangeDecoder::new_buffer(COMPRESSED_SIZE_MAX as usize),
            lzma: None,
            uncompressed_size: 0,
            is_lzma_chunk: false,
            need_dict_reset: !has_preset,
            need_props: true,
            end_reached: false,
            error: None,
        }
    }

    fn decode_chunk_header(&mut self) -> Result<()> {
        let control = self.inner.read_u8()?;
        if control == 0x00 {
            trace!("lzma2: end of stream");
            self.end_reached = true;
            return Ok(());
        }

        if control >= 0xE0 || control == 0x01 {
            self.need_props = true;
            self.need_dict_reset = false;
            self.lz.reset();
        } else if self.need_dict_reset {
            return Err(corrupt_io("Corrupted input data (LZMA2:0)"));
        }

        if control >= 0x80 {
            self.is_lzma_chunk = true;
            self.uncompressed_size = ((control & 0x1F) as usize) << 16;
            self.uncompressed_size += self.inner.read_u16::<BigEndian>()? as usize + 1;
            let compressed_size = self.inner.read_u16::<BigEndian>()? as usize + 1;
            trace!(
                "lzma2: chunk control {control:#04x} unpack {} pack {compressed_size}",
                self.uncompressed_size
            );
            if control >= 0xC0 {
                self.need_props = false;
                self.decode_props()?;
            } else if self.need_props {
                return Err(corrupt_io("Corrupted input data (LZMA2:1)"));
            } else if control >= 0xA0 {
                if let Some(lzma) = self.lzma.as_mut() {
                    lzma.reset();
                }
            }
            self.rc.prepare(&mut self.inner, compressed_size)?;
        } else if control > 0x02 {
            return Err(corrupt_io("Corrupted input data (LZMA2:2)"));
        } else {
            self.is_lzma_chunk = false;
            self.uncompressed_size = self.inner.read_u16::<BigEndian>()? as usize + 1;
            trace!(
                "lzma2: uncompressed chunk of {} bytes",
                self.uncompressed_size
            );
        }
        Ok(())
    }

    fn decode_props(&mut self) -> Result<()> {
        let props = self.inner.read_u8()?;
        if props > (4 * 5 + 4) * 9 + 8 {
            return Err(corrupt_io("Corrupted input data (LZMA2:3)"));
        }
        let pb = props / (9 * 5);
        let props = props - pb * 9 * 5;
        let lp = props / 9;
        let lc = props - lp * 9;
        if lc + lp > 4 {
            return Err(corrupt_io("Corrupted input data (LZMA2:4)"));
        }
        self.lzma = Some(LzmaDecoder::new(lc as u32, lp as u32, pb as u32));
        Ok(())
    }

    fn read_decode(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(e) = &self.error {
            return Err(std::io::Error::new(e.kind(), e.to_string()));
        }
        if self.end_reached {
            return Ok(0);
        }

        let mut size = 0;
        let mut len = buf.len();
        let mut off = 0;
        while len > 0 {
            if self.uncompressed_size == 0 {
                self.decode_chunk_header()?;
                if self.end_reached {
                    return Ok(size);
                }
            }

            let copy_size_max = self.uncompressed_size.min(len);
            if self.is_lzma_chunk {
                self.lz.set_limit(copy_size_max);
                if let Some(lzma) = self.lzma.as_mut() {
                    lzma.decode(&mut self.lz, &mut self.rc)?;
                }
            } else {
                self.lz.copy_uncompressed(&mut self.inner, copy_size_max)?;
            }

            let copied_size = self.lz.flush(buf, off);
            off += copied_size;
            len -= copied_size;
            size += copied_size;
            self.uncompressed_size -= copied_size;
            if self.uncompressed_size == 0
                && (!self.rc.is_finished() || self.lz.has_pending())
            {
                return Err(corrupt_io(
                    "LZMA2 chunk did not consume its payload exactly",
                ));
            }
        }
        Ok(size)
    }
}

impl<R: Read> Read for Lzma2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read_decode(buf) {
            Ok(size) => Ok(size),
            Err(e) => {
                let error = std::io::Error::new(e.kind(), e.to_string());
                self.error = Some(e);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_size_prop_expansion() {
        assert_eq!(dict_size_from_prop(0).unwrap(), 1 << 12);
        assert_eq!(dict_size_from_prop(1).unwrap(), 3 << 11);
        assert_eq!(dict_size_from_prop(2).unwrap(), 1 << 13);
        assert_eq!(dict_size_from_prop(40).unwrap(), u32::MAX);
        assert!(dict_size_from_prop(41).is_err());
    }

    #[test]
    fn empty_stream_is_just_the_end_byte() {
        let mut r = Lzma2Reader::new(&[0x00u8][..], 1 << 16, None);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn first_chunk_must_reset_dict() {
        // 0x02: uncompressed chunk without dictionary reset
        let data = [0x02u8, 0x00, 0x00, b'x', 0x00];
        let mut r = Lzma2Reader::new(&data[..], 1 << 16, None);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn invalid_control_byte_rejected() {
        let data = [0x7Fu8];
        let mut r = Lzma2Reader::new(&data[..], 1 << 16, None);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn error_is_sticky() {
        let data = [0x7Fu8];
        let mut r = Lzma2Reader::new(&data[..], 1 << 16, None);
        let mut buf = [0u8; 4];
        assert!(r.read(&mut buf).is_err());
        assert!(r.read(&mut buf).is_err());
    }
}
