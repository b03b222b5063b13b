use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use super::*;
use crate::error::{corrupt_io, Error};

/// Memory needed for decoding, in KiB, from the raw props byte.
pub fn get_memory_usage_by_props(dict_size: u32, props_byte: u8) -> crate::Result<u32> {
    if props_byte > (4 * 5 + 4) * 9 + 8 {
        return Err(Error::malformed("invalid LZMA props byte"));
    }
    let props = props_byte % (9 * 5);
    let lp = props / 9;
    let lc = props - lp * 9;
    get_memory_usage(dict_size, lc as u32, lp as u32)
}

/// Memory needed for decoding, in KiB.
pub fn get_memory_usage(dict_size: u32, lc: u32, lp: u32) -> crate::Result<u32> {
    if lc > 8 || lp > 4 {
        return Err(Error::malformed("invalid lc or lp"));
    }
    Ok(10 + get_dict_size(dict_size)? / 1024 + ((2 * 0x300) << (lc + lp)) / 1024)
}

fn get_dict_size(dict_size: u32) -> crate::Result<u32> {
    if dict_size > DICT_SIZE_MAX {
        return Err(Error::malformed("dictionary size too large"));
    }
    let dict_size = dict_size.max(DICT_SIZE_MIN);
    Ok((dict_size + 15) & !15)
}

/// Pull reader for a raw LZMA stream (the classic `.lzma` framing).
///
/// The stream does not self-terminate: either the caller supplies the
/// uncompressed size from container metadata, or the stream carries the
/// explicit end marker (size passed as `u64::MAX`).
#[derive(Debug)]
pub struct LzmaReader<R> {
    lz: LzDecoder,
    rc: RangeDecoder<R>,
    lzma: LzmaDecoder,
    end_reached: bool,
    relaxed_end_cond: bool,
    remaining_size: u64,
}

impl<R: Read> LzmaReader<R> {
    fn construct1(
        reader: R,
        uncomp_size: u64,
        mut props: u8,
        dict_size: u32,
        preset_dict: Option<&[u8]>,
    ) -> crate::Result<Self> {
        if props > (4 * 5 + 4) * 9 + 8 {
            return Err(Error::malformed("invalid LZMA props byte"));
        }
        let pb = props / (9 * 5);
        props -= pb * 9 * 5;
        let lp = props / 9;
        let lc = props - lp * 9;
        Self::construct2(
            reader,
            uncomp_size,
            lc as u32,
            lp as u32,
            pb as u32,
            dict_size,
            preset_dict,
        )
    }

    fn construct2(
        reader: R,
        uncomp_size: u64,
        lc: u32,
        lp: u32,
        pb: u32,
        dict_size: u32,
        preset_dict: Option<&[u8]>,
    ) -> crate::Result<Self> {
        if lc > 8 || lp > 4 || pb > 4 {
            return Err(Error::malformed("invalid lc, lp or pb"));
        }
        let mut dict_size = get_dict_size(dict_size)?;
        // no point allocating a window larger than the output
        if uncomp_size <= u64::MAX / 2 && dict_size as u64 > uncomp_size {
            dict_size = get_dict_size(uncomp_size as u32)?;
        }
        let rc = RangeDecoder::new_stream(reader)?;
        let lz = LzDecoder::new(dict_size as usize, preset_dict);
        let lzma = LzmaDecoder::new(lc, lp, pb);
        Ok(Self {
            lz,
            rc,
            lzma,
            end_reached: false,
            relaxed_end_cond: true,
            remaining_size: uncomp_size,
        })
    }

    /// Reads the 13-byte `.lzma` header from the stream, enforcing a
    /// decoder memory limit (in KiB) before allocating the window.
    pub fn new_mem_limit(
        mut reader: R,
        mem_limit_kb: u32,
        preset_dict: Option<&[u8]>,
    ) -> crate::Result<Self> {
        let props = reader.read_u8().map_err(Error::from)?;
        let dict_size = reader.read_u32::<LittleEndian>().map_err(Error::from)?;
        let uncomp_size = reader.read_u64::<LittleEndian>().map_err(Error::from)?;
        let need_mem = get_memory_usage_by_props(dict_size, props)?;
        if mem_limit_kb < need_mem {
            return Err(Error::unsupported(format!(
                "{need_mem} KiB needed but the limit is {mem_limit_kb} KiB"
            )));
        }
        Self::construct1(reader, uncomp_size, props, dict_size, preset_dict)
    }

    /// Builds a reader from an already parsed 5-byte props blob.
    pub fn new_with_props(
        reader: R,
        uncomp_size: u64,
        props: u8,
        dict_size: u32,
        preset_dict: Option<&[u8]>,
    ) -> crate::Result<Self> {
        Self::construct1(reader, uncomp_size, props, dict_size, preset_dict)
    }

    pub fn new(
        reader: R,
        uncomp_size: u64,
        lc: u32,
        lp: u32,
        pb: u32,
        dict_size: u32,
        preset_dict: Option<&[u8]>,
    ) -> crate::Result<Self> {
        Self::construct2(reader, uncomp_size, lc, lp, pb, dict_size, preset_dict)
    }

    fn read_decode(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() || self.end_reached {
            return Ok(0);
        }
        let mut size = 0;
        let mut len = buf.len();
        let mut off = 0;
        while len > 0 {
            let mut copy_size_max = len;
            if self.remaining_size <= u64::MAX / 2 && (self.remaining_size as usize) < len {
                copy_size_max = self.remaining_size as usize;
            }
            self.lz.set_limit(copy_size_max);

            self.lzma.decode(&mut self.lz, &mut self.rc)?;
            if self.lzma.end_marker_detected() {
                // with a declared size the decoder stops at the limit and
                // never reads the marker; meeting one means corruption
                if self.remaining_size != u64::MAX {
                    return Err(corrupt_io("end marker before declared size"));
                }
                self.rc.normalize()?;
                self.end_reached = true;
            }

            let copied_size = self.lz.flush(buf, off);
            off += copied_size;
            len -= copied_size;
            size += copied_size;
            if self.remaining_size <= u64::MAX / 2 {
                self.remaining_size -= copied_size as u64;
                if self.remaining_size == 0 {
                    self.end_reached = true;
                }
            }

            if self.end_reached {
                if self.lz.has_pending()
                    || (!self.relaxed_end_cond && !self.rc.is_stream_finished())
                {
                    return Err(corrupt_io("stream not finished at declared end"));
                }
                return Ok(size);
            }
        }
        Ok(size)
    }
}

impl<R: Read> Read for LzmaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_decode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_props_byte() {
        let err = LzmaReader::new_with_props(&[][..], 4, 225, 1 << 16, None).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn rejects_bad_lclppb() {
        let err = LzmaReader::new(&[][..], 4, 9, 0, 0, 1 << 16, None).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
        let err = LzmaReader::new(&[][..], 4, 3, 5, 0, 1 << 16, None).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
        let err = LzmaReader::new(&[][..], 4, 3, 0, 5, 1 << 16, None).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn truncated_header_is_truncated_input() {
        let err = LzmaReader::new(&[0u8, 0, 0][..], 4, 3, 0, 2, 1 << 16, None).unwrap_err();
        assert!(matches!(err, Error::TruncatedInput));
    }

    #[test]
    fn mem_limit_enforced() {
        // props lc=3 lp=0 pb=2, 64 MiB dict, 8-byte size
        let mut header = vec![0x5D, 0x00, 0x00, 0x00, 0x04];
        header.extend_from_slice(&8u64.to_le_bytes());
        let err = LzmaReader::new_mem_limit(&header[..], 64, None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }

    // All-zero payload: every token is the literal 0x00.
    #[test]
    fn zero_payload_stream_decodes() {
        let data = [0u8; 64];
        let mut r = LzmaReader::new(&data[..], 16, 3, 0, 2, 1 << 12, None).unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn decoding_is_deterministic() {
        let data = [0u8; 64];
        let mut out1 = Vec::new();
        let mut out2 = Vec::new();
        LzmaReader::new(&data[..], 24, 3, 0, 2, 1 << 12, None)
            .unwrap()
            .read_to_end(&mut out1)
            .unwrap();
        LzmaReader::new(&data[..], 24, 3, 0, 2, 1 << 12, None)
            .unwrap()
            .read_to_end(&mut out2)
            .unwrap();
        assert_eq!(out1, out2);
    }
}
