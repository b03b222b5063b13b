//! Streaming decoders for the compression methods found in 7-Zip and Zip
//! archives: LZMA, LZMA2 and the two PPMd variants (H and I rev.1).
//!
//! Each decoder is a [`std::io::Read`] adapter over the compressed byte
//! stream. Containers that know which method a stream uses can construct
//! the matching reader directly ([`LzmaReader`], [`Lzma2Reader`],
//! [`PpmdHReader`], [`PpmdIReader`]); [`Decoder`] offers method dispatch
//! from a [`Method`] tag and the raw coder property blob instead.

mod error;
mod lzma;
mod ppmd;

pub use error::Error;
pub use lzma::{
    lzma2_dict_size, lzma2_get_memory_usage, lzma_get_memory_usage,
    lzma_get_memory_usage_by_props, Lzma2Reader, LzmaReader, DICT_SIZE_MAX, DICT_SIZE_MIN,
};
pub use ppmd::{PpmdHReader, PpmdIReader};

pub type Result<T> = std::result::Result<T, Error>;

use byteorder::{ByteOrder, LittleEndian};
use std::io::Read;

/// Compression method tag, matching the coder identifiers archives store.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Method {
    /// Standalone LZMA (as in `.7z` LZMA coders): 5 property bytes, the
    /// lc/lp/pb byte followed by the dictionary size as a 32-bit LE word.
    Lzma,
    /// LZMA2 chunked framing: a single dictionary-size property byte.
    Lzma2,
    /// PPMd variant H (7-Zip PPMd): 5 property bytes.
    PpmdH,
    /// PPMd variant I rev.1 (Zip method 98): a 16-bit LE property word.
    PpmdI,
}

/// A decoder for any supported [`Method`], dispatched at construction.
#[derive(Debug)]
pub enum Decoder<R> {
    Lzma(LzmaReader<R>),
    Lzma2(Lzma2Reader<R>),
    PpmdH(PpmdHReader<R>),
    PpmdI(PpmdIReader<R>),
}

impl<R: Read> Decoder<R> {
    /// Builds the reader for `method` from the raw property blob the
    /// container carries. `uncomp_size` is required by methods whose
    /// streams do not terminate themselves (LZMA without an end marker,
    /// PPMd variant H); pass `u64::MAX` for an LZMA stream that relies on
    /// its end marker.
    pub fn new(method: Method, inner: R, props: &[u8], uncomp_size: u64) -> Result<Self> {
        match method {
            Method::Lzma => {
                if props.len() != 5 {
                    return Err(Error::malformed("LZMA properties must be 5 bytes"));
                }
                let dict_size = LittleEndian::read_u32(&props[1..5]);
                Ok(Decoder::Lzma(LzmaReader::new_with_props(
                    inner,
                    uncomp_size,
                    props[0],
                    dict_size,
                    None,
                )?))
            }
            Method::Lzma2 => {
                if props.len() != 1 {
                    return Err(Error::malformed("LZMA2 properties must be 1 byte"));
                }
                let dict_size = lzma2_dict_size(props[0])?;
                Ok(Decoder::Lzma2(Lzma2Reader::new(inner, dict_size, None)))
            }
            Method::PpmdH => Ok(Decoder::PpmdH(PpmdHReader::new(inner, props, uncomp_size)?)),
            Method::PpmdI => Ok(Decoder::PpmdI(PpmdIReader::new(inner, props)?)),
        }
    }
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Decoder::Lzma(r) => r.read(buf),
            Decoder::Lzma2(r) => r.read(buf),
            Decoder::PpmdH(r) => r.read(buf),
            Decoder::PpmdI(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_rejects_short_props() {
        assert!(matches!(
            Decoder::new(Method::Lzma, &[][..], &[0x5D], 0),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            Decoder::new(Method::Lzma2, &[][..], &[], 0),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            Decoder::new(Method::PpmdI, &[][..], &[0x06], 0),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn dispatch_builds_lzma2_reader() {
        let data = [0x00u8];
        let mut d = Decoder::new(Method::Lzma2, &data[..], &[18], u64::MAX).unwrap();
        let mut out = Vec::new();
        d.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
