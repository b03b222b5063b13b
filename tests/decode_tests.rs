use std::io::Read;

use arcodec::{Decoder, Error, Lzma2Reader, LzmaReader, Method, PpmdHReader, PpmdIReader};

fn ppmd_h_props(order: u8, mem: u32) -> [u8; 5] {
    let mut p = [0u8; 5];
    p[0] = order;
    p[1..5].copy_from_slice(&mem.to_le_bytes());
    p
}

fn unhex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

const PANGRAM: &[u8] = b"the quick brown fox jumps over the lazy dog. ";

// 153 bytes with enough repetition for a few real matches.
fn lzma_sample() -> Vec<u8> {
    let mut v = PANGRAM.repeat(3);
    v.extend_from_slice(b"the quick red fox.");
    v
}

// 1080 bytes: repeated text followed by a two-symbol pseudo-random tail
// noisy enough to push several contexts through a frequency rescale.
fn ppmd_sample() -> Vec<u8> {
    let mut v = PANGRAM.repeat(4);
    let mut x: u32 = 7;
    for _ in 0..900 {
        x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
        v.push(b'a' + ((x >> 16) & 1) as u8);
    }
    v
}

#[test]
fn lzma2_empty_stream() {
    let mut r = Lzma2Reader::new(&[0x00u8][..], 1 << 16, None);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert!(out.is_empty());
}

#[test]
fn lzma2_uncompressed_chunk_round_trip() {
    // control 0x01 (uncompressed, dict reset), size-1 = 3, payload, end
    let data = [0x01u8, 0x00, 0x03, b'a', b'b', b'c', b'd', 0x00];
    let mut r = Lzma2Reader::new(&data[..], 1 << 16, None);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"abcd");
}

#[test]
fn lzma2_decoding_is_deterministic() {
    let data = [0x01u8, 0x00, 0x03, 1, 2, 3, 4, 0x00];
    let mut first = Vec::new();
    Lzma2Reader::new(&data[..], 1 << 16, None)
        .read_to_end(&mut first)
        .unwrap();
    let mut second = Vec::new();
    Lzma2Reader::new(&data[..], 1 << 16, None)
        .read_to_end(&mut second)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn lzma2_rejects_reserved_control_byte() {
    let mut r = Lzma2Reader::new(&[0x7Fu8][..], 1 << 16, None);
    let mut out = Vec::new();
    let err = r.read_to_end(&mut out).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn lzma2_truncated_chunk_header() {
    // uncompressed chunk header cut off after the control byte
    let mut r = Lzma2Reader::new(&[0x01u8][..], 1 << 16, None);
    let mut out = Vec::new();
    let err = r.read_to_end(&mut out).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn lzma_zero_length_declared_size() {
    // props byte 0x5D (lc=3 lp=0 pb=2), 64 KiB dict, five coder init bytes
    let data = [0u8, 0, 0, 0, 0];
    let mut r = LzmaReader::new_with_props(&data[..], 0, 0x5D, 1 << 16, None).unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert!(out.is_empty());
}

#[test]
fn lzma_rejects_invalid_props_byte() {
    let data = [0u8, 0, 0, 0, 0];
    assert!(matches!(
        LzmaReader::new_with_props(&data[..], 0, 225, 1 << 16, None),
        Err(Error::MalformedHeader(_))
    ));
}

#[test]
fn ppmd_h_decodes_first_literal_from_fresh_model() {
    // A fresh model gives every byte frequency 1 of 257; steer the range
    // coder into the slot for 'A' and decode exactly one symbol.
    let slot_width = u32::MAX / 257;
    let code = (b'A' as u32) * slot_width;
    let mut data = vec![0u8];
    data.extend_from_slice(&code.to_be_bytes());
    data.push(0); // consumed by renormalization
    let mut r = PpmdHReader::new(&data[..], &ppmd_h_props(6, 1 << 16), 1).unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"A");
}

#[test]
fn ppmd_h_truncated_payload_is_eof() {
    let data = [0u8, 0, 0];
    let err = PpmdHReader::new(&data[..], &ppmd_h_props(6, 1 << 16), 4).unwrap_err();
    assert!(matches!(err, Error::TruncatedInput));
}

#[test]
fn ppmd_i_decodes_first_literal_from_fresh_model() {
    let slot_width = u32::MAX / 257;
    let code = (b'B' as u32) * slot_width;
    let data = code.to_be_bytes();
    let word: u16 = (8 - 1) | (1 << 12); // order 8, 1 MiB, cut-off
    let mut r = PpmdIReader::new(&data[..], &word.to_le_bytes()).unwrap();
    let mut buf = [0u8; 1];
    let n = r.read(&mut buf).unwrap();
    assert_eq!(n, 1);
    assert_eq!(buf[0], b'B');
}

#[test]
fn ppmd_i_rejects_freeze_restore_method() {
    let word: u16 = (8 - 1) | (2 << 12);
    let rc = [0u8, 0, 0, 0];
    assert!(matches!(
        PpmdIReader::new(&rc[..], &word.to_le_bytes()),
        Err(Error::UnsupportedConfiguration(_))
    ));
}

// lzma_sample() compressed with liblzma: lc=3 lp=0 pb=2 (props byte 0x5D),
// 64 KiB dictionary, unknown size, terminated by the end marker.
#[test]
fn lzma_decodes_known_stream() {
    let payload = unhex(concat!(
        "003a1a08ce76c7e5e9d60734c3d10ebfce55e1aabde0e48f9801dd8de507549e",
        "65255f273a6a7eb4d3490389ce0bc3f7bc4825240d3782c3fffff0ea0000",
    ));
    let mut r = LzmaReader::new_with_props(&payload[..], u64::MAX, 0x5D, 1 << 16, None).unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, lzma_sample());
}

// The same sample in LZMA2 framing (64 KiB dictionary): one compressed
// chunk carrying new props and a dictionary reset, then the terminator.
#[test]
fn lzma2_decodes_known_stream() {
    let payload = unhex(concat!(
        "e0009800385d003a1a08ce76c7e5e9d60734c3d10ebfce55e1aabde0e48f9801",
        "dd8de507549e65255f273a6a7eb4d3490389ce0bc3f7bc4825240d19484c0000",
    ));
    let mut r = Lzma2Reader::new(&payload[..], 1 << 16, None);
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, lzma_sample());
}

// ppmd_sample() compressed by the matching variant H encoder at order 4
// with a 64 KiB model. The tail forces six rescales, so the adaptive
// statistics and the range coder stay in lockstep well past the warm-up.
#[test]
fn ppmd_h_decodes_known_stream() {
    let payload = unhex(concat!(
        "0073f26f56a1863a5b53992ef57cb695897e701dcbc0b95bfab9135e99474a33",
        "72218ad051e1988004ea3586fc6f5a1cde6bd8fa75d27a2107635653a076c982",
        "29e1bb380ec99eedb134d5d273b2844f86fc4cedfc225de3f41deba1ec31ac9f",
        "e2f3ba9e20b167cd967daca021a6993b8fffd88a69aeb26f1fba194400473bb2",
        "f5a57b09b1e8a05aaf3bb04cde051cc19d2ddd0e8fdb2213650d42d9cfc5cb3a",
        "bef1f373c776810f1f390ce3e3c6ccdee7fbd848",
    ));
    let plain = ppmd_sample();
    let mut r =
        PpmdHReader::new(&payload[..], &ppmd_h_props(4, 1 << 16), plain.len() as u64).unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, plain);
}

// The same sample compressed by the matching variant I encoder at order 4
// with a 1 MiB model; the stream carries its own end marker.
#[test]
fn ppmd_i_decodes_known_stream() {
    let payload = unhex(concat!(
        "73f26f2ce2d39ab06a90381bc17bdad6d0a8c0ff0a963e774d93436b2285343b",
        "d4e1eaf36efe88c88d311bfe8fa9d4b75eb8a29b21d63871cc51412db6f97923",
        "403ba85275f868b8ee2b169a26865fca078e423c8c9b4a16c1d19019e7ea7926",
        "3c7f803ad6fb149d4b1aa9aabd5a61970360c08869e00da4538f31945c8ba0e1",
        "6130b02784fd669fdb978d54a62a58f2f2c5f595e6de36888dccb9c41c6899a8",
        "52c5c9b71b5cbe624b812f5d7c80ab1eec828e00",
    ));
    let word: u16 = (4 - 1) | (1 << 12); // order 4, 1 MiB, cut-off
    let mut r = PpmdIReader::new(&payload[..], &word.to_le_bytes()).unwrap();
    let mut out = Vec::new();
    r.read_to_end(&mut out).unwrap();
    assert_eq!(out, ppmd_sample());
}

#[test]
fn decoder_dispatch_covers_all_methods() {
    // LZMA2 end-of-stream through the generic front door
    let mut d = Decoder::new(Method::Lzma2, &[0x00u8][..], &[18], u64::MAX).unwrap();
    let mut out = Vec::new();
    d.read_to_end(&mut out).unwrap();
    assert!(out.is_empty());

    // PPMd H with a zero-length output
    let rc = [0u8, 0, 0, 0, 0];
    let mut d = Decoder::new(Method::PpmdH, &rc[..], &ppmd_h_props(6, 1 << 20), 0).unwrap();
    let mut out = Vec::new();
    d.read_to_end(&mut out).unwrap();
    assert!(out.is_empty());

    // invalid property blobs are rejected before any payload is read
    assert!(Decoder::new(Method::Lzma, &[][..], &[0x5D, 0, 0], 0).is_err());
    assert!(Decoder::new(Method::PpmdI, &[][..], &[], 0).is_err());
}
