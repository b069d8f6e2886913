//! Shared builder for hand-assembled edition 4 messages.

#![allow(dead_code)]

use bufr_bits::BitWriter;

pub const OBSERVED: u8 = 0x80;
pub const COMPRESSED: u8 = 0x40;

/// Assembles a complete edition 4 message around a hand-written section 4
/// payload. Section lengths follow the canonical octet padding the encoder
/// produces, so round-trip comparisons are byte exact.
pub fn build_message(
    descriptors: &[u32],
    n_subsets: u16,
    flags: u8,
    payload: impl FnOnce(&mut BitWriter),
) -> Vec<u8> {
    let mut body = BitWriter::new();
    payload(&mut body);
    body.pad_to_octet();
    let payload_bytes = body.into_bytes();

    let s1_len = 22;
    let s3_len = 7 + 2 * descriptors.len();
    let s4_len = 4 + payload_bytes.len();
    let total = 8 + s1_len + s3_len + s4_len + 4;

    let mut w = BitWriter::new();
    w.write_bytes(b"BUFR", 4).unwrap();
    w.write_uint(total as u64, 24).unwrap();
    w.write_uint(4, 8).unwrap();

    // Section 1, edition 4 layout.
    w.write_uint(s1_len as u64, 24).unwrap();
    w.write_uint(0, 8).unwrap();
    w.write_uint(0, 16).unwrap();
    w.write_uint(0, 16).unwrap();
    w.write_uint(0, 8).unwrap();
    w.write_uint(0, 8).unwrap();
    w.write_uint(2, 8).unwrap();
    w.write_uint(255, 8).unwrap();
    w.write_uint(255, 8).unwrap();
    w.write_uint(25, 8).unwrap();
    w.write_uint(0, 8).unwrap();
    w.write_uint(2021, 16).unwrap();
    for v in [3u64, 14, 9, 26, 53] {
        w.write_uint(v, 8).unwrap();
    }

    // Section 3.
    w.write_uint(s3_len as u64, 24).unwrap();
    w.write_uint(0, 8).unwrap();
    w.write_uint(n_subsets as u64, 16).unwrap();
    w.write_uint(flags as u64, 8).unwrap();
    for id in descriptors {
        w.write_uint((id / 100_000) as u64, 2).unwrap();
        w.write_uint((id / 1000 % 100) as u64, 6).unwrap();
        w.write_uint((id % 1000) as u64, 8).unwrap();
    }

    // Section 4.
    w.write_uint(s4_len as u64, 24).unwrap();
    w.write_uint(0, 8).unwrap();
    for b in &payload_bytes {
        w.write_uint(*b as u64, 8).unwrap();
    }

    w.write_bytes(b"7777", 4).unwrap();
    w.into_bytes()
}
