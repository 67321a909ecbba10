#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use pagedtopic_core::varint::{
    packed_len_i64, read_packed_bytes, read_packed_i32, read_packed_i64, read_packed_u32,
    write_packed_i64,
};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode or fail, never panic:
    // - Missing continuation bytes
    // - Overlong encodings
    // - Length prefixes larger than the input
    let input = Bytes::copy_from_slice(data);
    let _ = read_packed_i32(&mut input.clone());
    let _ = read_packed_u32(&mut input.clone());
    let _ = read_packed_bytes(&mut input.clone());

    // Whatever decodes as an i64 re-encodes to the same value
    let mut buf = input.clone();
    if let Ok(value) = read_packed_i64(&mut buf) {
        let mut encoded = BytesMut::new();
        write_packed_i64(&mut encoded, value);
        assert_eq!(encoded.len(), packed_len_i64(value));
        let decoded = read_packed_i64(&mut encoded.freeze()).unwrap();
        assert_eq!(decoded, value);
    }
});
