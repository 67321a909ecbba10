//! Packed Integer Encoding
//!
//! Every key and metadata structure on the hot path stores its integers in the
//! "packed" variable-length format. Peers running the reference format read the
//! same bytes, so the layout below must not change.
//!
//! ## Layout
//! - **First byte**: bit `0x80` is the continuation flag, bit `0x40` is the sign
//!   flag and bits `0x3F` hold the six least significant data bits
//! - **Following bytes**: bit `0x80` is the continuation flag, bits `0x7F` hold the
//!   next seven data bits
//! - Negative values are written as their one's complement (`!v`) with the sign
//!   flag set, so `-1` encodes as the single byte `0x40`
//!
//! An `i32` takes 1-5 bytes and an `i64` 1-10 bytes depending on magnitude.
//!
//! ## Why Not ZigZag?
//! The format predates this crate and is shared with other nodes, so the sign
//! handling is fixed: a sign bit in the first byte rather than ZigZag interleaving.
//! Small magnitudes of either sign still fit in one byte.
//!
//! ## Usage
//! ```ignore
//! let mut buf = BytesMut::new();
//! write_packed_i64(&mut buf, -42);
//! let value = read_packed_i64(&mut buf.as_ref())?;  // Returns -42
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Error, Result};

/// Sign flag carried in the first byte
const SIGN_BIT: u8 = 0x40;

/// Continuation flag carried in every byte
const CONTINUATION_BIT: u8 = 0x80;

/// Maximum encoded length of a packed `i32`
pub const MAX_PACKED_I32_LEN: usize = 5;

/// Maximum encoded length of a packed `i64`
pub const MAX_PACKED_I64_LEN: usize = 10;

/// Encode an `i32` in the packed format
pub fn write_packed_i32(buf: &mut impl BufMut, value: i32) {
    let mut first = 0u8;
    let mut n = value;
    if n < 0 {
        first = SIGN_BIT;
        n = !n;
    }

    let mut n = n as u32;
    let mut byte = first | (n & 0x3F) as u8;
    n >>= 6;

    while n != 0 {
        buf.put_u8(byte | CONTINUATION_BIT);
        byte = (n & 0x7F) as u8;
        n >>= 7;
    }

    buf.put_u8(byte);
}

/// Encode an `i64` in the packed format
pub fn write_packed_i64(buf: &mut impl BufMut, value: i64) {
    let mut first = 0u8;
    let mut n = value;
    if n < 0 {
        first = SIGN_BIT;
        n = !n;
    }

    let mut n = n as u64;
    let mut byte = first | (n & 0x3F) as u8;
    n >>= 6;

    while n != 0 {
        buf.put_u8(byte | CONTINUATION_BIT);
        byte = (n & 0x7F) as u8;
        n >>= 7;
    }

    buf.put_u8(byte);
}

/// Encode a non-negative identifier (channel, partition) as a packed `i32`
pub fn write_packed_u32(buf: &mut impl BufMut, value: u32) {
    write_packed_i32(buf, value as i32);
}

/// Decode a packed `i32`
pub fn read_packed_i32(buf: &mut impl Buf) -> Result<i32> {
    let mut byte = next_byte(buf)?;
    let negative = byte & SIGN_BIT != 0;
    let mut value = (byte & 0x3F) as u32;
    let mut shift = 6;
    let mut len = 1;

    while byte & CONTINUATION_BIT != 0 {
        if len == MAX_PACKED_I32_LEN {
            return Err(Error::malformed("packed int exceeds 5 bytes"));
        }
        byte = next_byte(buf)?;
        value |= ((byte & 0x7F) as u32) << shift;
        shift += 7;
        len += 1;
    }

    let value = value as i32;
    Ok(if negative { !value } else { value })
}

/// Decode a packed `i64`
pub fn read_packed_i64(buf: &mut impl Buf) -> Result<i64> {
    let mut byte = next_byte(buf)?;
    let negative = byte & SIGN_BIT != 0;
    let mut value = (byte & 0x3F) as u64;
    let mut shift = 6;
    let mut len = 1;

    while byte & CONTINUATION_BIT != 0 {
        if len == MAX_PACKED_I64_LEN {
            return Err(Error::malformed("packed long exceeds 10 bytes"));
        }
        byte = next_byte(buf)?;
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        len += 1;
    }

    let value = value as i64;
    Ok(if negative { !value } else { value })
}

/// Decode a packed `i32` that must hold a non-negative identifier
pub fn read_packed_u32(buf: &mut impl Buf) -> Result<u32> {
    let value = read_packed_i32(buf)?;
    if value < 0 {
        return Err(Error::Malformed(format!(
            "expected a non-negative packed int, found {value}"
        )));
    }
    Ok(value as u32)
}

/// Number of bytes `write_packed_i32` will produce for `value`
pub fn packed_len_i32(value: i32) -> usize {
    let n = if value < 0 { !value } else { value } as u32;
    if n < 0x40 {
        1
    } else {
        ((0x27 - n.leading_zeros()) / 7) as usize
    }
}

/// Number of bytes `write_packed_i64` will produce for `value`
pub fn packed_len_i64(value: i64) -> usize {
    let n = if value < 0 { !value } else { value } as u64;
    if n < 0x40 {
        1
    } else {
        ((0x47 - n.leading_zeros()) / 7) as usize
    }
}

/// Write a length-prefixed byte string (packed length, then the bytes)
pub fn write_packed_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    write_packed_i32(buf, bytes.len() as i32);
    buf.put_slice(bytes);
}

/// Read a length-prefixed byte string written by [`write_packed_bytes`]
pub fn read_packed_bytes(buf: &mut impl Buf) -> Result<Bytes> {
    let len = read_packed_i32(buf)?;
    if len < 0 {
        return Err(Error::Malformed(format!("negative length prefix {len}")));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::Malformed(format!(
            "length prefix {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

fn next_byte(buf: &mut impl Buf) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::malformed("truncated packed integer"));
    }
    Ok(buf.get_u8())
}
