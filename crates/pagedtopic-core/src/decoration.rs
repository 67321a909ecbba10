//! Decorated Binaries
//!
//! A decorated binary carries a value plus up to 64 independent "decorations"
//! (small binaries keyed by id) without interleaving them with the value. The
//! topic uses this to attach element metadata (channel, page, offset, timestamp)
//! to a stored value so that metadata can be read without touching the value.
//!
//! ## Layout
//! ```text
//! [18][mask: u8]          [len][bytes] [len][bytes] ...   ids < 8
//! [19][mask: packed long] [len][bytes] [len][bytes] ...   any id >= 8
//! ```
//! Each set bit of the mask names a decoration; the decorations follow in
//! ascending id order, each as a packed-int length followed by its bytes.
//! Decoration `DECO_VALUE` (id 0) is the undecorated value.
//!
//! An undecorated binary is just the value. Decorating it promotes the value to
//! decoration 0, and removing the last non-value decoration collapses the binary
//! back to the plain value.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::varint::{read_packed_i32, read_packed_i64, write_packed_i32, write_packed_i64};

/// Format byte of a decorated binary with an 8-bit mask
pub const FMT_BIN_DECO: u8 = 18;

/// Format byte of a decorated binary with a packed-long mask
pub const FMT_BIN_EXT_DECO: u8 = 19;

/// Format byte of an int-decorated key prefix
pub const FMT_IDO: u8 = 13;

/// Format byte of a plain key body
pub const FMT_EXT: u8 = 21;

/// Decoration holding the undecorated value
pub const DECO_VALUE: u8 = 0;

/// Application decoration used for page element metadata
pub const DECO_CUSTOM: u8 = 7;

/// First application-definable decoration of the extended range
pub const DECO_APP_1: u8 = 10;

pub const DECO_ID_MIN: u8 = 0;
pub const DECO_ID_MAX: u8 = 63;

/// Whether `bin` is in one of the decorated formats
pub fn is_decorated(bin: &[u8]) -> bool {
    bin.len() > 1 && matches!(bin[0], FMT_BIN_DECO | FMT_BIN_EXT_DECO)
}

/// Return `bin` with decoration `id` set to `deco`, replacing any previous one
pub fn decorate(bin: &Bytes, id: u8, deco: Bytes) -> Result<Bytes> {
    check_id(id)?;

    if id == DECO_VALUE && !is_decorated(bin) && !is_decorated(&deco) {
        // a lone value never needs the decorated envelope
        return Ok(deco);
    }

    let mut decorations = split(bin)?;
    decorations.insert(id, deco);
    Ok(join(&decorations))
}

/// Decorate a raw value that must never be taken for a decorated binary
///
/// Unlike [`decorate`], the value is always stored as decoration 0, even when
/// its first byte happens to be a decoration format byte.
pub fn decorate_value(value: Bytes, id: u8, deco: Bytes) -> Result<Bytes> {
    check_id(id)?;
    if id == DECO_VALUE {
        return Err(Error::malformed("cannot decorate a value with itself"));
    }

    let mut decorations = BTreeMap::new();
    decorations.insert(DECO_VALUE, value);
    decorations.insert(id, deco);
    Ok(join(&decorations))
}

/// Return decoration `id` of `bin`, if present
///
/// For an undecorated binary the only decoration is the value itself.
pub fn get_decoration(bin: &Bytes, id: u8) -> Result<Option<Bytes>> {
    check_id(id)?;

    if !is_decorated(bin) {
        return Ok((id == DECO_VALUE).then(|| bin.clone()));
    }

    let mut buf = bin.clone();
    let mask = read_mask(&mut buf)?;
    for current in 0..=DECO_ID_MAX {
        if mask & (1u64 << current) == 0 {
            continue;
        }
        let len = read_len(&mut buf)?;
        if current == id {
            return Ok(Some(buf.copy_to_bytes(len)));
        }
        buf.advance(len);
    }
    Ok(None)
}

/// Remove decoration `id` from `bin`
pub fn undecorate(bin: &Bytes, id: u8) -> Result<Bytes> {
    check_id(id)?;

    if !is_decorated(bin) {
        return Ok(if id == DECO_VALUE { Bytes::new() } else { bin.clone() });
    }

    let mut decorations = split(bin)?;
    if decorations.remove(&id).is_none() {
        return Ok(bin.clone());
    }
    Ok(join(&decorations))
}

/// The undecorated value of `bin`; empty when a decorated binary has no value
pub fn get_value(bin: &Bytes) -> Result<Bytes> {
    Ok(get_decoration(bin, DECO_VALUE)?.unwrap_or_default())
}

fn check_id(id: u8) -> Result<()> {
    if id > DECO_ID_MAX {
        return Err(Error::Malformed(format!(
            "decoration id {id} out of range {DECO_ID_MIN}..={DECO_ID_MAX}"
        )));
    }
    Ok(())
}

fn read_mask(buf: &mut Bytes) -> Result<u64> {
    match buf.get_u8() {
        FMT_BIN_DECO => {
            if !buf.has_remaining() {
                return Err(Error::malformed("decorated binary is missing its mask"));
            }
            Ok(buf.get_u8() as u64)
        }
        FMT_BIN_EXT_DECO => Ok(read_packed_i64(buf)? as u64),
        other => Err(Error::Malformed(format!("unknown decoration format {other}"))),
    }
}

fn read_len(buf: &mut Bytes) -> Result<usize> {
    let len = read_packed_i32(buf)?;
    if len < 0 || len as usize > buf.remaining() {
        return Err(Error::Malformed(format!(
            "decoration length {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    Ok(len as usize)
}

/// Break a binary into its decorations, promoting an undecorated value to id 0
fn split(bin: &Bytes) -> Result<BTreeMap<u8, Bytes>> {
    let mut decorations = BTreeMap::new();

    if !is_decorated(bin) {
        if !bin.is_empty() {
            decorations.insert(DECO_VALUE, bin.clone());
        }
        return Ok(decorations);
    }

    let mut buf = bin.clone();
    let mask = read_mask(&mut buf)?;
    for id in 0..=DECO_ID_MAX {
        if mask & (1u64 << id) != 0 {
            let len = read_len(&mut buf)?;
            decorations.insert(id, buf.copy_to_bytes(len));
        }
    }
    if buf.has_remaining() {
        return Err(Error::Malformed(format!(
            "{} trailing bytes after decorations",
            buf.remaining()
        )));
    }
    Ok(decorations)
}

fn join(decorations: &BTreeMap<u8, Bytes>) -> Bytes {
    match decorations.len() {
        0 => return Bytes::new(),
        1 => {
            if let Some(value) = decorations.get(&DECO_VALUE) {
                if !is_decorated(value) {
                    return value.clone();
                }
            }
        }
        _ => {}
    }

    let mask = decorations
        .keys()
        .fold(0u64, |mask, id| mask | (1u64 << id));
    let extended = decorations.keys().any(|id| *id >= 8);

    let mut buf = BytesMut::with_capacity(
        11 + decorations.values().map(|d| d.len() + 5).sum::<usize>(),
    );
    if extended {
        buf.put_u8(FMT_BIN_EXT_DECO);
        write_packed_i64(&mut buf, mask as i64);
    } else {
        buf.put_u8(FMT_BIN_DECO);
        buf.put_u8(mask as u8);
    }
    for deco in decorations.values() {
        write_packed_i32(&mut buf, deco.len() as i32);
        buf.put_slice(deco);
    }
    buf.freeze()
}
