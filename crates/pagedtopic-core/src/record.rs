//! Versioned Record Formats
//!
//! `Page`, `Usage`, `Subscription`, `PagedTopicSubscription` and `SubscriberInfo`
//! are stored as `[version: u8][body]`. The version is the format the *writer*
//! used, and readers branch on it rather than on the newest format they know:
//!
//! - **Older version**: decode the fields that version defines and default the
//!   rest (null owner, zero timestamps, null positions)
//! - **Same version**: decode everything
//! - **Newer version**: fail with `Error::UnsupportedVersion`
//!
//! This lets nodes running different releases share stored records during a
//! rolling upgrade.
//!
//! ## Example
//! ```ignore
//! let bytes = page.encode();
//! let page = Page::decode(&bytes)?;
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// A record stored with an explicit format version
pub trait VersionedRecord: Sized {
    /// Record name used in error messages
    const RECORD: &'static str;

    /// Version written by `encode`
    const CURRENT_VERSION: u8;

    /// Write the current-version body
    fn write_body(&self, buf: &mut BytesMut);

    /// Read a body written in `version` (never newer than `CURRENT_VERSION`)
    fn read_body(version: u8, buf: &mut Bytes) -> Result<Self>;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(Self::CURRENT_VERSION);
        self.write_body(&mut buf);
        buf.freeze()
    }

    fn decode(bytes: &Bytes) -> Result<Self> {
        let mut buf = bytes.clone();
        if !buf.has_remaining() {
            return Err(Error::Malformed(format!("empty {} record", Self::RECORD)));
        }

        let version = buf.get_u8();
        if version > Self::CURRENT_VERSION {
            return Err(Error::UnsupportedVersion {
                record: Self::RECORD,
                version,
            });
        }

        let record = Self::read_body(version, &mut buf)?;
        if buf.has_remaining() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes after {} v{version}",
                buf.remaining(),
                Self::RECORD
            )));
        }
        Ok(record)
    }
}

pub(crate) fn write_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(value as u8);
}

pub(crate) fn read_bool(buf: &mut impl Buf) -> Result<bool> {
    if !buf.has_remaining() {
        return Err(Error::malformed("truncated boolean"));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::Malformed(format!("invalid boolean byte {other}"))),
    }
}

pub(crate) fn write_string(buf: &mut impl BufMut, value: &str) {
    crate::varint::write_packed_bytes(buf, value.as_bytes());
}

pub(crate) fn read_string(buf: &mut impl Buf) -> Result<String> {
    let bytes = crate::varint::read_packed_bytes(buf)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Malformed(format!("invalid UTF-8 string: {e}")))
}

pub(crate) fn write_uuid(buf: &mut impl BufMut, uuid: Option<uuid::Uuid>) {
    match uuid {
        Some(uuid) => {
            buf.put_u8(1);
            buf.put_slice(uuid.as_bytes());
        }
        None => buf.put_u8(0),
    }
}

pub(crate) fn read_uuid(buf: &mut impl Buf) -> Result<Option<uuid::Uuid>> {
    if !read_bool(buf)? {
        return Ok(None);
    }
    if buf.remaining() < 16 {
        return Err(Error::malformed("truncated uuid"));
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Some(uuid::Uuid::from_bytes(raw)))
}
