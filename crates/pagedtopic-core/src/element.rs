//! Stored Elements
//!
//! Two hot-path structures describe every published element:
//!
//! - **`ContentKey`**: the storage key `(channel, page, element offset)`
//! - **`PageElement`**: the stored value, a serialized application value with its
//!   metadata attached as a decoration
//!
//! ## ContentKey Layout
//! ```text
//! [FMT_EXT][packed partition][packed channel][packed page][packed element]
//! ```
//! The partition is redundant with `(channel, page)` but is packed explicitly so
//! the store can route the key without recomputing it. A key may also arrive with
//! an int-decoration prefix `[FMT_IDO][packed partition]` in front of that body.
//!
//! Key identity is exactly `(channel, page, element)`; the partition is derived.
//!
//! ## PageElement Layout
//! The value bytes are kept contiguous as decoration 0. Metadata lives in
//! decoration `DECO_CUSTOM` as the packed sequence
//! `[channel][page][offset][timestamp]`, so positions and timestamps can be read
//! without touching (or understanding) the value.

use std::fmt;
use std::sync::OnceLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::decoration::{self, DECO_CUSTOM, FMT_EXT, FMT_IDO};
use crate::error::{Error, Result};
use crate::partitioning::partition_for_page;
use crate::position::PagedPosition;
use crate::varint::{
    read_packed_i32, read_packed_i64, read_packed_u32, write_packed_i32, write_packed_i64,
    write_packed_u32,
};

/// Storage key of one element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    pub channel: u32,
    pub page: i64,
    pub element: i32,
}

impl ContentKey {
    pub const fn new(channel: u32, page: i64, element: i32) -> Self {
        Self {
            channel,
            page,
            element,
        }
    }

    /// Partition owning this key, the partition of its page
    pub fn partition(&self, partition_count: u32) -> u32 {
        partition_for_page(self.channel, self.page, partition_count)
    }

    pub fn position(&self) -> PagedPosition {
        PagedPosition::new(self.page, self.element)
    }

    /// Binary form of this key within a topic of `partition_count` partitions
    pub fn binary(&self, partition_count: u32) -> Bytes {
        Self::to_binary(
            self.partition(partition_count),
            self.channel,
            self.page,
            self.element,
        )
    }

    /// Binary form of a key, built without constructing a `ContentKey`
    pub fn to_binary(partition: u32, channel: u32, page: i64, element: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(21);
        buf.put_u8(FMT_EXT);
        write_packed_u32(&mut buf, partition);
        write_packed_u32(&mut buf, channel);
        write_packed_i64(&mut buf, page);
        write_packed_i32(&mut buf, element);
        buf.freeze()
    }

    /// Binary form carrying the int-decoration routing prefix
    pub fn to_decorated_binary(partition: u32, channel: u32, page: i64, element: i32) -> Bytes {
        let body = Self::to_binary(partition, channel, page, element);
        let mut buf = BytesMut::with_capacity(body.len() + 6);
        buf.put_u8(FMT_IDO);
        write_packed_u32(&mut buf, partition);
        buf.put_slice(&body);
        buf.freeze()
    }

    pub fn from_binary(bytes: &Bytes) -> Result<Self> {
        Self::decode(bytes).map(|(_, key)| key)
    }

    /// Partition packed into a binary key
    pub fn partition_of_binary(bytes: &Bytes) -> Result<u32> {
        Self::decode(bytes).map(|(partition, _)| partition)
    }

    fn decode(bytes: &Bytes) -> Result<(u32, Self)> {
        let mut buf = bytes.clone();
        let mut format = read_format(&mut buf)?;
        if format == FMT_IDO {
            read_packed_u32(&mut buf)?;
            format = read_format(&mut buf)?;
        }
        if format != FMT_EXT {
            return Err(Error::Malformed(format!("unknown content key format {format}")));
        }

        let partition = read_packed_u32(&mut buf)?;
        let key = Self {
            channel: read_packed_u32(&mut buf)?,
            page: read_packed_i64(&mut buf)?,
            element: read_packed_i32(&mut buf)?,
        };
        if buf.has_remaining() {
            return Err(Error::Malformed(format!(
                "{} trailing bytes after content key",
                buf.remaining()
            )));
        }
        Ok((partition, key))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContentKey(channel={}, page={}, element={})",
            self.channel, self.page, self.element
        )
    }
}

fn read_format(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::malformed("empty content key"));
    }
    Ok(buf.get_u8())
}

/// Metadata decorated onto every stored element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementMetadata {
    pub channel: u32,
    pub page: i64,
    pub offset: i32,
    /// Acceptance time (ms since epoch)
    pub timestamp: i64,
}

impl ElementMetadata {
    fn to_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(25);
        write_packed_u32(&mut buf, self.channel);
        write_packed_i64(&mut buf, self.page);
        write_packed_i32(&mut buf, self.offset);
        write_packed_i64(&mut buf, self.timestamp);
        buf.freeze()
    }

    fn from_element(bin: &Bytes) -> Result<Self> {
        let mut buf = decoration::get_decoration(bin, DECO_CUSTOM)?
            .ok_or_else(|| Error::malformed("page element has no metadata decoration"))?;
        Ok(Self {
            channel: read_packed_u32(&mut buf)?,
            page: read_packed_i64(&mut buf)?,
            offset: read_packed_i32(&mut buf)?,
            timestamp: read_packed_i64(&mut buf)?,
        })
    }
}

/// A stored element: the value binary plus lazily decoded metadata
#[derive(Debug, Clone)]
pub struct PageElement {
    binary: Bytes,
    metadata: OnceLock<ElementMetadata>,
}

impl PageElement {
    /// Decorate `value` with its element metadata
    pub fn encode(channel: u32, page: i64, offset: i32, timestamp: i64, value: Bytes) -> Result<Self> {
        let metadata = ElementMetadata {
            channel,
            page,
            offset,
            timestamp,
        };
        let binary = decoration::decorate_value(value, DECO_CUSTOM, metadata.to_bytes())?;
        Ok(Self {
            binary,
            metadata: OnceLock::from(metadata),
        })
    }

    /// Wrap a stored binary; metadata is decoded on first access
    pub fn from_binary(binary: Bytes) -> Self {
        Self {
            binary,
            metadata: OnceLock::new(),
        }
    }

    pub fn binary(&self) -> &Bytes {
        &self.binary
    }

    pub fn metadata(&self) -> Result<&ElementMetadata> {
        if let Some(metadata) = self.metadata.get() {
            return Ok(metadata);
        }
        let metadata = ElementMetadata::from_element(&self.binary)?;
        Ok(self.metadata.get_or_init(|| metadata))
    }

    pub fn channel(&self) -> Result<u32> {
        Ok(self.metadata()?.channel)
    }

    pub fn page(&self) -> Result<i64> {
        Ok(self.metadata()?.page)
    }

    pub fn offset(&self) -> Result<i32> {
        Ok(self.metadata()?.offset)
    }

    pub fn timestamp(&self) -> Result<i64> {
        Ok(self.metadata()?.timestamp)
    }

    pub fn position(&self) -> Result<PagedPosition> {
        let metadata = self.metadata()?;
        Ok(PagedPosition::new(metadata.page, metadata.offset))
    }

    /// The application value, undecorated and never deserialized
    pub fn value_binary(&self) -> Result<Bytes> {
        decoration::get_value(&self.binary)
    }

    /// Stored elements are read-only
    pub fn commit(&self) -> Result<()> {
        Err(Error::Unsupported(
            "commit is not supported on a stored page element".to_string(),
        ))
    }
}

impl PartialEq for PageElement {
    fn eq(&self, other: &Self) -> bool {
        self.binary == other.binary
    }
}

impl Eq for PageElement {}

/// Position of a stored element, reading only its metadata
pub fn extract_position(bin: &Bytes) -> Result<PagedPosition> {
    let metadata = ElementMetadata::from_element(bin)?;
    Ok(PagedPosition::new(metadata.page, metadata.offset))
}

/// Acceptance timestamp of a stored element, reading only its metadata
pub fn extract_timestamp(bin: &Bytes) -> Result<i64> {
    Ok(ElementMetadata::from_element(bin)?.timestamp)
}
