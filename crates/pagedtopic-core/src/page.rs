//! Pages
//!
//! A page is the unit of storage for one channel within one partition: a bounded
//! run of elements stored together, linked to the previous and next page the same
//! channel placed in the same partition.
//!
//! ## Page Lifecycle
//! 1. **Open**: created by the first offer to `(channel, page)`, accepts elements
//! 2. **Sealed**: full or explicitly closed; no more offers, subscribers still read
//! 3. **Sealed + Empty**: drained; exists only to unblock publishers on a full topic
//! 4. **Removed**: reference count reached zero and it is no longer the tail
//!
//! ## Reference Counting
//! A page's reference count is the number of subscriber groups attached to it,
//! plus one for the link from the previous page in the partition. Removing a page
//! is only allowed once that count reaches zero.
//!
//! ## Notifiers
//! Subscribers that have read everything in an open page register a notifier id
//! on it. The next insert drains the set and the surrounding system wakes them.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::partitioning::partition_for_page;
use crate::position::{PagedPosition, NULL_PAGE};
use crate::record::{read_bool, write_bool, VersionedRecord};
use crate::varint::{
    read_packed_i32, read_packed_i64, read_packed_u32, write_packed_i32, write_packed_i64,
    write_packed_u32,
};

/// Tail offset of a page holding no elements
pub const EMPTY: i32 = -1;

/// Sorted set of notifier ids
///
/// Stored as a sorted vector: the set is small, read far more often than it is
/// written and deserialized on every page access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierSet(Vec<i32>);

impl NotifierSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a set from arbitrary ids, sorting and dropping duplicates
    pub fn from_ids(ids: impl IntoIterator<Item = i32>) -> Self {
        let mut ids: Vec<i32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// Insert `id`, returning false if it was already present
    pub fn insert(&mut self, id: i32) -> bool {
        match self.0.binary_search(&id) {
            Ok(_) => false,
            Err(index) => {
                self.0.insert(index, id);
                true
            }
        }
    }

    pub fn contains(&self, id: i32) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    /// Remove and return every id in ascending order
    pub fn drain(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.0)
    }

    /// Remove the two adjacent ids starting at `index`
    ///
    /// Returns `None` when fewer than two ids follow `index`.
    pub fn remove_pair_at(&mut self, index: usize) -> Option<[i32; 2]> {
        if index + 1 >= self.0.len() {
            return None;
        }
        let pair = [self.0[index], self.0[index + 1]];
        self.0.drain(index..index + 2);
        Some(pair)
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_packed_i32(buf, self.0.len() as i32);
        for id in &self.0 {
            write_packed_i32(buf, *id);
        }
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        let count = read_packed_i32(buf)?;
        if count < 0 || count as usize > buf.remaining() {
            return Err(Error::Malformed(format!("invalid notifier count {count}")));
        }
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(read_packed_i32(buf)?);
        }
        Ok(Self::from_ids(ids))
    }
}

/// Key of a page: channel plus page id
///
/// The partition is derived from the mapper, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageKey {
    pub channel: u32,
    pub page: i64,
}

impl PageKey {
    pub const fn new(channel: u32, page: i64) -> Self {
        Self { channel, page }
    }

    pub fn partition(&self, partition_count: u32) -> u32 {
        partition_for_page(self.channel, self.page, partition_count)
    }

    pub fn to_binary(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(15);
        write_packed_u32(&mut buf, self.channel);
        write_packed_i64(&mut buf, self.page);
        buf.freeze()
    }

    pub fn from_binary(bytes: &Bytes) -> Result<Self> {
        let mut buf = bytes.clone();
        let channel = read_packed_u32(&mut buf)?;
        let page = read_packed_i64(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::malformed("trailing bytes after page key"));
        }
        Ok(Self { channel, page })
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({}, {})", self.channel, self.page)
    }
}

/// Metadata for one page of a channel within a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Next page of this channel in the same partition
    pub next_partition_page: i64,

    /// Previous page of this channel in the same partition
    pub previous_partition_page: i64,

    /// Offset of the last element, or `EMPTY`
    pub tail: i32,

    /// No further offers are accepted once sealed
    pub sealed: bool,

    /// Total size of the element binaries
    pub byte_size: i64,

    /// Attached subscriber groups plus the link from the previous page
    pub reference_count: i32,

    /// Notifiers to wake on the next insert
    pub insertion_notifiers: NotifierSet,

    /// Time the first element was inserted (ms since epoch)
    pub head_timestamp: i64,

    /// Time the latest element was inserted (ms since epoch)
    pub tail_timestamp: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            next_partition_page: NULL_PAGE,
            previous_partition_page: NULL_PAGE,
            tail: EMPTY,
            sealed: false,
            byte_size: 0,
            reference_count: 0,
            insertion_notifiers: NotifierSet::new(),
            head_timestamp: 0,
            tail_timestamp: 0,
        }
    }
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tail == EMPTY
    }

    pub fn is_sealed_and_empty(&self) -> bool {
        self.sealed && self.is_empty()
    }

    pub fn is_subscribed(&self) -> bool {
        self.reference_count > 0
    }

    pub fn set_sealed(&mut self, sealed: bool) {
        self.sealed = sealed;
    }

    pub fn set_tail(&mut self, tail: i32) {
        self.tail = tail;
    }

    pub fn set_byte_size(&mut self, byte_size: i64) {
        self.byte_size = byte_size;
    }

    pub fn set_next_partition_page(&mut self, page: i64) {
        self.next_partition_page = page;
    }

    pub fn set_previous_partition_page(&mut self, page: i64) {
        self.previous_partition_page = page;
    }

    /// Reset the page to hold no elements
    pub fn mark_empty(&mut self) {
        self.tail = EMPTY;
        self.byte_size = 0;
    }

    /// Adjust the reference count, returning the new count
    pub fn adjust_reference_count(&mut self, delta: i32) -> i32 {
        self.reference_count += delta;
        self.reference_count
    }

    pub fn increment_reference_count(&mut self) -> i32 {
        self.adjust_reference_count(1)
    }

    pub fn decrement_reference_count(&mut self) -> i32 {
        self.adjust_reference_count(-1)
    }

    pub fn add_insertion_notifier(&mut self, notifier_id: i32) {
        self.insertion_notifiers.insert(notifier_id);
    }

    /// Drain the insertion notifiers
    pub fn reset_insertion_notifiers(&mut self) -> Vec<i32> {
        self.insertion_notifiers.drain()
    }

    pub fn set_insertion_notifiers(&mut self, notifiers: NotifierSet) {
        self.insertion_notifiers = notifiers;
    }

    /// Record an insert at `timestamp`
    pub fn touch(&mut self, timestamp: i64) {
        if self.head_timestamp == 0 {
            self.head_timestamp = timestamp;
        }
        self.tail_timestamp = timestamp;
    }
}

impl VersionedRecord for Page {
    const RECORD: &'static str = "Page";
    const CURRENT_VERSION: u8 = 1;

    fn write_body(&self, buf: &mut BytesMut) {
        write_packed_i64(buf, self.next_partition_page);
        write_packed_i32(buf, self.tail);
        write_bool(buf, self.sealed);
        write_packed_i64(buf, self.byte_size);
        write_packed_i32(buf, self.reference_count);
        self.insertion_notifiers.write_to(buf);
        // v1
        write_packed_i64(buf, self.previous_partition_page);
        write_packed_i64(buf, self.head_timestamp);
        write_packed_i64(buf, self.tail_timestamp);
    }

    fn read_body(version: u8, buf: &mut Bytes) -> Result<Self> {
        let mut page = Page {
            next_partition_page: read_packed_i64(buf)?,
            tail: read_packed_i32(buf)?,
            sealed: read_bool(buf)?,
            byte_size: read_packed_i64(buf)?,
            reference_count: read_packed_i32(buf)?,
            insertion_notifiers: NotifierSet::read_from(buf)?,
            ..Page::default()
        };

        if version >= 1 {
            page.previous_partition_page = read_packed_i64(buf)?;
            page.head_timestamp = read_packed_i64(buf)?;
            page.tail_timestamp = read_packed_i64(buf)?;
        }

        Ok(page)
    }
}

/// Position of the first element of a page
pub fn head_position(key: &PageKey, page: &Page) -> PagedPosition {
    let offset = if page.is_empty() { EMPTY } else { 0 };
    PagedPosition::new(key.page, offset)
}

/// Position of the last element of a page
pub fn tail_position(key: &PageKey, page: &Page) -> PagedPosition {
    PagedPosition::new(key.page, page.tail)
}

/// Whether a page is sealed and drained
pub fn is_sealed_and_empty(page: &Page) -> bool {
    page.is_sealed_and_empty()
}
