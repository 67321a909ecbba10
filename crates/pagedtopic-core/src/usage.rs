//! Per-Partition Channel Usage
//!
//! Each partition keeps one `Usage` record per channel with the page chain
//! bookkeeping for that channel:
//!
//! - **publication_tail**: the topic-wide tail page (meaningful only in the
//!   channel's authoritative partition)
//! - **partition_head / partition_tail**: first and last page of the channel held
//!   in this partition, `NULL_PAGE` when none
//! - **partition_max**: the highest page ever created here; never reset, so a
//!   removed page is never recreated
//! - **waiting_subscriber_count**: subscribers that drained the partition and
//!   must be attached to the next page created
//! - **removal_notifiers**: publishers to wake when a page is removed
//! - **anonymous_subscribers**: non-durable groups subscribed in this partition

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::SubscriberGroupId;
use crate::page::NotifierSet;
use crate::position::NULL_PAGE;
use crate::record::VersionedRecord;
use crate::varint::{
    read_packed_i32, read_packed_i64, read_packed_u32, write_packed_i32, write_packed_i64,
    write_packed_u32,
};

/// Anonymous subscriber groups of a partition
///
/// Decoded records hold an immutable list; the first mutation promotes it to a
/// set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymousSubscribers {
    Immutable(Vec<SubscriberGroupId>),
    Mutable(BTreeSet<SubscriberGroupId>),
}

impl Default for AnonymousSubscribers {
    fn default() -> Self {
        AnonymousSubscribers::Immutable(Vec::new())
    }
}

impl AnonymousSubscribers {
    /// Apply `f` to the mutable set, promoting the immutable list first
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut BTreeSet<SubscriberGroupId>) -> R) -> R {
        match self {
            AnonymousSubscribers::Mutable(set) => f(set),
            AnonymousSubscribers::Immutable(list) => {
                let mut set: BTreeSet<SubscriberGroupId> = std::mem::take(list).into_iter().collect();
                let result = f(&mut set);
                *self = AnonymousSubscribers::Mutable(set);
                result
            }
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, AnonymousSubscribers::Mutable(_))
    }

    pub fn len(&self) -> usize {
        match self {
            AnonymousSubscribers::Immutable(list) => list.len(),
            AnonymousSubscribers::Mutable(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &SubscriberGroupId> + '_> {
        match self {
            AnonymousSubscribers::Immutable(list) => Box::new(list.iter()),
            AnonymousSubscribers::Mutable(set) => Box::new(set.iter()),
        }
    }
}

/// Channel bookkeeping within one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub publication_tail: i64,
    pub partition_head: i64,
    pub partition_tail: i64,
    pub partition_max: i64,
    pub waiting_subscriber_count: i32,
    pub removal_notifiers: NotifierSet,
    pub anonymous_subscribers: AnonymousSubscribers,
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            publication_tail: NULL_PAGE,
            partition_head: NULL_PAGE,
            partition_tail: NULL_PAGE,
            partition_max: NULL_PAGE,
            waiting_subscriber_count: 0,
            removal_notifiers: NotifierSet::new(),
            anonymous_subscribers: AnonymousSubscribers::default(),
        }
    }
}

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_publication_tail(&mut self, page: i64) {
        self.publication_tail = page;
    }

    pub fn set_partition_head(&mut self, page: i64) {
        self.partition_head = page;
    }

    /// Set the partition tail; `partition_max` only ever moves forward
    pub fn set_partition_tail(&mut self, page: i64) {
        self.partition_tail = page;
        self.partition_max = self.partition_max.max(page);
    }

    pub fn set_partition_max(&mut self, page: i64) {
        self.partition_max = self.partition_max.max(page);
    }

    /// Adjust the waiting subscriber count, returning the new count
    pub fn adjust_waiting_subscriber_count(&mut self, delta: i32) -> i32 {
        self.waiting_subscriber_count += delta;
        self.waiting_subscriber_count
    }

    /// Clear the waiting subscriber count, returning its previous value
    pub fn reset_waiting_subscriber_count(&mut self) -> i32 {
        std::mem::take(&mut self.waiting_subscriber_count)
    }

    pub fn add_removal_notifier(&mut self, notifier_id: i32) {
        self.removal_notifiers.insert(notifier_id);
    }

    /// Drain the removal notifiers
    pub fn reset_removal_notifiers(&mut self) -> Vec<i32> {
        self.removal_notifiers.drain()
    }

    pub fn add_anonymous_subscriber(&mut self, group: SubscriberGroupId) -> bool {
        self.anonymous_subscribers.mutate(|set| set.insert(group))
    }

    pub fn remove_anonymous_subscriber(&mut self, group: &SubscriberGroupId) -> bool {
        self.anonymous_subscribers.mutate(|set| set.remove(group))
    }

    /// Snapshot of the anonymous subscriber groups
    pub fn anonymous_subscribers(&self) -> Vec<SubscriberGroupId> {
        self.anonymous_subscribers.iter().cloned().collect()
    }
}

impl VersionedRecord for Usage {
    const RECORD: &'static str = "Usage";
    const CURRENT_VERSION: u8 = 0;

    fn write_body(&self, buf: &mut BytesMut) {
        write_packed_i64(buf, self.publication_tail);
        write_packed_i64(buf, self.partition_head);
        write_packed_i64(buf, self.partition_tail);
        write_packed_i64(buf, self.partition_max);
        write_packed_i32(buf, self.waiting_subscriber_count);
        self.removal_notifiers.write_to(buf);
        write_packed_i32(buf, self.anonymous_subscribers.len() as i32);
        for group in self.anonymous_subscribers.iter() {
            group.write_to(buf);
        }
    }

    fn read_body(_version: u8, buf: &mut Bytes) -> Result<Self> {
        let publication_tail = read_packed_i64(buf)?;
        let partition_head = read_packed_i64(buf)?;
        let partition_tail = read_packed_i64(buf)?;
        let partition_max = read_packed_i64(buf)?;
        let waiting_subscriber_count = read_packed_i32(buf)?;
        let removal_notifiers = NotifierSet::read_from(buf)?;

        let count = read_packed_i32(buf)?;
        if count < 0 || count as usize > buf.remaining() {
            return Err(Error::Malformed(format!(
                "invalid anonymous subscriber count {count}"
            )));
        }
        let mut groups = Vec::with_capacity(count as usize);
        for _ in 0..count {
            groups.push(SubscriberGroupId::read_from(buf)?);
        }

        Ok(Self {
            publication_tail,
            partition_head,
            partition_tail,
            partition_max,
            waiting_subscriber_count,
            removal_notifiers,
            anonymous_subscribers: AnonymousSubscribers::Immutable(groups),
        })
    }
}

/// Key of a usage record; the partition is stored explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageKey {
    pub partition: u32,
    pub channel: u32,
}

impl UsageKey {
    pub const fn new(partition: u32, channel: u32) -> Self {
        Self { partition, channel }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_packed_u32(buf, self.partition);
        write_packed_u32(buf, self.channel);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            partition: read_packed_u32(buf)?,
            channel: read_packed_u32(buf)?,
        })
    }
}
