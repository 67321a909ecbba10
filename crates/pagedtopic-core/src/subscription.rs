//! Per-Partition Subscriptions
//!
//! A `Subscription` is stored for every `(partition, channel, group)`. It holds
//! the group's read cursor into this partition's pages of the channel, the
//! committed and rollback positions, and (in the channel-zero entry) the
//! group's channel allocation as last pushed from the group-wide
//! `PagedTopicSubscription`.
//!
//! ## Ownership
//! Older records tracked a single owning subscriber for everything; newer ones
//! track the group's subscribers and a channel to owner table. Both are modelled
//! by [`ChannelOwnership`], and `migrate_to_allocated` converts the former into
//! the latter explicitly.
//!
//! ## Rollback
//! When the subscriber reading a channel changes, the read position moves back
//! to the rollback position so the new owner re-reads everything the previous
//! owner had not committed.
//!
//! ## Concurrency
//! The struct is a plain value. Readers outside the partition's single-writer
//! dispatch (clients checking allocation, monitoring) go through [`Guarded`],
//! which serializes every read-modify-write and hands out copies.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocation::{ChannelAllocationStrategy, Departed};
use crate::error::{Error, Result};
use crate::identity::{SubscriberGroupId, SubscriberId, NULL_SUBSCRIBER};
use crate::position::{PagedPosition, NULL_PAGE, NULL_POSITION};
use crate::record::{read_bool, write_bool, VersionedRecord};
use crate::topic_subscription::PagedTopicSubscription;
use crate::varint::{
    read_packed_bytes, read_packed_i32, read_packed_i64, read_packed_u32, write_packed_bytes,
    write_packed_i32, write_packed_i64, write_packed_u32,
};

/// Serialized form of a subscriber group's element filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter(pub Bytes);

/// Serialized form of a subscriber group's value converter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Converter(pub Bytes);

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Converter({})", String::from_utf8_lossy(&self.0))
    }
}

pub(crate) fn write_optional_bytes(buf: &mut impl BufMut, bytes: Option<&Bytes>) {
    write_bool(buf, bytes.is_some());
    if let Some(bytes) = bytes {
        write_packed_bytes(buf, bytes);
    }
}

pub(crate) fn read_optional_bytes(buf: &mut impl Buf) -> Result<Option<Bytes>> {
    if read_bool(buf)? {
        Ok(Some(read_packed_bytes(buf)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn write_subscriber_map(buf: &mut impl BufMut, subscribers: &BTreeMap<i64, SubscriberId>) {
    write_packed_i32(buf, subscribers.len() as i32);
    for subscriber in subscribers.values() {
        subscriber.write_to(buf);
    }
}

pub(crate) fn read_subscriber_map(buf: &mut impl Buf) -> Result<BTreeMap<i64, SubscriberId>> {
    let count = read_count(buf, "subscriber")?;
    let mut subscribers = BTreeMap::new();
    for _ in 0..count {
        let subscriber = SubscriberId::read_from(buf)?;
        subscribers.insert(subscriber.id, subscriber);
    }
    Ok(subscribers)
}

pub(crate) fn write_channels(buf: &mut impl BufMut, channels: &[i64]) {
    write_packed_i32(buf, channels.len() as i32);
    for owner in channels {
        write_packed_i64(buf, *owner);
    }
}

pub(crate) fn read_channels(buf: &mut impl Buf) -> Result<Vec<i64>> {
    let count = read_count(buf, "channel")?;
    let mut channels = Vec::with_capacity(count);
    for _ in 0..count {
        channels.push(read_packed_i64(buf)?);
    }
    Ok(channels)
}

pub(crate) fn read_count(buf: &mut impl Buf, what: &str) -> Result<usize> {
    let count = read_packed_i32(buf)?;
    if count < 0 || count as usize > buf.remaining() {
        return Err(Error::Malformed(format!("invalid {what} count {count}")));
    }
    Ok(count as usize)
}

/// Who owns the channels of a group, as seen by one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOwnership {
    /// Legacy form: one subscriber owns every channel
    Single(SubscriberId),

    /// Group subscribers and the owner id of each channel
    Allocated {
        subscribers: BTreeMap<i64, SubscriberId>,
        channels: Vec<i64>,
    },
}

impl Default for ChannelOwnership {
    fn default() -> Self {
        ChannelOwnership::Allocated {
            subscribers: BTreeMap::new(),
            channels: Vec::new(),
        }
    }
}

impl ChannelOwnership {
    /// Convert the legacy single owner into a one-entry subscriber map
    ///
    /// The channel table is left empty, so lookups keep falling back to the
    /// owning subscriber until an allocation is computed.
    pub fn migrate_to_allocated(&mut self) {
        if let ChannelOwnership::Single(owner) = *self {
            let mut subscribers = BTreeMap::new();
            if !owner.is_null() {
                subscribers.insert(owner.id, owner);
            }
            *self = ChannelOwnership::Allocated {
                subscribers,
                channels: Vec::new(),
            };
        }
    }

    pub fn subscribers(&self) -> BTreeMap<i64, SubscriberId> {
        match self {
            ChannelOwnership::Single(owner) if owner.is_null() => BTreeMap::new(),
            ChannelOwnership::Single(owner) => BTreeMap::from([(owner.id, *owner)]),
            ChannelOwnership::Allocated { subscribers, .. } => subscribers.clone(),
        }
    }

    pub fn channels(&self) -> Vec<i64> {
        match self {
            ChannelOwnership::Single(_) => Vec::new(),
            ChannelOwnership::Allocated { channels, .. } => channels.clone(),
        }
    }
}

/// A group's subscription state within one partition and channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Page the group started from, `NULL_PAGE` until fully initialised
    pub subscription_head: i64,

    /// Page currently being read
    pub page: i64,

    /// Next offset to read in `page`; `i32::MAX` when detached and waiting for
    /// the next page
    pub position: i32,

    pub filter: Option<Filter>,
    pub converter: Option<Converter>,

    /// Subscriber currently reading this channel
    pub owning_subscriber: SubscriberId,

    pub ownership: ChannelOwnership,

    /// Last acknowledged position
    pub committed: PagedPosition,

    /// Position a new owner resumes from
    pub rollback: PagedPosition,

    /// Time of the last commit (ms since epoch)
    pub last_commit_timestamp: i64,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            subscription_head: NULL_PAGE,
            page: NULL_PAGE,
            position: 0,
            filter: None,
            converter: None,
            owning_subscriber: NULL_SUBSCRIBER,
            ownership: ChannelOwnership::default(),
            committed: NULL_POSITION,
            rollback: NULL_POSITION,
            last_commit_timestamp: 0,
        }
    }
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_subscription_head(&mut self, page: i64) {
        self.subscription_head = page;
    }

    pub fn set_page(&mut self, page: i64) {
        self.page = page;
    }

    pub fn set_position(&mut self, position: i32) {
        self.position = position;
    }

    pub fn set_filter(&mut self, filter: Option<Filter>) {
        self.filter = filter;
    }

    pub fn set_converter(&mut self, converter: Option<Converter>) {
        self.converter = converter;
    }

    /// Current read cursor
    pub fn read_position(&self) -> PagedPosition {
        PagedPosition::new(self.page, self.position)
    }

    /// Add a subscriber and recompute the channel allocation
    ///
    /// Returns false when the subscriber was already present.
    pub fn add_subscriber(
        &mut self,
        subscriber: SubscriberId,
        channel_count: u32,
        strategy: &dyn ChannelAllocationStrategy,
    ) -> bool {
        self.ownership.migrate_to_allocated();
        let ChannelOwnership::Allocated {
            subscribers,
            channels,
        } = &mut self.ownership
        else {
            return false;
        };

        if subscribers.insert(subscriber.id, subscriber).is_some() {
            return false;
        }
        *channels = strategy.allocate(subscribers, channel_count, &BTreeMap::new());
        true
    }

    /// Remove a subscriber and recompute the channel allocation
    ///
    /// Returns the departed subscriber keyed by member id, or an empty map when
    /// the subscriber was not present.
    pub fn remove_subscriber(
        &mut self,
        subscriber_id: i64,
        channel_count: u32,
        strategy: &dyn ChannelAllocationStrategy,
    ) -> Departed {
        let mut departed = Departed::new();
        if !self.has_subscriber(subscriber_id) {
            return departed;
        }
        self.ownership.migrate_to_allocated();
        let ChannelOwnership::Allocated {
            subscribers,
            channels,
        } = &mut self.ownership
        else {
            return departed;
        };

        if let Some(removed) = subscribers.remove(&subscriber_id) {
            departed
                .entry(removed.member_id())
                .or_default()
                .insert(removed);
            *channels = strategy.allocate(subscribers, channel_count, &BTreeMap::new());
        }
        departed
    }

    /// Remove every subscriber, leaving all channels unowned
    pub fn remove_all_subscribers(&mut self, channel_count: u32) -> Departed {
        let mut departed = Departed::new();
        for subscriber in self.ownership.subscribers().into_values() {
            departed
                .entry(subscriber.member_id())
                .or_default()
                .insert(subscriber);
        }
        self.ownership = ChannelOwnership::Allocated {
            subscribers: BTreeMap::new(),
            channels: vec![0; channel_count as usize],
        };
        departed
    }

    /// Change the subscriber reading this channel
    ///
    /// A change of owner moves the read position back to the rollback position.
    /// Page references are not touched; the partition moves them after the
    /// cursor.
    pub fn set_owning_subscriber(&mut self, subscriber: SubscriberId) {
        if self.owning_subscriber == subscriber {
            return;
        }
        debug!(
            previous = %self.owning_subscriber,
            owner = %subscriber,
            rollback = %self.rollback,
            "Channel owner changed"
        );
        self.owning_subscriber = subscriber;
        if !self.rollback.is_null() {
            self.page = self.rollback.page;
            self.position = self.rollback.offset;
        }
    }

    pub fn set_committed_position(&mut self, committed: PagedPosition, rollback: PagedPosition) {
        self.committed = committed;
        self.rollback = rollback;
        self.last_commit_timestamp = crate::current_timestamp_ms();
    }

    /// Owner id of `channel`, 0 when no one owns it
    ///
    /// Falls back to the owning subscriber while no channel table exists.
    pub fn get_channel_owner(&self, channel: u32) -> i64 {
        match &self.ownership {
            ChannelOwnership::Single(owner) => owner.id,
            ChannelOwnership::Allocated { channels, .. } if channels.is_empty() => {
                self.owning_subscriber.id
            }
            ChannelOwnership::Allocated { channels, .. } => {
                channels.get(channel as usize).copied().unwrap_or(0)
            }
        }
    }

    /// Channels owned by `subscriber_id`
    ///
    /// With no channel table the owning subscriber is treated as owning every
    /// channel, including when the group has no subscribers at all.
    pub fn get_channels(&self, subscriber_id: i64, channel_count: u32) -> Vec<u32> {
        let owns_everything = |owner: i64| -> Vec<u32> {
            if owner == subscriber_id {
                (0..channel_count).collect()
            } else {
                Vec::new()
            }
        };

        match &self.ownership {
            ChannelOwnership::Single(owner) => owns_everything(owner.id),
            ChannelOwnership::Allocated { channels, .. } if channels.is_empty() => {
                owns_everything(self.owning_subscriber.id)
            }
            ChannelOwnership::Allocated { channels, .. } => channels
                .iter()
                .enumerate()
                .filter(|(_, owner)| **owner == subscriber_id)
                .map(|(channel, _)| channel as u32)
                .collect(),
        }
    }

    /// Replace the allocation with the group-wide one
    pub fn refresh_from(&mut self, group: &PagedTopicSubscription) {
        self.ownership = ChannelOwnership::Allocated {
            subscribers: group.subscribers(),
            channels: group.channels(),
        };
    }

    pub fn has_subscriber(&self, subscriber_id: i64) -> bool {
        match &self.ownership {
            ChannelOwnership::Single(owner) => !owner.is_null() && owner.id == subscriber_id,
            ChannelOwnership::Allocated { subscribers, .. } => {
                subscribers.contains_key(&subscriber_id)
            }
        }
    }

    pub fn subscriber_ids(&self) -> Vec<i64> {
        self.ownership.subscribers().into_keys().collect()
    }

    pub fn subscribers(&self) -> BTreeMap<i64, SubscriberId> {
        self.ownership.subscribers()
    }

    pub fn channels(&self) -> Vec<i64> {
        self.ownership.channels()
    }
}

impl VersionedRecord for Subscription {
    const RECORD: &'static str = "Subscription";
    const CURRENT_VERSION: u8 = 2;

    fn write_body(&self, buf: &mut BytesMut) {
        write_packed_i64(buf, self.subscription_head);
        write_packed_i64(buf, self.page);
        write_packed_i32(buf, self.position);
        write_optional_bytes(buf, self.filter.as_ref().map(|f| &f.0));
        write_optional_bytes(buf, self.converter.as_ref().map(|c| &c.0));
        self.owning_subscriber.write_to(buf);
        // v1
        match &self.ownership {
            ChannelOwnership::Single(owner) => {
                buf.put_u8(0);
                owner.write_to(buf);
            }
            ChannelOwnership::Allocated {
                subscribers,
                channels,
            } => {
                buf.put_u8(1);
                write_subscriber_map(buf, subscribers);
                write_channels(buf, channels);
            }
        }
        // v2
        self.committed.write_to(buf);
        self.rollback.write_to(buf);
        write_packed_i64(buf, self.last_commit_timestamp);
    }

    fn read_body(version: u8, buf: &mut Bytes) -> Result<Self> {
        let mut subscription = Subscription {
            subscription_head: read_packed_i64(buf)?,
            page: read_packed_i64(buf)?,
            position: read_packed_i32(buf)?,
            filter: read_optional_bytes(buf)?.map(Filter),
            converter: read_optional_bytes(buf)?.map(Converter),
            owning_subscriber: SubscriberId::read_from(buf)?,
            ..Subscription::default()
        };

        if version == 0 {
            // the scalar owner was the only ownership record
            subscription.ownership = ChannelOwnership::Single(subscription.owning_subscriber);
            return Ok(subscription);
        }

        if !buf.has_remaining() {
            return Err(Error::malformed("truncated subscription ownership"));
        }
        subscription.ownership = match buf.get_u8() {
            0 => ChannelOwnership::Single(SubscriberId::read_from(buf)?),
            1 => ChannelOwnership::Allocated {
                subscribers: read_subscriber_map(buf)?,
                channels: read_channels(buf)?,
            },
            other => {
                return Err(Error::Malformed(format!("unknown ownership tag {other}")));
            }
        };

        if version >= 2 {
            subscription.committed = PagedPosition::read_from(buf)?;
            subscription.rollback = PagedPosition::read_from(buf)?;
            subscription.last_commit_timestamp = read_packed_i64(buf)?;
        }

        Ok(subscription)
    }
}

/// Key of a subscription; the partition is stored explicitly
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub partition: u32,
    pub channel: u32,
    pub group: SubscriberGroupId,
}

impl SubscriptionKey {
    pub fn new(partition: u32, channel: u32, group: SubscriberGroupId) -> Self {
        Self {
            partition,
            channel,
            group,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_packed_u32(buf, self.partition);
        write_packed_u32(buf, self.channel);
        self.group.write_to(buf);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            partition: read_packed_u32(buf)?,
            channel: read_packed_u32(buf)?,
            group: SubscriberGroupId::read_from(buf)?,
        })
    }
}

/// Serialized access to a shared value
///
/// The lock belongs to the in-memory handle only and is never part of the
/// value's stored form.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for Guarded<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Run `f` with exclusive access to the value
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<T: Clone> Guarded<T> {
    /// A copy of the current value
    pub fn snapshot(&self) -> T {
        self.inner.lock().clone()
    }
}

impl<T: VersionedRecord> Guarded<T> {
    pub fn encode(&self) -> Bytes {
        self.inner.lock().encode()
    }
}
