//! Group-Wide Subscription Record
//!
//! `PagedTopicSubscription` is the single source of truth for a subscriber
//! group: its live subscribers, the full channel allocation, manual channel
//! pins, connect timestamps and the filter and converter the group was created
//! with. Per-partition [`Subscription`](crate::subscription::Subscription)
//! entries are refreshed from it.
//!
//! ## Invariants
//! - The filter and converter are fixed when the group is created; any later
//!   subscriber asking for different ones is rejected
//! - `owned_channels` is always the inverse of `channels`, rebuilt by
//!   `update_channel_allocations`
//! - A subscriber owning one channel is indexed by that channel alone; the set
//!   form is only used for subscribers owning several channels

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allocation::{ChannelAllocationStrategy, Departed};
use crate::error::{Error, Result};
use crate::identity::{Member, SubscriberGroupId, SubscriberId};
use crate::record::{read_string, write_string, VersionedRecord};
use crate::subscription::{
    read_channels, read_count, read_optional_bytes, read_subscriber_map, write_channels,
    write_optional_bytes, write_subscriber_map, Converter, Filter,
};
use crate::varint::{
    read_packed_i64, read_packed_u32, write_packed_i32, write_packed_i64, write_packed_u32,
};

/// Channels owned by one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnedChannels {
    One(u32),
    Many(BTreeSet<u32>),
}

impl OwnedChannels {
    fn add(&mut self, channel: u32) {
        match self {
            OwnedChannels::One(existing) if *existing == channel => {}
            OwnedChannels::One(existing) => {
                *self = OwnedChannels::Many(BTreeSet::from([*existing, channel]));
            }
            OwnedChannels::Many(channels) => {
                channels.insert(channel);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            OwnedChannels::One(channel) => vec![*channel],
            OwnedChannels::Many(channels) => channels.iter().copied().collect(),
        }
    }
}

/// Group-wide subscription state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedTopicSubscription {
    pub topic: String,
    pub group: SubscriberGroupId,

    /// Unique id of this incarnation of the group
    pub subscription_id: i64,

    pub filter: Option<Filter>,
    pub converter: Option<Converter>,

    subscribers: BTreeMap<i64, SubscriberId>,

    /// Owner id of each channel, 0 for none
    channels: Vec<i64>,

    owned_channels: BTreeMap<i64, OwnedChannels>,

    /// Channels manually pinned to a subscriber
    pinned_channels: BTreeMap<u32, i64>,

    /// Connect time of each subscriber (ms since epoch)
    timestamps: BTreeMap<i64, i64>,

    pub channel_count: u32,
}

impl PagedTopicSubscription {
    pub fn new(
        topic: impl Into<String>,
        group: SubscriberGroupId,
        subscription_id: i64,
        filter: Option<Filter>,
        converter: Option<Converter>,
        channel_count: u32,
    ) -> Self {
        Self {
            topic: topic.into(),
            group,
            subscription_id,
            filter,
            converter,
            subscribers: BTreeMap::new(),
            channels: vec![0; channel_count as usize],
            owned_channels: BTreeMap::new(),
            pinned_channels: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            channel_count,
        }
    }

    /// Add a subscriber connected at `timestamp`; false if already present
    ///
    /// The allocation is not recomputed until `update_channel_allocations`.
    pub fn add_subscriber(&mut self, subscriber: SubscriberId, timestamp: i64) -> bool {
        let added = self.subscribers.insert(subscriber.id, subscriber).is_none();
        self.timestamps.entry(subscriber.id).or_insert(timestamp);
        added
    }

    /// Remove a subscriber and any pins it held; false if absent
    pub fn remove_subscriber(&mut self, subscriber_id: i64) -> bool {
        let removed = self.subscribers.remove(&subscriber_id).is_some();
        self.timestamps.remove(&subscriber_id);
        self.pinned_channels.retain(|_, owner| *owner != subscriber_id);
        removed
    }

    pub fn has_subscriber(&self, subscriber_id: i64) -> bool {
        self.subscribers.contains_key(&subscriber_id)
    }

    pub fn subscriber(&self, subscriber_id: i64) -> Option<SubscriberId> {
        self.subscribers.get(&subscriber_id).copied()
    }

    pub fn subscribers(&self) -> BTreeMap<i64, SubscriberId> {
        self.subscribers.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn channels(&self) -> Vec<i64> {
        self.channels.clone()
    }

    pub fn pinned_channels(&self) -> BTreeMap<u32, i64> {
        self.pinned_channels.clone()
    }

    pub fn subscriber_timestamp(&self, subscriber_id: i64) -> Option<i64> {
        self.timestamps.get(&subscriber_id).copied()
    }

    /// Merge from an authoritative copy
    ///
    /// Subscribers and timestamps absent from `other` are dropped; the
    /// allocation, pins and channel count are taken from `other`.
    pub fn update(&mut self, other: &PagedTopicSubscription) {
        self.subscribers
            .retain(|id, _| other.subscribers.contains_key(id));
        self.subscribers
            .extend(other.subscribers.iter().map(|(id, s)| (*id, *s)));

        self.timestamps
            .retain(|id, _| other.timestamps.contains_key(id));
        self.timestamps
            .extend(other.timestamps.iter().map(|(id, ts)| (*id, *ts)));

        self.channels = other.channels.clone();
        self.owned_channels = other.owned_channels.clone();
        self.pinned_channels = other.pinned_channels.clone();
        self.channel_count = other.channel_count;
    }

    /// Recompute the channel table and the subscriber to channels index
    pub fn update_channel_allocations(
        &mut self,
        strategy: &dyn ChannelAllocationStrategy,
        channel_count: u32,
    ) {
        self.channel_count = channel_count;
        self.pinned_channels
            .retain(|channel, _| *channel < channel_count);
        self.channels = strategy.allocate(&self.subscribers, channel_count, &self.pinned_channels);
        self.rebuild_owned_channels();
        debug!(
            group = %self.group,
            subscribers = self.subscribers.len(),
            channel_count,
            "Channel allocation recomputed"
        );
    }

    fn rebuild_owned_channels(&mut self) {
        self.owned_channels.clear();
        for (channel, owner) in self.channels.iter().enumerate() {
            if *owner == 0 {
                continue;
            }
            let channel = channel as u32;
            self.owned_channels
                .entry(*owner)
                .and_modify(|owned| owned.add(channel))
                .or_insert(OwnedChannels::One(channel));
        }
    }

    /// Reject a subscriber whose filter or converter differs from the group's
    pub fn assert_filter_and_converter(
        &self,
        filter: Option<&Filter>,
        converter: Option<&Converter>,
    ) -> Result<()> {
        if self.filter.as_ref() != filter {
            return Err(Error::InconsistentSubscription {
                group: self.group.to_string(),
                existing: describe(self.filter.as_ref()),
                requested: describe(filter),
            });
        }
        if self.converter.as_ref() != converter {
            return Err(Error::InconsistentSubscription {
                group: self.group.to_string(),
                existing: describe(self.converter.as_ref()),
                requested: describe(converter),
            });
        }
        Ok(())
    }

    /// Channels owned by `subscriber_id`, ascending
    pub fn owned_channels(&self, subscriber_id: i64) -> Vec<u32> {
        self.owned_channels
            .get(&subscriber_id)
            .map(OwnedChannels::to_vec)
            .unwrap_or_default()
    }

    /// Owner id of `channel`, 0 when unowned or out of range
    pub fn channel_owner(&self, channel: u32) -> i64 {
        self.channels.get(channel as usize).copied().unwrap_or(0)
    }

    /// Pin `channel` to a present subscriber
    pub fn pin_channel(&mut self, channel: u32, subscriber_id: i64) -> Result<()> {
        if channel >= self.channel_count {
            return Err(Error::InvalidChannel {
                channel,
                channel_count: self.channel_count,
            });
        }
        if !self.has_subscriber(subscriber_id) {
            return Err(Error::UnknownSubscriber {
                group: self.group.to_string(),
                subscriber_id,
            });
        }
        self.pinned_channels.insert(channel, subscriber_id);
        Ok(())
    }

    pub fn unpin_channel(&mut self, channel: u32) -> Option<i64> {
        self.pinned_channels.remove(&channel)
    }

    /// Drop subscribers whose member has left, returning them by member id
    pub fn cleanup(
        &mut self,
        strategy: &dyn ChannelAllocationStrategy,
        live_members: &[Member],
    ) -> Departed {
        let departed = strategy.cleanup(&mut self.subscribers, live_members);
        for subscriber in departed.values().flatten() {
            self.timestamps.remove(&subscriber.id);
            self.pinned_channels
                .retain(|_, owner| *owner != subscriber.id);
        }
        departed
    }
}

fn describe<T: std::fmt::Display>(value: Option<&T>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}

impl VersionedRecord for PagedTopicSubscription {
    const RECORD: &'static str = "PagedTopicSubscription";
    const CURRENT_VERSION: u8 = 1;

    fn write_body(&self, buf: &mut BytesMut) {
        write_string(buf, &self.topic);
        self.group.write_to(buf);
        write_packed_i64(buf, self.subscription_id);
        write_optional_bytes(buf, self.filter.as_ref().map(|f| &f.0));
        write_optional_bytes(buf, self.converter.as_ref().map(|c| &c.0));
        write_subscriber_map(buf, &self.subscribers);
        write_channels(buf, &self.channels);
        write_packed_u32(buf, self.channel_count);
        // v1
        write_packed_i32(buf, self.pinned_channels.len() as i32);
        for (channel, owner) in &self.pinned_channels {
            write_packed_u32(buf, *channel);
            write_packed_i64(buf, *owner);
        }
        write_packed_i32(buf, self.timestamps.len() as i32);
        for (id, timestamp) in &self.timestamps {
            write_packed_i64(buf, *id);
            write_packed_i64(buf, *timestamp);
        }
    }

    fn read_body(version: u8, buf: &mut Bytes) -> Result<Self> {
        let mut subscription = PagedTopicSubscription {
            topic: read_string(buf)?,
            group: SubscriberGroupId::read_from(buf)?,
            subscription_id: read_packed_i64(buf)?,
            filter: read_optional_bytes(buf)?.map(Filter),
            converter: read_optional_bytes(buf)?.map(Converter),
            subscribers: read_subscriber_map(buf)?,
            channels: read_channels(buf)?,
            owned_channels: BTreeMap::new(),
            pinned_channels: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            channel_count: read_packed_u32(buf)?,
        };

        if version >= 1 {
            for _ in 0..read_count(buf, "pinned channel")? {
                let channel = read_packed_u32(buf)?;
                subscription
                    .pinned_channels
                    .insert(channel, read_packed_i64(buf)?);
            }
            for _ in 0..read_count(buf, "timestamp")? {
                let id = read_packed_i64(buf)?;
                subscription.timestamps.insert(id, read_packed_i64(buf)?);
            }
        }

        subscription.rebuild_owned_channels();
        Ok(subscription)
    }
}
