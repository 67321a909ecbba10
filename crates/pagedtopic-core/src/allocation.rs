//! Channel Allocation
//!
//! Within a subscriber group every channel is owned by exactly one live
//! subscriber. A `ChannelAllocationStrategy` computes that ownership as a plain
//! function of the subscriber set.
//!
//! ## Contract
//! The same subscriber set and channel count always produce the same allocation,
//! whatever order the subscribers joined or were discovered in. Subscribers are
//! passed as a map keyed by subscriber id, so iteration order is the sort order.
//!
//! ## SimpleChannelAllocationStrategy
//! 1. Pinned channels whose subscriber is present go to that subscriber
//! 2. The remaining channels are dealt round-robin, in ascending channel order,
//!    to the subscribers in ascending id order
//! 3. With no subscribers every channel is owned by `0` (no one)
//!
//! ## Example
//! ```ignore
//! let strategy = SimpleChannelAllocationStrategy;
//! let channels = strategy.allocate(&subscribers, 17, &BTreeMap::new());
//! assert_eq!(channels.len(), 17);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::identity::{member_id_of, Member, SubscriberId};

/// Departed subscribers grouped by member id
pub type Departed = BTreeMap<u32, BTreeSet<SubscriberId>>;

/// Computes channel ownership for a subscriber group
pub trait ChannelAllocationStrategy: Send + Sync {
    /// Owner (subscriber id, or 0) of each channel
    fn allocate(
        &self,
        subscribers: &BTreeMap<i64, SubscriberId>,
        channel_count: u32,
        pinned: &BTreeMap<u32, i64>,
    ) -> Vec<i64>;

    /// Remove subscribers whose member is no longer live
    ///
    /// A subscriber is also considered departed when its member id is live but
    /// belongs to a different member instance (the id was reused after a restart).
    fn cleanup(&self, subscribers: &mut BTreeMap<i64, SubscriberId>, live_members: &[Member]) -> Departed {
        let live: HashMap<u32, &Member> = live_members.iter().map(|m| (m.id, m)).collect();
        let mut departed = Departed::new();

        subscribers.retain(|id, subscriber| {
            let member_id = member_id_of(*id);
            let alive = match (live.get(&member_id), subscriber.uid) {
                (Some(member), Some(uid)) => member.uid == uid,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !alive {
                departed.entry(member_id).or_default().insert(*subscriber);
            }
            alive
        });

        departed
    }
}

/// Round-robin allocation over subscribers sorted by id
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleChannelAllocationStrategy;

impl ChannelAllocationStrategy for SimpleChannelAllocationStrategy {
    fn allocate(
        &self,
        subscribers: &BTreeMap<i64, SubscriberId>,
        channel_count: u32,
        pinned: &BTreeMap<u32, i64>,
    ) -> Vec<i64> {
        let mut channels = vec![0i64; channel_count as usize];
        if subscribers.is_empty() {
            return channels;
        }

        let mut unpinned = Vec::with_capacity(channels.len());
        for channel in 0..channel_count {
            match pinned.get(&channel) {
                Some(owner) if subscribers.contains_key(owner) => {
                    channels[channel as usize] = *owner;
                }
                _ => unpinned.push(channel),
            }
        }

        let ids: Vec<i64> = subscribers.keys().copied().collect();
        for (i, channel) in unpinned.into_iter().enumerate() {
            channels[channel as usize] = ids[i % ids.len()];
        }

        channels
    }
}
