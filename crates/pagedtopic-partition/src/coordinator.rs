//! Subscriber Group Coordinator
//!
//! Tracks every subscriber group of a topic and keeps the group's channel
//! allocation consistent with the subscribers that are actually alive.
//!
//! ## Joining
//!
//! `ensure_subscription` creates the group on first use (fixing its filter and
//! converter), initialises the group's subscription in every partition, adds
//! the subscriber and reallocates channels.
//!
//! Partition initialisation runs in three phases:
//! 1. **Inquire** every partition; if all report an initialised subscription
//!    we are done
//! 2. **Pin** every partition, attaching to its current page
//! 3. **Advance** every partition to the group-wide head: the furthest pinned
//!    page, or the earliest one when consumed elements are retained
//!
//! ## Leaving
//!
//! A subscriber leaves by closing, by missing heartbeats, or by its member
//! departing. All three remove it from the group, recompute the allocation and
//! push it synchronously into the channel-zero subscription of every
//! partition. Closing is best effort: it never fails, and a destroyed store
//! simply means there is nothing left to update.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pagedtopic_core::{
    current_timestamp_ms, partitioning, ChannelAllocationStrategy, Converter, Departed, Filter,
    Guarded, Member, PagedTopicSubscription, SimpleChannelAllocationStrategy, SubscriberGroupId,
    SubscriberId, SubscriberInfo, SubscriberInfoKey, NULL_PAGE,
};

use crate::error::{PartitionError, PartitionResult};
use crate::partition::EnsurePhase;
use crate::store::TopicStore;

/// A group's record and the lock ordering pushes of its allocation
#[derive(Clone)]
struct GroupHandle {
    record: Guarded<PagedTopicSubscription>,
    push: Arc<Mutex<()>>,
}

impl GroupHandle {
    fn new(record: PagedTopicSubscription) -> Self {
        Self {
            record: Guarded::new(record),
            push: Arc::new(Mutex::new(())),
        }
    }
}

/// Coordinates the subscriber groups of one topic
pub struct SubscriptionCoordinator {
    store: Arc<TopicStore>,
    strategy: Arc<dyn ChannelAllocationStrategy>,
    groups: DashMap<SubscriberGroupId, GroupHandle>,
    subscribers: DashMap<SubscriberInfoKey, SubscriberInfo>,
    next_subscription_id: AtomicI64,
}

impl SubscriptionCoordinator {
    pub fn new(store: Arc<TopicStore>) -> Self {
        Self::with_strategy(store, Arc::new(SimpleChannelAllocationStrategy))
    }

    pub fn with_strategy(store: Arc<TopicStore>, strategy: Arc<dyn ChannelAllocationStrategy>) -> Self {
        Self {
            store,
            strategy,
            groups: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription_id: AtomicI64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<TopicStore> {
        &self.store
    }

    fn channel_count(&self) -> u32 {
        self.store.channel_count()
    }

    fn group(&self, group: &SubscriberGroupId) -> Option<GroupHandle> {
        self.groups.get(group).map(|entry| entry.value().clone())
    }

    fn record(&self, group: &SubscriberGroupId) -> PartitionResult<Guarded<PagedTopicSubscription>> {
        self.group(group)
            .map(|handle| handle.record)
            .ok_or_else(|| PartitionError::UnknownGroup(group.to_string()))
    }

    /// Snapshot of a group's subscription record
    pub fn subscription(&self, group: &SubscriberGroupId) -> Option<PagedTopicSubscription> {
        self.group(group).map(|handle| handle.record.snapshot())
    }

    pub fn subscriber_info(&self, group: &SubscriberGroupId, subscriber: SubscriberId) -> Option<SubscriberInfo> {
        self.subscribers
            .get(&SubscriberInfoKey::new(group.clone(), subscriber))
            .map(|entry| entry.value().clone())
    }

    /// Join `subscriber` to `group`, returning the channels it now owns
    pub async fn ensure_subscription(
        &self,
        group: &SubscriberGroupId,
        subscriber: SubscriberId,
        filter: Option<Filter>,
        converter: Option<Converter>,
    ) -> PartitionResult<Vec<u32>> {
        let now = current_timestamp_ms();
        let channel_count = self.channel_count();

        let handle = self
            .groups
            .entry(group.clone())
            .or_insert_with(|| {
                let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
                info!(
                    topic = %self.store.topic(),
                    group = %group,
                    subscription_id,
                    "Subscriber group created"
                );
                GroupHandle::new(PagedTopicSubscription::new(
                    self.store.topic(),
                    group.clone(),
                    subscription_id,
                    filter.clone(),
                    converter.clone(),
                    channel_count,
                ))
            })
            .value()
            .clone();
        let guarded = &handle.record;

        guarded.with(|s| s.assert_filter_and_converter(filter.as_ref(), converter.as_ref()))?;

        self.initialise_partitions(group, filter.as_ref(), converter.as_ref())
            .await?;

        let (added, subscription_id) = guarded.with(|s| {
            let added = s.add_subscriber(subscriber, now);
            if added {
                s.update_channel_allocations(self.strategy.as_ref(), channel_count);
            }
            (added, s.subscription_id)
        });

        let timeout = self.store.config().subscriber_timeout_ms;
        self.subscribers
            .entry(SubscriberInfoKey::new(group.clone(), subscriber))
            .and_modify(|info| info.heartbeat(now))
            .or_insert_with(|| SubscriberInfo::new(subscription_id, subscriber.uid, timeout, now));

        if added {
            info!(
                group = %group,
                subscriber = %subscriber,
                "Subscriber joined group"
            );
            self.push_allocation(group, &handle).await?;
        }

        Ok(guarded.with(|s| s.owned_channels(subscriber.id)))
    }

    async fn initialise_partitions(
        &self,
        group: &SubscriberGroupId,
        filter: Option<&Filter>,
        converter: Option<&Converter>,
    ) -> PartitionResult<()> {
        let inquired = self
            .store
            .invoke_all(|p| p.ensure_subscription(group, EnsurePhase::Inquire, &[], filter, converter))
            .await?;
        if inquired.iter().all(Option::is_some) {
            return Ok(());
        }

        let pinned = self
            .store
            .invoke_all(|p| p.ensure_subscription(group, EnsurePhase::Pin, &[], filter, converter))
            .await?;
        let heads = self.global_heads(&pinned);
        debug!(group = %group, heads = ?heads, "Advancing subscription to group head");

        self.store
            .invoke_all(|p| p.ensure_subscription(group, EnsurePhase::Advance, &heads, filter, converter))
            .await?;
        Ok(())
    }

    fn global_heads(&self, pinned: &[Option<Vec<i64>>]) -> Vec<i64> {
        let retain = self.store.config().retain_consumed;
        let base = partitioning::base_page(self.store.topic(), self.store.partition_count());

        (0..self.channel_count() as usize)
            .map(|channel| {
                let pages = pinned
                    .iter()
                    .flatten()
                    .filter_map(|pages| pages.get(channel).copied())
                    .filter(|page| *page != NULL_PAGE);
                let head = if retain { pages.min() } else { pages.max() };
                head.unwrap_or(base)
            })
            .collect()
    }

    /// Push the group's current allocation to every partition
    ///
    /// Pushes of one group run one at a time and each reads the record once it
    /// holds the lock, so the last allocation applied is always the newest.
    async fn push_allocation(&self, group: &SubscriberGroupId, handle: &GroupHandle) -> PartitionResult<()> {
        let _ordered = handle.push.lock().await;
        let allocation = handle.record.snapshot();
        self.store
            .invoke_all(|p| p.update_allocation(group, &allocation))
            .await?;
        debug!(
            group = %group,
            subscribers = allocation.subscriber_count(),
            "Channel allocation pushed to partitions"
        );
        Ok(())
    }

    /// Refresh a subscriber's liveness
    pub fn heartbeat(&self, group: &SubscriberGroupId, subscriber: SubscriberId) -> PartitionResult<()> {
        let key = SubscriberInfoKey::new(group.clone(), subscriber);
        let mut info = self
            .subscribers
            .get_mut(&key)
            .ok_or_else(|| PartitionError::UnknownSubscriber {
                group: group.to_string(),
                subscriber: subscriber.to_string(),
            })?;
        info.heartbeat(current_timestamp_ms());
        Ok(())
    }

    /// Close every subscriber whose heartbeat has lapsed at `now`
    pub async fn expire_subscribers(&self, now: i64) -> PartitionResult<Vec<SubscriberInfoKey>> {
        let expired: Vec<SubscriberInfoKey> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            info!(
                group = %key.group,
                subscriber = %key.subscriber,
                "Subscriber heartbeat expired"
            );
            self.notify_closed(&key.group, key.subscriber).await?;
        }
        Ok(expired)
    }

    /// Remove a closed subscriber from its group
    ///
    /// Safe to call any number of times; failures are logged and the call
    /// still succeeds.
    pub async fn notify_closed(&self, group: &SubscriberGroupId, subscriber: SubscriberId) -> PartitionResult<()> {
        match self.close_subscriber(group, subscriber).await {
            Ok(()) => {}
            Err(PartitionError::StoreInactive(topic)) => {
                debug!(
                    topic = %topic,
                    group = %group,
                    subscriber = %subscriber,
                    "Topic destroyed before subscriber close"
                );
            }
            Err(e) => {
                warn!(
                    group = %group,
                    subscriber = %subscriber,
                    error = %e,
                    "Failed to remove closed subscriber"
                );
            }
        }
        Ok(())
    }

    async fn close_subscriber(&self, group: &SubscriberGroupId, subscriber: SubscriberId) -> PartitionResult<()> {
        self.subscribers
            .remove(&SubscriberInfoKey::new(group.clone(), subscriber));

        let Some(handle) = self.group(group) else {
            return Ok(());
        };
        let channel_count = self.channel_count();
        let remaining = handle.record.with(|s| {
            if s.remove_subscriber(subscriber.id) {
                s.update_channel_allocations(self.strategy.as_ref(), channel_count);
                Some(s.subscriber_count())
            } else {
                None
            }
        });
        let Some(remaining) = remaining else {
            return Ok(());
        };

        info!(group = %group, subscriber = %subscriber, "Subscriber left group");

        if group.is_anonymous() && remaining == 0 {
            // nobody else can ever join an anonymous group
            self.destroy_group(group).await?;
            return Ok(());
        }
        self.push_allocation(group, &handle).await
    }

    /// Apply a new membership view, removing subscribers of departed members
    ///
    /// Returns the departed subscribers across all groups, keyed by member id.
    pub async fn member_departed(&self, live_members: &[Member]) -> PartitionResult<Departed> {
        self.store.set_members(live_members.to_vec());
        let live: BTreeSet<i64> = live_members.iter().map(|m| m.timestamp).collect();
        let channel_count = self.channel_count();

        let groups: Vec<(SubscriberGroupId, GroupHandle)> = self
            .groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut all_departed = Departed::new();
        for (group, handle) in groups {
            if group.is_anonymous() && !live.contains(&group.member_timestamp) {
                self.destroy_group(&group).await?;
                continue;
            }

            let departed = handle.record.with(|s| {
                let departed = s.cleanup(self.strategy.as_ref(), live_members);
                if !departed.is_empty() {
                    s.update_channel_allocations(self.strategy.as_ref(), channel_count);
                }
                departed
            });
            if departed.is_empty() {
                continue;
            }

            for subscriber in departed.values().flatten() {
                self.subscribers
                    .remove(&SubscriberInfoKey::new(group.clone(), *subscriber));
            }
            info!(
                group = %group,
                members = departed.len(),
                "Removed subscribers of departed members"
            );
            self.push_allocation(&group, &handle).await?;

            for (member, subscribers) in departed {
                all_departed.entry(member).or_default().extend(subscribers);
            }
        }

        self.store
            .invoke_all(|p| p.cleanup_non_durable_subscribers(live_members))
            .await?;
        Ok(all_departed)
    }

    /// Destroy a group and its subscriptions in every partition
    ///
    /// Returns false when the group did not exist.
    pub async fn destroy_group(&self, group: &SubscriberGroupId) -> PartitionResult<bool> {
        if self.groups.remove(group).is_none() {
            return Ok(false);
        }
        self.subscribers.retain(|key, _| &key.group != group);
        self.store
            .invoke_all(|p| p.remove_subscription(group))
            .await?;
        info!(topic = %self.store.topic(), group = %group, "Subscriber group destroyed");
        Ok(true)
    }

    /// Owner id of `channel` in `group`, 0 when unowned
    pub fn channel_owner(&self, group: &SubscriberGroupId, channel: u32) -> PartitionResult<i64> {
        Ok(self.record(group)?.with(|s| s.channel_owner(channel)))
    }

    /// Channels currently owned by `subscriber`
    pub fn owned_channels(&self, group: &SubscriberGroupId, subscriber: SubscriberId) -> PartitionResult<Vec<u32>> {
        Ok(self.record(group)?.with(|s| s.owned_channels(subscriber.id)))
    }

    /// Pin `channel` to `subscriber` and reallocate
    pub async fn pin_channel(
        &self,
        group: &SubscriberGroupId,
        channel: u32,
        subscriber: SubscriberId,
    ) -> PartitionResult<()> {
        let handle = self
            .group(group)
            .ok_or_else(|| PartitionError::UnknownGroup(group.to_string()))?;
        let channel_count = self.channel_count();
        handle.record.with(|s| -> PartitionResult<()> {
            if !s.has_subscriber(subscriber.id) {
                return Err(PartitionError::UnknownSubscriber {
                    group: group.to_string(),
                    subscriber: subscriber.to_string(),
                });
            }
            s.pin_channel(channel, subscriber.id)?;
            s.update_channel_allocations(self.strategy.as_ref(), channel_count);
            Ok(())
        })?;
        self.push_allocation(group, &handle).await
    }

    /// Groups known to the coordinator, by name
    pub fn groups(&self) -> BTreeMap<String, SubscriberGroupId> {
        self.groups
            .iter()
            .map(|entry| (entry.key().name.clone(), entry.key().clone()))
            .collect()
    }
}
