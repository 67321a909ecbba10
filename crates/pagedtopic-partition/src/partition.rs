//! Partition Life Cycle
//!
//! A `TopicPartition` holds everything one partition stores for a topic:
//! pages, per-channel usage, per-group subscriptions, element content and
//! notification registrations. It is only ever mutated by one caller at a time
//! (the store's per-partition lock), so none of the operations below need any
//! synchronization of their own.
//!
//! ## Pages and references
//!
//! The pages of a channel inside a partition form a linked list from
//! `Usage::partition_head` to `Usage::partition_tail`. A page's reference count
//! is the number of subscriber groups attached to it plus one for the link from
//! the previous page. When the count drops to zero the page is removed (unless
//! the topic retains consumed elements) and the release continues down the
//! chain.
//!
//! Groups that drained a partition before the next page existed register in
//! `Usage::waiting_subscriber_count`; the next page created is born with those
//! references already applied.
//!
//! ## Notifications
//!
//! Blocked subscribers register for the next insert into a page and blocked
//! publishers register for the next page removal. Firing a notifier removes its
//! registration and records a [`Wakeup`] which the owner of the partition
//! drains with [`TopicPartition::take_wakeups`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use pagedtopic_core::page::{head_position, tail_position};
use pagedtopic_core::position::MAX_OFFSET;
use pagedtopic_core::{
    partitioning, ContentKey, Converter, Filter, Member, NotificationKey, Page, PageElement,
    PageKey, PagedPosition, PagedTopicSubscription, SubscriberGroupId, SubscriberId,
    Subscription, SubscriptionKey, TopicConfig, Usage, UsageKey, EMPTY, NULL_PAGE,
    NULL_POSITION, NULL_SUBSCRIBER,
};

use crate::error::PartitionResult;

/// Evaluates a group's filter against a stored element
pub trait ElementFilter: Send + Sync {
    fn evaluate(&self, filter: &Filter, element: &PageElement) -> bool;
}

/// Applies a group's converter to an element value
///
/// Returning `None` drops the element from the poll result.
pub trait ElementConverter: Send + Sync {
    fn convert(&self, converter: &Converter, value: Bytes) -> Option<Bytes>;
}

/// Filter that accepts every element
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ElementFilter for AcceptAll {
    fn evaluate(&self, _filter: &Filter, _element: &PageElement) -> bool {
        true
    }
}

/// Converter that returns values unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

impl ElementConverter for IdentityConverter {
    fn convert(&self, _converter: &Converter, value: Bytes) -> Option<Bytes> {
        Some(value)
    }
}

/// Outcome of an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferStatus {
    /// Elements were appended and the page is still open
    Success,
    /// The page is sealed; the publisher must move on to the next page
    PageSealed,
    /// Local storage is full; nothing was accepted
    TopicFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferResult {
    pub status: OfferStatus,

    /// Number of leading elements accepted
    pub accepted: usize,

    /// Space left in this page, or the capacity of the next one once sealed
    pub remaining_capacity: i64,
}

impl OfferResult {
    fn new(status: OfferStatus, accepted: usize, remaining_capacity: i64) -> Self {
        Self {
            status,
            accepted,
            remaining_capacity,
        }
    }
}

/// Outcome of a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The group has no subscription in this partition
    UnknownSubscriber,
    /// The page is fully consumed and the cursor moved past it
    Exhausted,
    /// Elements still to read in the page after this poll
    Remaining(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub status: PollStatus,

    /// Offset of the next element to read
    pub next: i32,

    pub elements: Vec<PageElement>,
}

impl PollResult {
    fn exhausted(next: i32, elements: Vec<PageElement>) -> Self {
        Self {
            status: PollStatus::Exhausted,
            next,
            elements,
        }
    }
}

/// Phases of establishing a group's subscription in a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnsurePhase {
    /// Read the pinned pages of an existing subscription
    Inquire,
    /// Create the subscription and attach to the current page
    Pin,
    /// Move forward to the group-wide head and finish initialisation
    Advance,
}

/// Outcome of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Committed,
    AlreadyCommitted,
    NothingToCommit,
    /// Unknown group, or a position not yet read
    Rejected,
    /// The committing subscriber does not own the channel
    Unowned,
}

/// A fired notifier and the channels it was registered for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub notifier_id: i32,
    pub channels: Vec<u32>,
}

#[derive(Debug, Clone)]
struct StoredElement {
    element: PageElement,
    expires_at: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct Registration {
    channels: Vec<u32>,
    expires_at: Option<i64>,
}

impl Registration {
    fn add_channel(&mut self, channel: u32) {
        if let Err(index) = self.channels.binary_search(&channel) {
            self.channels.insert(index, channel);
        }
    }
}

/// One partition of a paged topic
pub struct TopicPartition {
    topic: String,
    partition: u32,
    partition_count: u32,
    local_partition_count: u32,
    config: TopicConfig,

    pages: BTreeMap<PageKey, Page>,
    usages: BTreeMap<UsageKey, Usage>,
    subscriptions: BTreeMap<SubscriptionKey, Subscription>,
    content: BTreeMap<ContentKey, StoredElement>,
    notifications: BTreeMap<NotificationKey, Registration>,
    wakeups: Vec<Wakeup>,
    storage_bytes: i64,

    members: Arc<RwLock<Vec<Member>>>,
    filter: Arc<dyn ElementFilter>,
    converter: Arc<dyn ElementConverter>,
    clock: fn() -> i64,
}

impl TopicPartition {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        partition_count: u32,
        config: TopicConfig,
        members: Arc<RwLock<Vec<Member>>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            partition_count,
            local_partition_count: partition_count,
            config,
            pages: BTreeMap::new(),
            usages: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            content: BTreeMap::new(),
            notifications: BTreeMap::new(),
            wakeups: Vec::new(),
            storage_bytes: 0,
            members,
            filter: Arc::new(AcceptAll),
            converter: Arc::new(IdentityConverter),
            clock: pagedtopic_core::current_timestamp_ms,
        }
    }

    pub fn with_evaluators(
        mut self,
        filter: Arc<dyn ElementFilter>,
        converter: Arc<dyn ElementConverter>,
    ) -> Self {
        self.filter = filter;
        self.converter = converter;
        self
    }

    /// Number of partitions of the topic owned by this process
    pub fn with_local_partition_count(mut self, count: u32) -> Self {
        self.local_partition_count = count.max(1);
        self
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn channel_count(&self) -> u32 {
        self.config.channel_count
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    /// Bytes of element content held by this partition
    pub fn storage_bytes(&self) -> i64 {
        self.storage_bytes
    }

    pub fn page(&self, channel: u32, page: i64) -> Option<&Page> {
        self.pages.get(&PageKey::new(channel, page))
    }

    pub fn usage(&self, channel: u32) -> Option<&Usage> {
        self.usages.get(&UsageKey::new(self.partition, channel))
    }

    pub fn subscription(&self, group: &SubscriberGroupId, channel: u32) -> Option<&Subscription> {
        self.subscriptions
            .get(&SubscriptionKey::new(self.partition, channel, group.clone()))
    }

    /// Channels a notifier is currently registered for
    pub fn notification(&self, notifier_id: i32) -> Option<&[u32]> {
        self.notifications
            .get(&NotificationKey::new(self.partition, notifier_id))
            .map(|registration| registration.channels.as_slice())
    }

    /// Drain the notifiers fired since the last call
    pub fn take_wakeups(&mut self) -> Vec<Wakeup> {
        std::mem::take(&mut self.wakeups)
    }

    /// Drop all state, as when the topic is destroyed
    pub fn clear(&mut self) {
        self.pages.clear();
        self.usages.clear();
        self.subscriptions.clear();
        self.content.clear();
        self.notifications.clear();
        self.wakeups.clear();
        self.storage_bytes = 0;
    }

    fn usage_mut(&mut self, channel: u32) -> &mut Usage {
        self.usages
            .entry(UsageKey::new(self.partition, channel))
            .or_default()
    }

    fn page_mut(&mut self, channel: u32, page: i64) -> Option<&mut Page> {
        self.pages.get_mut(&PageKey::new(channel, page))
    }

    fn has_page(&self, channel: u32, page: i64) -> bool {
        page != NULL_PAGE && self.pages.contains_key(&PageKey::new(channel, page))
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Set the channel's publication tail on first use, returning it
    pub fn initialise_topic(&mut self, channel: u32) -> i64 {
        let base = partitioning::base_page(&self.topic, self.partition_count);
        let usage = self.usage_mut(channel);
        if usage.publication_tail == NULL_PAGE {
            usage.set_publication_tail(base);
        }
        usage.publication_tail
    }

    /// Make sure `page` exists, creating it as the new partition tail
    ///
    /// Returns false when the page was created before and has since been
    /// removed; removed pages are never recreated.
    pub fn ensure_page(&mut self, channel: u32, page: i64) -> bool {
        if self.has_page(channel, page) {
            return true;
        }

        let usage = self.usage_mut(channel);
        if page <= usage.partition_max {
            return false;
        }

        let previous_tail = usage.partition_tail;
        usage.set_partition_tail(page);
        usage.set_partition_max(page);

        let mut created = Page::new();
        if previous_tail == NULL_PAGE {
            usage.set_partition_head(page);
        } else {
            // link from the old tail
            created.increment_reference_count();
            created.set_previous_partition_page(previous_tail);
        }

        // groups waiting for the next page attach now
        let waiting = usage.reset_waiting_subscriber_count();
        created.adjust_reference_count(waiting);

        if let Some(previous) = self.page_mut(channel, previous_tail) {
            previous.set_next_partition_page(page);
        }
        self.pages.insert(PageKey::new(channel, page), created);

        debug!(
            topic = %self.topic,
            partition = self.partition,
            channel,
            page,
            waiting,
            "Page created"
        );
        true
    }

    /// Append elements to the tail page of a channel
    ///
    /// `notify_post_full` is the publisher's notifier, registered for the next
    /// page removal when the topic is full.
    pub fn offer_to_page_tail(
        &mut self,
        channel: u32,
        page: i64,
        elements: &[Bytes],
        notify_post_full: Option<i32>,
        seal: bool,
    ) -> PartitionResult<OfferResult> {
        let mut capacity = self.config.page_capacity_bytes;
        let server_capacity = self.config.server_capacity_bytes;

        if server_capacity > 0 && notify_post_full.is_some() {
            // keep enough headroom that every local partition can start a page
            // before the server limit is hit
            let dynamic = server_capacity / 2 / i64::from(self.local_partition_count.max(1));
            if capacity > dynamic {
                capacity = dynamic.max(1);
            }
        }

        if !self.ensure_page(channel, page) {
            return Ok(OfferResult::new(OfferStatus::PageSealed, 0, 0));
        }

        let key = PageKey::new(channel, page);
        let Some(current) = self.pages.get(&key) else {
            return Ok(OfferResult::new(OfferStatus::PageSealed, 0, 0));
        };
        if current.sealed {
            return Ok(OfferResult::new(OfferStatus::PageSealed, 0, 0));
        }

        if current.tail == EMPTY {
            if let Some(result) =
                self.on_start_of_page(channel, page, notify_post_full, elements.len(), capacity)
            {
                return Ok(result);
            }
        }

        let now = self.now();
        let expires_at = (self.config.element_expiry_ms > 0)
            .then(|| now.saturating_add(self.config.element_expiry_ms));

        let Some(current) = self.pages.get(&key) else {
            return Ok(OfferResult::new(OfferStatus::PageSealed, 0, 0));
        };
        let mut byte_size = current.byte_size;
        let mut tail = current.tail;
        let mut accepted = 0;

        for value in elements {
            if byte_size >= capacity {
                break;
            }
            tail += 1;
            let element = PageElement::encode(channel, page, tail, now, value.clone())?;
            let size = element.binary().len() as i64;
            byte_size += size;
            self.storage_bytes += size;
            self.content.insert(
                ContentKey::new(channel, page, tail),
                StoredElement {
                    element,
                    expires_at,
                },
            );
            accepted += 1;
        }

        let Some(current) = self.pages.get_mut(&key) else {
            return Ok(OfferResult::new(OfferStatus::PageSealed, accepted, capacity));
        };
        current.set_tail(tail);
        if accepted > 0 {
            current.touch(now);
        }

        let (status, remaining_capacity) = if byte_size >= capacity || seal {
            current.set_sealed(true);
            (OfferStatus::PageSealed, capacity)
        } else {
            (OfferStatus::Success, capacity - byte_size)
        };
        current.set_byte_size(byte_size);

        let notifiers = current.reset_insertion_notifiers();
        if status == OfferStatus::PageSealed {
            debug!(
                topic = %self.topic,
                partition = self.partition,
                channel,
                page,
                byte_size,
                "Page sealed"
            );
        }
        self.notify_all(&notifiers);

        Ok(OfferResult::new(status, accepted, remaining_capacity))
    }

    fn on_start_of_page(
        &mut self,
        channel: u32,
        page: i64,
        notify_post_full: Option<i32>,
        offered: usize,
        capacity: i64,
    ) -> Option<OfferResult> {
        // a leaked anonymous group would keep this page alive forever
        let anonymous = self.usage_mut(channel).anonymous_subscribers();
        let live = self.live_member_timestamps();
        self.remove_dead_anonymous(&anonymous, &live);

        let subscribed = self.page(channel, page).is_some_and(Page::is_subscribed);
        let server_capacity = self.config.server_capacity_bytes;

        if !subscribed && !self.config.retain_consumed {
            // nobody will ever read it; accept without storing and move the
            // publisher on
            if let Some(current) = self.page_mut(channel, page) {
                current.set_sealed(true);
            }
            self.remove_page_if_not_retaining(channel, page);
            trace!(
                topic = %self.topic,
                partition = self.partition,
                channel,
                page,
                offered,
                "Discarded offer to unsubscribed page"
            );
            return Some(OfferResult::new(OfferStatus::PageSealed, offered, capacity));
        }

        if server_capacity > 0 && self.storage_bytes >= server_capacity {
            if let Some(notifier) = notify_post_full {
                self.request_removal_notification(notifier, channel);
            }

            // seal single-page channels so their readers detach and free space
            for other in 0..self.channel_count() {
                let (head, tail) = self
                    .usage(other)
                    .map_or((NULL_PAGE, NULL_PAGE), |u| (u.partition_head, u.partition_tail));
                if tail == NULL_PAGE || tail != head {
                    continue;
                }
                if let Some(single) = self.page_mut(other, head) {
                    single.set_sealed(true);
                    let notifiers = single.reset_insertion_notifiers();
                    self.notify_all(&notifiers);
                }
            }

            debug!(
                topic = %self.topic,
                partition = self.partition,
                storage_bytes = self.storage_bytes,
                server_capacity,
                "Topic full"
            );
            return Some(OfferResult::new(OfferStatus::TopicFull, 0, capacity));
        }

        None
    }

    pub fn remove_page_if_not_retaining(&mut self, channel: u32, page: i64) -> bool {
        if self.config.retain_consumed {
            return false;
        }
        self.remove_page(channel, page)
    }

    /// Remove a page and its elements, returning false if it did not exist
    ///
    /// Only the head or the tail of a channel's page list is ever removed.
    pub fn remove_page(&mut self, channel: u32, page: i64) -> bool {
        let Some(removed) = self.pages.remove(&PageKey::new(channel, page)) else {
            return false;
        };

        for offset in (0..=removed.tail).rev() {
            if let Some(stored) = self.content.remove(&ContentKey::new(channel, page, offset)) {
                self.storage_bytes -= stored.element.binary().len() as i64;
            }
        }

        let usage = self.usage_mut(channel);
        if usage.partition_tail == page {
            usage.set_partition_head(NULL_PAGE);
            usage.set_partition_tail(NULL_PAGE);
        } else {
            usage.set_partition_head(removed.next_partition_page);
        }
        let notifiers = usage.reset_removal_notifiers();

        if let Some(next) = self.page_mut(channel, removed.next_partition_page) {
            next.set_previous_partition_page(NULL_PAGE);
        }

        debug!(
            topic = %self.topic,
            partition = self.partition,
            channel,
            page,
            "Page removed"
        );
        self.notify_all(&notifiers);
        true
    }

    /// Fire notifiers, turning each registration into a [`Wakeup`]
    pub fn notify_all(&mut self, notifiers: &[i32]) {
        for notifier_id in notifiers {
            let key = NotificationKey::new(self.partition, *notifier_id);
            if let Some(registration) = self.notifications.remove(&key) {
                self.wakeups.push(Wakeup {
                    notifier_id: *notifier_id,
                    channels: registration.channels,
                });
            }
        }
    }

    /// Wake a subscriber on the next insert into `page`
    pub fn request_insertion_notification(&mut self, channel: u32, page: i64, notifier_id: i32) {
        if let Some(current) = self.page_mut(channel, page) {
            current.add_insertion_notifier(notifier_id);
        }
        self.notifications
            .entry(NotificationKey::new(self.partition, notifier_id))
            .or_default()
            .add_channel(channel);
    }

    /// Wake a publisher on the next page removal in any non-empty channel
    pub fn request_removal_notification(&mut self, notifier_id: i32, channel: u32) {
        let expires_at = self
            .now()
            .saturating_add(self.config.publisher_notification_expiry_ms);
        let key = NotificationKey::new(self.partition, notifier_id);

        for other in 0..self.channel_count() {
            let usage = self.usage_mut(other);
            if usage.partition_head == NULL_PAGE {
                continue;
            }
            usage.add_removal_notifier(notifier_id);

            // space can also be freed by losing partitions, which removes no
            // page, so the registration lapses on its own
            let registration = self.notifications.entry(key).or_default();
            registration.add_channel(channel);
            registration.expires_at = Some(expires_at);
        }
    }

    /// Fire registrations whose expiry has passed, returning how many fired
    pub fn expire_notifications(&mut self, now: i64) -> usize {
        let expired: Vec<i32> = self
            .notifications
            .iter()
            .filter(|(_, registration)| registration.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.notifier_id)
            .collect();
        self.notify_all(&expired);
        expired.len()
    }

    /// Remove a group's subscription, releasing the pages it was attached to
    pub fn remove_subscription(&mut self, group: &SubscriberGroupId) {
        for channel in 0..self.channel_count() {
            let key = SubscriptionKey::new(self.partition, channel, group.clone());
            let Some(subscription) = self.subscriptions.remove(&key) else {
                continue;
            };

            if group.is_anonymous() {
                self.usage_mut(channel).remove_anonymous_subscriber(group);
            }
            self.release_cursor(channel, subscription.read_position());
        }

        debug!(
            topic = %self.topic,
            partition = self.partition,
            group = %group,
            "Subscription removed"
        );
    }

    /// Drop the page reference held by a cursor
    fn release_cursor(&mut self, channel: u32, cursor: PagedPosition) {
        let mut page = cursor.page;
        let mut attached = self.has_page(channel, page);

        if cursor.offset == MAX_OFFSET || !attached {
            // drained before the next page existed; any next page carries
            // our reference through the waiting count
            let next = self.page(channel, page).map(|drained| drained.next_partition_page);
            page = match next {
                Some(next) => next,
                None => self.usage_mut(channel).partition_head,
            };
            if page == NULL_PAGE {
                self.usage_mut(channel).adjust_waiting_subscriber_count(-1);
                attached = false;
            } else {
                attached = self.has_page(channel, page);
            }
        }

        if attached {
            self.release_page_chain(channel, page);
        }
    }

    /// Move a cursor's page reference to where a new owner rolled it back to
    ///
    /// The reference at the new cursor is taken before the old one is dropped,
    /// so a rollback within one page never frees it.
    fn reattach_cursor(&mut self, channel: u32, subscription: &mut Subscription, previous: PagedPosition) {
        let target = subscription.page;
        if let Some(page) = self.page_mut(channel, target) {
            page.increment_reference_count();
        } else {
            // the rolled back page is gone; resume from the oldest one left
            let head = self.usage_mut(channel).partition_head;
            if let Some(page) = self.page_mut(channel, head) {
                page.increment_reference_count();
                subscription.set_page(head);
                subscription.set_position(0);
            } else {
                self.usage_mut(channel).adjust_waiting_subscriber_count(1);
                subscription.set_position(MAX_OFFSET);
            }
        }
        self.release_cursor(channel, previous);

        debug!(
            topic = %self.topic,
            partition = self.partition,
            channel,
            from = %previous,
            to = %subscription.read_position(),
            "Cursor rolled back"
        );
    }

    fn release_page_chain(&mut self, channel: u32, mut page: i64) {
        while let Some(current) = self.page_mut(channel, page) {
            if current.decrement_reference_count() != 0 {
                break;
            }
            let next = current.next_partition_page;
            self.remove_page_if_not_retaining(channel, page);
            if next == NULL_PAGE {
                break;
            }
            page = next;
        }
    }

    /// Establish a group's subscription in every channel of this partition
    ///
    /// Returns `None` when an `Inquire` finds the group not yet initialised
    /// here (the caller must `Pin` then `Advance`). Otherwise returns the page
    /// each channel's cursor is on, `NULL_PAGE` where the cursor is detached.
    pub fn ensure_subscription(
        &mut self,
        group: &SubscriberGroupId,
        phase: EnsurePhase,
        heads: &[i64],
        filter: Option<&Filter>,
        converter: Option<&Converter>,
    ) -> Option<Vec<i64>> {
        match phase {
            EnsurePhase::Inquire => self.cleanup_subscriber_registrations(),
            EnsurePhase::Pin => {
                let anonymous = self.usage_mut(0).anonymous_subscribers();
                let live = self.live_member_timestamps();
                self.remove_dead_anonymous(&anonymous, &live);
            }
            EnsurePhase::Advance => {}
        }

        let channel_count = self.channel_count();
        let mut pages = vec![NULL_PAGE; channel_count as usize];

        for channel in 0..channel_count {
            let key = SubscriptionKey::new(self.partition, channel, group.clone());

            match phase {
                EnsurePhase::Inquire => {
                    let subscription = self.subscriptions.get_mut(&key)?;
                    if subscription.subscription_head == NULL_PAGE {
                        return None;
                    }
                    // later subscribers may bring a new filter or converter
                    if subscription.filter.as_ref() != filter {
                        subscription.set_filter(filter.cloned());
                    }
                    if subscription.converter.as_ref() != converter {
                        subscription.set_converter(converter.cloned());
                    }
                    pages[channel as usize] = visible_page(subscription);
                }
                EnsurePhase::Pin if !self.subscriptions.contains_key(&key) => {
                    pages[channel as usize] = self.pin(key, filter, converter);
                }
                EnsurePhase::Advance
                    if self
                        .subscriptions
                        .get(&key)
                        .is_some_and(|s| s.subscription_head == NULL_PAGE) =>
                {
                    let head = heads.get(channel as usize).copied().unwrap_or(NULL_PAGE);
                    pages[channel as usize] = self.advance(key, head);
                }
                _ => {
                    let subscription = self.subscriptions.get(&key)?;
                    pages[channel as usize] = visible_page(subscription);
                }
            }
        }

        Some(pages)
    }

    fn pin(
        &mut self,
        key: SubscriptionKey,
        filter: Option<&Filter>,
        converter: Option<&Converter>,
    ) -> i64 {
        let channel = key.channel;
        let retain = self.config.retain_consumed;
        let mut subscription = Subscription::new();

        let usage = self.usage_mut(channel);
        if key.group.is_anonymous() {
            usage.add_anonymous_subscriber(key.group.clone());
        }

        let mut page = if retain {
            usage.partition_head
        } else {
            usage.partition_tail
        };

        if page == NULL_PAGE {
            // empty partition; attach to whatever page comes next
            usage.adjust_waiting_subscriber_count(1);
            page = usage.partition_max;
            subscription.set_page(page);
            if page != NULL_PAGE {
                subscription.set_position(MAX_OFFSET);
            }
        } else {
            if let Some(current) = self.page_mut(channel, page) {
                current.increment_reference_count();
            }
            subscription.set_page(page);
        }

        subscription.set_filter(filter.cloned());
        subscription.set_converter(converter.cloned());
        self.subscriptions.insert(key, subscription);
        page
    }

    fn advance(&mut self, key: SubscriptionKey, head: i64) -> i64 {
        let channel = key.channel;
        let Some(mut subscription) = self.subscriptions.remove(&key) else {
            return NULL_PAGE;
        };

        let mut page = subscription.page;
        let mut attached = self.has_page(channel, page);
        let partition_head = self.usage_mut(channel).partition_head;

        if !attached && partition_head != NULL_PAGE {
            // pinned while empty; the waiting count already attached us to the
            // first page inserted since
            page = partition_head;
            attached = true;
            subscription.set_page(page);
            subscription.set_position(0);
        }

        while page < head && attached {
            let Some(current) = self.page_mut(channel, page) else {
                break;
            };
            let next = current.next_partition_page;
            if current.decrement_reference_count() == 0 {
                self.remove_page_if_not_retaining(channel, page);
            }

            if next == NULL_PAGE {
                attached = false;
                self.usage_mut(channel).adjust_waiting_subscriber_count(1);
                subscription.set_position(MAX_OFFSET);
            } else {
                page = next;
                subscription.set_page(page);
                if let Some(current) = self.page_mut(channel, page) {
                    current.increment_reference_count();
                }
            }
        }

        if page == head && attached {
            let position = if self.config.retain_consumed {
                0
            } else {
                self.page(channel, page).map_or(0, |p| p.tail + 1)
            };
            subscription.set_position(position);
        }

        subscription.set_subscription_head(head);
        let visible = visible_page(&subscription);
        self.subscriptions.insert(key, subscription);
        visible
    }

    /// Read elements for a group from the head of its current page
    ///
    /// `notifier_id` is registered for the next insert when the read catches up
    /// with the page tail.
    pub fn poll_from_page_head(
        &mut self,
        group: &SubscriberGroupId,
        channel: u32,
        page: i64,
        max_elements: usize,
        notifier_id: i32,
    ) -> PartitionResult<PollResult> {
        let key = SubscriptionKey::new(self.partition, channel, group.clone());
        let Some(mut subscription) = self.subscriptions.remove(&key) else {
            return Ok(PollResult {
                status: PollStatus::UnknownSubscriber,
                next: 0,
                elements: Vec::new(),
            });
        };

        let result = self.poll_subscription(&mut subscription, channel, page, max_elements, notifier_id);
        self.subscriptions.insert(key, subscription);
        result
    }

    fn poll_subscription(
        &mut self,
        subscription: &mut Subscription,
        channel: u32,
        page: i64,
        max_elements: usize,
        notifier_id: i32,
    ) -> PartitionResult<PollResult> {
        let current = subscription.page;
        let mut position;

        if page == current {
            position = subscription.position;
            if page == NULL_PAGE || position == MAX_OFFSET {
                // blind request, or already detached from this page
                return Ok(PollResult::exhausted(MAX_OFFSET, Vec::new()));
            }
        } else if page < current {
            return Ok(PollResult::exhausted(MAX_OFFSET, Vec::new()));
        } else {
            // first read of a later page; we are attached through the
            // waiting count
            if !self.ensure_page(channel, page) {
                return Ok(PollResult::exhausted(MAX_OFFSET, Vec::new()));
            }
            position = 0;
            subscription.set_page(page);
            subscription.set_position(position);
        }

        let Some((tail, sealed)) = self.page(channel, page).map(|p| (p.tail, p.sealed)) else {
            return Ok(PollResult::exhausted(MAX_OFFSET, Vec::new()));
        };

        let now = self.now();
        let limit = self.config.max_batch_size_bytes;
        let mut wanted = max_elements;
        let mut batch_bytes = 0i64;
        let mut elements = Vec::with_capacity(max_elements.min((tail - position + 1).max(0) as usize));

        while wanted > 0 && position <= tail && batch_bytes < limit {
            let content_key = ContentKey::new(channel, page, position);
            position += 1;

            let expired = self
                .content
                .get(&content_key)
                .is_some_and(|s| s.expires_at.is_some_and(|at| at <= now));
            if expired {
                if let Some(stored) = self.content.remove(&content_key) {
                    self.storage_bytes -= stored.element.binary().len() as i64;
                }
                continue;
            }

            let Some(stored) = self.content.get(&content_key) else {
                continue;
            };
            if let Some(filter) = subscription.filter.as_ref() {
                if !self.filter.evaluate(filter, &stored.element) {
                    continue;
                }
            }

            let element = match subscription.converter.as_ref() {
                None => stored.element.clone(),
                Some(converter) => {
                    let value = stored.element.value_binary()?;
                    let Some(converted) = self.converter.convert(converter, value) else {
                        continue;
                    };
                    let metadata = stored.element.metadata()?;
                    PageElement::encode(
                        metadata.channel,
                        metadata.page,
                        metadata.offset,
                        metadata.timestamp,
                        converted,
                    )?
                }
            };

            batch_bytes += element.binary().len() as i64;
            elements.push(element);
            wanted -= 1;
        }

        if position > tail && sealed {
            // detach from the drained page
            let Some(drained) = self.page_mut(channel, page) else {
                return Ok(PollResult::exhausted(position, elements));
            };
            let next = drained.next_partition_page;
            let remaining_refs = drained.decrement_reference_count();
            if remaining_refs == 0 {
                self.remove_page_if_not_retaining(channel, page);
            }

            if next == NULL_PAGE {
                self.usage_mut(channel).adjust_waiting_subscriber_count(1);
                subscription.set_position(MAX_OFFSET);
            } else {
                subscription.set_page(next);
                subscription.set_position(0);
                // a removed page hands its link reference to us
                if remaining_refs > 0 {
                    if let Some(following) = self.page_mut(channel, next) {
                        following.increment_reference_count();
                    }
                }
            }

            return Ok(PollResult::exhausted(position, elements));
        }

        subscription.set_position(position);
        if position > tail {
            self.request_insertion_notification(channel, page, notifier_id);
        }

        Ok(PollResult {
            status: PollStatus::Remaining(tail - position + 1),
            next: position,
            elements,
        })
    }

    /// Record a group's committed position in a channel
    pub fn commit(
        &mut self,
        group: &SubscriberGroupId,
        channel: u32,
        position: PagedPosition,
        subscriber: SubscriberId,
    ) -> CommitResult {
        let owner = self
            .subscription(group, 0)
            .map(|allocation| allocation.get_channel_owner(channel))
            .unwrap_or(0);
        let allow_unowned = self.config.allow_unowned_commits;

        let key = SubscriptionKey::new(self.partition, channel, group.clone());
        let Some(subscription) = self.subscriptions.get_mut(&key) else {
            return CommitResult::Rejected;
        };

        if position.is_null() {
            return CommitResult::NothingToCommit;
        }
        if !allow_unowned && owner != subscriber.id {
            return CommitResult::Unowned;
        }
        if !subscription.committed.is_null() && position <= subscription.committed {
            return CommitResult::AlreadyCommitted;
        }
        if position >= subscription.read_position() {
            return CommitResult::Rejected;
        }

        subscription.set_committed_position(position, position.next());
        trace!(
            partition = self.partition,
            channel,
            group = %group,
            position = %position,
            "Committed"
        );
        CommitResult::Committed
    }

    /// Apply a group-wide allocation to this partition's subscriptions
    ///
    /// The channel-zero entry takes the full allocation; every channel entry
    /// takes its owner, rolling back when the owner changed. Returns false when
    /// the group has no subscription here.
    pub fn update_allocation(
        &mut self,
        group: &SubscriberGroupId,
        allocation: &PagedTopicSubscription,
    ) -> bool {
        let zero = SubscriptionKey::new(self.partition, 0, group.clone());
        let Some(subscription) = self.subscriptions.get_mut(&zero) else {
            return false;
        };
        subscription.refresh_from(allocation);

        for channel in 0..self.channel_count() {
            let key = SubscriptionKey::new(self.partition, channel, group.clone());
            let owner = allocation
                .subscriber(allocation.channel_owner(channel))
                .unwrap_or(NULL_SUBSCRIBER);
            let Some(mut subscription) = self.subscriptions.remove(&key) else {
                continue;
            };

            let previous = subscription.read_position();
            subscription.set_owning_subscriber(owner);
            if subscription.read_position() != previous {
                self.reattach_cursor(channel, &mut subscription, previous);
            }
            self.subscriptions.insert(key, subscription);
        }
        true
    }

    /// Thin out insertion registrations on channels nobody publishes to
    ///
    /// Removes a random pair from every tail page holding two or more; a live
    /// subscriber losing its registration just sees a spurious wake-up and
    /// registers again.
    pub fn cleanup_subscriber_registrations(&mut self) {
        for channel in 0..self.channel_count() {
            let tail = self.usage(channel).map_or(NULL_PAGE, |u| u.partition_tail);
            let Some(page) = self.page_mut(channel, tail) else {
                continue;
            };
            let count = page.insertion_notifiers.len();
            if count < 2 {
                continue;
            }
            let index = random_index(count - 1);
            if let Some(pair) = page.insertion_notifiers.remove_pair_at(index) {
                self.notify_all(&pair);
            }
        }
    }

    /// Remove anonymous groups whose creating member is no longer live
    pub fn cleanup_non_durable_subscribers(&mut self, live_members: &[Member]) {
        let live: BTreeSet<i64> = live_members.iter().map(|m| m.timestamp).collect();
        let anonymous: BTreeSet<SubscriberGroupId> = (0..self.channel_count())
            .filter_map(|channel| self.usage(channel))
            .flat_map(Usage::anonymous_subscribers)
            .collect();
        let anonymous: Vec<SubscriberGroupId> = anonymous.into_iter().collect();
        self.remove_dead_anonymous(&anonymous, &live);
    }

    fn live_member_timestamps(&self) -> BTreeSet<i64> {
        self.members.read().iter().map(|m| m.timestamp).collect()
    }

    fn remove_dead_anonymous(&mut self, anonymous: &[SubscriberGroupId], live: &BTreeSet<i64>) {
        for group in anonymous {
            if live.contains(&group.member_timestamp) {
                continue;
            }
            debug!(
                topic = %self.topic,
                partition = self.partition,
                group = %group,
                "Removing anonymous subscription of departed member"
            );
            self.remove_subscription(group);
        }
    }

    /// Position of the first element of every channel
    pub fn head_positions(&self) -> Vec<PagedPosition> {
        (0..self.channel_count())
            .map(|channel| {
                let head = self.usage(channel).map_or(NULL_PAGE, |u| u.partition_head);
                let key = PageKey::new(channel, head);
                self.pages
                    .get(&key)
                    .map_or(NULL_POSITION, |page| head_position(&key, page))
            })
            .collect()
    }

    /// Position of the last element of every channel
    pub fn tail_positions(&self) -> Vec<PagedPosition> {
        (0..self.channel_count())
            .map(|channel| {
                let tail = self.usage(channel).map_or(NULL_PAGE, |u| u.partition_tail);
                let key = PageKey::new(channel, tail);
                self.pages
                    .get(&key)
                    .map_or(NULL_POSITION, |page| tail_position(&key, page))
            })
            .collect()
    }
}

fn visible_page(subscription: &Subscription) -> i64 {
    if subscription.position == MAX_OFFSET {
        NULL_PAGE
    } else {
        subscription.page
    }
}

fn random_index(bound: usize) -> usize {
    (Uuid::new_v4().as_u128() % bound as u128) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagedtopic_core::identity::create_id;

    fn config() -> TopicConfig {
        TopicConfig {
            channel_count: 2,
            page_capacity_bytes: 1024,
            ..TopicConfig::default()
        }
    }

    fn partition_with(config: TopicConfig) -> TopicPartition {
        let member = Member::new(1, Uuid::new_v4(), 1_000);
        TopicPartition::new("orders", 0, 1, config, Arc::new(RwLock::new(vec![member])))
    }

    fn values(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(format!("value-{i}"))).collect()
    }

    fn subscribe(partition: &mut TopicPartition, group: &SubscriberGroupId, head: i64) {
        assert!(partition
            .ensure_subscription(group, EnsurePhase::Inquire, &[], None, None)
            .is_none());
        partition
            .ensure_subscription(group, EnsurePhase::Pin, &[], None, None)
            .unwrap();
        let heads = vec![head; partition.channel_count() as usize];
        partition
            .ensure_subscription(group, EnsurePhase::Advance, &heads, None, None)
            .unwrap();
    }

    #[test]
    fn test_initialise_topic_is_stable() {
        let mut partition = partition_with(config());
        let tail = partition.initialise_topic(0);
        assert_eq!(tail, partitioning::base_page("orders", 1));
        assert_eq!(partition.initialise_topic(0), tail);
    }

    #[test]
    fn test_ensure_page_links_pages() {
        let mut partition = partition_with(config());
        assert!(partition.ensure_page(0, 3));
        assert!(partition.ensure_page(0, 5));

        let usage = partition.usage(0).unwrap();
        assert_eq!(usage.partition_head, 3);
        assert_eq!(usage.partition_tail, 5);
        assert_eq!(partition.page(0, 3).unwrap().next_partition_page, 5);
        assert_eq!(partition.page(0, 5).unwrap().previous_partition_page, 3);
        assert_eq!(partition.page(0, 5).unwrap().reference_count, 1);

        // a page at or below the max cannot be created
        assert!(!partition.ensure_page(0, 4));
    }

    #[test]
    fn test_removed_page_is_not_recreated() {
        let mut partition = partition_with(config());
        partition.ensure_page(0, 1);
        assert!(partition.remove_page(0, 1));
        assert!(!partition.remove_page(0, 1));
        assert!(!partition.ensure_page(0, 1));
        assert_eq!(partition.usage(0).unwrap().partition_head, NULL_PAGE);
    }

    #[test]
    fn test_offer_without_subscribers_is_discarded() {
        let mut partition = partition_with(config());
        let result = partition
            .offer_to_page_tail(0, 0, &values(3), None, false)
            .unwrap();
        assert_eq!(result, OfferResult::new(OfferStatus::PageSealed, 3, 1024));
        assert!(partition.page(0, 0).is_none());
        assert_eq!(partition.storage_bytes(), 0);
    }

    #[test]
    fn test_offer_and_poll() {
        let mut partition = partition_with(config());
        let group = SubscriberGroupId::durable("billing");
        subscribe(&mut partition, &group, 0);

        let result = partition
            .offer_to_page_tail(0, 0, &values(3), None, false)
            .unwrap();
        assert_eq!(result.status, OfferStatus::Success);
        assert_eq!(result.accepted, 3);
        assert!(partition.storage_bytes() > 0);

        let polled = partition.poll_from_page_head(&group, 0, 0, 10, 7).unwrap();
        assert_eq!(polled.status, PollStatus::Remaining(0));
        assert_eq!(polled.next, 3);
        assert_eq!(polled.elements.len(), 3);
        assert_eq!(
            polled.elements[1].value_binary().unwrap(),
            Bytes::from_static(b"value-1")
        );
        assert_eq!(polled.elements[2].position().unwrap(), PagedPosition::new(0, 2));

        // caught up: registered for the next insert
        assert_eq!(partition.notification(7), Some(&[0u32][..]));
        partition
            .offer_to_page_tail(0, 0, &values(1), None, false)
            .unwrap();
        assert_eq!(
            partition.take_wakeups(),
            vec![Wakeup {
                notifier_id: 7,
                channels: vec![0]
            }]
        );
        assert!(partition.notification(7).is_none());
    }

    #[test]
    fn test_poll_unknown_subscriber() {
        let mut partition = partition_with(config());
        let group = SubscriberGroupId::durable("nobody");
        let result = partition.poll_from_page_head(&group, 0, 0, 1, 1).unwrap();
        assert_eq!(result.status, PollStatus::UnknownSubscriber);
    }

    #[test]
    fn test_element_expiry() {
        static NOW: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(10_000);
        fn clock() -> i64 {
            NOW.load(std::sync::atomic::Ordering::Relaxed)
        }

        let mut partition = partition_with(TopicConfig {
            element_expiry_ms: 100,
            ..config()
        })
        .with_clock(clock);
        let group = SubscriberGroupId::durable("slow");
        subscribe(&mut partition, &group, 0);
        partition
            .offer_to_page_tail(0, 0, &values(2), None, false)
            .unwrap();

        NOW.store(10_200, std::sync::atomic::Ordering::Relaxed);
        let polled = partition.poll_from_page_head(&group, 0, 0, 10, 1).unwrap();
        assert!(polled.elements.is_empty());
        assert_eq!(polled.next, 2);
        assert_eq!(partition.storage_bytes(), 0);
    }

    #[test]
    fn test_commit_rules() {
        let mut partition = partition_with(TopicConfig {
            channel_count: 1,
            ..config()
        });
        let group = SubscriberGroupId::durable("g");
        subscribe(&mut partition, &group, 0);
        partition
            .offer_to_page_tail(0, 0, &values(3), None, false)
            .unwrap();
        partition.poll_from_page_head(&group, 0, 0, 2, 1).unwrap();

        let owner = SubscriberId::new(create_id(1, 1), None);
        let mut allocation =
            PagedTopicSubscription::new("orders", group.clone(), 1, None, None, 1);
        allocation.add_subscriber(owner, 0);
        allocation.update_channel_allocations(&pagedtopic_core::SimpleChannelAllocationStrategy, 1);
        assert!(partition.update_allocation(&group, &allocation));

        let other = SubscriberId::new(create_id(2, 1), None);
        assert_eq!(
            partition.commit(&group, 0, PagedPosition::new(0, 0), other),
            CommitResult::Unowned
        );
        assert_eq!(
            partition.commit(&group, 0, NULL_POSITION, owner),
            CommitResult::NothingToCommit
        );
        assert_eq!(
            partition.commit(&group, 0, PagedPosition::new(0, 2), owner),
            CommitResult::Rejected
        );
        assert_eq!(
            partition.commit(&group, 0, PagedPosition::new(0, 1), owner),
            CommitResult::Committed
        );
        assert_eq!(
            partition.commit(&group, 0, PagedPosition::new(0, 0), owner),
            CommitResult::AlreadyCommitted
        );

        let subscription = partition.subscription(&group, 0).unwrap();
        assert_eq!(subscription.committed, PagedPosition::new(0, 1));
        assert_eq!(subscription.rollback, PagedPosition::new(0, 2));
    }

    #[test]
    fn test_remove_subscription_skips_missing_channel() {
        let mut partition = partition_with(config());
        let group = SubscriberGroupId::durable("billing");
        subscribe(&mut partition, &group, 0);
        partition
            .offer_to_page_tail(1, 0, &values(2), None, false)
            .unwrap();

        partition
            .subscriptions
            .remove(&SubscriptionKey::new(0, 0, group.clone()));
        partition.remove_subscription(&group);

        assert!(partition.subscription(&group, 1).is_none());
        assert!(partition.page(1, 0).is_none());
        assert_eq!(partition.usage(1).unwrap().waiting_subscriber_count, 0);
    }

    #[test]
    fn test_cleanup_subscriber_registrations_removes_pair() {
        let mut partition = partition_with(config());
        partition.ensure_page(0, 0);
        for notifier in [1, 2, 3] {
            partition.request_insertion_notification(0, 0, notifier);
        }

        partition.cleanup_subscriber_registrations();
        assert_eq!(partition.page(0, 0).unwrap().insertion_notifiers.len(), 1);
        assert_eq!(partition.take_wakeups().len(), 2);
    }

    #[test]
    fn test_removal_notification_expires() {
        let mut partition = partition_with(config());
        partition.ensure_page(1, 0);
        partition.request_removal_notification(9, 0);
        assert_eq!(partition.notification(9), Some(&[0u32][..]));
        assert!(partition.usage(1).unwrap().removal_notifiers.contains(9));

        assert_eq!(partition.expire_notifications(0), 0);
        assert_eq!(partition.expire_notifications(i64::MAX), 1);
        assert_eq!(partition.take_wakeups()[0].notifier_id, 9);
    }

    #[test]
    fn test_monitoring_positions() {
        let mut partition = partition_with(config());
        let group = SubscriberGroupId::durable("monitor");
        subscribe(&mut partition, &group, 0);
        partition
            .offer_to_page_tail(1, 4, &values(2), None, false)
            .unwrap();

        assert_eq!(partition.head_positions(), vec![NULL_POSITION, PagedPosition::new(4, 0)]);
        assert_eq!(partition.tail_positions(), vec![NULL_POSITION, PagedPosition::new(4, 1)]);
    }
}
