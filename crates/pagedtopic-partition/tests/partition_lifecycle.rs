//! Partition Life Cycle Integration Tests
//!
//! Drives a single `TopicPartition` through publish and consume cycles:
//! - Pages seal at capacity and are removed once every group drained them
//! - Groups that drained a partition attach to the next page created
//! - Consumed pages survive when the topic retains them
//! - A full topic refuses offers and wakes the publisher on page removal
//! - Anonymous groups of departed members are cleaned up on the next page
//! - A new channel owner rolls back without freeing pages twice

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use uuid::Uuid;

use pagedtopic_core::identity::create_id;
use pagedtopic_core::{
    Member, PagedPosition, PagedTopicSubscription, SimpleChannelAllocationStrategy,
    SubscriberGroupId, SubscriberId, TopicConfig, NULL_PAGE,
};
use pagedtopic_partition::{CommitResult, EnsurePhase, OfferStatus, PollStatus, TopicPartition};

fn local_member() -> Member {
    Member::new(1, Uuid::new_v4(), 1_000)
}

fn partition(config: TopicConfig) -> TopicPartition {
    TopicPartition::new(
        "events",
        0,
        1,
        config,
        Arc::new(RwLock::new(vec![local_member()])),
    )
}

fn values(n: usize, len: usize) -> Vec<Bytes> {
    (0..n).map(|i| Bytes::from(format!("{i:0>len$}"))).collect()
}

/// Run the three subscription phases with every channel's head at page 0
fn subscribe(partition: &mut TopicPartition, group: &SubscriberGroupId) {
    assert!(partition
        .ensure_subscription(group, EnsurePhase::Inquire, &[], None, None)
        .is_none());
    partition
        .ensure_subscription(group, EnsurePhase::Pin, &[], None, None)
        .unwrap();
    let heads = vec![0; partition.channel_count() as usize];
    partition
        .ensure_subscription(group, EnsurePhase::Advance, &heads, None, None)
        .unwrap();
}

/// Hand every channel of `group` to `owner`
fn assign(partition: &mut TopicPartition, group: &SubscriberGroupId, owner: SubscriberId) {
    let channel_count = partition.channel_count();
    let mut allocation =
        PagedTopicSubscription::new("events", group.clone(), 1, None, None, channel_count);
    allocation.add_subscriber(owner, 0);
    allocation.update_channel_allocations(&SimpleChannelAllocationStrategy, channel_count);
    assert!(partition.update_allocation(group, &allocation));
}

fn owner(member: u32) -> SubscriberId {
    SubscriberId::new(create_id(1, member), None)
}

// ---------------------------------------------------------------
// Sealing and removal
// ---------------------------------------------------------------

#[test]
fn page_seals_at_capacity() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        page_capacity_bytes: 64,
        ..TopicConfig::default()
    });
    let group = SubscriberGroupId::durable("audit");
    subscribe(&mut partition, &group);

    let offered = values(20, 8);
    let result = partition
        .offer_to_page_tail(0, 0, &offered, None, false)
        .unwrap();

    assert_eq!(result.status, OfferStatus::PageSealed);
    assert!(result.accepted > 0);
    assert!(result.accepted < offered.len());

    let page = partition.page(0, 0).unwrap();
    assert!(page.sealed);
    assert!(page.byte_size >= 64);
    assert_eq!(page.tail as usize, result.accepted - 1);

    // further offers to a sealed page accept nothing
    let again = partition
        .offer_to_page_tail(0, 0, &offered, None, false)
        .unwrap();
    assert_eq!(again.status, OfferStatus::PageSealed);
    assert_eq!(again.accepted, 0);
}

#[test]
fn drained_sealed_page_is_removed() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let group = SubscriberGroupId::durable("audit");
    subscribe(&mut partition, &group);

    partition
        .offer_to_page_tail(0, 0, &values(3, 4), None, true)
        .unwrap();
    assert!(partition.storage_bytes() > 0);

    let polled = partition.poll_from_page_head(&group, 0, 0, 10, 1).unwrap();
    assert_eq!(polled.status, PollStatus::Exhausted);
    assert_eq!(polled.elements.len(), 3);

    assert!(partition.page(0, 0).is_none());
    assert_eq!(partition.storage_bytes(), 0);
    let usage = partition.usage(0).unwrap();
    assert_eq!(usage.partition_head, NULL_PAGE);
    assert_eq!(usage.waiting_subscriber_count, 1);

    // the waiting group is attached to the next page as it is created
    partition
        .offer_to_page_tail(0, 1, &values(2, 4), None, false)
        .unwrap();
    assert_eq!(partition.page(0, 1).unwrap().reference_count, 1);
    assert_eq!(partition.usage(0).unwrap().waiting_subscriber_count, 0);

    let polled = partition.poll_from_page_head(&group, 0, 1, 10, 1).unwrap();
    assert_eq!(polled.status, PollStatus::Remaining(0));
    assert_eq!(polled.elements.len(), 2);
}

#[test]
fn page_survives_until_every_group_drained_it() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let fast = SubscriberGroupId::durable("fast");
    let slow = SubscriberGroupId::durable("slow");
    subscribe(&mut partition, &fast);
    subscribe(&mut partition, &slow);

    partition
        .offer_to_page_tail(0, 0, &values(2, 4), None, true)
        .unwrap();
    assert_eq!(partition.page(0, 0).unwrap().reference_count, 2);

    partition.poll_from_page_head(&fast, 0, 0, 10, 1).unwrap();
    assert_eq!(partition.page(0, 0).unwrap().reference_count, 1);

    partition.poll_from_page_head(&slow, 0, 0, 10, 2).unwrap();
    assert!(partition.page(0, 0).is_none());

    partition
        .offer_to_page_tail(0, 1, &values(1, 4), None, false)
        .unwrap();
    assert_eq!(partition.page(0, 1).unwrap().reference_count, 2);
}

#[test]
fn removing_subscription_releases_pages() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let group = SubscriberGroupId::durable("audit");
    subscribe(&mut partition, &group);

    partition
        .offer_to_page_tail(0, 0, &values(2, 4), None, false)
        .unwrap();
    assert!(partition.page(0, 0).is_some());

    partition.remove_subscription(&group);
    assert!(partition.subscription(&group, 0).is_none());
    assert!(partition.page(0, 0).is_none());
    assert_eq!(partition.storage_bytes(), 0);
}

// ---------------------------------------------------------------
// Retained topics
// ---------------------------------------------------------------

#[test]
fn retained_pages_are_readable_by_late_groups() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        retain_consumed: true,
        ..TopicConfig::default()
    });
    let early = SubscriberGroupId::durable("early");
    subscribe(&mut partition, &early);

    partition
        .offer_to_page_tail(0, 0, &values(3, 4), None, false)
        .unwrap();
    let polled = partition.poll_from_page_head(&early, 0, 0, 10, 1).unwrap();
    assert_eq!(polled.elements.len(), 3);

    // a late group starts from the head of the retained page
    let late = SubscriberGroupId::durable("late");
    subscribe(&mut partition, &late);
    assert_eq!(partition.subscription(&late, 0).unwrap().position, 0);

    let polled = partition.poll_from_page_head(&late, 0, 0, 10, 2).unwrap();
    assert_eq!(polled.elements.len(), 3);

    // sealing and draining does not remove a retained page
    partition
        .offer_to_page_tail(0, 0, &[], None, true)
        .unwrap();
    partition.poll_from_page_head(&early, 0, 0, 10, 1).unwrap();
    partition.poll_from_page_head(&late, 0, 0, 10, 2).unwrap();
    assert!(partition.page(0, 0).is_some());
}

// ---------------------------------------------------------------
// Server capacity
// ---------------------------------------------------------------

#[test]
fn full_topic_wakes_publisher_on_removal() {
    let mut partition = partition(TopicConfig {
        channel_count: 2,
        server_capacity_bytes: 100,
        ..TopicConfig::default()
    });
    let group = SubscriberGroupId::durable("billing");
    subscribe(&mut partition, &group);
    let publisher = Some(5);

    let first = partition
        .offer_to_page_tail(0, 0, &values(4, 30), publisher, false)
        .unwrap();
    assert_eq!(first.status, OfferStatus::PageSealed);
    assert!(first.accepted > 0);

    let second = partition
        .offer_to_page_tail(0, 1, &values(4, 30), publisher, false)
        .unwrap();
    assert_eq!(second.status, OfferStatus::PageSealed);
    assert!(partition.storage_bytes() >= 100);

    let full = partition
        .offer_to_page_tail(0, 2, &values(4, 30), publisher, false)
        .unwrap();
    assert_eq!(full.status, OfferStatus::TopicFull);
    assert_eq!(full.accepted, 0);
    assert_eq!(partition.notification(5), Some(&[0u32][..]));

    // draining the head page frees space and wakes the publisher
    let polled = partition.poll_from_page_head(&group, 0, 0, 10, 1).unwrap();
    assert_eq!(polled.status, PollStatus::Exhausted);
    assert!(partition.page(0, 0).is_none());

    let wakeups = partition.take_wakeups();
    assert!(wakeups.iter().any(|w| w.notifier_id == 5 && w.channels == vec![0]));
    assert!(partition.notification(5).is_none());
}

// ---------------------------------------------------------------
// Anonymous groups
// ---------------------------------------------------------------

#[test]
fn anonymous_group_of_departed_member_is_removed() {
    let mut partition = partition(TopicConfig {
        channel_count: 2,
        ..TopicConfig::default()
    });
    let departed = Member::new(2, Uuid::new_v4(), 2_000);
    let group = SubscriberGroupId::anonymous(&departed);
    subscribe(&mut partition, &group);
    assert_eq!(partition.usage(0).unwrap().anonymous_subscribers(), vec![group.clone()]);

    // the first offer to a new page notices the group's member is gone
    let result = partition
        .offer_to_page_tail(0, 0, &values(3, 4), None, false)
        .unwrap();
    assert_eq!(result.status, OfferStatus::PageSealed);
    assert_eq!(result.accepted, 3);

    assert!(partition.subscription(&group, 0).is_none());
    assert!(partition.subscription(&group, 1).is_none());
    assert!(partition.usage(0).unwrap().anonymous_subscribers().is_empty());
    assert!(partition.page(0, 0).is_none());
    assert_eq!(partition.storage_bytes(), 0);
}

#[test]
fn anonymous_group_of_live_member_is_kept() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let live = local_member();
    let group = SubscriberGroupId::anonymous(&live);
    subscribe(&mut partition, &group);

    partition.cleanup_non_durable_subscribers(&[live]);
    assert!(partition.subscription(&group, 0).is_some());

    partition.cleanup_non_durable_subscribers(&[]);
    assert!(partition.subscription(&group, 0).is_none());
}

// ---------------------------------------------------------------
// Ownership rollback
// ---------------------------------------------------------------

#[test]
fn rollback_onto_drained_page_keeps_it_for_other_groups() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let billing = SubscriberGroupId::durable("billing");
    let audit = SubscriberGroupId::durable("audit");
    subscribe(&mut partition, &billing);
    subscribe(&mut partition, &audit);
    assign(&mut partition, &billing, owner(1));

    partition
        .offer_to_page_tail(0, 0, &values(3, 4), None, true)
        .unwrap();
    let polled = partition.poll_from_page_head(&billing, 0, 0, 10, 1).unwrap();
    assert_eq!(polled.status, PollStatus::Exhausted);
    assert_eq!(polled.elements.len(), 3);
    assert_eq!(partition.page(0, 0).unwrap().reference_count, 1);
    assert_eq!(partition.usage(0).unwrap().waiting_subscriber_count, 1);

    assert_eq!(
        partition.commit(&billing, 0, PagedPosition::new(0, 0), owner(1)),
        CommitResult::Committed
    );

    // the new owner rolls back onto the page billing had already left
    assign(&mut partition, &billing, owner(2));
    let subscription = partition.subscription(&billing, 0).unwrap();
    assert_eq!(subscription.read_position(), PagedPosition::new(0, 1));
    assert_eq!(partition.page(0, 0).unwrap().reference_count, 2);
    assert_eq!(partition.usage(0).unwrap().waiting_subscriber_count, 0);

    let reread = partition.poll_from_page_head(&billing, 0, 0, 10, 1).unwrap();
    assert_eq!(reread.status, PollStatus::Exhausted);
    assert_eq!(reread.elements.len(), 2);
    assert_eq!(reread.elements[0].value_binary().unwrap(), Bytes::from_static(b"0001"));
    assert_eq!(partition.page(0, 0).unwrap().reference_count, 1);

    let audited = partition.poll_from_page_head(&audit, 0, 0, 10, 2).unwrap();
    assert_eq!(audited.elements.len(), 3);
    assert!(partition.page(0, 0).is_none());
    assert_eq!(partition.usage(0).unwrap().waiting_subscriber_count, 2);
}

#[test]
fn rollback_onto_removed_page_resumes_from_head() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let group = SubscriberGroupId::durable("billing");
    subscribe(&mut partition, &group);
    assign(&mut partition, &group, owner(1));

    partition
        .offer_to_page_tail(0, 0, &values(3, 4), None, true)
        .unwrap();
    partition.poll_from_page_head(&group, 0, 0, 10, 1).unwrap();
    assert!(partition.page(0, 0).is_none());
    assert_eq!(
        partition.commit(&group, 0, PagedPosition::new(0, 0), owner(1)),
        CommitResult::Committed
    );

    partition
        .offer_to_page_tail(0, 1, &values(2, 4), None, false)
        .unwrap();
    let polled = partition.poll_from_page_head(&group, 0, 1, 1, 1).unwrap();
    assert_eq!(polled.status, PollStatus::Remaining(1));

    assign(&mut partition, &group, owner(2));
    let subscription = partition.subscription(&group, 0).unwrap();
    assert_eq!(subscription.read_position(), PagedPosition::new(1, 0));
    assert_eq!(partition.page(0, 1).unwrap().reference_count, 1);

    let reread = partition.poll_from_page_head(&group, 0, 1, 10, 1).unwrap();
    assert_eq!(reread.elements.len(), 2);
    assert_eq!(reread.elements[0].value_binary().unwrap(), Bytes::from_static(b"0000"));
}

#[test]
fn same_owner_reallocation_keeps_cursor() {
    let mut partition = partition(TopicConfig {
        channel_count: 1,
        ..TopicConfig::default()
    });
    let group = SubscriberGroupId::durable("billing");
    subscribe(&mut partition, &group);
    assign(&mut partition, &group, owner(1));

    partition
        .offer_to_page_tail(0, 0, &values(3, 4), None, false)
        .unwrap();
    partition.poll_from_page_head(&group, 0, 0, 2, 1).unwrap();
    assert_eq!(
        partition.commit(&group, 0, PagedPosition::new(0, 0), owner(1)),
        CommitResult::Committed
    );

    assign(&mut partition, &group, owner(1));
    let subscription = partition.subscription(&group, 0).unwrap();
    assert_eq!(subscription.read_position(), PagedPosition::new(0, 2));
    assert_eq!(partition.page(0, 0).unwrap().reference_count, 1);
}
