//! Subscription Coordinator Integration Tests
//!
//! Tests that verify subscriber groups stay consistent across partitions:
//! - Joining subscribers share the channels of their group
//! - A group's filter and converter are fixed by its first subscriber
//! - Closing, expiring and departing subscribers release their channels
//! - A new channel owner resumes from the last committed position
//! - Concurrent joins and leaves leave every partition with the latest allocation

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use pagedtopic_core::{
    Filter, Member, PagedPosition, SubscriberGroupId, SubscriberId, TopicConfig,
};
use pagedtopic_partition::{
    CommitResult, PartitionError, PollStatus, SubscriptionCoordinator, TopicStore,
};

/// Helper to build a coordinator over a fresh store
fn coordinator(partition_count: u32, config: TopicConfig, local: Member) -> SubscriptionCoordinator {
    let store = TopicStore::new("orders", partition_count, config, local).unwrap();
    SubscriptionCoordinator::new(Arc::new(store))
}

fn config(channel_count: u32) -> TopicConfig {
    TopicConfig {
        channel_count,
        ..TopicConfig::default()
    }
}

fn members() -> (Member, Member) {
    (
        Member::new(1, Uuid::new_v4(), 100),
        Member::new(2, Uuid::new_v4(), 200),
    )
}

#[tokio::test]
async fn test_subscribers_share_group_channels() {
    let (m1, m2) = members();
    let coordinator = coordinator(3, config(4), m1);
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);

    let owned = coordinator
        .ensure_subscription(&group, s1, None, None)
        .await
        .unwrap();
    assert_eq!(owned, vec![0, 1, 2, 3]);

    let owned = coordinator
        .ensure_subscription(&group, s2, None, None)
        .await
        .unwrap();
    assert_eq!(owned, vec![1, 3]);
    assert_eq!(coordinator.owned_channels(&group, s1).unwrap(), vec![0, 2]);
    assert_eq!(coordinator.channel_owner(&group, 3).unwrap(), s2.id);

    // every partition sees the same allocation
    let owners = coordinator
        .store()
        .invoke_all(|p| {
            (0..p.channel_count())
                .map(|channel| p.subscription(&group, channel).map(|s| s.owning_subscriber))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
    for partition in owners {
        assert_eq!(partition, vec![Some(s1), Some(s2), Some(s1), Some(s2)]);
    }

    // joining again changes nothing
    let owned = coordinator
        .ensure_subscription(&group, s1, None, None)
        .await
        .unwrap();
    assert_eq!(owned, vec![0, 2]);
    assert_eq!(coordinator.subscription(&group).unwrap().subscriber_count(), 2);
}

#[tokio::test]
async fn test_inconsistent_filter_rejected() {
    let (m1, m2) = members();
    let coordinator = coordinator(1, config(2), m1);
    let group = SubscriberGroupId::durable("filtered");
    let filter = Filter(Bytes::from_static(b"price > 10"));

    coordinator
        .ensure_subscription(&group, SubscriberId::for_member(1, &m1), Some(filter), None)
        .await
        .unwrap();

    let err = coordinator
        .ensure_subscription(&group, SubscriberId::for_member(1, &m2), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PartitionError::Core(pagedtopic_core::Error::InconsistentSubscription { .. })
    ));
    assert_eq!(coordinator.subscription(&group).unwrap().subscriber_count(), 1);
}

#[tokio::test]
async fn test_closed_subscriber_releases_channels() {
    let (m1, m2) = members();
    let coordinator = coordinator(2, config(4), m1);
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    coordinator.ensure_subscription(&group, s2, None, None).await.unwrap();

    coordinator.notify_closed(&group, s2).await.unwrap();
    assert_eq!(coordinator.owned_channels(&group, s1).unwrap(), vec![0, 1, 2, 3]);
    assert!(coordinator.subscriber_info(&group, s2).is_none());

    // closing twice is harmless
    coordinator.notify_closed(&group, s2).await.unwrap();
    assert_eq!(coordinator.subscription(&group).unwrap().subscriber_count(), 1);
}

#[tokio::test]
async fn test_close_after_destroy_succeeds() {
    let (m1, _) = members();
    let coordinator = coordinator(2, config(2), m1);
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    coordinator.store().destroy().await;

    assert!(coordinator.notify_closed(&group, s1).await.is_ok());

    let err = coordinator
        .ensure_subscription(&group, s1, None, None)
        .await
        .unwrap_err();
    assert!(err.is_inactive());
}

#[tokio::test]
async fn test_expired_subscriber_is_removed() {
    let (m1, m2) = members();
    let coordinator = coordinator(
        2,
        TopicConfig {
            subscriber_timeout_ms: 1_000,
            ..config(4)
        },
        m1,
    );
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.ensure_subscription(&group, s2, None, None).await.unwrap();
    coordinator.heartbeat(&group, s2).unwrap();

    let first = coordinator.subscriber_info(&group, s1).unwrap();
    let expired = coordinator.expire_subscribers(first.expiry() + 1).await.unwrap();

    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].subscriber, s1);
    assert_eq!(coordinator.owned_channels(&group, s2).unwrap(), vec![0, 1, 2, 3]);
    assert!(coordinator.subscriber_info(&group, s2).is_some());
}

#[tokio::test]
async fn test_heartbeat_unknown_subscriber() {
    let (m1, _) = members();
    let coordinator = coordinator(1, config(1), m1);
    let group = SubscriberGroupId::durable("nobody");

    let err = coordinator
        .heartbeat(&group, SubscriberId::for_member(1, &m1))
        .unwrap_err();
    assert!(matches!(err, PartitionError::UnknownSubscriber { .. }));
}

#[tokio::test]
async fn test_departed_member_subscribers_removed() {
    let (m1, m2) = members();
    let coordinator = coordinator(2, config(4), m1);
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    coordinator.ensure_subscription(&group, s2, None, None).await.unwrap();

    let departed = coordinator.member_departed(&[m1]).await.unwrap();
    assert_eq!(departed.len(), 1);
    assert!(departed[&2].contains(&s2));
    assert_eq!(coordinator.owned_channels(&group, s1).unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(coordinator.store().members(), vec![m1]);
}

#[tokio::test]
async fn test_anonymous_group_destroyed_with_last_subscriber() {
    let (m1, _) = members();
    let coordinator = coordinator(2, config(2), m1);
    let group = SubscriberGroupId::anonymous(&m1);
    let s1 = SubscriberId::for_member(1, &m1);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    assert!(coordinator.groups().contains_key(&group.name));

    coordinator.notify_closed(&group, s1).await.unwrap();
    assert!(coordinator.subscription(&group).is_none());

    let remaining = coordinator
        .store()
        .invoke_all(|p| p.subscription(&group, 0).is_some())
        .await
        .unwrap();
    assert_eq!(remaining, vec![false, false]);
}

#[tokio::test]
async fn test_destroy_group() {
    let (m1, _) = members();
    let coordinator = coordinator(1, config(2), m1);
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    assert!(coordinator.destroy_group(&group).await.unwrap());
    assert!(!coordinator.destroy_group(&group).await.unwrap());

    assert!(coordinator.subscriber_info(&group, s1).is_none());
    assert!(matches!(
        coordinator.channel_owner(&group, 0),
        Err(PartitionError::UnknownGroup(_))
    ));
}

#[tokio::test]
async fn test_new_owner_resumes_from_commit() {
    let (m1, m2) = members();
    let coordinator = coordinator(1, config(2), m1);
    let store = Arc::clone(coordinator.store());
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();

    let page = store.invoke(0, |p| p.initialise_topic(1)).await.unwrap();
    let values: Vec<Bytes> = (0..3).map(|i| Bytes::from(format!("order-{i}"))).collect();
    store.offer(1, page, &values, None, false).await.unwrap();

    let polled = store.poll(&group, 1, page, 10, 1).await.unwrap();
    assert_eq!(polled.status, PollStatus::Remaining(0));
    assert_eq!(polled.elements.len(), 3);

    let committed = store
        .invoke(0, |p| p.commit(&group, 1, PagedPosition::new(page, 0), s1))
        .await
        .unwrap();
    assert_eq!(committed, CommitResult::Committed);

    // channel 1 moves to the second subscriber, which rereads from the commit
    coordinator.ensure_subscription(&group, s2, None, None).await.unwrap();
    assert_eq!(coordinator.channel_owner(&group, 1).unwrap(), s2.id);

    let (owner, position) = store
        .invoke(0, |p| {
            let subscription = p.subscription(&group, 1).unwrap();
            (subscription.owning_subscriber, subscription.read_position())
        })
        .await
        .unwrap();
    assert_eq!(owner, s2);
    assert_eq!(position, PagedPosition::new(page, 1));

    let polled = store.poll(&group, 1, page, 10, 2).await.unwrap();
    assert_eq!(polled.elements.len(), 2);
    assert_eq!(
        polled.elements[0].value_binary().unwrap(),
        Bytes::from_static(b"order-1")
    );
}

#[tokio::test]
async fn test_pin_channel_to_subscriber() {
    let (m1, m2) = members();
    let coordinator = coordinator(1, config(2), m1);
    let group = SubscriberGroupId::durable("billing");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);

    coordinator.ensure_subscription(&group, s1, None, None).await.unwrap();
    coordinator.ensure_subscription(&group, s2, None, None).await.unwrap();
    coordinator.pin_channel(&group, 1, s1).await.unwrap();

    assert_eq!(coordinator.channel_owner(&group, 1).unwrap(), s1.id);

    let stranger = SubscriberId::for_member(9, &m2);
    assert!(matches!(
        coordinator.pin_channel(&group, 0, stranger).await,
        Err(PartitionError::UnknownSubscriber { .. })
    ));
}

#[tokio::test]
async fn test_rollback_keeps_page_for_other_groups() {
    let (m1, m2) = members();
    let coordinator = coordinator(1, config(1), m1);
    let store = Arc::clone(coordinator.store());
    let billing = SubscriberGroupId::durable("billing");
    let audit = SubscriberGroupId::durable("audit");
    let s1 = SubscriberId::for_member(1, &m1);
    let s2 = SubscriberId::for_member(1, &m2);
    let auditor = SubscriberId::for_member(2, &m1);

    coordinator.ensure_subscription(&billing, s1, None, None).await.unwrap();
    coordinator.ensure_subscription(&audit, auditor, None, None).await.unwrap();

    let page = store.invoke(0, |p| p.initialise_topic(0)).await.unwrap();
    let values: Vec<Bytes> = (0..3).map(|i| Bytes::from(format!("order-{i}"))).collect();
    store.offer(0, page, &values, None, true).await.unwrap();

    let polled = store.poll(&billing, 0, page, 10, 1).await.unwrap();
    assert_eq!(polled.status, PollStatus::Exhausted);
    assert_eq!(polled.elements.len(), 3);

    let committed = store
        .invoke(0, |p| p.commit(&billing, 0, PagedPosition::new(page, 0), s1))
        .await
        .unwrap();
    assert_eq!(committed, CommitResult::Committed);

    // the channel moves to s2 once s1 leaves
    coordinator.ensure_subscription(&billing, s2, None, None).await.unwrap();
    coordinator.notify_closed(&billing, s1).await.unwrap();
    assert_eq!(coordinator.channel_owner(&billing, 0).unwrap(), s2.id);

    let reread = store.poll(&billing, 0, page, 10, 2).await.unwrap();
    assert_eq!(reread.elements.len(), 2);
    assert_eq!(
        reread.elements[0].value_binary().unwrap(),
        Bytes::from_static(b"order-1")
    );

    let references = store
        .invoke(0, |p| p.page(0, page).map(|pg| pg.reference_count))
        .await
        .unwrap();
    assert_eq!(references, Some(1));

    let audited = store.poll(&audit, 0, page, 10, 3).await.unwrap();
    assert_eq!(audited.elements.len(), 3);

    let (removed, waiting) = store
        .invoke(0, |p| {
            (
                p.page(0, page).is_none(),
                p.usage(0).map(|u| u.waiting_subscriber_count),
            )
        })
        .await
        .unwrap();
    assert!(removed);
    assert_eq!(waiting, Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_and_leaves_push_latest_allocation() {
    let (m1, _) = members();
    let coordinator = Arc::new(coordinator(3, config(8), m1));
    let group = SubscriberGroupId::durable("billing");

    let mut tasks = Vec::new();
    for notification in 1..=16 {
        let coordinator = Arc::clone(&coordinator);
        let group = group.clone();
        tasks.push(tokio::spawn(async move {
            let subscriber = SubscriberId::for_member(notification, &m1);
            coordinator
                .ensure_subscription(&group, subscriber, None, None)
                .await?;
            if notification % 3 == 0 {
                coordinator.notify_closed(&group, subscriber).await?;
            }
            Ok::<_, PartitionError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let expected = coordinator.subscription(&group).unwrap();
    assert_eq!(expected.subscriber_count(), 11);

    let pushed = coordinator
        .store()
        .invoke_all(|p| {
            let channels = p.subscription(&group, 0).map(|s| s.channels());
            let owners: Vec<i64> = (0..p.channel_count())
                .filter_map(|channel| p.subscription(&group, channel))
                .map(|s| s.owning_subscriber.id)
                .collect();
            (channels, owners)
        })
        .await
        .unwrap();
    for (channels, owners) in pushed {
        assert_eq!(channels, Some(expected.channels()));
        assert_eq!(owners, expected.channels());
    }
}
