//! Topic Store
//!
//! Holds every partition of one topic, each behind its own async mutex so that
//! all operations on a partition run one at a time while different partitions
//! proceed in parallel.
//!
//! Once [`TopicStore::destroy`] has run, every invocation fails with
//! [`PartitionError::StoreInactive`]. Callers on best-effort paths (closing a
//! subscriber, expiring heartbeats) treat that error as "nothing left to do".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::info;

use pagedtopic_core::{partitioning, Member, SubscriberGroupId, TopicConfig};

use crate::error::{PartitionError, PartitionResult};
use crate::partition::{
    AcceptAll, ElementConverter, ElementFilter, IdentityConverter, OfferResult, PollResult,
    TopicPartition, Wakeup,
};

pub struct TopicStore {
    topic: String,
    config: TopicConfig,
    partitions: Vec<Mutex<TopicPartition>>,
    members: Arc<RwLock<Vec<Member>>>,
    active: AtomicBool,
}

impl TopicStore {
    /// Create a store whose only live member is `local`
    pub fn new(
        topic: impl Into<String>,
        partition_count: u32,
        config: TopicConfig,
        local: Member,
    ) -> PartitionResult<Self> {
        Self::with_evaluators(
            topic,
            partition_count,
            config,
            local,
            Arc::new(AcceptAll),
            Arc::new(IdentityConverter),
        )
    }

    pub fn with_evaluators(
        topic: impl Into<String>,
        partition_count: u32,
        config: TopicConfig,
        local: Member,
        filter: Arc<dyn ElementFilter>,
        converter: Arc<dyn ElementConverter>,
    ) -> PartitionResult<Self> {
        config.validate()?;
        if partition_count == 0 {
            return Err(pagedtopic_core::Error::Config(
                "partition_count must be positive".to_string(),
            )
            .into());
        }

        let topic = topic.into();
        let members = Arc::new(RwLock::new(vec![local]));
        let partitions = (0..partition_count)
            .map(|partition| {
                Mutex::new(
                    TopicPartition::new(
                        topic.clone(),
                        partition,
                        partition_count,
                        config.clone(),
                        Arc::clone(&members),
                    )
                    .with_evaluators(Arc::clone(&filter), Arc::clone(&converter)),
                )
            })
            .collect();

        info!(
            topic = %topic,
            partition_count,
            channel_count = config.channel_count,
            "Topic store created"
        );

        Ok(Self {
            topic,
            config,
            partitions,
            members,
            active: AtomicBool::new(true),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn channel_count(&self) -> u32 {
        self.config.channel_count
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Replace the set of live members
    pub fn set_members(&self, members: Vec<Member>) {
        *self.members.write() = members;
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    /// Partition holding `page` of `channel`
    pub fn partition_for(&self, channel: u32, page: i64) -> u32 {
        partitioning::partition_for_page(channel, page, self.partition_count())
    }

    /// Mark the store inactive and drop every partition's state
    pub async fn destroy(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        for partition in &self.partitions {
            partition.lock().await.clear();
        }
        info!(topic = %self.topic, "Topic store destroyed");
    }

    fn ensure_active(&self) -> PartitionResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(PartitionError::StoreInactive(self.topic.clone()))
        }
    }

    /// Run `f` with exclusive access to one partition
    pub async fn invoke<R>(
        &self,
        partition: u32,
        f: impl FnOnce(&mut TopicPartition) -> R,
    ) -> PartitionResult<R> {
        self.ensure_active()?;
        let slot = self
            .partitions
            .get(partition as usize)
            .ok_or(PartitionError::PartitionOutOfRange {
                partition,
                partition_count: self.partition_count(),
            })?;

        let mut guard = slot.lock().await;
        // destroyed while we waited for the lock
        self.ensure_active()?;
        Ok(f(&mut guard))
    }

    /// Run `f` on every partition in turn, collecting the results in
    /// partition order
    pub async fn invoke_all<R>(
        &self,
        mut f: impl FnMut(&mut TopicPartition) -> R,
    ) -> PartitionResult<Vec<R>> {
        let mut results = Vec::with_capacity(self.partitions.len());
        for partition in 0..self.partition_count() {
            results.push(self.invoke(partition, &mut f).await?);
        }
        Ok(results)
    }

    /// Offer elements to the partition owning `page` of `channel`
    pub async fn offer(
        &self,
        channel: u32,
        page: i64,
        elements: &[Bytes],
        notify_post_full: Option<i32>,
        seal: bool,
    ) -> PartitionResult<OfferResult> {
        let partition = self.partition_for(channel, page);
        self.invoke(partition, |p| {
            p.offer_to_page_tail(channel, page, elements, notify_post_full, seal)
        })
        .await?
    }

    /// Poll a group's elements from the partition owning `page` of `channel`
    pub async fn poll(
        &self,
        group: &SubscriberGroupId,
        channel: u32,
        page: i64,
        max_elements: usize,
        notifier_id: i32,
    ) -> PartitionResult<PollResult> {
        let partition = self.partition_for(channel, page);
        self.invoke(partition, |p| {
            p.poll_from_page_head(group, channel, page, max_elements, notifier_id)
        })
        .await?
    }

    /// Drain the wake-ups of every partition
    pub async fn take_wakeups(&self) -> PartitionResult<Vec<(u32, Wakeup)>> {
        let per_partition = self
            .invoke_all(|p| {
                let partition = p.partition();
                p.take_wakeups()
                    .into_iter()
                    .map(move |wakeup| (partition, wakeup))
                    .collect::<Vec<_>>()
            })
            .await?;
        Ok(per_partition.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn store(partition_count: u32) -> TopicStore {
        TopicStore::new(
            "prices",
            partition_count,
            TopicConfig::default(),
            Member::new(1, Uuid::new_v4(), 100),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_routes_to_partition() {
        let store = store(3);
        let ids = store.invoke_all(|p| p.partition()).await.unwrap();
        assert_eq!(ids, vec![0, 1, 2]);

        let err = store.invoke(3, |p| p.partition()).await.unwrap_err();
        assert!(matches!(
            err,
            PartitionError::PartitionOutOfRange {
                partition: 3,
                partition_count: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_destroyed_store_is_inactive() {
        let store = store(2);
        store.destroy().await;
        assert!(!store.is_active());

        let err = store.invoke(0, |p| p.partition()).await.unwrap_err();
        assert!(err.is_inactive());
        // destroying twice is harmless
        store.destroy().await;
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let result = TopicStore::new(
            "prices",
            0,
            TopicConfig::default(),
            Member::new(1, Uuid::new_v4(), 100),
        );
        assert!(matches!(
            result,
            Err(PartitionError::Core(pagedtopic_core::Error::Config(_)))
        ));
    }

    #[tokio::test]
    async fn test_members_are_shared_with_partitions() {
        let store = store(1);
        let member = Member::new(2, Uuid::new_v4(), 200);
        store.set_members(vec![member]);
        assert_eq!(store.members(), vec![member]);
    }
}
