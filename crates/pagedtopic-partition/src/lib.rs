//! Partition life cycle and subscriber group coordination for paged topics
//!
//! [`TopicStore`] owns the partitions of a topic and serializes access to each
//! of them. [`SubscriptionCoordinator`] manages subscriber groups on top of the
//! store: joining, heartbeats, expiry, member departure and channel
//! reallocation.
//!
//! ```ignore
//! use std::sync::Arc;
//! use pagedtopic_core::{Member, SubscriberGroupId, SubscriberId, TopicConfig};
//! use pagedtopic_partition::{SubscriptionCoordinator, TopicStore};
//!
//! let store = Arc::new(TopicStore::new("orders", 31, TopicConfig::default(), local)?);
//! let coordinator = SubscriptionCoordinator::new(Arc::clone(&store));
//!
//! let group = SubscriberGroupId::durable("billing");
//! let channels = coordinator
//!     .ensure_subscription(&group, SubscriberId::for_member(1, &local), None, None)
//!     .await?;
//! ```

pub mod coordinator;
pub mod error;
pub mod partition;
pub mod store;
pub mod telemetry;

pub use coordinator::SubscriptionCoordinator;
pub use error::{PartitionError, PartitionResult};
pub use partition::{
    AcceptAll, CommitResult, ElementConverter, ElementFilter, EnsurePhase, IdentityConverter,
    OfferResult, OfferStatus, PollResult, PollStatus, TopicPartition, Wakeup,
};
pub use store::TopicStore;
