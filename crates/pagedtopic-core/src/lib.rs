pub mod allocation;
pub mod config;
pub mod decoration;
pub mod element;
pub mod error;
pub mod identity;
pub mod page;
pub mod partitioning;
pub mod position;
pub mod record;
pub mod subscriber_info;
pub mod subscription;
pub mod topic_subscription;
pub mod usage;
pub mod varint;

pub use allocation::{ChannelAllocationStrategy, Departed, SimpleChannelAllocationStrategy};
pub use config::TopicConfig;
pub use element::{ContentKey, PageElement};
pub use error::{Error, Result};
pub use identity::{
    Member, NotificationKey, SubscriberGroupId, SubscriberId, SubscriberInfoKey, NULL_SUBSCRIBER,
};
pub use page::{NotifierSet, Page, PageKey, EMPTY};
pub use position::{PagedPosition, NULL_PAGE, NULL_POSITION};
pub use record::VersionedRecord;
pub use subscriber_info::SubscriberInfo;
pub use subscription::{
    ChannelOwnership, Converter, Filter, Guarded, Subscription, SubscriptionKey,
};
pub use topic_subscription::{OwnedChannels, PagedTopicSubscription};
pub use usage::{AnonymousSubscribers, Usage, UsageKey};

/// Current time in milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
