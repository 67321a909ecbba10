//! Partition and coordination errors

use thiserror::Error;

/// Result type for partition operations
pub type PartitionResult<T> = Result<T, PartitionError>;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(transparent)]
    Core(#[from] pagedtopic_core::Error),

    /// The topic's store was destroyed while the operation was in flight
    #[error("Store inactive for topic: {0}")]
    StoreInactive(String),

    #[error("Partition out of range: partition={partition}, count={partition_count}")]
    PartitionOutOfRange { partition: u32, partition_count: u32 },

    #[error("Unknown subscriber group: {0}")]
    UnknownGroup(String),

    #[error("Unknown subscriber: group={group}, subscriber={subscriber}")]
    UnknownSubscriber { group: String, subscriber: String },
}

impl PartitionError {
    /// Whether the error only reports that the topic no longer exists
    pub fn is_inactive(&self) -> bool {
        matches!(self, PartitionError::StoreInactive(_))
    }
}
