//! Error Types for Paged Topics
//!
//! This module defines all error types that can occur while encoding, decoding or
//! mutating the paged topic data model.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `Malformed`: a packed integer, decorated binary, key or record could not be
//!   decoded (truncated buffer, overlong integer, unknown format byte)
//! - `UnsupportedVersion`: a stored record was written by a newer format version
//!
//! ### Consistency Errors
//! - `InconsistentSubscription`: a subscriber tried to join a group with a filter or
//!   converter different from the one the group was created with
//! - `InvalidChannel`: a channel index outside the topic's channel count
//! - `UnknownSubscriber`: a channel pinned to a subscriber outside the group
//!
//! ### Operation Errors
//! - `Unsupported`: the operation is not supported on this object (for example
//!   committing a read-only page element)
//!
//! ### Configuration Errors
//! - `Config`, `Io`, `Toml`: loading or validating a `TopicConfig`
//!
//! ## Usage
//! All functions in this crate return `Result<T>` which is aliased to `Result<T, Error>`.
//!
//! ```ignore
//! use pagedtopic_core::{varint, Result};
//!
//! fn read_channel(mut buf: &[u8]) -> Result<u32> {
//!     // truncated input surfaces as Error::Malformed
//!     varint::read_packed_u32(&mut buf)
//! }
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Malformed binary: {0}")]
    Malformed(String),

    #[error("Unsupported {record} format version: {version}")]
    UnsupportedVersion { record: &'static str, version: u8 },

    #[error(
        "Inconsistent subscription for group {group}: existing {existing}, requested {requested}"
    )]
    InconsistentSubscription {
        group: String,
        existing: String,
        requested: String,
    },

    #[error("Invalid channel {channel}, topic has {channel_count} channels")]
    InvalidChannel { channel: u32, channel_count: u32 },

    #[error("Subscriber {subscriber_id} is not part of group {group}")]
    UnknownSubscriber { group: String, subscriber_id: i64 },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::Malformed(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
