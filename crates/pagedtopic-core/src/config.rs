//! Topic Configuration
//!
//! ## TopicConfig
//!
//! Controls how a topic pages, retains and expires its elements:
//!
//! - **channel_count**: Number of channels (default: 17)
//! - **page_capacity_bytes**: Seal a page once it holds this many bytes (default: 1MB)
//! - **server_capacity_bytes**: Refuse offers once local storage exceeds this (default: 0, unlimited)
//! - **retain_consumed**: Keep pages after every group has read them (default: false)
//! - **element_expiry_ms**: Expire stored elements after this long (default: 0, never)
//! - **max_batch_size_bytes**: Upper bound on one poll result (default: 8MB)
//! - **subscriber_timeout_ms**: Subscriber heartbeat timeout (default: 5 minutes)
//! - **allow_unowned_commits**: Accept commits from subscribers not owning the channel (default: false)
//! - **publisher_notification_expiry_ms**: Lifetime of a publisher's "space freed" registration (default: 10s)
//!
//! ## Usage
//!
//! ```ignore
//! use pagedtopic_core::TopicConfig;
//!
//! let config = TopicConfig::from_toml_str(r#"
//!     channel_count = 5
//!     page_capacity_bytes = 65536
//! "#)?;
//!
//! // or from a file
//! let config = TopicConfig::load("topic.toml")?;
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::subscriber_info::DEFAULT_SUBSCRIBER_TIMEOUT_MS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Number of channels (default: 17)
    #[serde(default = "default_channel_count")]
    pub channel_count: u32,

    /// Page capacity in bytes (default: 1MB)
    #[serde(default = "default_page_capacity")]
    pub page_capacity_bytes: i64,

    /// Local storage limit in bytes, 0 for unlimited
    #[serde(default)]
    pub server_capacity_bytes: i64,

    /// Keep consumed pages (default: false)
    #[serde(default)]
    pub retain_consumed: bool,

    /// Element expiry in milliseconds, 0 for never
    #[serde(default)]
    pub element_expiry_ms: i64,

    /// Maximum bytes returned by a single poll (default: 8MB)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size_bytes: i64,

    /// Subscriber heartbeat timeout in milliseconds (default: 5 minutes)
    #[serde(default = "default_subscriber_timeout")]
    pub subscriber_timeout_ms: i64,

    /// Accept commits from subscribers that do not own the channel
    #[serde(default)]
    pub allow_unowned_commits: bool,

    /// Lifetime of publisher removal registrations (default: 10 seconds)
    #[serde(default = "default_publisher_notification_expiry")]
    pub publisher_notification_expiry_ms: i64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            channel_count: default_channel_count(),
            page_capacity_bytes: default_page_capacity(),
            server_capacity_bytes: 0,
            retain_consumed: false,
            element_expiry_ms: 0,
            max_batch_size_bytes: default_max_batch_size(),
            subscriber_timeout_ms: default_subscriber_timeout(),
            allow_unowned_commits: false,
            publisher_notification_expiry_ms: default_publisher_notification_expiry(),
        }
    }
}

impl TopicConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TopicConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_count == 0 {
            return Err(Error::Config("channel_count must be positive".to_string()));
        }
        if self.page_capacity_bytes <= 0 {
            return Err(Error::Config(
                "page_capacity_bytes must be positive".to_string(),
            ));
        }
        if self.server_capacity_bytes < 0 || self.element_expiry_ms < 0 {
            return Err(Error::Config(
                "capacities and expiry must not be negative".to_string(),
            ));
        }
        if self.max_batch_size_bytes <= 0 {
            return Err(Error::Config(
                "max_batch_size_bytes must be positive".to_string(),
            ));
        }
        if self.subscriber_timeout_ms <= 0 {
            return Err(Error::Config(
                "subscriber_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_channel_count() -> u32 {
    17
}

fn default_page_capacity() -> i64 {
    1024 * 1024 // 1MB
}

fn default_max_batch_size() -> i64 {
    8 * 1024 * 1024 // 8MB
}

fn default_subscriber_timeout() -> i64 {
    DEFAULT_SUBSCRIBER_TIMEOUT_MS
}

fn default_publisher_notification_expiry() -> i64 {
    10_000 // 10 seconds
}
