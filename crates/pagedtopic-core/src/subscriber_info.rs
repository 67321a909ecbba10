//! Subscriber Liveness
//!
//! Every subscriber of a group keeps a `SubscriberInfo` record alive by
//! heartbeating. A record whose heartbeat is older than its timeout is expired,
//! and an expired subscriber is treated exactly like one that closed: its
//! channels are released and reallocated.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::record::{read_uuid, write_uuid, VersionedRecord};
use crate::varint::{read_packed_i64, write_packed_i64};

/// Default subscriber timeout: 5 minutes
pub const DEFAULT_SUBSCRIBER_TIMEOUT_MS: i64 = 300_000;

/// Liveness record of one subscriber in one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    /// Last heartbeat (ms since epoch)
    pub last_heartbeat: i64,

    /// Time without a heartbeat after which the subscriber is dead
    pub timeout_ms: i64,

    /// Group incarnation the subscriber joined
    pub subscription_id: i64,

    /// Member instance hosting the subscriber
    pub owner_uid: Option<Uuid>,

    /// Time the subscriber connected (ms since epoch)
    pub connect_timestamp: i64,
}

impl Default for SubscriberInfo {
    fn default() -> Self {
        Self {
            last_heartbeat: 0,
            timeout_ms: DEFAULT_SUBSCRIBER_TIMEOUT_MS,
            subscription_id: 0,
            owner_uid: None,
            connect_timestamp: 0,
        }
    }
}

impl SubscriberInfo {
    pub fn new(subscription_id: i64, owner_uid: Option<Uuid>, timeout_ms: i64, now: i64) -> Self {
        Self {
            last_heartbeat: now,
            timeout_ms,
            subscription_id,
            owner_uid,
            connect_timestamp: now,
        }
    }

    pub fn heartbeat(&mut self, now: i64) {
        self.last_heartbeat = self.last_heartbeat.max(now);
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.last_heartbeat) > self.timeout_ms
    }

    /// Time at which the record expires without another heartbeat
    pub fn expiry(&self) -> i64 {
        self.last_heartbeat.saturating_add(self.timeout_ms)
    }
}

impl VersionedRecord for SubscriberInfo {
    const RECORD: &'static str = "SubscriberInfo";
    const CURRENT_VERSION: u8 = 2;

    fn write_body(&self, buf: &mut BytesMut) {
        write_packed_i64(buf, self.last_heartbeat);
        write_packed_i64(buf, self.timeout_ms);
        // v1
        write_packed_i64(buf, self.subscription_id);
        // v2
        write_uuid(buf, self.owner_uid);
        write_packed_i64(buf, self.connect_timestamp);
    }

    fn read_body(version: u8, buf: &mut Bytes) -> Result<Self> {
        let mut info = SubscriberInfo {
            last_heartbeat: read_packed_i64(buf)?,
            timeout_ms: read_packed_i64(buf)?,
            ..SubscriberInfo::default()
        };
        if version >= 1 {
            info.subscription_id = read_packed_i64(buf)?;
        }
        if version >= 2 {
            info.owner_uid = read_uuid(buf)?;
            info.connect_timestamp = read_packed_i64(buf)?;
        }
        Ok(info)
    }
}
