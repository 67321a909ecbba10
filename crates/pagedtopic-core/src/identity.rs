//! Subscriber and Group Identity
//!
//! ## SubscriberId
//! One 64-bit value combining the cluster member id (high 32 bits) with a
//! per-member notification id (low 32 bits), plus the member's unique instance
//! id. The instance id tells apart two subscribers whose member id was reused
//! after a restart. `NULL_SUBSCRIBER` (id 0) means "no one".
//!
//! ## SubscriberGroupId
//! - **Durable** groups are identified by name alone (member timestamp 0)
//! - **Anonymous** groups get a generated name and carry the join timestamp of
//!   the member that created them, so two members never collide on the same
//!   generated name, and the group dies with its member
//!
//! ## NotificationKey
//! `(partition, notifier id)`: a wake-up slot a publisher or subscriber blocks on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use twox_hash::XxHash32;
use uuid::Uuid;

use crate::error::Result;
use crate::record::{read_string, read_uuid, write_string, write_uuid};
use crate::varint::{
    read_packed_i32, read_packed_i64, read_packed_u32, write_packed_i32, write_packed_i64,
    write_packed_u32,
};

/// Identity of a cluster member, as reported by the membership service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Member {
    /// Member id, reusable after the member leaves
    pub id: u32,

    /// Unique id of this member instance
    pub uid: Uuid,

    /// Time the member joined the cluster (ms since epoch)
    pub timestamp: i64,
}

impl Member {
    pub fn new(id: u32, uid: Uuid, timestamp: i64) -> Self {
        Self { id, uid, timestamp }
    }
}

/// Identity of a single subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId {
    pub id: i64,
    pub uid: Option<Uuid>,
}

/// The "no subscriber" identity
pub const NULL_SUBSCRIBER: SubscriberId = SubscriberId { id: 0, uid: None };

impl SubscriberId {
    pub fn new(id: i64, uid: Option<Uuid>) -> Self {
        Self { id, uid }
    }

    /// A subscriber of `member` using notifier `notification_id`
    pub fn for_member(notification_id: i32, member: &Member) -> Self {
        Self {
            id: create_id(notification_id, member.id),
            uid: Some(member.uid),
        }
    }

    pub fn member_id(&self) -> u32 {
        member_id_of(self.id)
    }

    pub fn notification_id(&self) -> i32 {
        notification_id_of(self.id)
    }

    pub fn is_null(&self) -> bool {
        self.id == 0
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_packed_i64(buf, self.id);
        write_uuid(buf, self.uid);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            id: read_packed_i64(buf)?,
            uid: read_uuid(buf)?,
        })
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        NULL_SUBSCRIBER
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubscriberId(id={}, member={}, notification={})",
            self.id,
            self.member_id(),
            self.notification_id()
        )
    }
}

/// Combine a notification id and a member id into a subscriber id
pub fn create_id(notification_id: i32, member_id: u32) -> i64 {
    ((member_id as i64) << 32) | (notification_id as i64 & 0xFFFF_FFFF)
}

pub fn member_id_of(id: i64) -> u32 {
    (id >> 32) as u32
}

pub fn notification_id_of(id: i64) -> i32 {
    id as i32
}

static ANONYMOUS_GROUPS: AtomicU64 = AtomicU64::new(0);

/// Identity of a subscriber group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberGroupId {
    pub name: String,

    /// Join timestamp of the creating member, 0 for durable groups
    pub member_timestamp: i64,
}

impl SubscriberGroupId {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            member_timestamp: 0,
        }
    }

    /// A new anonymous group bound to `member`
    pub fn anonymous(member: &Member) -> Self {
        let n = ANONYMOUS_GROUPS.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("$anon{n}"),
            member_timestamp: member.timestamp,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.member_timestamp != 0
    }

    pub fn is_durable(&self) -> bool {
        !self.is_anonymous()
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_string(buf, &self.name);
        write_packed_i64(buf, self.member_timestamp);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            name: read_string(buf)?,
            member_timestamp: read_packed_i64(buf)?,
        })
    }
}

impl fmt::Display for SubscriberGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            write!(f, "{}@{}", self.name, self.member_timestamp)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Wake-up slot for a blocked publisher or subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationKey {
    pub partition: u32,
    pub notifier_id: i32,
}

impl NotificationKey {
    pub const fn new(partition: u32, notifier_id: i32) -> Self {
        Self {
            partition,
            notifier_id,
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        write_packed_u32(buf, self.partition);
        write_packed_i32(buf, self.notifier_id);
    }

    pub fn read_from(buf: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            partition: read_packed_u32(buf)?,
            notifier_id: read_packed_i32(buf)?,
        })
    }
}

/// Key of a subscriber's liveness record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberInfoKey {
    pub group: SubscriberGroupId,
    pub subscriber: SubscriberId,
}

impl SubscriberInfoKey {
    pub fn new(group: SubscriberGroupId, subscriber: SubscriberId) -> Self {
        Self { group, subscriber }
    }

    /// Records of one group share a partition, chosen by group name
    pub fn partition(&self, partition_count: u32) -> u32 {
        XxHash32::oneshot(0, self.group.name.as_bytes()) % partition_count.max(1)
    }
}
