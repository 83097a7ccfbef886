//! Fanout message wire schema.
//!
//! A single versioned shape travels over the broker. Workers that see a
//! `schema_version` they don't recognize treat the message as poison rather
//! than guessing at a migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CURRENT_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanoutMessage {
    pub schema_version: u8,
    pub message_id: String,
    pub post_id: i64,
    pub author_id: i64,
    pub body: String,
    pub author_username: String,
    pub ts: DateTime<Utc>,
    pub user_id: i64,
}

impl FanoutMessage {
    /// `message_id` is `<batch_uuid>-<index>`: stable and globally unique
    /// across a fanout batch, used as the dedup key on the consumer side.
    pub fn message_id(batch_id: &uuid::Uuid, index: usize) -> String {
        format!("{batch_id}-{index}")
    }

    pub fn is_supported_version(&self) -> bool {
        self.schema_version == CURRENT_SCHEMA_VERSION
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Priority assigned to a fanout message before publish.
///
/// `low_id_is_active` is the placeholder the wider spec calls out
/// explicitly: a real system derives this from recent activity, not from
/// the numeric id. Kept as-specified rather than replaced with an invented
/// heuristic.
pub fn priority_for_follower(follower_id: i64) -> u8 {
    const ACTIVE_ID_THRESHOLD: i64 = 100;
    if follower_id < ACTIVE_ID_THRESHOLD {
        5
    } else {
        1
    }
}

/// `routing_hash` bucket a given user's messages must land in. Must stay
/// stable for a fixed worker count so every message for one user routes to
/// the same queue.
pub fn routing_hash(user_id: i64, bucket_count: u32) -> String {
    let bucket_count = bucket_count.max(1) as i64;
    (user_id.rem_euclid(bucket_count)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user_id: i64) -> FanoutMessage {
        FanoutMessage {
            schema_version: CURRENT_SCHEMA_VERSION,
            message_id: "batch-0".to_string(),
            post_id: 1,
            author_id: 7,
            body: "hello".to_string(),
            author_username: "alice".to_string(),
            ts: Utc::now(),
            user_id,
        }
    }

    #[test]
    fn round_trips_through_json() {
        let msg = sample(42);
        let bytes = msg.to_json().unwrap();
        let decoded = FanoutMessage::from_json(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn rejects_future_schema_versions() {
        let mut msg = sample(1);
        msg.schema_version = CURRENT_SCHEMA_VERSION + 1;
        assert!(!msg.is_supported_version());
    }

    #[test]
    fn message_id_is_stable_and_indexed() {
        let batch = uuid::Uuid::new_v4();
        let a = FanoutMessage::message_id(&batch, 0);
        let b = FanoutMessage::message_id(&batch, 1);
        assert_ne!(a, b);
        assert_eq!(a, format!("{batch}-0"));
    }

    #[test]
    fn low_id_followers_get_higher_priority() {
        assert!(priority_for_follower(5) > priority_for_follower(500));
    }

    #[test]
    fn routing_hash_is_stable_for_fixed_bucket_count() {
        for user_id in [1_i64, 26, 51, -3] {
            let first = routing_hash(user_id, 25);
            let second = routing_hash(user_id, 25);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn routing_hash_never_negative() {
        assert_eq!(routing_hash(-3, 25), "22");
    }
}
