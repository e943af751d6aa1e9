//! The coordination document's shape: `StreamState`, `ConsumerRecord`,
//! `ShardRecord`, and the lineage-graph helpers built on top of them.

use crate::ids::{ConsumerId, SequenceNumber, ShardId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// The optimistic-concurrency token guarding a single slot of the document
/// (changes on every successful mutation to that slot).
pub type Version = Uuid;

/// One shard's leasing and checkpoint state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShardRecord {
    pub parent: Option<ShardId>,
    pub checkpoint: Option<SequenceNumber>,
    pub depleted: bool,
    pub lease_owner: Option<ConsumerId>,
    pub lease_expiration: Option<DateTime<Utc>>,
    pub version: Version,
}

impl ShardRecord {
    /// A freshly observed shard: no lease, no checkpoint, not depleted.
    pub fn new(parent: Option<ShardId>) -> Self {
        ShardRecord {
            parent,
            checkpoint: None,
            depleted: false,
            lease_owner: None,
            lease_expiration: None,
            version: Uuid::new_v4(),
        }
    }

    /// True if `now` is past `lease_expiration`, or there is no lease at all.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expiration {
            Some(expiration) => now > expiration,
            None => true,
        }
    }
}

/// One consumer process's heartbeat and identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsumerRecord {
    pub app_name: String,
    pub host: String,
    pub pid: u32,
    pub started_on: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    pub is_active: bool,
    pub is_standalone: bool,
    /// Present only in standalone mode: this consumer's private shard
    /// partition (lease/checkpoint only; lineage is always global).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<HashMap<ShardId, ShardRecord>>,
}

impl ConsumerRecord {
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.heartbeat
    }
}

/// The single coordination document for a (`consumer_group`, `stream_name`)
/// pair.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamState {
    pub consumer_group: String,
    pub stream_name: String,
    pub stream_created_on: DateTime<Utc>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
    /// Shard lineage and, in auto-assignment mode, lease/checkpoint state.
    /// Always authoritative for lineage regardless of mode.
    pub shards: HashMap<ShardId, ShardRecord>,
    pub version: Version,
}

impl StreamState {
    pub fn new(consumer_group: String, stream_name: String, stream_created_on: DateTime<Utc>) -> Self {
        StreamState {
            consumer_group,
            stream_name,
            stream_created_on,
            consumers: HashMap::new(),
            shards: HashMap::new(),
            version: Uuid::new_v4(),
        }
    }

    /// Live consumers: active and not heartbeat-expired is decided by the
    /// caller (heartbeat GC already removed the dead ones by the time this
    /// is consulted); this just filters the `is_active` flag.
    pub fn is_known_consumer(&self, id: &ConsumerId) -> bool {
        self.consumers.contains_key(id)
    }

    /// A shard is a root, or its parent is depleted, or its parent is no
    /// longer present in the current listing (old ancestors beyond the
    /// retention horizon are promoted to root).
    pub fn parent_depleted_or_absent(&self, shard: &ShardRecord) -> bool {
        match &shard.parent {
            None => true,
            Some(parent_id) => match self.shards.get(parent_id) {
                Some(parent) => parent.depleted,
                None => true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn root_shard_has_no_parent_dependency() {
        let shard = ShardRecord::new(None);
        let state = StreamState::new("g".into(), "s".into(), now());
        assert!(state.parent_depleted_or_absent(&shard));
    }

    #[test]
    fn non_root_blocked_until_parent_depleted() {
        let parent_id = ShardId::from("parent");
        let mut state = StreamState::new("g".into(), "s".into(), now());
        state.shards.insert(parent_id.clone(), ShardRecord::new(None));

        let child = ShardRecord::new(Some(parent_id.clone()));
        assert!(!state.parent_depleted_or_absent(&child));

        state.shards.get_mut(&parent_id).unwrap().depleted = true;
        assert!(state.parent_depleted_or_absent(&child));
    }

    #[test]
    fn absent_parent_is_treated_as_root() {
        let child = ShardRecord::new(Some(ShardId::from("gone-beyond-retention")));
        let state = StreamState::new("g".into(), "s".into(), now());
        assert!(state.parent_depleted_or_absent(&child));
    }

    #[test]
    fn lease_with_no_expiration_counts_as_expired() {
        let shard = ShardRecord::new(None);
        assert!(shard.lease_expired(now()));
    }

    use proptest::prelude::*;

    proptest! {
        /// A shard is leasable (parent_depleted_or_absent) exactly when
        /// it has no parent, or its parent is missing, or its parent's
        /// `depleted` flag is set — for any root/depleted combination.
        #[test]
        fn parent_depleted_or_absent_matches_naive_lookup(
            has_parent in any::<bool>(),
            parent_present in any::<bool>(),
            parent_depleted in any::<bool>(),
        ) {
            let mut state = StreamState::new("g".into(), "s".into(), now());
            let parent_id = ShardId::from("parent");

            if has_parent && parent_present {
                let mut parent = ShardRecord::new(None);
                parent.depleted = parent_depleted;
                state.shards.insert(parent_id.clone(), parent);
            }

            let child = ShardRecord::new(if has_parent { Some(parent_id.clone()) } else { None });
            let expected = !has_parent || !parent_present || parent_depleted;
            prop_assert_eq!(state.parent_depleted_or_absent(&child), expected);
        }
    }
}
