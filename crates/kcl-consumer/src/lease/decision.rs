//! The pure per-shard reconciliation decision table, split out from the
//! reconciliation loop so it can be exercised without a live KV/Kinesis
//! client. Row order matters: `decide` returns the first matching row.

use chrono::{DateTime, Utc};
use kcl_types::ConsumerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Renew,
    /// Release an expired lease held by a known-but-stalled peer, then
    /// attempt to lock it for ourselves.
    Steal,
    /// Release a lease held by a consumer no longer in the document at
    /// all, then attempt to lock it for ourselves.
    Reclaim,
    Acquire,
}

pub struct ShardContext<'a> {
    pub self_id: &'a ConsumerId,
    pub depleted: bool,
    pub lease_owner: Option<&'a ConsumerId>,
    pub lease_expiration: Option<DateTime<Utc>>,
    pub owner_known: bool,
    pub parent_depleted_or_absent: bool,
    pub owned_count: usize,
    pub max_active: usize,
    pub use_auto_shard_assignment: bool,
    pub renew_threshold: chrono::Duration,
    pub now: DateTime<Utc>,
}

/// Evaluates one shard against the decision table, returning the action to
/// take and its debug reason.
pub fn decide(ctx: &ShardContext) -> (Decision, &'static str) {
    if ctx.depleted {
        return (Decision::Skip, "depleted, can't be leased");
    }

    if let Some(owner) = ctx.lease_owner {
        if owner == ctx.self_id {
            let expiration = ctx.lease_expiration.unwrap_or(ctx.now);
            if expiration - ctx.now > ctx.renew_threshold {
                return (Decision::Skip, "owned by this consumer");
            }
            return (Decision::Renew, "time to renew");
        }

        let lease_expired = ctx.lease_expiration.map(|exp| ctx.now > exp).unwrap_or(true);
        if lease_expired && ctx.owner_known {
            return (Decision::Steal, "expired lease");
        }
        if !ctx.owner_known {
            return (Decision::Reclaim, "owner is gone");
        }
        return (Decision::Skip, "owned by peer");
    }

    if !ctx.parent_depleted_or_absent {
        return (Decision::Skip, "parent not depleted");
    }

    if ctx.use_auto_shard_assignment && ctx.owned_count >= ctx.max_active {
        return (Decision::Skip, "max leases reached");
    }

    (Decision::Acquire, "acquired")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base<'a>(self_id: &'a ConsumerId, now: DateTime<Utc>) -> ShardContext<'a> {
        ShardContext {
            self_id,
            depleted: false,
            lease_owner: None,
            lease_expiration: None,
            owner_known: true,
            parent_depleted_or_absent: true,
            owned_count: 0,
            max_active: usize::MAX,
            use_auto_shard_assignment: true,
            renew_threshold: chrono::Duration::seconds(150),
            now,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn depleted_shard_is_always_skipped_first() {
        let self_id = ConsumerId::from("a");
        let mut ctx = base(&self_id, now());
        ctx.depleted = true;
        ctx.lease_owner = Some(&self_id); // would otherwise match "owned by self"
        assert_eq!(decide(&ctx), (Decision::Skip, "depleted, can't be leased"));
    }

    #[test]
    fn own_healthy_lease_is_skipped() {
        let self_id = ConsumerId::from("a");
        let mut ctx = base(&self_id, now());
        ctx.lease_owner = Some(&self_id);
        ctx.lease_expiration = Some(now() + chrono::Duration::seconds(200));
        assert_eq!(decide(&ctx), (Decision::Skip, "owned by this consumer"));
    }

    #[test]
    fn own_lease_near_expiry_is_renewed() {
        let self_id = ConsumerId::from("a");
        let mut ctx = base(&self_id, now());
        ctx.lease_owner = Some(&self_id);
        ctx.lease_expiration = Some(now() + chrono::Duration::seconds(10));
        assert_eq!(decide(&ctx), (Decision::Renew, "time to renew"));
    }

    #[test]
    fn expired_lease_held_by_known_peer_is_stolen() {
        let self_id = ConsumerId::from("a");
        let peer = ConsumerId::from("b");
        let mut ctx = base(&self_id, now());
        ctx.lease_owner = Some(&peer);
        ctx.lease_expiration = Some(now() - chrono::Duration::seconds(1));
        ctx.owner_known = true;
        assert_eq!(decide(&ctx), (Decision::Steal, "expired lease"));
    }

    #[test]
    fn lease_held_by_vanished_peer_is_reclaimed_even_if_not_yet_expired() {
        let self_id = ConsumerId::from("a");
        let peer = ConsumerId::from("b");
        let mut ctx = base(&self_id, now());
        ctx.lease_owner = Some(&peer);
        ctx.lease_expiration = Some(now() + chrono::Duration::seconds(100));
        ctx.owner_known = false;
        assert_eq!(decide(&ctx), (Decision::Reclaim, "owner is gone"));
    }

    #[test]
    fn lease_held_by_live_peer_not_yet_expired_is_skipped() {
        let self_id = ConsumerId::from("a");
        let peer = ConsumerId::from("b");
        let mut ctx = base(&self_id, now());
        ctx.lease_owner = Some(&peer);
        ctx.lease_expiration = Some(now() + chrono::Duration::seconds(100));
        ctx.owner_known = true;
        assert_eq!(decide(&ctx), (Decision::Skip, "owned by peer"));
    }

    #[test]
    fn free_shard_with_undepleted_parent_is_skipped() {
        let self_id = ConsumerId::from("a");
        let mut ctx = base(&self_id, now());
        ctx.parent_depleted_or_absent = false;
        assert_eq!(decide(&ctx), (Decision::Skip, "parent not depleted"));
    }

    #[test]
    fn free_shard_beyond_the_auto_assignment_cap_is_skipped() {
        let self_id = ConsumerId::from("a");
        let mut ctx = base(&self_id, now());
        ctx.owned_count = 3;
        ctx.max_active = 3;
        assert_eq!(decide(&ctx), (Decision::Skip, "max leases reached"));
    }

    #[test]
    fn standalone_mode_ignores_the_cap() {
        let self_id = ConsumerId::from("a");
        let mut ctx = base(&self_id, now());
        ctx.use_auto_shard_assignment = false;
        ctx.owned_count = 1000;
        ctx.max_active = 1;
        assert_eq!(decide(&ctx), (Decision::Acquire, "acquired"));
    }

    #[test]
    fn free_shard_with_capacity_is_acquired() {
        let self_id = ConsumerId::from("a");
        let ctx = base(&self_id, now());
        assert_eq!(decide(&ctx), (Decision::Acquire, "acquired"));
    }
}
