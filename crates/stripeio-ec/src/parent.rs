//! Parent interface
//!
//! Everything the engine needs from the placement group it serves: peer
//! sets, per-peer missing maps, the log watermark, id issuance and message
//! dispatch. All calls happen under the parent's PG lock.

use crate::messages::{ClusterMessage, SubWrite};
use std::collections::{BTreeMap, BTreeSet};
use stripeio_common::{DeltaStats, Epoch, ObjectId, OsdId, PgId, PgShard, Tid, Version};

/// Objects a peer does not currently hold
#[derive(Clone, Debug, Default)]
pub struct MissingSet {
    missing: BTreeSet<ObjectId>,
}

impl MissingSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an object as missing
    pub fn insert(&mut self, oid: ObjectId) {
        self.missing.insert(oid);
    }

    /// Remove an object from the missing set
    pub fn remove(&mut self, oid: ObjectId) {
        self.missing.remove(&oid);
    }

    /// Whether the peer lacks this object
    #[must_use]
    pub fn is_missing(&self, oid: ObjectId) -> bool {
        self.missing.contains(&oid)
    }
}

/// Per-peer state the read planner consults
#[derive(Clone, Debug, Default)]
pub struct ShardInfo {
    /// Backfill watermark: the peer holds every object strictly below it.
    /// `None` means fully backfilled.
    pub last_backfill: Option<ObjectId>,
}

impl ShardInfo {
    /// Whether the peer has backfilled this object
    #[must_use]
    pub fn is_backfilled(&self, oid: ObjectId) -> bool {
        match self.last_backfill {
            None => true,
            Some(bound) => oid < bound,
        }
    }
}

/// Pool-level feature switches
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolInfo {
    pub allows_ec_overwrites: bool,
    pub allows_ec_optimizations: bool,
}

/// Placement group info the engine reads
#[derive(Clone, Copy, Debug)]
pub struct PgInfo {
    pub pgid: PgId,
    /// Most recent log update
    pub last_update: Version,
}

/// The placement group the engine serves.
///
/// The engine is driven re-entrantly under the PG lock; none of these
/// calls may block.
pub trait PgParent {
    /// Peers in the acting set
    fn get_acting_shards(&self) -> &BTreeSet<PgShard>;

    /// Peers currently being backfilled
    fn get_backfill_shards(&self) -> &BTreeSet<PgShard>;

    /// Every peer a write must reach
    fn get_acting_recovery_backfill_shards(&self) -> &BTreeSet<PgShard>;

    /// Missing map of an acting or backfill peer; panics for unknown peers
    fn get_shard_missing(&self, peer: PgShard) -> &MissingSet;

    /// Missing map of any peer
    fn maybe_get_shard_missing(&self, peer: PgShard) -> Option<&MissingSet>;

    /// Peers known to hold otherwise-missing objects
    fn get_missing_loc_shards(&self) -> &BTreeMap<ObjectId, BTreeSet<PgShard>>;

    /// Per-peer info for backfill decisions
    fn get_shard_info(&self, peer: PgShard) -> &ShardInfo;

    /// This PG's own info
    fn get_info(&self) -> &PgInfo;

    /// Pool feature switches
    fn get_pool(&self) -> &PoolInfo;

    /// Highest version the log can still roll back to
    fn log_can_rollback_to(&self) -> Version;

    /// Issue the next transaction id; monotonic per PG
    fn get_tid(&mut self) -> Tid;

    /// This daemon's own peer identity
    fn whoami_shard(&self) -> PgShard;

    /// The PG this engine serves
    fn primary_pgid(&self) -> PgId;

    /// Current cluster map epoch
    fn get_osdmap_epoch(&self) -> Epoch;

    /// Epoch the current interval started at
    fn get_interval_start_epoch(&self) -> Epoch;

    /// Whether a peer should receive the transaction itself, as opposed to
    /// a stats-only record
    fn should_send_op(&self, peer: PgShard, oid: ObjectId) -> bool;

    /// Dispatch a batch of messages to peers
    fn send_cluster_messages(&mut self, messages: Vec<(OsdId, ClusterMessage)>, epoch: Epoch);

    /// Apply the local shard's portion of a write; acks arrive later
    /// through the engine's sub-write reply path
    fn submit_local_transaction(&mut self, write: SubWrite);

    /// Fold an op's stat delta into PG stats
    fn apply_stats(&mut self, oid: ObjectId, stats: &DeltaStats);
}
