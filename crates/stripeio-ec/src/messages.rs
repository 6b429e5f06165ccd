//! Wire message shapes
//!
//! The engine builds these and hands them to the parent's cluster sender;
//! it never serializes or routes them itself. Replies re-enter through the
//! engine's `handle_*` entry points.

use crate::codec::SubChunkRange;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use stripeio_common::{DeltaStats, Epoch, ObjectId, PgShard, ReqId, ShardIndex, SpgId, Tid, Version};

/// Flags passed through to the object store on each read extent
pub type ReadFlags = u32;

/// One extent to read on a shard: (offset, length, flags)
pub type ReadExtent = (u64, u64, ReadFlags);

/// Batched read of shard extents on one peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubRead {
    pub from: PgShard,
    pub tid: Tid,
    pub pgid: SpgId,
    pub map_epoch: Epoch,
    pub min_epoch: Epoch,
    pub priority: u8,
    /// Per-object page-aligned extents on the addressed shard
    pub to_read: BTreeMap<ObjectId, Vec<ReadExtent>>,
    /// Per-object sub-chunk runs the codec asked for
    pub subchunks: BTreeMap<ObjectId, Vec<SubChunkRange>>,
    /// Objects whose attributes ride along with this read
    pub attrs_to_read: BTreeSet<ObjectId>,
}

/// Reply to a [`SubRead`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubReadReply {
    pub from: PgShard,
    pub tid: Tid,
    /// Per-object buffers at their shard offsets
    pub buffers_read: BTreeMap<ObjectId, Vec<(u64, Bytes)>>,
    pub attrs_read: BTreeMap<ObjectId, BTreeMap<String, Bytes>>,
    /// Objects this peer failed to read, with the reason
    pub errors: BTreeMap<ObjectId, String>,
}

/// Description of the mutations one shard must apply.
///
/// Commitment is delegated: the parent turns this into an object-store
/// transaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShardTransaction {
    /// Buffer writes at shard offsets
    pub writes: Vec<(u64, Bytes)>,
    /// Attribute updates (cumulative hash info)
    pub attrs: BTreeMap<String, Bytes>,
    /// Truncate the shard to this length first
    pub truncate: Option<u64>,
}

impl ShardTransaction {
    /// Whether the transaction mutates anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.attrs.is_empty() && self.truncate.is_none()
    }
}

/// PG log entry carried on sub-writes; opaque to the engine
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub oid: ObjectId,
    pub version: Version,
}

/// One peer's portion of a write
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubWrite {
    pub from: PgShard,
    pub tid: Tid,
    pub pgid: SpgId,
    pub map_epoch: Epoch,
    pub min_epoch: Epoch,
    pub reqid: ReqId,
    pub oid: ObjectId,
    pub stats: DeltaStats,
    /// Empty when `stats_only` is set
    pub transaction: ShardTransaction,
    pub version: Version,
    pub trim_to: Version,
    pub pg_committed_to: Version,
    pub log_entries: Vec<LogEntry>,
    /// Opaque hit-set history payload carried for the parent
    pub hit_set_history: Option<Bytes>,
    pub temp_added: BTreeSet<ObjectId>,
    pub temp_cleared: BTreeSet<ObjectId>,
    /// Peer should record the metadata but apply no data
    pub stats_only: bool,
}

/// Apply/commit acknowledgment for a [`SubWrite`]
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SubWriteReply {
    pub from: PgShard,
    pub tid: Tid,
    pub applied: bool,
    pub committed: bool,
}

/// Everything the engine sends through the cluster
#[derive(Clone, Debug, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum ClusterMessage {
    SubRead(SubRead),
    SubReadReply(SubReadReply),
    SubWrite(SubWrite),
    SubWriteReply(SubWriteReply),
}

/// Per-shard read plan: which extents and sub-chunks to fetch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardReadPlan {
    pub extents: crate::extents::ExtentSet,
    pub subchunks: Vec<SubChunkRange>,
}

impl ShardReadPlan {
    /// Full-chunk sub-chunk run
    #[must_use]
    pub fn full_subchunks(sub_chunk_count: usize) -> Vec<SubChunkRange> {
        vec![(0, sub_chunk_count as u32)]
    }
}

// Re-exported alias used across the pipelines: shard -> wanted extents
pub type ShardExtentSets = BTreeMap<ShardIndex, crate::extents::ExtentSet>;
