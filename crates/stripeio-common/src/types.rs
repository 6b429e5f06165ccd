//! Core identifier types for stripeio
//!
//! Typed ids shared by the engine and its collaborators: objects, shards,
//! peers, placement groups and versions.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cluster map epoch.
pub type Epoch = u32;

/// Monotonic per-PG transaction id.
pub type Tid = u64;

/// Unique identifier for an object within a placement group.
///
/// Ordered so it can act as a backfill watermark: a peer that has backfilled
/// up to some bound holds every object below it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a new random object ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical shard index within a placement group (0..k+m).
///
/// Physical indices are what peers store and messages address; they relate
/// to raw (pre-permutation) indices through the stripe's chunk mapping.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into,
    Display,
)]
#[display("{_0}")]
pub struct ShardIndex(u8);

impl ShardIndex {
    /// Create a new shard index
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Get the index value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Get the index as a usize (for vector indexing)
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardIndex({})", self.0)
    }
}

/// Raw shard index: position in codec order (0..k+m), before the chunk
/// mapping permutes it onto a physical shard.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into,
    Display,
)]
#[display("{_0}")]
pub struct RawShardIndex(u8);

impl RawShardIndex {
    /// Create a new raw shard index
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    /// Get the index value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Get the index as a usize (for vector indexing)
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for RawShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawShardIndex({})", self.0)
    }
}

/// Identifier of a storage daemon in the cluster.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    From,
    Into,
    Display,
)]
#[display("osd.{_0}")]
pub struct OsdId(u32);

impl OsdId {
    /// Create a new OSD id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the id value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for OsdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OsdId({})", self.0)
    }
}

/// A peer in the placement group: which daemon holds which shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PgShard {
    /// Daemon hosting the shard
    pub osd: OsdId,
    /// Shard held by that daemon
    pub shard: ShardIndex,
}

impl PgShard {
    /// Create a new peer identifier
    #[must_use]
    pub const fn new(osd: OsdId, shard: ShardIndex) -> Self {
        Self { osd, shard }
    }
}

impl fmt::Display for PgShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.osd, self.shard)
    }
}

/// Placement group identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PgId {
    /// Pool the group belongs to
    pub pool: u64,
    /// Group seed within the pool
    pub seed: u32,
}

impl PgId {
    /// Create a new placement group id
    #[must_use]
    pub const fn new(pool: u64, seed: u32) -> Self {
        Self { pool, seed }
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:x}", self.pool, self.seed)
    }
}

/// Placement group id qualified with the shard a message addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpgId {
    /// The placement group
    pub pgid: PgId,
    /// Addressed shard
    pub shard: ShardIndex,
}

impl SpgId {
    /// Create a sharded placement group id
    #[must_use]
    pub const fn new(pgid: PgId, shard: ShardIndex) -> Self {
        Self { pgid, shard }
    }
}

impl fmt::Display for SpgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s{}", self.pgid, self.shard)
    }
}

/// Object version: map epoch plus a per-PG sequence number.
///
/// Ordering is epoch-major, matching log ordering across interval changes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    /// Epoch the write was issued in
    pub epoch: Epoch,
    /// Sequence number within the PG log
    pub version: u64,
}

impl Version {
    /// Create a new version
    #[must_use]
    pub const fn new(epoch: Epoch, version: u64) -> Self {
        Self { epoch, version }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.version)
    }
}

/// Client request identifier, unique per client session.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReqId {
    /// Originating client
    pub client: u64,
    /// Request sequence within that client
    pub tid: u64,
}

impl ReqId {
    /// Create a new request id
    #[must_use]
    pub const fn new(client: u64, tid: u64) -> Self {
        Self { client, tid }
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client.{}:{}", self.client, self.tid)
    }
}

/// Per-op statistics delta, applied through the parent when a write is
/// dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaStats {
    /// Net change in stored bytes
    pub num_bytes: i64,
    /// Number of write operations
    pub num_writes: u64,
}

impl DeltaStats {
    /// Accumulate another delta into this one
    pub fn add(&mut self, other: &DeltaStats) {
        self.num_bytes += other.num_bytes;
        self.num_writes += other.num_writes;
    }
}
