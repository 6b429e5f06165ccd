//! stripeio EC - Per-placement-group erasure-coding I/O engine
//!
//! The data plane of an erasure-coded placement group: plans client reads
//! down to the minimum decodable set of peer shards, reconstructs missing
//! shards through a pluggable codec, and serializes overlapping writes
//! through a read-modify-write pipeline backed by a pinned, line-addressed
//! shard-extent cache.
//!
//! Out of scope by design: message transport (an abstract sender), the
//! coding arithmetic itself (the [`codec::ErasureCodec`] trait), peer
//! membership and log bookkeeping (the [`parent::PgParent`] trait), and
//! persistence (the engine emits [`messages::ShardTransaction`]
//! descriptions).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stripeio_ec::{EcEngine, EngineConfig, ReedSolomonCodec};
//!
//! let codec = Arc::new(ReedSolomonCodec::new(4, 2)?);
//! let engine = EcEngine::new(pg_parent, codec, 4 * 4096, EngineConfig::default())?;
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod extents;
pub mod geometry;
pub mod hash;
pub mod messages;
pub mod parent;
pub mod plan;
pub mod read;
pub mod reed_solomon;
pub mod rmw;
pub mod shard_map;

pub use cache::{CacheEvent, ExtentCache};
pub use codec::{ErasureCodec, PluginFlags};
pub use config::EngineConfig;
pub use engine::EcEngine;
pub use error::{EcError, EcResult};
pub use extents::{ExtentMap, ExtentSet};
pub use geometry::StripeInfo;
pub use hash::{HashInfo, HashInfoRegistry, HINFO_KEY};
pub use messages::{ClusterMessage, SubRead, SubReadReply, SubWrite, SubWriteReply};
pub use parent::{MissingSet, PgInfo, PgParent, PoolInfo, ShardInfo};
pub use plan::{ClientWrite, WritePlan};
pub use read::{EcAlign, ObjectReadResult, ReadPipeline};
pub use reed_solomon::ReedSolomonCodec;
pub use rmw::{RmwOp, RmwPipeline};
pub use shard_map::ShardExtentMap;
