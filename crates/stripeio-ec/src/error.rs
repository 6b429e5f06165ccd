//! Engine error type
//!
//! Errors are clonable: per-peer failures are recorded inside read results
//! and may be reported to several waiters.

use stripeio_common::PgShard;
use thiserror::Error;

/// Result type for engine operations
pub type EcResult<T> = std::result::Result<T, EcError>;

/// Errors produced by the erasure-coding engine
#[derive(Debug, Clone, Error)]
pub enum EcError {
    #[error("read failed on {peer}: {reason}")]
    PeerRead { peer: PgShard, reason: String },

    #[error("insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("range {offset}~{length} not covered on shard {shard}")]
    RangeNotCovered {
        shard: stripeio_common::ShardIndex,
        offset: u64,
        length: u64,
    },

    #[error("invalid stripe configuration: {0}")]
    InvalidStripe(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl EcError {
    /// Create a codec error from any codec failure
    pub fn codec(msg: impl ToString) -> Self {
        Self::Codec(msg.to_string())
    }

    /// The catch-all failure reported to clients when no decodable shard
    /// set remains.
    #[must_use]
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}
