//! Abstract erasure codec interface
//!
//! The engine never performs coding arithmetic itself; it drives a codec
//! through this trait. All indices at this boundary are *raw* (pre-mapping)
//! shard indices in `0..k+m`; the stripe geometry translates to and from
//! physical shards.

use crate::error::EcResult;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::BitOr;
use stripeio_common::{RawShardIndex, ShardIndex};

/// A run of sub-chunks within one chunk: (first sub-chunk, count).
///
/// Plugins that cannot read partial chunks always report the full range.
pub type SubChunkRange = (u32, u32);

/// Capability bits reported by a codec plugin
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginFlags(u64);

impl PluginFlags {
    /// No optional capabilities
    pub const NONE: Self = Self(0);
    /// Plugin can decode from less than a full stripe
    pub const PARTIAL_READ: Self = Self(1 << 0);
    /// Plugin can re-encode parity for a sub-stripe interval
    pub const PARTIAL_WRITE: Self = Self(1 << 1);
    /// Plugin tolerates overwrite-style parity updates
    pub const EC_OVERWRITE: Self = Self(1 << 2);
    /// Plugin opts into the optimized planning paths
    pub const EC_OPTIMIZATIONS: Self = Self(1 << 3);

    /// Whether all bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PluginFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PluginFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::PARTIAL_READ, "PARTIAL_READ"),
            (Self::PARTIAL_WRITE, "PARTIAL_WRITE"),
            (Self::EC_OVERWRITE, "EC_OVERWRITE"),
            (Self::EC_OPTIMIZATIONS, "EC_OPTIMIZATIONS"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// Erasure codec plugin interface.
///
/// Chunk buffers passed in and out are whole multiples of the chunk size
/// for `decode`, and equal-length interval slices for `encode_chunks`.
pub trait ErasureCodec: Send + Sync {
    /// Number of data chunks (k)
    fn data_chunk_count(&self) -> usize;

    /// Number of coding chunks (m)
    fn coding_chunk_count(&self) -> usize;

    /// Total chunks (k + m)
    fn chunk_count(&self) -> usize {
        self.data_chunk_count() + self.coding_chunk_count()
    }

    /// Sub-chunks per chunk; 1 unless the plugin reads partial chunks
    fn sub_chunk_count(&self) -> usize {
        1
    }

    /// Permutation from raw index to physical shard. An empty vector means
    /// identity; a shorter-than-`k+m` vector is identity past its end.
    fn chunk_mapping(&self) -> Vec<ShardIndex> {
        Vec::new()
    }

    /// Which shards (with which sub-chunk runs) must be read to decode
    /// `want` out of `have`
    fn minimum_to_decode(
        &self,
        want: &BTreeSet<RawShardIndex>,
        have: &BTreeSet<RawShardIndex>,
    ) -> EcResult<BTreeMap<RawShardIndex, Vec<SubChunkRange>>>;

    /// Compute the requested coding chunks from a full set of k data
    /// chunks of equal length
    fn encode_chunks(
        &self,
        data: &BTreeMap<RawShardIndex, Bytes>,
        parity: &BTreeSet<RawShardIndex>,
    ) -> EcResult<BTreeMap<RawShardIndex, Bytes>>;

    /// Reconstruct the `want` chunks from the available chunks.
    ///
    /// `chunk_size` is the plugin's coding granularity, not the buffer
    /// length; buffers may span several chunks.
    fn decode(
        &self,
        want: &BTreeSet<RawShardIndex>,
        have: &BTreeMap<RawShardIndex, Bytes>,
        chunk_size: u64,
    ) -> EcResult<BTreeMap<RawShardIndex, Bytes>>;

    /// Reconstruct the `want` data chunks and concatenate them in raw
    /// index order
    fn decode_concat(
        &self,
        want: &BTreeSet<RawShardIndex>,
        chunks: &BTreeMap<RawShardIndex, Bytes>,
    ) -> EcResult<Bytes>;

    /// Optional capabilities
    fn supported_optimizations(&self) -> PluginFlags {
        PluginFlags::NONE
    }
}
