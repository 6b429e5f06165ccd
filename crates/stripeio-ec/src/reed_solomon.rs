//! Reed-Solomon codec adapter
//!
//! Default codec over `reed-solomon-erasure`: MDS, any k of k+m shards
//! reconstruct any other. Identity chunk mapping, one sub-chunk per chunk.

use crate::codec::{ErasureCodec, PluginFlags, SubChunkRange};
use crate::error::{EcError, EcResult};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::{BTreeMap, BTreeSet};
use stripeio_common::RawShardIndex;

/// Reed-Solomon erasure codec
pub struct ReedSolomonCodec {
    rs: ReedSolomon,
    k: usize,
    m: usize,
}

impl ReedSolomonCodec {
    /// Create a codec with k data and m coding chunks
    pub fn new(k: usize, m: usize) -> EcResult<Self> {
        let rs = ReedSolomon::new(k, m).map_err(EcError::codec)?;
        Ok(Self { rs, k, m })
    }

    /// Check that every buffer has the same length and return it
    fn uniform_len(have: &BTreeMap<RawShardIndex, Bytes>) -> EcResult<usize> {
        let mut len = None;
        for buf in have.values() {
            match len {
                None => len = Some(buf.len()),
                Some(l) if l != buf.len() => {
                    return Err(EcError::codec(format!(
                        "chunk length mismatch: {} vs {}",
                        l,
                        buf.len()
                    )))
                }
                _ => {}
            }
        }
        len.ok_or_else(|| EcError::codec("no chunks supplied"))
    }

    /// Reconstruct every missing shard from the available ones
    fn reconstruct_all(
        &self,
        have: &BTreeMap<RawShardIndex, Bytes>,
    ) -> EcResult<Vec<Vec<u8>>> {
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.k + self.m];
        for (raw, buf) in have {
            if raw.as_usize() >= self.k + self.m {
                return Err(EcError::codec(format!("chunk index {raw} out of range")));
            }
            shards[raw.as_usize()] = Some(buf.to_vec());
        }
        self.rs.reconstruct(&mut shards).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => EcError::InsufficientShards {
                available: have.len(),
                required: self.k,
            },
            other => EcError::codec(other),
        })?;
        // reconstruct fills every slot
        Ok(shards.into_iter().map(|s| s.unwrap_or_default()).collect())
    }
}

impl ErasureCodec for ReedSolomonCodec {
    fn data_chunk_count(&self) -> usize {
        self.k
    }

    fn coding_chunk_count(&self) -> usize {
        self.m
    }

    fn minimum_to_decode(
        &self,
        want: &BTreeSet<RawShardIndex>,
        have: &BTreeSet<RawShardIndex>,
    ) -> EcResult<BTreeMap<RawShardIndex, Vec<SubChunkRange>>> {
        let full: Vec<SubChunkRange> = vec![(0, self.sub_chunk_count() as u32)];

        // Every wanted shard available: read exactly those.
        if want.is_subset(have) {
            return Ok(want.iter().map(|&s| (s, full.clone())).collect());
        }

        // Otherwise any k available shards decode everything; lowest
        // indices first keeps data shards preferred.
        if have.len() < self.k {
            return Err(EcError::InsufficientShards {
                available: have.len(),
                required: self.k,
            });
        }
        Ok(have
            .iter()
            .take(self.k)
            .map(|&s| (s, full.clone()))
            .collect())
    }

    fn encode_chunks(
        &self,
        data: &BTreeMap<RawShardIndex, Bytes>,
        parity: &BTreeSet<RawShardIndex>,
    ) -> EcResult<BTreeMap<RawShardIndex, Bytes>> {
        let len = Self::uniform_len(data)?;
        if len == 0 {
            return Ok(parity.iter().map(|&s| (s, Bytes::new())).collect());
        }

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.k + self.m);
        for raw in 0..self.k {
            let buf = data
                .get(&RawShardIndex::new(raw as u8))
                .ok_or_else(|| EcError::codec(format!("missing data chunk {raw}")))?;
            shards.push(buf.to_vec());
        }
        shards.resize(self.k + self.m, vec![0u8; len]);

        self.rs.encode(&mut shards).map_err(EcError::codec)?;

        Ok(parity
            .iter()
            .filter(|s| s.as_usize() >= self.k && s.as_usize() < self.k + self.m)
            .map(|&s| (s, Bytes::from(std::mem::take(&mut shards[s.as_usize()]))))
            .collect())
    }

    fn decode(
        &self,
        want: &BTreeSet<RawShardIndex>,
        have: &BTreeMap<RawShardIndex, Bytes>,
        _chunk_size: u64,
    ) -> EcResult<BTreeMap<RawShardIndex, Bytes>> {
        Self::uniform_len(have)?;
        let mut all = self.reconstruct_all(have)?;
        Ok(want
            .iter()
            .filter(|s| s.as_usize() < self.k + self.m)
            .map(|&s| (s, Bytes::from(std::mem::take(&mut all[s.as_usize()]))))
            .collect())
    }

    fn decode_concat(
        &self,
        want: &BTreeSet<RawShardIndex>,
        chunks: &BTreeMap<RawShardIndex, Bytes>,
    ) -> EcResult<Bytes> {
        // Fast path: everything wanted was read.
        if want.iter().all(|s| chunks.contains_key(s)) {
            let mut out = bytes::BytesMut::new();
            for s in want {
                out.extend_from_slice(&chunks[s]);
            }
            return Ok(out.freeze());
        }

        let decoded = self.decode(want, chunks, 0)?;
        let mut out = bytes::BytesMut::new();
        for s in want {
            let buf = decoded
                .get(s)
                .ok_or_else(|| EcError::codec(format!("chunk {s} not decoded")))?;
            out.extend_from_slice(buf);
        }
        Ok(out.freeze())
    }

    fn supported_optimizations(&self) -> PluginFlags {
        PluginFlags::PARTIAL_READ | PluginFlags::PARTIAL_WRITE | PluginFlags::EC_OVERWRITE
    }
}
