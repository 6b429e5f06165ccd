//! Sparse per-shard extent map
//!
//! `ShardExtentMap` holds buffers for any subset of a placement group's
//! shards, tracks the RO range its data shards span, and drives the codec
//! for parity generation and reconstruction. It is the currency moved
//! between the cache, the pipelines and the transaction generator.

use crate::codec::ErasureCodec;
use crate::error::{EcError, EcResult};
use crate::extents::{ExtentMap, ExtentSet};
use crate::geometry::StripeInfo;
use crate::hash::HashInfoRef;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use stripeio_common::{RawShardIndex, ShardIndex};

/// Buffers for a subset of shards, with the RO range they span.
#[derive(Clone)]
pub struct ShardExtentMap {
    sinfo: Arc<StripeInfo>,
    // Span of the data shards in RO space; None when empty
    ro_range: Option<(u64, u64)>,
    maps: BTreeMap<ShardIndex, ExtentMap>,
}

impl ShardExtentMap {
    /// Create an empty map
    #[must_use]
    pub fn new(sinfo: Arc<StripeInfo>) -> Self {
        Self {
            sinfo,
            ro_range: None,
            maps: BTreeMap::new(),
        }
    }

    /// Build from per-shard extent maps; empty shards are dropped
    #[must_use]
    pub fn from_maps(sinfo: Arc<StripeInfo>, maps: BTreeMap<ShardIndex, ExtentMap>) -> Self {
        let mut out = Self {
            sinfo,
            ro_range: None,
            maps,
        };
        out.maps.retain(|_, emap| !emap.is_empty());
        out.compute_ro_range();
        out
    }

    /// Stripe parameters this map was built for
    #[must_use]
    pub fn stripe_info(&self) -> &Arc<StripeInfo> {
        &self.sinfo
    }

    /// Whether no shard holds a buffer
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Lowest RO offset spanned by the data shards
    #[must_use]
    pub fn ro_start(&self) -> Option<u64> {
        self.ro_range.map(|(s, _)| s)
    }

    /// One past the highest RO offset spanned by the data shards
    #[must_use]
    pub fn ro_end(&self) -> Option<u64> {
        self.ro_range.map(|(_, e)| e)
    }

    /// Total buffered bytes across all shards
    #[must_use]
    pub fn size(&self) -> u64 {
        self.maps.values().map(ExtentMap::size).sum()
    }

    /// All per-shard extent maps
    #[must_use]
    pub fn extent_maps(&self) -> &BTreeMap<ShardIndex, ExtentMap> {
        &self.maps
    }

    /// One shard's extent map, if it holds anything
    #[must_use]
    pub fn extent_map(&self, shard: ShardIndex) -> Option<&ExtentMap> {
        self.maps.get(&shard)
    }

    /// Whether a shard holds any buffer
    #[must_use]
    pub fn contains_shard(&self, shard: ShardIndex) -> bool {
        self.maps.contains_key(&shard)
    }

    /// Whether every extent of `other` is buffered here
    #[must_use]
    pub fn contains(&self, other: &BTreeMap<ShardIndex, ExtentSet>) -> bool {
        other.iter().all(|(shard, eset)| match self.maps.get(shard) {
            Some(emap) => eset.iter().all(|(off, len)| emap.covers(off, len)),
            None => eset.is_empty(),
        })
    }

    /// Per-shard buffered interval sets
    #[must_use]
    pub fn extent_sets(&self) -> BTreeMap<ShardIndex, ExtentSet> {
        self.maps
            .iter()
            .map(|(&shard, emap)| (shard, emap.interval_set()))
            .collect()
    }

    /// Union of buffered intervals across all shards
    #[must_use]
    pub fn extent_superset(&self) -> ExtentSet {
        let mut superset = ExtentSet::new();
        for emap in self.maps.values() {
            superset.union_with(&emap.interval_set());
        }
        superset
    }

    fn ro_of(&self, raw: RawShardIndex, shard_offset: u64) -> u64 {
        self.sinfo.shard_offset_to_ro_offset(raw, shard_offset)
    }

    /// Recompute the RO span from the data shards
    fn compute_ro_range(&mut self) {
        let mut range: Option<(u64, u64)> = None;
        for raw in 0..self.sinfo.k() {
            let raw = RawShardIndex::new(raw as u8);
            let shard = self.sinfo.shard(raw);
            let Some(emap) = self.maps.get(&shard) else {
                continue;
            };
            let (Some(first), Some(last)) = (emap.range_start(), emap.range_end()) else {
                continue;
            };
            let start = self.ro_of(raw, first);
            let end = self.ro_of(raw, last - 1) + 1;
            range = Some(match range {
                None => (start, end),
                Some((s, e)) => (s.min(start), e.max(end)),
            });
        }
        self.ro_range = range;
    }

    fn grow_ro_range(&mut self, start: u64, end: u64) {
        self.ro_range = Some(match self.ro_range {
            None => (start, end),
            Some((s, e)) => (s.min(start), e.max(end)),
        });
    }

    /// Insert a buffer on one shard.
    ///
    /// Coding shards do not contribute to the RO span.
    pub fn insert_in_shard(&mut self, shard: ShardIndex, offset: u64, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let len = data.len() as u64;
        self.maps.entry(shard).or_default().insert(offset, data);
        let raw = self.sinfo.raw_shard(shard);
        if raw.as_usize() < self.sinfo.k() {
            let start = self.ro_of(raw, offset);
            let end = self.ro_of(raw, offset + len - 1) + 1;
            self.grow_ro_range(start, end);
        }
    }

    /// Union another map into this one; `other`'s buffers win overlaps
    pub fn insert(&mut self, other: &ShardExtentMap) {
        for (&shard, emap) in &other.maps {
            self.maps.entry(shard).or_default().insert_map(emap);
        }
        if let Some((start, end)) = other.ro_range {
            self.grow_ro_range(start, end);
        }
    }

    /// Distribute an RO-ordered buffer across the data shards
    pub fn insert_ro_buffer(&mut self, ro_offset: u64, data: &Bytes) {
        for (shard, offset, buf) in self.sinfo.ro_range_to_shard_buffers(ro_offset, data) {
            if buf.is_empty() {
                continue;
            }
            let len = buf.len() as u64;
            self.maps.entry(shard).or_default().insert(offset, buf);
            let raw = self.sinfo.raw_shard(shard);
            let start = self.ro_of(raw, offset);
            let end = self.ro_of(raw, offset + len - 1) + 1;
            self.grow_ro_range(start, end);
        }
    }

    /// Insert zeros over an RO range
    pub fn insert_ro_zero_buffer(&mut self, ro_offset: u64, ro_length: u64) {
        if ro_length == 0 {
            return;
        }
        self.insert_ro_buffer(ro_offset, &Bytes::from(vec![0u8; ro_length as usize]));
    }

    /// Zero-fill from the current RO end up to (not including) `ro_offset`
    pub fn append_zeros_to_ro_offset(&mut self, ro_offset: u64) {
        let current_end = self.ro_end().unwrap_or(0);
        if ro_offset > current_end {
            self.insert_ro_zero_buffer(current_end, ro_offset - current_end);
        }
    }

    /// Restrict to the extents listed in `other`
    #[must_use]
    pub fn intersect(&self, other: &BTreeMap<ShardIndex, ExtentSet>) -> ShardExtentMap {
        let mut maps = BTreeMap::new();
        for (shard, eset) in other {
            let Some(emap) = self.maps.get(shard) else {
                continue;
            };
            let mut cut = ExtentMap::new();
            for (off, len) in eset.iter() {
                cut.insert_map(&emap.intersect(off, len));
            }
            if !cut.is_empty() {
                maps.insert(*shard, cut);
            }
        }
        Self::from_maps(self.sinfo.clone(), maps)
    }

    /// Restrict to an RO range
    #[must_use]
    pub fn intersect_ro_range(&self, ro_offset: u64, ro_length: u64) -> ShardExtentMap {
        let Some((ro_start, ro_end)) = self.ro_range else {
            return Self::new(self.sinfo.clone());
        };
        // Overlap is everything
        if ro_offset <= ro_start && ro_offset + ro_length >= ro_end {
            return self.clone();
        }
        // Overlap is nothing
        if ro_offset >= ro_end || ro_offset + ro_length <= ro_start {
            return Self::new(self.sinfo.clone());
        }
        let wanted = self.sinfo.ro_range_to_shard_extents(ro_offset, ro_length);
        self.intersect(&wanted)
    }

    /// Drop everything at or past an RO offset
    pub fn erase_after_ro_offset(&mut self, ro_offset: u64) {
        let Some((_, ro_end)) = self.ro_range else {
            return;
        };
        if ro_offset >= ro_end {
            return;
        }
        let to_erase = self.sinfo.ro_range_to_shard_extents(ro_offset, ro_end - ro_offset);
        for (shard, eset) in to_erase {
            if let Some(emap) = self.maps.get_mut(&shard) {
                if let (Some(start), Some(end)) = (eset.range_start(), eset.range_end()) {
                    emap.erase(start, end - start);
                }
                if emap.is_empty() {
                    self.maps.remove(&shard);
                }
            }
        }
        self.compute_ro_range();
    }

    /// Drop a shard-space range from every shard
    pub fn erase_stripe(&mut self, offset: u64, length: u64) {
        self.maps.retain(|_, emap| {
            emap.erase(offset, length);
            !emap.is_empty()
        });
        self.compute_ro_range();
    }

    /// Drop one shard entirely
    pub fn erase_shard(&mut self, shard: ShardIndex) {
        if self.maps.remove(&shard).is_some() {
            self.compute_ro_range();
        }
    }

    /// Assemble `[offset, offset + length)` of one shard.
    ///
    /// With `zero_pad`, uncovered bytes read as zero; without it, partial
    /// coverage is an error rather than silently wrong bytes.
    pub fn get_buffer(
        &self,
        shard: ShardIndex,
        offset: u64,
        length: u64,
        zero_pad: bool,
    ) -> EcResult<Bytes> {
        let not_covered = || EcError::RangeNotCovered {
            shard,
            offset,
            length,
        };
        let Some(emap) = self.maps.get(&shard) else {
            if zero_pad {
                return Ok(Bytes::from(vec![0u8; length as usize]));
            }
            return Err(not_covered());
        };
        if let Some(buf) = emap.get(offset, length) {
            return Ok(buf);
        }
        if !zero_pad {
            return Err(not_covered());
        }
        let mut padded = vec![0u8; length as usize];
        for (off, buf) in emap.intersect(offset, length).iter() {
            let lo = (off - offset) as usize;
            padded[lo..lo + buf.len()].copy_from_slice(buf);
        }
        Ok(Bytes::from(padded))
    }

    /// Equal-length per-shard buffers for one shard-space interval, padded
    /// with zeros where a present shard only partially covers it
    #[must_use]
    pub fn slice(&self, offset: u64, length: u64) -> BTreeMap<ShardIndex, Bytes> {
        self.maps
            .keys()
            .map(|&shard| {
                let buf = self
                    .get_buffer(shard, offset, length, true)
                    .expect("zero-padded get_buffer cannot fail");
                (shard, buf)
            })
            .collect()
    }

    /// Reassemble an RO range from the data shards.
    ///
    /// Every byte must be buffered; reconstruction happens in `decode`,
    /// not here.
    pub fn get_ro_buffer(&self, ro_offset: u64, ro_length: u64) -> EcResult<Bytes> {
        let chunk_size = self.sinfo.chunk_size();
        let width = self.sinfo.stripe_width();
        let k = self.sinfo.k() as u64;

        let mut out = bytes::BytesMut::with_capacity(ro_length as usize);
        let mut raw = (ro_offset / chunk_size) % k;
        let mut chunk_offset = ro_offset - (ro_offset % chunk_size);
        let end = ro_offset + ro_length;

        while chunk_offset < end {
            let lo = chunk_offset.max(ro_offset);
            let hi = (chunk_offset + chunk_size).min(end);
            let shard_offset = (chunk_offset / width) * chunk_size + (lo - chunk_offset);
            let shard = self.sinfo.shard(RawShardIndex::new(raw as u8));
            let buf = self.get_buffer(shard, shard_offset, hi - lo, false)?;
            out.extend_from_slice(&buf);

            chunk_offset += chunk_size;
            raw += 1;
            if raw == k {
                raw = 0;
            }
        }
        Ok(out.freeze())
    }

    /// Invent zero parity buffers over the data superset.
    ///
    /// Appends do not carry parity; encode expects the buffers to exist.
    pub fn insert_parity_buffers(&mut self) {
        let superset = self.extent_superset();
        for raw in self.sinfo.k()..self.sinfo.k_plus_m() {
            let shard = self.sinfo.shard(RawShardIndex::new(raw as u8));
            let emap = self.maps.entry(shard).or_default();
            for (offset, length) in superset.iter() {
                emap.insert(offset, Bytes::from(vec![0u8; length as usize]));
            }
        }
    }

    /// Compute parity for every buffered interval and fold appended bytes
    /// into the cumulative hash.
    ///
    /// Data shards absent from an interval are zero-filled and stashed back
    /// into the map so the cache and the write path see them.
    pub fn encode(
        &mut self,
        codec: &dyn ErasureCodec,
        hinfo: Option<&HashInfoRef>,
        before_ro_size: u64,
    ) -> EcResult<()> {
        let superset = self.extent_superset();
        let k = self.sinfo.k();

        for (offset, length) in superset.iter() {
            let mut buffers = self.slice(offset, length);

            // Zero-fill data shards missing from this interval
            for raw in 0..k {
                let shard = self.sinfo.shard(RawShardIndex::new(raw as u8));
                if !buffers.contains_key(&shard) {
                    let zeros = Bytes::from(vec![0u8; length as usize]);
                    self.insert_in_shard(shard, offset, zeros.clone());
                    buffers.insert(shard, zeros);
                }
            }

            let data: BTreeMap<RawShardIndex, Bytes> = buffers
                .iter()
                .filter(|(&shard, _)| self.sinfo.is_data_shard(shard))
                .map(|(&shard, buf)| (self.sinfo.raw_shard(shard), buf.clone()))
                .collect();
            let parity_want: BTreeSet<RawShardIndex> = (k..self.sinfo.k_plus_m())
                .map(|raw| RawShardIndex::new(raw as u8))
                .collect();

            let parity = codec.encode_chunks(&data, &parity_want)?;
            for (raw, buf) in parity {
                let shard = self.sinfo.shard(raw);
                buffers.insert(shard, buf.clone());
                self.maps.entry(shard).or_default().insert(offset, buf);
            }

            // Appends fold the freshly written bytes, data and parity both,
            // into the cumulative hashes.
            if let Some(hinfo) = hinfo {
                if self.ro_start().is_some_and(|s| s >= before_ro_size) {
                    hinfo.write().append(offset, &buffers);
                }
            }
        }
        Ok(())
    }

    /// Reconstruct wanted-but-absent shards from whatever is buffered
    pub fn decode(
        &mut self,
        codec: &dyn ErasureCodec,
        want: &BTreeMap<ShardIndex, ExtentSet>,
    ) -> EcResult<()> {
        let mut decoded_any = false;
        for (&shard, eset) in want {
            // A shard that was read does not need decoding; readers erase
            // shards whose reads failed before calling in here.
            if self.maps.contains_key(&shard) {
                continue;
            }
            decoded_any = true;
            let raw = self.sinfo.raw_shard(shard);
            let mut want_raw = BTreeSet::new();
            want_raw.insert(raw);

            for (offset, length) in eset.iter() {
                let have: BTreeMap<RawShardIndex, Bytes> = self
                    .slice(offset, length)
                    .into_iter()
                    .map(|(s, buf)| (self.sinfo.raw_shard(s), buf))
                    .collect();
                let out = codec.decode(&want_raw, &have, self.sinfo.chunk_size())?;
                let buf = out
                    .get(&raw)
                    .ok_or_else(|| EcError::codec(format!("shard {shard} not decoded")))?;
                if buf.len() as u64 != length {
                    return Err(EcError::codec(format!(
                        "decode returned {} bytes for {length}-byte interval",
                        buf.len()
                    )));
                }
                self.maps.entry(shard).or_default().insert(offset, buf.clone());
            }
        }
        if decoded_any {
            self.compute_ro_range();
        }
        Ok(())
    }
}

impl fmt::Debug for ShardExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardExtentMap(")?;
        match self.ro_range {
            Some((s, e)) => write!(f, "ro={s}~{e}")?,
            None => write!(f, "ro=empty")?,
        }
        write!(f, ", maps={{")?;
        for (i, (shard, emap)) in self.maps.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{shard}:{emap:?}")?;
        }
        write!(f, "}})")
    }
}
