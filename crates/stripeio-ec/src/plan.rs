//! Write planning and per-shard transaction generation
//!
//! A client write arrives as RO-space bytes. The plan works out which
//! shard extents must be read first (partial chunks of stripes whose
//! parity is being recomputed) and which extents every peer will be asked
//! to write. Transaction generation later merges the read results with the
//! new bytes, recomputes parity over the touched intervals, and emits one
//! transaction description per shard.
//!
//! Parity is never read: it is recomputed from the full data interval,
//! with data shards absent from an interval reading as zero.

use crate::codec::ErasureCodec;
use crate::error::EcResult;
use crate::extents::{ExtentMap, ExtentSet};
use crate::geometry::{align_page_next, align_page_prev, StripeInfo, PAGE_SIZE};
use crate::hash::{HashInfoRef, HINFO_KEY};
use crate::messages::{ShardExtentSets, ShardTransaction};
use crate::shard_map::ShardExtentMap;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use stripeio_common::{RawShardIndex, ShardIndex};
use tracing::trace;

/// A client write in RO space
#[derive(Clone, Debug, Default)]
pub struct ClientWrite {
    /// New bytes keyed by RO offset
    pub data: ExtentMap,
    /// Truncate the object to this RO length before applying `data`
    pub truncate: Option<u64>,
    /// Object size in RO bytes before this op
    pub object_size: u64,
}

impl ClientWrite {
    /// A plain overwrite/append of one contiguous range
    #[must_use]
    pub fn write(ro_offset: u64, data: Bytes, object_size: u64) -> Self {
        let mut map = ExtentMap::new();
        map.insert(ro_offset, data);
        Self {
            data: map,
            truncate: None,
            object_size,
        }
    }
}

/// What an op must read and what it will write, per shard
#[derive(Clone, Debug, Default)]
pub struct WritePlan {
    pub to_read: ShardExtentSets,
    pub will_write: ShardExtentSets,
    /// Truncates make cached line content unreconstructible
    pub invalidates_cache: bool,
}

impl WritePlan {
    /// Plan a client write against the stripe geometry.
    ///
    /// Data shards get the page-aligned hull of their new bytes in
    /// `will_write`; every coding shard gets the union of those hulls
    /// (the parity recompute interval). `to_read` covers, per data shard,
    /// the parity interval clipped to what exists on disk, minus pages the
    /// client fully overwrites.
    #[must_use]
    pub fn for_write(sinfo: &Arc<StripeInfo>, write: &ClientWrite) -> WritePlan {
        let size_before = write
            .truncate
            .map_or(write.object_size, |t| t.min(write.object_size));

        // Per-shard footprint of the new bytes
        let mut new_data = ShardExtentSets::new();
        for (ro_offset, buf) in write.data.iter() {
            for (shard, eset) in sinfo.ro_range_to_shard_extents(ro_offset, buf.len() as u64) {
                new_data.entry(shard).or_default().union_with(&eset);
            }
        }

        // Data shards write the page-aligned hull of their new bytes
        let mut will_write = ShardExtentSets::new();
        let mut superset = ExtentSet::new();
        for (shard, eset) in &new_data {
            let mut hull = eset.clone();
            hull.align(PAGE_SIZE);
            superset.union_with(&hull);
            will_write.insert(*shard, hull);
        }

        // Every data shard with bytes inside the parity interval feeds the
        // re-encode and must be read, except pages fully replaced by the
        // client and anything past the shard's current end.
        let mut to_read = ShardExtentSets::new();
        for raw in 0..sinfo.k() {
            let raw = RawShardIndex::new(raw as u8);
            let shard = sinfo.shard(raw);
            let shard_end = align_page_next(sinfo.ro_offset_to_shard_offset(size_before, raw));
            if shard_end == 0 {
                continue;
            }
            let existing: ExtentSet = [(0, shard_end)].into_iter().collect();
            let mut need = superset.intersect(&existing);
            if let Some(new) = new_data.get(&shard) {
                for (off, len) in new.iter() {
                    let inner_start = align_page_next(off);
                    let inner_end = align_page_prev(off + len);
                    if inner_end > inner_start {
                        need.erase(inner_start, inner_end - inner_start);
                    }
                }
            }
            if !need.is_empty() {
                need.align(PAGE_SIZE);
                to_read.insert(shard, need.intersect(&existing));
            }
        }

        // Coding shards are rewritten over the whole parity interval
        for raw in sinfo.k()..sinfo.k_plus_m() {
            let shard = sinfo.shard(RawShardIndex::new(raw as u8));
            if !superset.is_empty() {
                will_write.insert(shard, superset.clone());
            }
        }

        let plan = WritePlan {
            to_read,
            will_write,
            invalidates_cache: write.truncate.is_some(),
        };
        trace!(?plan, "write planned");
        plan
    }

    /// Whether the op needs bytes read before it can commit
    #[must_use]
    pub fn requires_rmw(&self) -> bool {
        !self.to_read.is_empty()
    }
}

/// Merge read results with the new bytes, recompute parity, and emit one
/// transaction description per shard.
///
/// Returns the shard-extent map that will be written; its extent sets must
/// equal `plan.will_write`, which the pipeline asserts.
pub fn generate_transactions(
    sinfo: &Arc<StripeInfo>,
    codec: &dyn ErasureCodec,
    write: &ClientWrite,
    plan: &WritePlan,
    read_result: ShardExtentMap,
    hinfo: Option<&HashInfoRef>,
) -> EcResult<(ShardExtentMap, BTreeMap<ShardIndex, ShardTransaction>)> {
    let mut sem = read_result;
    if let Some(truncate_to) = write.truncate {
        sem.erase_after_ro_offset(truncate_to);
    }
    for (ro_offset, buf) in write.data.iter() {
        sem.insert_ro_buffer(ro_offset, buf);
    }

    // Hull bytes neither read nor provided lie past the object's end and
    // read as zero.
    for (shard, hull) in &plan.will_write {
        if !sinfo.is_data_shard(*shard) {
            continue;
        }
        let covered = sem
            .extent_map(*shard)
            .map(|emap| emap.interval_set())
            .unwrap_or_default();
        let mut missing = hull.clone();
        missing.subtract(&covered);
        for (off, len) in missing.iter() {
            sem.insert_in_shard(*shard, off, Bytes::from(vec![0u8; len as usize]));
        }
    }

    sem.insert_parity_buffers();
    sem.encode(codec, hinfo, write.object_size)?;

    let written = sem.intersect(&plan.will_write);

    let mut transactions: BTreeMap<ShardIndex, ShardTransaction> = BTreeMap::new();
    for (&shard, emap) in written.extent_maps() {
        let tx = transactions.entry(shard).or_default();
        for (off, buf) in emap.iter() {
            tx.writes.push((off, buf.clone()));
        }
    }
    if let Some(truncate_to) = write.truncate {
        let shard_len = sinfo.ro_to_next_chunk_offset(truncate_to);
        for raw in 0..sinfo.k_plus_m() {
            let shard = sinfo.shard(RawShardIndex::new(raw as u8));
            transactions.entry(shard).or_default().truncate = Some(shard_len);
        }
    }
    if let Some(hinfo) = hinfo {
        let blob = hinfo.read().encode_blob();
        for tx in transactions.values_mut() {
            tx.attrs.insert(HINFO_KEY.to_string(), blob.clone());
        }
    }

    Ok((written, transactions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PluginFlags;
    use crate::reed_solomon::ReedSolomonCodec;

    const CHUNK: u64 = 4096;

    fn sinfo(k: usize, m: usize) -> Arc<StripeInfo> {
        Arc::new(StripeInfo::new(k, m, CHUNK * k as u64, Vec::new(), PluginFlags::NONE).unwrap())
    }

    fn eset(intervals: &[(u64, u64)]) -> ExtentSet {
        intervals.iter().copied().collect()
    }

    #[test]
    fn test_plan_small_overwrite() {
        // Overwrite [2048, 4096) of a 4096-byte object, k=4 m=2
        let si = sinfo(4, 2);
        let write = ClientWrite::write(2048, Bytes::from(vec![7u8; 2048]), 4096);
        let plan = WritePlan::for_write(&si, &write);

        assert!(plan.requires_rmw());
        assert!(!plan.invalidates_cache);
        // Only shard 0 holds data; it is read over the whole first chunk
        assert_eq!(plan.to_read.len(), 1);
        assert_eq!(plan.to_read[&ShardIndex::new(0)], eset(&[(0, CHUNK)]));
        // Shard 0 and both coding shards are written over [0, 4096)
        assert_eq!(plan.will_write.len(), 3);
        assert_eq!(plan.will_write[&ShardIndex::new(0)], eset(&[(0, CHUNK)]));
        assert_eq!(plan.will_write[&ShardIndex::new(4)], eset(&[(0, CHUNK)]));
        assert_eq!(plan.will_write[&ShardIndex::new(5)], eset(&[(0, CHUNK)]));
    }

    #[test]
    fn test_plan_reads_peer_data_shards_of_touched_stripe() {
        // Same overwrite, but the object spans the full stripe: the other
        // data shards feed the parity recompute.
        let si = sinfo(4, 2);
        let write = ClientWrite::write(2048, Bytes::from(vec![7u8; 2048]), 4 * CHUNK);
        let plan = WritePlan::for_write(&si, &write);

        assert_eq!(plan.to_read.len(), 4);
        for raw in 0..4u8 {
            assert_eq!(plan.to_read[&ShardIndex::new(raw)], eset(&[(0, CHUNK)]));
        }
    }

    #[test]
    fn test_plan_aligned_append_needs_no_reads() {
        let si = sinfo(4, 2);
        let write = ClientWrite::write(0, Bytes::from(vec![7u8; 4 * CHUNK as usize]), 0);
        let plan = WritePlan::for_write(&si, &write);
        assert!(!plan.requires_rmw());
        assert_eq!(plan.will_write.len(), 6);
    }

    #[test]
    fn test_plan_aligned_chunk_overwrite_skips_owned_pages() {
        // Overwriting the whole first chunk: nothing on shard 0 to read,
        // but the sibling data shards still feed the parity recompute.
        let si = sinfo(4, 2);
        let write = ClientWrite::write(0, Bytes::from(vec![7u8; CHUNK as usize]), 4 * CHUNK);
        let plan = WritePlan::for_write(&si, &write);
        assert!(!plan.to_read.contains_key(&ShardIndex::new(0)));
        assert_eq!(plan.to_read.len(), 3);
    }

    #[test]
    fn test_plan_truncate_invalidates_cache() {
        let si = sinfo(4, 2);
        let write = ClientWrite {
            data: ExtentMap::new(),
            truncate: Some(0),
            object_size: 4096,
        };
        let plan = WritePlan::for_write(&si, &write);
        assert!(plan.invalidates_cache);
        assert!(plan.will_write.is_empty());
    }

    #[test]
    fn test_generate_matches_plan() {
        let si = sinfo(4, 2);
        let codec = ReedSolomonCodec::new(4, 2).unwrap();
        let write = ClientWrite::write(2048, Bytes::from(vec![7u8; 2048]), 4096);
        let plan = WritePlan::for_write(&si, &write);

        // Simulate the read the plan asked for
        let mut read_result = ShardExtentMap::new(si.clone());
        read_result.insert_in_shard(ShardIndex::new(0), 0, Bytes::from(vec![3u8; 4096]));

        let (written, transactions) =
            generate_transactions(&si, &codec, &write, &plan, read_result, None).unwrap();

        assert_eq!(written.extent_sets(), plan.will_write);
        // Shard 0's written chunk: old bytes then new bytes
        let buf = written
            .get_buffer(ShardIndex::new(0), 0, CHUNK, false)
            .unwrap();
        assert_eq!(&buf[..2048], &[3u8; 2048][..]);
        assert_eq!(&buf[2048..], &[7u8; 2048][..]);
        // One transaction per written shard, each with one buffer write
        assert_eq!(transactions.len(), 3);
        assert_eq!(transactions[&ShardIndex::new(4)].writes.len(), 1);
    }

    #[test]
    fn test_generate_parity_consistent_with_full_encode() {
        // Parity produced through the RMW path must match encoding the
        // final object contents from scratch.
        let si = sinfo(2, 1);
        let codec = ReedSolomonCodec::new(2, 1).unwrap();

        let old = Bytes::from(vec![3u8; 8192]);
        let write = ClientWrite::write(1024, Bytes::from(vec![9u8; 1024]), 8192);
        let plan = WritePlan::for_write(&si, &write);

        let mut read_result = ShardExtentMap::new(si.clone());
        for (shard, eset) in &plan.to_read {
            for (off, len) in eset.iter() {
                let raw = si.raw_shard(*shard);
                // Shard content of the old object for this extent
                let mut shard_bytes = vec![0u8; len as usize];
                for i in 0..len {
                    let ro = si.shard_offset_to_ro_offset(raw, off + i);
                    shard_bytes[i as usize] = old[ro as usize];
                }
                read_result.insert_in_shard(*shard, off, Bytes::from(shard_bytes));
            }
        }

        let (written, _) =
            generate_transactions(&si, &codec, &write, &plan, read_result, None).unwrap();

        // Build the final object and encode it wholesale
        let mut final_bytes = old.to_vec();
        final_bytes[1024..2048].copy_from_slice(&[9u8; 1024]);
        let mut reference = ShardExtentMap::new(si.clone());
        reference.insert_ro_buffer(0, &Bytes::from(final_bytes));
        reference.insert_parity_buffers();
        reference.encode(&codec, None, 0).unwrap();

        let parity_shard = ShardIndex::new(2);
        let rmw_parity = written
            .get_buffer(parity_shard, 0, CHUNK, false)
            .unwrap();
        let ref_parity = reference
            .get_buffer(parity_shard, 0, CHUNK, false)
            .unwrap();
        assert_eq!(rmw_parity, ref_parity);
    }
}
