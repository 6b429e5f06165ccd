//! Engine facade
//!
//! `EcEngine` owns the two pipelines, the extent cache and the hash-info
//! registry, and routes everything between them: peer replies enter here,
//! cache misses become reconstruction reads, and read completions feed the
//! RMW pipeline until it reaches a fixed point. The parent drives every
//! entry point under its PG lock.

use crate::cache::ExtentCache;
use crate::codec::ErasureCodec;
use crate::config::EngineConfig;
use crate::error::EcResult;
use crate::extents::{ExtentMap, ExtentSet};
use crate::geometry::StripeInfo;
use crate::hash::{HashInfoRef, HashInfoRegistry};
use crate::messages::{ShardExtentSets, SubReadReply, SubWriteReply};
use crate::parent::PgParent;
use crate::plan::{ClientWrite, WritePlan};
use crate::read::{ClientReadCallback, EcAlign, InternalReadComplete, ReadPipeline, ReadSink};
use crate::rmw::{OnWrite, RmwEffect, RmwOp, RmwPipeline};
use crate::shard_map::ShardExtentMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use stripeio_common::{ObjectId, ReqId, Version};
use tracing::{info, warn};

/// The per-placement-group erasure-coding I/O engine.
pub struct EcEngine<P: PgParent> {
    parent: P,
    sinfo: Arc<StripeInfo>,
    codec: Arc<dyn ErasureCodec>,
    reads: ReadPipeline,
    rmw: RmwPipeline,
    cache: ExtentCache,
    registry: Arc<HashInfoRegistry>,
}

impl<P: PgParent> EcEngine<P> {
    /// Build an engine from a codec and the pool's stripe width
    pub fn new(
        parent: P,
        codec: Arc<dyn ErasureCodec>,
        stripe_width: u64,
        config: EngineConfig,
    ) -> EcResult<Self> {
        let sinfo = Arc::new(StripeInfo::from_codec(codec.as_ref(), stripe_width)?);
        info!(
            k = sinfo.k(),
            m = sinfo.m(),
            chunk_size = sinfo.chunk_size(),
            "erasure engine starting"
        );
        Ok(Self {
            reads: ReadPipeline::new(sinfo.clone(), codec.clone(), config.clone()),
            rmw: RmwPipeline::new(sinfo.clone(), codec.clone()),
            cache: ExtentCache::new(sinfo.clone(), config.cache_max_bytes),
            registry: Arc::new(HashInfoRegistry::new()),
            parent,
            sinfo,
            codec,
        })
    }

    /// Stripe parameters
    #[must_use]
    pub fn stripe_info(&self) -> &Arc<StripeInfo> {
        &self.sinfo
    }

    /// The codec in use
    #[must_use]
    pub fn codec(&self) -> &Arc<dyn ErasureCodec> {
        &self.codec
    }

    /// Shared hash-info registry
    #[must_use]
    pub fn hash_registry(&self) -> &Arc<HashInfoRegistry> {
        &self.registry
    }

    /// The parent this engine serves
    pub fn parent(&self) -> &P {
        &self.parent
    }

    /// Mutable access to the parent
    pub fn parent_mut(&mut self) -> &mut P {
        &mut self.parent
    }

    /// Highest committed op version
    #[must_use]
    pub fn committed_to(&self) -> Version {
        self.rmw.committed_to()
    }

    /// Highest PG-committed-to observed
    #[must_use]
    pub fn completed_to(&self) -> Version {
        self.rmw.completed_to()
    }

    /// Resident cache bytes
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.cache.size()
    }

    /// Number of pinned cache lines
    #[must_use]
    pub fn pinned_line_count(&self) -> usize {
        self.cache.pinned_line_count()
    }

    /// Whether no write op is queued against an object; the parent uses
    /// this for trim decisions
    #[must_use]
    pub fn cache_idle(&self, oid: ObjectId) -> bool {
        self.cache.idle(oid)
    }

    /// Number of write ops owned by the pipeline
    #[must_use]
    pub fn queued_write_ops(&self) -> usize {
        self.rmw.queued_ops()
    }

    /// Number of in-flight read ops
    #[must_use]
    pub fn in_flight_reads(&self) -> usize {
        self.reads.in_flight()
    }

    /// Submit client reads; the completion fires in submission order
    /// relative to other read batches
    pub fn objects_read_and_reconstruct(
        &mut self,
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        fast_read: bool,
        on_complete: ClientReadCallback,
    ) {
        self.reads
            .objects_read_and_reconstruct(&mut self.parent, reads, fast_read, on_complete);
    }

    /// The read primitive used by recovery: also consults backfill and
    /// missing-loc peers and fetches attributes
    pub fn objects_read_and_reconstruct_for_recovery(
        &mut self,
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        on_complete: ClientReadCallback,
    ) {
        self.reads
            .objects_read_and_reconstruct_for_recovery(&mut self.parent, reads, on_complete);
    }

    /// Plan a client write into an op ready for `start_rmw`
    pub fn prepare_write(
        &mut self,
        oid: ObjectId,
        version: Version,
        trim_to: Version,
        pg_committed_to: Version,
        reqid: ReqId,
        write: ClientWrite,
        hinfo: Option<HashInfoRef>,
    ) -> RmwOp {
        let tid = self.parent.get_tid();
        let plan = WritePlan::for_write(&self.sinfo, &write);
        RmwOp::new_write(
            tid,
            oid,
            version,
            trim_to,
            pg_committed_to,
            reqid,
            plan,
            write,
            hinfo,
        )
    }

    /// Enqueue a write op and drive the pipeline
    pub fn start_rmw(&mut self, op: RmwOp) {
        let effects = self.rmw.start_rmw(op, &mut self.parent, &mut self.cache);
        self.drive(effects);
    }

    /// Attach a callback ordered after every currently queued write
    pub fn call_write_ordered(&mut self, cb: OnWrite) {
        self.rmw.call_write_ordered(cb);
    }

    /// A peer (or the local store) answered a sub-read
    pub fn handle_sub_read_reply(&mut self, reply: SubReadReply) {
        let completions = self.reads.handle_sub_read_reply(&mut self.parent, reply);
        let mut effects = Vec::new();
        for completion in completions {
            match completion {
                InternalReadComplete::Rmw { rmw_tid, oid, result } => {
                    let converted = result.map(|emap| self.ro_map_to_shard_map(oid, &emap));
                    self.rmw.op_read_complete(rmw_tid, converted);
                }
                InternalReadComplete::Cache { oid, result } => match result {
                    Ok(emap) => {
                        let sem = self.ro_map_to_shard_map(oid, &emap);
                        let events = self.cache.read_done(oid, sem);
                        self.rmw.absorb_cache_events(events, &mut effects);
                    }
                    Err(e) => {
                        // The uncovered footprint stays in `reading`; the
                        // waiting op is replayed after membership change.
                        warn!(%oid, error = %e, "cache backend read failed");
                    }
                },
            }
        }
        effects.extend(self.rmw.check_ops(&mut self.parent, &mut self.cache));
        self.drive(effects);
    }

    /// A peer (or the local store) acknowledged a sub-write
    pub fn handle_sub_write_reply(&mut self, reply: SubWriteReply) {
        self.rmw.handle_sub_write_reply(reply);
        let effects = self.rmw.check_ops(&mut self.parent, &mut self.cache);
        self.drive(effects);
    }

    /// Membership change: cancel all in-flight work and reset state
    pub fn on_change(&mut self) {
        info!("membership change: resetting engine");
        self.reads.on_change();
        self.rmw.on_change(&mut self.cache);
    }

    /// Turn pipeline effects into dispatched reads
    fn drive(&mut self, effects: Vec<RmwEffect>) {
        for effect in effects {
            let (sink, oid, want) = match effect {
                RmwEffect::CacheBackendRead { oid, want } => (ReadSink::Cache, oid, want),
                RmwEffect::OpRead { tid, oid, want } => (ReadSink::Rmw { rmw_tid: tid }, oid, want),
            };
            let aligns = self.shard_want_to_aligns(&want);
            if let Err(e) =
                self.reads
                    .start_internal_read(&mut self.parent, sink, oid, aligns, want)
            {
                // No decodable shard set right now; the op stays parked
                // until membership change replays it.
                warn!(%oid, error = %e, "cannot plan rmw read");
            }
        }
    }

    /// Convert a per-shard read footprint into the RO ranges that produce
    /// it, so missing shards can be served by reconstruction
    fn shard_want_to_aligns(&self, want: &ShardExtentSets) -> Vec<EcAlign> {
        let chunk_size = self.sinfo.chunk_size();
        let mut ro_set = ExtentSet::new();
        for (&shard, eset) in want {
            let raw = self.sinfo.raw_shard(shard);
            debug_assert!(self.sinfo.is_data_shard(shard));
            for (off, len) in eset.iter() {
                // Each chunk row of the extent maps to one contiguous RO run
                let mut pos = off;
                while pos < off + len {
                    let row_end = (pos - pos % chunk_size) + chunk_size;
                    let next = row_end.min(off + len);
                    let ro = self.sinfo.shard_offset_to_ro_offset(raw, pos);
                    ro_set.insert(ro, next - pos);
                    pos = next;
                }
            }
        }
        ro_set
            .iter()
            .map(|(off, len)| EcAlign::new(off, len))
            .collect()
    }

    /// Distribute an RO-space read result back over shards
    fn ro_map_to_shard_map(&self, _oid: ObjectId, emap: &ExtentMap) -> ShardExtentMap {
        let mut sem = ShardExtentMap::new(self.sinfo.clone());
        for (ro_offset, buf) in emap.iter() {
            sem.insert_ro_buffer(ro_offset, buf);
        }
        sem
    }
}
