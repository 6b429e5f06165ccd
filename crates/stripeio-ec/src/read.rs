//! Read pipeline
//!
//! Plans the minimum set of shards that reconstructs each requested RO
//! range, fans sub-reads out to peers, collects replies, re-plans around
//! failed peers and decodes the survivors into client buffers. Client
//! completions fire strictly in submission order.

use crate::codec::ErasureCodec;
use crate::config::EngineConfig;
use crate::error::{EcError, EcResult};
use crate::extents::{ExtentMap, ExtentSet};
use crate::geometry::{StripeInfo, PAGE_SIZE};
use crate::messages::{ClusterMessage, ReadFlags, ShardExtentSets, ShardReadPlan, SubRead, SubReadReply};
use crate::parent::PgParent;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use stripeio_common::{ObjectId, PgShard, RawShardIndex, ShardIndex, SpgId, Tid};
use tracing::{debug, trace, warn};

/// Default message priority for client reads
const PRIORITY_DEFAULT: u8 = 127;
/// Message priority for recovery reads
const PRIORITY_RECOVERY: u8 = 64;

/// One requested RO range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcAlign {
    pub offset: u64,
    pub size: u64,
    pub flags: ReadFlags,
}

impl EcAlign {
    /// Create an align request with no flags
    #[must_use]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            flags: 0,
        }
    }
}

/// Per-object read request: ranges wanted plus the shard fan-out chosen
#[derive(Clone, Debug, Default)]
pub struct ReadRequest {
    pub to_read: Vec<EcAlign>,
    pub want_attrs: bool,
    pub shard_reads: BTreeMap<PgShard, ShardReadPlan>,
}

/// Per-object accumulation of shard replies
#[derive(Clone, Debug)]
pub struct ReadResult {
    pub result: Result<(), EcError>,
    pub errors: BTreeMap<PgShard, EcError>,
    pub attrs: Option<BTreeMap<String, Bytes>>,
    pub buffers_read: BTreeMap<ShardIndex, ExtentMap>,
}

impl Default for ReadResult {
    fn default() -> Self {
        Self {
            result: Ok(()),
            errors: BTreeMap::new(),
            attrs: None,
            buffers_read: BTreeMap::new(),
        }
    }
}

/// Decoded per-object outcome handed to completions
#[derive(Debug)]
pub struct ObjectReadResult {
    pub result: EcResult<()>,
    /// RO-space buffers for the requested ranges; empty on error
    pub emap: ExtentMap,
    pub attrs: Option<BTreeMap<String, Bytes>>,
}

/// Completion for a batch of client reads
pub type ClientReadCallback = Box<dyn FnOnce(BTreeMap<ObjectId, ObjectReadResult>) + Send>;

/// A finished internal read, routed onward by the engine
#[derive(Debug)]
pub enum InternalReadComplete {
    /// Bytes an RMW op asked for directly (cache bypassed)
    Rmw {
        rmw_tid: Tid,
        oid: ObjectId,
        result: EcResult<ExtentMap>,
    },
    /// Bytes the extent cache asked for
    Cache {
        oid: ObjectId,
        result: EcResult<ExtentMap>,
    },
}

/// Who consumes a read op's results
#[derive(Clone, Copy, Debug)]
pub(crate) enum ReadSink {
    Client { status_id: u64 },
    Rmw { rmw_tid: Tid },
    Cache,
}

/// In-flight read op, indexed by transaction id
pub(crate) struct ReadOp {
    tid: Tid,
    priority: u8,
    do_redundant_reads: bool,
    for_recovery: bool,
    want_to_read: BTreeMap<ObjectId, BTreeSet<RawShardIndex>>,
    to_read: BTreeMap<ObjectId, ReadRequest>,
    complete: BTreeMap<ObjectId, ReadResult>,
    obj_to_source: BTreeMap<ObjectId, BTreeSet<PgShard>>,
    in_progress: BTreeSet<PgShard>,
    sink: ReadSink,
}

struct ClientReadStatus {
    remaining: usize,
    results: BTreeMap<ObjectId, ObjectReadResult>,
    on_complete: Option<ClientReadCallback>,
}

/// The per-PG read pipeline.
pub struct ReadPipeline {
    sinfo: Arc<StripeInfo>,
    codec: Arc<dyn ErasureCodec>,
    config: EngineConfig,
    next_status_id: u64,
    client_reads: VecDeque<(u64, ClientReadStatus)>,
    tid_to_read: HashMap<Tid, ReadOp>,
    shard_to_read: HashMap<PgShard, BTreeSet<Tid>>,
}

impl ReadPipeline {
    /// Create the pipeline
    #[must_use]
    pub fn new(sinfo: Arc<StripeInfo>, codec: Arc<dyn ErasureCodec>, config: EngineConfig) -> Self {
        Self {
            sinfo,
            codec,
            config,
            next_status_id: 0,
            client_reads: VecDeque::new(),
            tid_to_read: HashMap::new(),
            shard_to_read: HashMap::new(),
        }
    }

    /// Number of read ops currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tid_to_read.len()
    }

    /// Per-shard footprint needed to serve a list of RO ranges
    #[must_use]
    pub fn want_shard_reads(&self, to_read: &[EcAlign]) -> ShardExtentSets {
        let mut want = ShardExtentSets::new();
        if self.config.partial_reads && self.sinfo.supports_partial_reads() {
            for align in to_read {
                for (shard, eset) in self.sinfo.ro_range_to_shard_extents(align.offset, align.size)
                {
                    want.entry(shard).or_default().union_with(&eset);
                }
            }
            return want;
        }

        // Non-optimized: whole chunk-aligned rows on every data shard
        for raw in 0..self.sinfo.k() {
            let shard = self.sinfo.shard(RawShardIndex::new(raw as u8));
            let eset = want.entry(shard).or_default();
            for align in to_read {
                let (off, len) = self.sinfo.ro_range_to_chunk_range(align.offset, align.size);
                eset.insert(off, len);
            }
        }
        want
    }

    /// Collect the shards we may read: acting minus errors and missing,
    /// plus backfill and missing-loc peers when recovering
    fn get_all_avail_shards(
        &self,
        parent: &dyn PgParent,
        oid: ObjectId,
        error_shards: &BTreeSet<PgShard>,
        for_recovery: bool,
    ) -> (BTreeSet<ShardIndex>, BTreeMap<ShardIndex, PgShard>) {
        let mut have = BTreeSet::new();
        let mut peers = BTreeMap::new();

        for peer in parent.get_acting_shards() {
            if error_shards.contains(peer) {
                continue;
            }
            if !parent.get_shard_missing(*peer).is_missing(oid) {
                have.insert(peer.shard);
                peers.insert(peer.shard, *peer);
            }
        }

        if for_recovery {
            for peer in parent.get_backfill_shards() {
                if error_shards.contains(peer) || have.contains(&peer.shard) {
                    continue;
                }
                if parent.get_shard_info(*peer).is_backfilled(oid)
                    && !parent.get_shard_missing(*peer).is_missing(oid)
                {
                    have.insert(peer.shard);
                    peers.insert(peer.shard, *peer);
                }
            }
            if let Some(locs) = parent.get_missing_loc_shards().get(&oid) {
                for peer in locs {
                    if error_shards.contains(peer) {
                        continue;
                    }
                    if let Some(missing) = parent.maybe_get_shard_missing(*peer) {
                        debug_assert!(!missing.is_missing(oid));
                    }
                    have.insert(peer.shard);
                    peers.insert(peer.shard, *peer);
                }
            }
        }

        (have, peers)
    }

    /// Choose the actual shard set to read for `want`, growing extents to
    /// the superset where a wanted shard is missing (or always, outside
    /// the experimental mode) and page-aligning the result.
    pub fn get_min_avail_to_read_shards(
        &self,
        parent: &dyn PgParent,
        oid: ObjectId,
        want: &ShardExtentSets,
        for_recovery: bool,
        do_redundant_reads: bool,
        error_shards: &BTreeSet<PgShard>,
    ) -> EcResult<BTreeMap<PgShard, ShardReadPlan>> {
        // Redundant reads re-read everything; recovery must not, or
        // retries would double-read shards.
        assert!(!for_recovery || !do_redundant_reads);

        let (have, peers) = self.get_all_avail_shards(parent, oid, error_shards, for_recovery);
        let have_raw: BTreeSet<RawShardIndex> =
            have.iter().map(|&s| self.sinfo.raw_shard(s)).collect();
        let want_raw: BTreeSet<RawShardIndex> = want
            .iter()
            .filter(|(_, eset)| !eset.is_empty())
            .map(|(&s, _)| self.sinfo.raw_shard(s))
            .collect();

        let mut need = self.codec.minimum_to_decode(&want_raw, &have_raw)?;
        if do_redundant_reads {
            let full = ShardReadPlan::full_subchunks(self.codec.sub_chunk_count());
            need = have_raw.iter().map(|&s| (s, full.clone())).collect();
        }

        // Extents that must be read on every chosen shard: a missing
        // wanted shard forces reconstruction inputs to cover its ranges,
        // and outside the experimental mode every read grows to the
        // superset so a later retry never needs to re-read a shard.
        let mut extra_extents = ExtentSet::new();
        for (shard, eset) in want {
            if eset.is_empty() {
                continue;
            }
            if !have.contains(shard) || do_redundant_reads || !self.config.partial_reads_experimental
            {
                extra_extents.union_with(eset);
            }
        }

        let mut shard_reads = BTreeMap::new();
        for (raw, subchunks) in need {
            let shard = self.sinfo.shard(raw);
            if !have.contains(&shard) {
                continue;
            }
            let mut extents = extra_extents.clone();
            if let Some(eset) = want.get(&shard) {
                extents.union_with(eset);
            }
            extents.align(PAGE_SIZE);
            shard_reads.insert(peers[&shard], ShardReadPlan { extents, subchunks });
        }
        Ok(shard_reads)
    }

    /// Submit a batch of client reads; the completion fires once per
    /// batch, in submission order relative to other batches.
    pub fn objects_read_and_reconstruct(
        &mut self,
        parent: &mut dyn PgParent,
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        fast_read: bool,
        on_complete: ClientReadCallback,
    ) {
        self.start_client_read(parent, reads, fast_read, false, false, on_complete);
    }

    /// The read-side primitive used by recovery: may read from backfill
    /// and missing-loc peers, and fetches object attributes alongside
    pub fn objects_read_and_reconstruct_for_recovery(
        &mut self,
        parent: &mut dyn PgParent,
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        on_complete: ClientReadCallback,
    ) {
        self.start_client_read(parent, reads, false, true, true, on_complete);
    }

    fn start_client_read(
        &mut self,
        parent: &mut dyn PgParent,
        reads: BTreeMap<ObjectId, Vec<EcAlign>>,
        do_redundant_reads: bool,
        for_recovery: bool,
        want_attrs: bool,
        on_complete: ClientReadCallback,
    ) {
        let status_id = self.next_status_id;
        self.next_status_id += 1;
        self.client_reads.push_back((
            status_id,
            ClientReadStatus {
                remaining: reads.len(),
                results: BTreeMap::new(),
                on_complete: Some(on_complete),
            },
        ));
        if reads.is_empty() {
            self.kick_reads();
            return;
        }

        let mut failed: Vec<(ObjectId, EcError)> = Vec::new();
        let mut want_to_read = BTreeMap::new();
        let mut for_read_op = BTreeMap::new();
        let no_errors = BTreeSet::new();

        for (oid, to_read) in reads {
            let want = self.want_shard_reads(&to_read);
            let want_raw: BTreeSet<RawShardIndex> = want
                .keys()
                .map(|&s| self.sinfo.raw_shard(s))
                .collect();

            match self.get_min_avail_to_read_shards(
                parent,
                oid,
                &want,
                for_recovery,
                do_redundant_reads,
                &no_errors,
            ) {
                Ok(shard_reads) => {
                    want_to_read.insert(oid, want_raw);
                    for_read_op.insert(
                        oid,
                        ReadRequest {
                            to_read,
                            want_attrs,
                            shard_reads,
                        },
                    );
                }
                Err(e) => {
                    warn!(%oid, error = %e, "cannot plan read");
                    failed.push((oid, e));
                }
            }
        }

        for (oid, e) in failed {
            self.complete_object(
                status_id,
                oid,
                ObjectReadResult {
                    result: Err(e),
                    emap: ExtentMap::new(),
                    attrs: None,
                },
            );
        }

        if !for_read_op.is_empty() {
            let priority = if for_recovery {
                PRIORITY_RECOVERY
            } else {
                PRIORITY_DEFAULT
            };
            self.start_read_op(
                parent,
                priority,
                want_to_read,
                for_read_op,
                do_redundant_reads,
                for_recovery,
                ReadSink::Client { status_id },
            );
        }
        self.kick_reads();
    }

    /// Start a read op whose decoded results feed the RMW pipeline or the
    /// extent cache instead of a client
    pub(crate) fn start_internal_read(
        &mut self,
        parent: &mut dyn PgParent,
        sink: ReadSink,
        oid: ObjectId,
        to_read: Vec<EcAlign>,
        want: ShardExtentSets,
    ) -> EcResult<()> {
        let want_raw: BTreeSet<RawShardIndex> =
            want.keys().map(|&s| self.sinfo.raw_shard(s)).collect();
        let shard_reads = self.get_min_avail_to_read_shards(
            parent,
            oid,
            &want,
            false,
            false,
            &BTreeSet::new(),
        )?;
        let mut want_to_read = BTreeMap::new();
        want_to_read.insert(oid, want_raw);
        let mut for_read_op = BTreeMap::new();
        for_read_op.insert(
            oid,
            ReadRequest {
                to_read,
                want_attrs: false,
                shard_reads,
            },
        );
        self.start_read_op(
            parent,
            PRIORITY_DEFAULT,
            want_to_read,
            for_read_op,
            false,
            false,
            sink,
        );
        Ok(())
    }

    /// Register the op, batch one sub-read per peer and dispatch
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_read_op(
        &mut self,
        parent: &mut dyn PgParent,
        priority: u8,
        want_to_read: BTreeMap<ObjectId, BTreeSet<RawShardIndex>>,
        to_read: BTreeMap<ObjectId, ReadRequest>,
        do_redundant_reads: bool,
        for_recovery: bool,
        sink: ReadSink,
    ) {
        let tid = parent.get_tid();
        assert!(
            !self.tid_to_read.contains_key(&tid),
            "transaction id {tid} reused"
        );
        let mut op = ReadOp {
            tid,
            priority,
            do_redundant_reads,
            for_recovery,
            want_to_read,
            complete: to_read
                .keys()
                .map(|&oid| (oid, ReadResult::default()))
                .collect(),
            to_read,
            obj_to_source: BTreeMap::new(),
            in_progress: BTreeSet::new(),
            sink,
        };
        debug!(tid, objects = op.to_read.len(), "starting read op");
        self.dispatch_reads(parent, &mut op, None);
        if op.in_progress.is_empty() {
            // Nothing to fetch (every requested range was empty)
            let internal = self.complete_read_op(op);
            debug_assert!(internal.is_empty(), "internal reads always name extents");
            return;
        }
        self.tid_to_read.insert(tid, op);
    }

    /// Send sub-reads for the op's current plan. With `only_objects`,
    /// restrict to those objects (retry path).
    fn dispatch_reads(
        &mut self,
        parent: &mut dyn PgParent,
        op: &mut ReadOp,
        only_objects: Option<&BTreeSet<ObjectId>>,
    ) {
        let mut messages: BTreeMap<PgShard, SubRead> = BTreeMap::new();
        let pgid = parent.get_info().pgid;
        let map_epoch = parent.get_osdmap_epoch();
        let min_epoch = parent.get_interval_start_epoch();
        let from = parent.whoami_shard();

        for (oid, request) in &op.to_read {
            if only_objects.is_some_and(|objs| !objs.contains(oid)) {
                continue;
            }
            let mut need_attrs = request.want_attrs
                && op
                    .complete
                    .get(oid)
                    .map_or(true, |res| res.attrs.as_ref().map_or(true, BTreeMap::is_empty));
            let flags = request.to_read.first().map_or(0, |a| a.flags);

            for (peer, plan) in &request.shard_reads {
                if only_objects.is_some()
                    && op
                        .obj_to_source
                        .get(oid)
                        .is_some_and(|sources| sources.contains(peer))
                {
                    continue; // already read from this peer
                }
                let msg = messages.entry(*peer).or_insert_with(|| SubRead {
                    from,
                    tid: op.tid,
                    pgid: SpgId::new(pgid, peer.shard),
                    map_epoch,
                    min_epoch,
                    priority: op.priority,
                    to_read: BTreeMap::new(),
                    subchunks: BTreeMap::new(),
                    attrs_to_read: BTreeSet::new(),
                });
                if need_attrs {
                    msg.attrs_to_read.insert(*oid);
                    need_attrs = false;
                }
                msg.subchunks.insert(*oid, plan.subchunks.clone());
                let extents = msg.to_read.entry(*oid).or_default();
                for (off, len) in plan.extents.iter() {
                    extents.push((off, len, flags));
                }
                op.obj_to_source.entry(*oid).or_default().insert(*peer);
            }
        }

        let mut batch = Vec::with_capacity(messages.len());
        for (peer, msg) in messages {
            op.in_progress.insert(peer);
            self.shard_to_read.entry(peer).or_default().insert(op.tid);
            batch.push((peer.osd, ClusterMessage::SubRead(msg)));
        }
        if !batch.is_empty() {
            parent.send_cluster_messages(batch, map_epoch);
        }
        trace!(tid = op.tid, peers = op.in_progress.len(), "read dispatched");
    }

    /// Process one peer's reply. Returns completions destined for the RMW
    /// pipeline or the cache; client completions fire inline in
    /// submission order.
    pub fn handle_sub_read_reply(
        &mut self,
        parent: &mut dyn PgParent,
        reply: SubReadReply,
    ) -> Vec<InternalReadComplete> {
        let Some(op) = self.tid_to_read.get_mut(&reply.tid) else {
            warn!(tid = reply.tid, "reply for unknown read op, ignoring");
            return Vec::new();
        };
        let from = reply.from;
        trace!(tid = reply.tid, %from, "sub-read reply");

        for (oid, bufs) in reply.buffers_read {
            let res = op.complete.entry(oid).or_default();
            let emap = res.buffers_read.entry(from.shard).or_default();
            for (off, data) in bufs {
                emap.insert(off, data);
            }
        }
        for (oid, attrs) in reply.attrs_read {
            op.complete.entry(oid).or_default().attrs = Some(attrs);
        }
        for (oid, reason) in reply.errors {
            warn!(tid = reply.tid, %from, %oid, %reason, "sub-read error");
            let res = op.complete.entry(oid).or_default();
            res.errors.insert(from, EcError::PeerRead { peer: from, reason });
            // A failed shard contributes no buffers
            res.buffers_read.remove(&from.shard);
        }

        op.in_progress.remove(&from);
        if let Some(tids) = self.shard_to_read.get_mut(&from) {
            tids.remove(&reply.tid);
        }
        if !op.in_progress.is_empty() {
            return Vec::new();
        }

        // All expected replies are in. An object retries only while the
        // buffers actually read cannot decode what it wants.
        let mut op = self.tid_to_read.remove(&reply.tid).unwrap();
        let mut retry_objects = BTreeSet::new();
        for (&oid, res) in &op.complete {
            if res.errors.is_empty() || res.result.is_err() {
                continue;
            }
            let have_read: BTreeSet<RawShardIndex> = res
                .buffers_read
                .keys()
                .map(|&s| self.sinfo.raw_shard(s))
                .collect();
            let want = op.want_to_read.get(&oid).cloned().unwrap_or_default();
            if self.codec.minimum_to_decode(&want, &have_read).is_err() {
                retry_objects.insert(oid);
            }
        }

        if !retry_objects.is_empty() {
            let mut dispatched = BTreeSet::new();
            for &oid in &retry_objects {
                match self.plan_remaining_reads(parent, &mut op, oid) {
                    Ok(()) => {
                        dispatched.insert(oid);
                    }
                    Err(e) => {
                        let res = op.complete.get_mut(&oid).unwrap();
                        warn!(%oid, error = %e, "no shards left to read");
                        res.result = Err(EcError::io(format!("read failed: {e}")));
                    }
                }
            }
            if !dispatched.is_empty() {
                self.dispatch_reads(parent, &mut op, Some(&dispatched));
            }
            if !op.in_progress.is_empty() {
                self.tid_to_read.insert(op.tid, op);
                return Vec::new();
            }
        }

        self.complete_read_op(op)
    }

    /// Re-plan a failed object: pick replacement shards over the
    /// remaining peers and extend the op's request.
    ///
    /// A shard that was already read is never re-read; the superset
    /// expansion guarantees its buffers suffice. Replacement shards read
    /// the full chunk-aligned hull with the full sub-chunk range.
    fn plan_remaining_reads(
        &self,
        parent: &dyn PgParent,
        op: &mut ReadOp,
        oid: ObjectId,
    ) -> EcResult<()> {
        let res = &op.complete[&oid];
        let error_shards: BTreeSet<PgShard> = res.errors.keys().copied().collect();
        let already_read: BTreeSet<ShardIndex> = op
            .obj_to_source
            .get(&oid)
            .map(|peers| peers.iter().map(|p| p.shard).collect())
            .unwrap_or_default();

        let (have, peers) =
            self.get_all_avail_shards(parent, oid, &error_shards, op.for_recovery);
        let want_raw = op.want_to_read.get(&oid).cloned().unwrap_or_default();
        let have_raw: BTreeSet<RawShardIndex> =
            have.iter().map(|&s| self.sinfo.raw_shard(s)).collect();
        let need = self.codec.minimum_to_decode(&want_raw, &have_raw)?;

        let full = ShardReadPlan::full_subchunks(self.codec.sub_chunk_count());
        let request = op.to_read.get_mut(&oid).unwrap();
        let mut new_shards = 0;
        for raw in need.keys() {
            let shard = self.sinfo.shard(*raw);
            if already_read.contains(&shard) {
                continue;
            }
            let peer = peers[&shard];
            let mut extents = ExtentSet::new();
            for align in &request.to_read {
                let (off, len) = self.sinfo.ro_range_to_chunk_range(align.offset, align.size);
                extents.insert(off, len);
            }
            extents.align(PAGE_SIZE);
            request.shard_reads.insert(
                peer,
                ShardReadPlan {
                    extents,
                    subchunks: full.clone(),
                },
            );
            new_shards += 1;
        }
        if new_shards == 0 {
            return Err(EcError::InsufficientShards {
                available: have.len(),
                required: self.sinfo.k(),
            });
        }
        Ok(())
    }

    /// Decode every object and deliver to the op's sink
    fn complete_read_op(&mut self, mut op: ReadOp) -> Vec<InternalReadComplete> {
        debug!(
            tid = op.tid,
            redundant = op.do_redundant_reads,
            recovery = op.for_recovery,
            "completing read op"
        );
        let mut internal = Vec::new();
        let objects: Vec<ObjectId> = op.to_read.keys().copied().collect();

        for oid in objects {
            let request = op.to_read.remove(&oid).unwrap();
            let res = op.complete.remove(&oid).unwrap_or_default();
            let wanted = op.want_to_read.remove(&oid).unwrap_or_default();
            let outcome = self.finish_single_request(&request, res, &wanted);
            match op.sink {
                ReadSink::Client { status_id } => {
                    self.complete_object(status_id, oid, outcome);
                }
                ReadSink::Rmw { rmw_tid } => {
                    internal.push(InternalReadComplete::Rmw {
                        rmw_tid,
                        oid,
                        result: outcome.result.map(|()| outcome.emap),
                    });
                }
                ReadSink::Cache => {
                    internal.push(InternalReadComplete::Cache {
                        oid,
                        result: outcome.result.map(|()| outcome.emap),
                    });
                }
            }
        }
        self.kick_reads();
        internal
    }

    /// Decode one object's shard buffers into an RO extent map
    fn finish_single_request(
        &self,
        request: &ReadRequest,
        res: ReadResult,
        _wanted: &BTreeSet<RawShardIndex>,
    ) -> ObjectReadResult {
        if let Err(e) = res.result {
            return ObjectReadResult {
                result: Err(e),
                emap: ExtentMap::new(),
                attrs: res.attrs,
            };
        }

        let mut emap = ExtentMap::new();
        for align in &request.to_read {
            match self.decode_range(align, &res.buffers_read) {
                Ok(buf) => emap.insert(align.offset, buf),
                Err(e) => {
                    warn!(error = %e, "decode failed");
                    return ObjectReadResult {
                        result: Err(e),
                        emap: ExtentMap::new(),
                        attrs: res.attrs,
                    };
                }
            }
        }
        ObjectReadResult {
            result: Ok(()),
            emap,
            attrs: res.attrs,
        }
    }

    /// Decode one RO range chunk window by chunk window
    fn decode_range(
        &self,
        align: &EcAlign,
        buffers_read: &BTreeMap<ShardIndex, ExtentMap>,
    ) -> EcResult<Bytes> {
        if align.size == 0 {
            return Ok(Bytes::new());
        }
        let chunk_size = self.sinfo.chunk_size();
        let width = self.sinfo.stripe_width();
        let k = self.sinfo.k() as u64;

        let (aligned_off, aligned_len) = self.sinfo.range_to_page_bounds(align.offset, align.size);
        let (chunk_off, chunk_len) = self.sinfo.range_to_chunk_bounds(align.offset, align.size);

        let mut out = bytes::BytesMut::new();
        let mut raw = (aligned_off / chunk_size) % k;
        let mut chunk_offset = chunk_off;
        while chunk_offset < chunk_off + chunk_len {
            let shard = self.sinfo.shard(RawShardIndex::new(raw as u8));

            let sub_off = chunk_offset.max(aligned_off);
            let sub_end = (chunk_offset + chunk_size).min(aligned_off + aligned_len);
            if sub_off < sub_end {
                let sub_shard_off = (chunk_offset / width) * chunk_size + (sub_off - chunk_offset);
                let sub_len = sub_end - sub_off;

                let mut chunks: BTreeMap<RawShardIndex, Bytes> = BTreeMap::new();
                if let Some(buf) = buffers_read
                    .get(&shard)
                    .and_then(|emap| emap.get(sub_shard_off, sub_len))
                {
                    // The wanted shard was read; decode is identity
                    chunks.insert(self.sinfo.raw_shard(shard), buf);
                } else {
                    // Reconstruct from whichever shards cover the window
                    for (&other, emap) in buffers_read {
                        if let Some(buf) = emap.get(sub_shard_off, sub_len) {
                            chunks.insert(self.sinfo.raw_shard(other), buf);
                        }
                    }
                }

                let mut want = BTreeSet::new();
                want.insert(self.sinfo.raw_shard(shard));
                let decoded = self.codec.decode_concat(&want, &chunks)?;
                out.extend_from_slice(&decoded);
            }

            chunk_offset += chunk_size;
            raw += 1;
            if raw == k {
                raw = 0;
            }
        }

        // Trim the page-aligned decode down to the requested range
        let skip = (align.offset - aligned_off) as usize;
        if skip > out.len() {
            return Err(EcError::io("short read"));
        }
        let take = (align.size as usize).min(out.len() - skip);
        if (take as u64) < align.size {
            return Err(EcError::io("short read"));
        }
        Ok(out.freeze().slice(skip..skip + take))
    }

    fn complete_object(&mut self, status_id: u64, oid: ObjectId, outcome: ObjectReadResult) {
        if let Some((_, status)) = self
            .client_reads
            .iter_mut()
            .find(|(id, _)| *id == status_id)
        {
            status.results.insert(oid, outcome);
            status.remaining -= 1;
        }
        self.kick_reads();
    }

    /// Fire finished client completions, strictly in submission order
    fn kick_reads(&mut self) {
        while let Some((_, status)) = self.client_reads.front_mut() {
            if status.remaining > 0 {
                break;
            }
            let results = std::mem::take(&mut status.results);
            let cb = status.on_complete.take();
            self.client_reads.pop_front();
            if let Some(cb) = cb {
                cb(results);
            }
        }
    }

    /// Membership change: drop every in-flight op and pending completion
    pub fn on_change(&mut self) {
        for op in self.tid_to_read.values() {
            debug!(tid = op.tid, "cancelling read op");
        }
        self.tid_to_read.clear();
        self.shard_to_read.clear();
        self.client_reads.clear();
    }
}
