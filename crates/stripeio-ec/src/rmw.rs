//! Read-modify-write pipeline
//!
//! Serializes overlapping writes per object through three FIFO stages:
//! `waiting_state` (just arrived), `waiting_reads` (reads issued),
//! `waiting_commit` (sub-writes dispatched). `check_ops` drives the three
//! try-advance steps to a fixed point; every external event (cache ready,
//! read completion, sub-write ack) re-enters through it. All of this runs
//! under the parent's PG lock.

use crate::cache::{CacheEvent, ExtentCache};
use crate::codec::ErasureCodec;
use crate::error::EcError;
use crate::geometry::StripeInfo;
use crate::hash::HashInfoRef;
use crate::messages::{
    ClusterMessage, LogEntry, ShardExtentSets, ShardTransaction, SubWrite, SubWriteReply,
};
use crate::parent::PgParent;
use crate::plan::{generate_transactions, ClientWrite, WritePlan};
use crate::shard_map::ShardExtentMap;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use stripeio_common::{DeltaStats, ObjectId, PgShard, ReqId, SpgId, Tid, Version};
use tracing::{debug, trace, warn};

/// Whether the pipeline may consult the extent cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    CacheValid,
    CacheInvalid,
}

impl PipelineState {
    fn caching_enabled(self) -> bool {
        self == Self::CacheValid
    }

    fn cache_invalid(self) -> bool {
        self == Self::CacheInvalid
    }
}

/// The payload of an op: a real client write, or a transaction-empty
/// rollforward carrying only `pg_committed_to`
#[derive(Debug)]
pub enum WriteKind {
    Write(ClientWrite),
    Rollforward,
}

/// Callback fired when an op's sub-writes have been dispatched
pub type OnWrite = Box<dyn FnOnce() + Send>;

/// One queued write op
pub struct RmwOp {
    pub tid: Tid,
    pub oid: ObjectId,
    pub version: Version,
    pub trim_to: Version,
    pub pg_committed_to: Version,
    pub reqid: ReqId,
    pub plan: WritePlan,
    pub write: WriteKind,
    pub log_entries: Vec<LogEntry>,
    pub temp_added: BTreeSet<ObjectId>,
    pub temp_cleared: BTreeSet<ObjectId>,
    pub delta_stats: DeltaStats,
    pub hit_set_history: Option<Bytes>,
    pub hinfo: Option<HashInfoRef>,

    using_cache: bool,
    cache_pending: bool,
    cache_result: Option<ShardExtentMap>,
    remote_read_pending: bool,
    remote_read_result: Option<ShardExtentMap>,
    pending_apply: BTreeSet<PgShard>,
    pending_commit: BTreeSet<PgShard>,
    on_write: Vec<OnWrite>,
}

impl RmwOp {
    /// Build a client write op
    #[allow(clippy::too_many_arguments)]
    pub fn new_write(
        tid: Tid,
        oid: ObjectId,
        version: Version,
        trim_to: Version,
        pg_committed_to: Version,
        reqid: ReqId,
        plan: WritePlan,
        write: ClientWrite,
        hinfo: Option<HashInfoRef>,
    ) -> Self {
        Self {
            tid,
            oid,
            version,
            trim_to,
            pg_committed_to,
            reqid,
            plan,
            write: WriteKind::Write(write),
            log_entries: Vec::new(),
            temp_added: BTreeSet::new(),
            temp_cleared: BTreeSet::new(),
            delta_stats: DeltaStats::default(),
            hit_set_history: None,
            hinfo,
            using_cache: true,
            cache_pending: false,
            cache_result: None,
            remote_read_pending: false,
            remote_read_result: None,
            pending_apply: BTreeSet::new(),
            pending_commit: BTreeSet::new(),
            on_write: Vec::new(),
        }
    }

    fn rollforward(tid: Tid, oid: ObjectId, trim_to: Version, pg_committed_to: Version, reqid: ReqId) -> Self {
        Self {
            tid,
            oid,
            version: Version::default(),
            trim_to,
            pg_committed_to,
            reqid,
            plan: WritePlan::default(),
            write: WriteKind::Rollforward,
            log_entries: Vec::new(),
            temp_added: BTreeSet::new(),
            temp_cleared: BTreeSet::new(),
            delta_stats: DeltaStats::default(),
            hit_set_history: None,
            hinfo: None,
            using_cache: false,
            cache_pending: false,
            cache_result: None,
            remote_read_pending: false,
            remote_read_result: None,
            pending_apply: BTreeSet::new(),
            pending_commit: BTreeSet::new(),
            on_write: Vec::new(),
        }
    }

    fn requires_rmw(&self) -> bool {
        self.plan.requires_rmw()
    }

    fn invalidates_cache(&self) -> bool {
        self.plan.invalidates_cache
    }

    fn read_in_progress(&self) -> bool {
        self.cache_pending || self.remote_read_pending
    }

    fn write_in_progress(&self) -> bool {
        !self.pending_apply.is_empty() || !self.pending_commit.is_empty()
    }
}

/// Work `check_ops` needs the engine to carry out
#[derive(Debug)]
pub enum RmwEffect {
    /// The cache wants these shard extents read and fed to `read_done`
    CacheBackendRead { oid: ObjectId, want: ShardExtentSets },
    /// A non-cached op wants these shard extents read into itself
    OpRead {
        tid: Tid,
        oid: ObjectId,
        want: ShardExtentSets,
    },
}

/// The per-PG write pipeline.
pub struct RmwPipeline {
    sinfo: Arc<StripeInfo>,
    codec: Arc<dyn ErasureCodec>,
    waiting_state: VecDeque<Tid>,
    waiting_reads: VecDeque<Tid>,
    waiting_commit: VecDeque<Tid>,
    tid_to_op: HashMap<Tid, RmwOp>,
    pipeline_state: PipelineState,
    /// Highest PG-committed-to observed
    completed_to: Version,
    /// Highest op version committed
    committed_to: Version,
}

impl RmwPipeline {
    /// Create the pipeline
    #[must_use]
    pub fn new(sinfo: Arc<StripeInfo>, codec: Arc<dyn ErasureCodec>) -> Self {
        Self {
            sinfo,
            codec,
            waiting_state: VecDeque::new(),
            waiting_reads: VecDeque::new(),
            waiting_commit: VecDeque::new(),
            tid_to_op: HashMap::new(),
            pipeline_state: PipelineState::default(),
            completed_to: Version::default(),
            committed_to: Version::default(),
        }
    }

    /// Highest PG-committed-to observed
    #[must_use]
    pub fn completed_to(&self) -> Version {
        self.completed_to
    }

    /// Highest op version committed
    #[must_use]
    pub fn committed_to(&self) -> Version {
        self.committed_to
    }

    /// Current cache validity
    #[must_use]
    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline_state
    }

    /// Number of ops the pipeline owns
    #[must_use]
    pub fn queued_ops(&self) -> usize {
        self.tid_to_op.len()
    }

    /// Enqueue a write op and drive the pipeline
    pub fn start_rmw(
        &mut self,
        op: RmwOp,
        parent: &mut dyn PgParent,
        cache: &mut ExtentCache,
    ) -> Vec<RmwEffect> {
        debug!(tid = op.tid, oid = %op.oid, version = %op.version, "start rmw");
        assert!(
            !self.tid_to_op.contains_key(&op.tid),
            "transaction id {} reused",
            op.tid
        );
        self.waiting_state.push_back(op.tid);
        self.tid_to_op.insert(op.tid, op);
        self.check_ops(parent, cache)
    }

    /// Drive the three stages to a fixed point
    pub fn check_ops(&mut self, parent: &mut dyn PgParent, cache: &mut ExtentCache) -> Vec<RmwEffect> {
        let mut effects = Vec::new();
        loop {
            let progressed = self.try_state_to_reads(parent, cache, &mut effects)
                || self.try_reads_to_commit(parent, cache, &mut effects)
                || self.try_finish_rmw(parent, cache);
            if !progressed {
                break;
            }
        }
        effects
    }

    /// Route cache events: readiness lands in the owning op, backend
    /// reads bubble up to the engine
    pub(crate) fn absorb_cache_events(&mut self, events: Vec<CacheEvent>, effects: &mut Vec<RmwEffect>) {
        for event in events {
            match event {
                CacheEvent::Ready { tid, result, .. } => {
                    if let Some(op) = self.tid_to_op.get_mut(&tid) {
                        op.cache_pending = false;
                        op.cache_result = Some(result);
                    }
                }
                CacheEvent::BackendRead { oid, want } => {
                    effects.push(RmwEffect::CacheBackendRead { oid, want });
                }
            }
        }
    }

    fn try_state_to_reads(
        &mut self,
        parent: &mut dyn PgParent,
        cache: &mut ExtentCache,
        effects: &mut Vec<RmwEffect>,
    ) -> bool {
        let Some(&tid) = self.waiting_state.front() else {
            return false;
        };
        let op = self.tid_to_op.get_mut(&tid).expect("queued op exists");

        if op.requires_rmw() {
            // Partial overwrites only exist on pools that opted in
            assert!(parent.get_pool().allows_ec_overwrites);
            if self.pipeline_state.cache_invalid() {
                trace!(tid, "blocked: requires rmw while cache invalid");
                return false;
            }
        }

        if !self.pipeline_state.caching_enabled() {
            op.using_cache = false;
        } else if op.invalidates_cache() {
            debug!(tid, "op invalidates cache");
            self.pipeline_state = PipelineState::CacheInvalid;
        }
        if matches!(op.write, WriteKind::Rollforward) {
            op.using_cache = false;
        }

        self.waiting_state.pop_front();
        self.waiting_reads.push_back(tid);

        if op.using_cache {
            op.cache_pending = true;
            let events = cache.request(
                tid,
                op.oid,
                Some(op.plan.to_read.clone()),
                op.plan.will_write.clone(),
            );
            self.absorb_cache_events(events, effects);
        } else if op.requires_rmw() {
            op.remote_read_pending = true;
            effects.push(RmwEffect::OpRead {
                tid,
                oid: op.oid,
                want: op.plan.to_read.clone(),
            });
        }
        true
    }

    fn try_reads_to_commit(
        &mut self,
        parent: &mut dyn PgParent,
        cache: &mut ExtentCache,
        effects: &mut Vec<RmwEffect>,
    ) -> bool {
        let Some(&tid) = self.waiting_reads.front() else {
            return false;
        };
        if self.tid_to_op[&tid].read_in_progress() {
            return false;
        }
        self.waiting_reads.pop_front();
        self.waiting_commit.push_back(tid);

        let mut op = self.tid_to_op.remove(&tid).expect("queued op exists");
        debug!(tid, oid = %op.oid, "starting commit");

        parent.apply_stats(op.oid, &op.delta_stats);

        // Merge cache-supplied bytes with remotely read ones
        let mut read_result = op
            .remote_read_result
            .take()
            .unwrap_or_else(|| ShardExtentMap::new(self.sinfo.clone()));
        if let Some(cached) = op.cache_result.take() {
            read_result.insert(&cached);
        }

        let (written, transactions) = match &op.write {
            WriteKind::Write(write) => {
                let (written, transactions) = generate_transactions(
                    &self.sinfo,
                    self.codec.as_ref(),
                    write,
                    &op.plan,
                    read_result,
                    op.hinfo.as_ref(),
                )
                .unwrap_or_else(|e| panic!("transaction generation failed for tid {tid}: {e}"));
                (written, transactions)
            }
            WriteKind::Rollforward => (
                ShardExtentMap::new(self.sinfo.clone()),
                std::collections::BTreeMap::new(),
            ),
        };

        // The plan is a promise; a mismatch is a bug, not a runtime state
        assert_eq!(
            written.extent_sets(),
            op.plan.will_write,
            "written set diverged from plan for tid {tid}"
        );

        if op.using_cache {
            let events = cache.write_done(tid, op.oid, written);
            self.absorb_cache_events(events, effects);
        }

        let from = parent.whoami_shard();
        let pgid = parent.primary_pgid();
        let map_epoch = parent.get_osdmap_epoch();
        let min_epoch = parent.get_interval_start_epoch();
        let peers: Vec<PgShard> = parent
            .get_acting_recovery_backfill_shards()
            .iter()
            .copied()
            .collect();

        let mut messages = Vec::new();
        let mut local_write = None;
        for peer in peers {
            op.pending_apply.insert(peer);
            op.pending_commit.insert(peer);
            let should_send = parent.should_send_op(peer, op.oid);
            let transaction = if should_send {
                transactions.get(&peer.shard).cloned().unwrap_or_default()
            } else {
                ShardTransaction::default()
            };
            let sub_write = SubWrite {
                from,
                tid,
                pgid: SpgId::new(pgid, peer.shard),
                map_epoch,
                min_epoch,
                reqid: op.reqid,
                oid: op.oid,
                stats: op.delta_stats,
                transaction,
                version: op.version,
                trim_to: op.trim_to,
                pg_committed_to: op.pg_committed_to,
                log_entries: op.log_entries.clone(),
                hit_set_history: op.hit_set_history.clone(),
                temp_added: op.temp_added.clone(),
                temp_cleared: op.temp_cleared.clone(),
                stats_only: !should_send,
            };
            if peer == from {
                local_write = Some(sub_write);
            } else {
                messages.push((peer.osd, ClusterMessage::SubWrite(sub_write)));
            }
        }
        if !messages.is_empty() {
            parent.send_cluster_messages(messages, map_epoch);
        }
        if let Some(sub_write) = local_write {
            parent.submit_local_transaction(sub_write);
        }

        for cb in op.on_write.drain(..) {
            cb();
        }
        self.tid_to_op.insert(tid, op);
        true
    }

    fn try_finish_rmw(&mut self, parent: &mut dyn PgParent, cache: &mut ExtentCache) -> bool {
        let Some(&tid) = self.waiting_commit.front() else {
            return false;
        };
        if self.tid_to_op[&tid].write_in_progress() {
            return false;
        }
        self.waiting_commit.pop_front();
        let op = self.tid_to_op.remove(&tid).expect("queued op exists");
        debug!(tid, oid = %op.oid, version = %op.version, "rmw finished");

        if op.pg_committed_to > self.completed_to {
            self.completed_to = op.pg_committed_to;
        }
        if op.version > self.committed_to {
            self.committed_to = op.version;
        }

        if matches!(op.write, WriteKind::Write(_))
            && op.version > parent.log_can_rollback_to()
            && self.waiting_reads.is_empty()
            && self.waiting_commit.is_empty()
        {
            // Nothing behind this op will advance pg_committed_to; kick
            // the rollforward with a transaction-empty op.
            let nop_tid = parent.get_tid();
            debug!(tid = nop_tid, "queueing rollforward op");
            let nop = RmwOp::rollforward(nop_tid, op.oid, op.trim_to, op.version, op.reqid);
            self.waiting_reads.push_back(nop_tid);
            self.tid_to_op.insert(nop_tid, nop);
        }

        if op.using_cache {
            cache.complete(op.oid, &op.plan.will_write);
        }

        if self.waiting_reads.is_empty() && self.waiting_commit.is_empty() {
            if self.pipeline_state.cache_invalid() {
                // Invalidating ops wrote around the cache; nothing is
                // pinned once the queues drain, so drop the stale bytes.
                cache.on_change();
            }
            self.pipeline_state = PipelineState::CacheValid;
        }
        true
    }

    /// Deliver a finished op-owned remote read
    pub fn op_read_complete(&mut self, tid: Tid, result: Result<ShardExtentMap, EcError>) {
        let Some(op) = self.tid_to_op.get_mut(&tid) else {
            warn!(tid, "read completion for unknown op");
            return;
        };
        match result {
            Ok(sem) => {
                match op.remote_read_result.as_mut() {
                    Some(existing) => existing.insert(&sem),
                    None => op.remote_read_result = Some(sem),
                }
                op.remote_read_pending = false;
            }
            Err(e) => {
                // The op stays parked in waiting_reads until membership
                // change replays it.
                warn!(tid, error = %e, "rmw read failed; op parked");
            }
        }
    }

    /// Sub-write acknowledgment from a peer (or the local store)
    pub fn handle_sub_write_reply(&mut self, reply: SubWriteReply) {
        let Some(op) = self.tid_to_op.get_mut(&reply.tid) else {
            trace!(tid = reply.tid, "stale sub-write reply");
            return;
        };
        if reply.applied {
            op.pending_apply.remove(&reply.from);
        }
        if reply.committed {
            op.pending_commit.remove(&reply.from);
        }
    }

    /// Attach a callback ordered after every currently queued write
    pub fn call_write_ordered(&mut self, cb: OnWrite) {
        let newest = self
            .waiting_state
            .back()
            .or_else(|| self.waiting_reads.back());
        match newest {
            Some(&tid) => {
                self.tid_to_op
                    .get_mut(&tid)
                    .expect("queued op exists")
                    .on_write
                    .push(cb);
            }
            None => cb(),
        }
    }

    /// Membership change: drop every op, release every pin, reset state
    pub fn on_change(&mut self, cache: &mut ExtentCache) {
        debug!(dropped = self.tid_to_op.len(), "rmw pipeline reset");
        self.waiting_state.clear();
        self.waiting_reads.clear();
        self.waiting_commit.clear();
        self.tid_to_op.clear();
        self.pipeline_state = PipelineState::CacheValid;
        self.completed_to = Version::default();
        self.committed_to = Version::default();
        cache.on_change();
    }
}
