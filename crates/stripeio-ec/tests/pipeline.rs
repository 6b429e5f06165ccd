//! End-to-end pipeline scenarios
//!
//! Drives a real engine against a scripted parent: sub-reads are served
//! from an in-memory shard store, sub-writes are applied to it, and
//! replies are injected back. Everything runs single-threaded, the way
//! the engine runs under a PG lock.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use stripeio_common::{DeltaStats, Epoch, ObjectId, OsdId, PgId, PgShard, ReqId, ShardIndex, Tid, Version};
use stripeio_ec::extents::ExtentMap;
use stripeio_ec::messages::SubWrite;
use stripeio_ec::parent::{MissingSet, PgInfo, PgParent, PoolInfo, ShardInfo};
use stripeio_ec::read::ObjectReadResult;
use stripeio_ec::{
    ClientWrite, ClusterMessage, EcAlign, EcEngine, EngineConfig, ReedSolomonCodec, ShardExtentMap,
    StripeInfo, SubReadReply, SubWriteReply,
};

const K: usize = 4;
const M: usize = 2;
const CHUNK: u64 = 4096;
const STRIPE: u64 = CHUNK * K as u64;

fn peer(i: u8) -> PgShard {
    PgShard::new(OsdId::new(u32::from(i)), ShardIndex::new(i))
}

struct MockParent {
    acting: BTreeSet<PgShard>,
    backfill: BTreeSet<PgShard>,
    all: BTreeSet<PgShard>,
    missing: BTreeMap<PgShard, MissingSet>,
    missing_loc: BTreeMap<ObjectId, BTreeSet<PgShard>>,
    infos: BTreeMap<PgShard, ShardInfo>,
    info: PgInfo,
    pool: PoolInfo,
    can_rollback_to: Version,
    next_tid: Tid,
    whoami: PgShard,
    pgid: PgId,
    epoch: Epoch,
    sent: Vec<(OsdId, ClusterMessage)>,
    local_writes: Vec<SubWrite>,
    stats_applied: Vec<(ObjectId, DeltaStats)>,
}

impl MockParent {
    fn new() -> Self {
        let peers: BTreeSet<PgShard> = (0..(K + M) as u8).map(peer).collect();
        Self {
            acting: peers.clone(),
            backfill: BTreeSet::new(),
            all: peers.clone(),
            missing: peers.iter().map(|&p| (p, MissingSet::new())).collect(),
            missing_loc: BTreeMap::new(),
            infos: peers.iter().map(|&p| (p, ShardInfo::default())).collect(),
            info: PgInfo {
                pgid: PgId::new(3, 0x1f),
                last_update: Version::default(),
            },
            pool: PoolInfo {
                allows_ec_overwrites: true,
                allows_ec_optimizations: true,
            },
            // High watermark so no rollforward op fires unless a test
            // lowers it
            can_rollback_to: Version::new(u32::MAX, 0),
            next_tid: 0,
            whoami: peer(0),
            pgid: PgId::new(3, 0x1f),
            epoch: 10,
            sent: Vec::new(),
            local_writes: Vec::new(),
            stats_applied: Vec::new(),
        }
    }

    fn mark_missing(&mut self, shard: u8, oid: ObjectId) {
        self.missing.get_mut(&peer(shard)).unwrap().insert(oid);
    }
}

impl PgParent for MockParent {
    fn get_acting_shards(&self) -> &BTreeSet<PgShard> {
        &self.acting
    }

    fn get_backfill_shards(&self) -> &BTreeSet<PgShard> {
        &self.backfill
    }

    fn get_acting_recovery_backfill_shards(&self) -> &BTreeSet<PgShard> {
        &self.all
    }

    fn get_shard_missing(&self, peer: PgShard) -> &MissingSet {
        &self.missing[&peer]
    }

    fn maybe_get_shard_missing(&self, peer: PgShard) -> Option<&MissingSet> {
        self.missing.get(&peer)
    }

    fn get_missing_loc_shards(&self) -> &BTreeMap<ObjectId, BTreeSet<PgShard>> {
        &self.missing_loc
    }

    fn get_shard_info(&self, peer: PgShard) -> &ShardInfo {
        &self.infos[&peer]
    }

    fn get_info(&self) -> &PgInfo {
        &self.info
    }

    fn get_pool(&self) -> &PoolInfo {
        &self.pool
    }

    fn log_can_rollback_to(&self) -> Version {
        self.can_rollback_to
    }

    fn get_tid(&mut self) -> Tid {
        self.next_tid += 1;
        self.next_tid
    }

    fn whoami_shard(&self) -> PgShard {
        self.whoami
    }

    fn primary_pgid(&self) -> PgId {
        self.pgid
    }

    fn get_osdmap_epoch(&self) -> Epoch {
        self.epoch
    }

    fn get_interval_start_epoch(&self) -> Epoch {
        self.epoch - 1
    }

    fn should_send_op(&self, _peer: PgShard, _oid: ObjectId) -> bool {
        true
    }

    fn send_cluster_messages(&mut self, messages: Vec<(OsdId, ClusterMessage)>, _epoch: Epoch) {
        self.sent.extend(messages);
    }

    fn submit_local_transaction(&mut self, write: SubWrite) {
        self.local_writes.push(write);
    }

    fn apply_stats(&mut self, oid: ObjectId, stats: &DeltaStats) {
        self.stats_applied.push((oid, *stats));
    }
}

/// The engine plus an in-memory shard store standing in for the peers
struct TestCluster {
    engine: EcEngine<MockParent>,
    store: HashMap<(ObjectId, ShardIndex), ExtentMap>,
    /// Peers that answer every read with an error
    failing: BTreeSet<OsdId>,
}

impl TestCluster {
    fn new(config: EngineConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let codec = Arc::new(ReedSolomonCodec::new(K, M).unwrap());
        let engine = EcEngine::new(MockParent::new(), codec, STRIPE, config).unwrap();
        Self {
            engine,
            store: HashMap::new(),
            failing: BTreeSet::new(),
        }
    }

    fn sinfo(&self) -> Arc<StripeInfo> {
        self.engine.stripe_info().clone()
    }

    /// Encode an object and lay its shards out in the store
    fn seed_object(&mut self, oid: ObjectId, data: &[u8]) {
        let codec = ReedSolomonCodec::new(K, M).unwrap();
        let mut sem = ShardExtentMap::new(self.sinfo());
        sem.insert_ro_buffer(0, &Bytes::copy_from_slice(data));
        sem.insert_parity_buffers();
        sem.encode(&codec, None, 0).unwrap();
        for (&shard, emap) in sem.extent_maps() {
            let entry = self.store.entry((oid, shard)).or_default();
            for (off, buf) in emap.iter() {
                entry.insert(off, buf.clone());
            }
        }
    }

    fn shard_bytes(&self, oid: ObjectId, shard: u8, off: u64, len: u64) -> Bytes {
        self.store[&(oid, ShardIndex::new(shard))]
            .get(off, len)
            .expect("store covers range")
    }

    fn serve_sub_read(&mut self, osd: OsdId, msg: stripeio_ec::SubRead) -> SubReadReply {
        let from = PgShard::new(osd, msg.pgid.shard);
        let mut reply = SubReadReply {
            from,
            tid: msg.tid,
            buffers_read: BTreeMap::new(),
            attrs_read: BTreeMap::new(),
            errors: BTreeMap::new(),
        };
        if self.failing.contains(&osd) {
            for oid in msg.to_read.keys() {
                reply.errors.insert(*oid, "injected failure".to_string());
            }
            return reply;
        }
        for (oid, extents) in &msg.to_read {
            let Some(emap) = self.store.get(&(*oid, msg.pgid.shard)) else {
                reply.errors.insert(*oid, "no such shard".to_string());
                continue;
            };
            let mut bufs = Vec::new();
            let mut failed = false;
            for &(off, len, _) in extents {
                match emap.get(off, len) {
                    Some(buf) => bufs.push((off, buf)),
                    None => {
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                reply.errors.insert(*oid, "short read".to_string());
            } else {
                reply.buffers_read.insert(*oid, bufs);
            }
        }
        reply
    }

    fn apply_sub_write(&mut self, osd: OsdId, msg: SubWrite) -> SubWriteReply {
        if !msg.stats_only {
            let entry = self.store.entry((msg.oid, msg.pgid.shard)).or_default();
            if let Some(len) = msg.transaction.truncate {
                let end = entry.range_end().unwrap_or(0);
                if end > len {
                    entry.erase(len, end - len);
                }
            }
            for (off, buf) in &msg.transaction.writes {
                entry.insert(*off, buf.clone());
            }
        }
        SubWriteReply {
            from: PgShard::new(osd, msg.pgid.shard),
            tid: msg.tid,
            applied: true,
            committed: true,
        }
    }

    /// Serve every outstanding message until the cluster goes quiet
    fn pump(&mut self) {
        loop {
            let sent = std::mem::take(&mut self.engine.parent_mut().sent);
            let local = std::mem::take(&mut self.engine.parent_mut().local_writes);
            if sent.is_empty() && local.is_empty() {
                break;
            }
            for msg in local {
                let osd = self.engine.parent().whoami_shard().osd;
                let reply = self.apply_sub_write(osd, msg);
                self.engine.handle_sub_write_reply(reply);
            }
            for (osd, msg) in sent {
                match msg {
                    ClusterMessage::SubRead(r) => {
                        let reply = self.serve_sub_read(osd, r);
                        self.engine.handle_sub_read_reply(reply);
                    }
                    ClusterMessage::SubWrite(w) => {
                        let reply = self.apply_sub_write(osd, w);
                        self.engine.handle_sub_write_reply(reply);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Capture slot for read completions
type ReadCapture = Arc<Mutex<Option<BTreeMap<ObjectId, ObjectReadResult>>>>;

fn capture() -> (ReadCapture, Box<dyn FnOnce(BTreeMap<ObjectId, ObjectReadResult>) + Send>) {
    let slot: ReadCapture = Arc::new(Mutex::new(None));
    let inner = slot.clone();
    (
        slot,
        Box::new(move |results| {
            *inner.lock() = Some(results);
        }),
    )
}

fn object_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[test]
fn single_chunk_read_touches_one_peer() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let data = object_data(STRIPE as usize);
    cluster.seed_object(oid, &data);

    let (slot, cb) = capture();
    let mut reads = BTreeMap::new();
    reads.insert(oid, vec![EcAlign::new(0, CHUNK)]);
    cluster.engine.objects_read_and_reconstruct(reads, false, cb);

    // Minimum plan: only shard 0's peer is asked
    let sub_reads: Vec<_> = cluster
        .engine
        .parent()
        .sent
        .iter()
        .filter(|(_, m)| matches!(m, ClusterMessage::SubRead(_)))
        .collect();
    assert_eq!(sub_reads.len(), 1);
    assert_eq!(sub_reads[0].0, OsdId::new(0));

    cluster.pump();

    let results = slot.lock().take().expect("read completed");
    let res = &results[&oid];
    assert!(res.result.is_ok());
    assert_eq!(res.emap.get(0, CHUNK).unwrap(), &data[..CHUNK as usize]);
}

#[test]
fn full_stripe_read_reconstructs_missing_shard() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let data = object_data(STRIPE as usize);
    cluster.seed_object(oid, &data);

    // Shard 2's peer does not have the object
    cluster.engine.parent_mut().mark_missing(2, oid);
    cluster.store.remove(&(oid, ShardIndex::new(2)));

    let (slot, cb) = capture();
    let mut reads = BTreeMap::new();
    reads.insert(oid, vec![EcAlign::new(0, STRIPE)]);
    cluster.engine.objects_read_and_reconstruct(reads, false, cb);

    // Four peers read: the surviving data shards plus one coding shard
    let targets: BTreeSet<OsdId> = cluster
        .engine
        .parent()
        .sent
        .iter()
        .filter(|(_, m)| matches!(m, ClusterMessage::SubRead(_)))
        .map(|(osd, _)| *osd)
        .collect();
    assert_eq!(targets.len(), K);
    assert!(!targets.contains(&OsdId::new(2)));

    cluster.pump();

    let results = slot.lock().take().expect("read completed");
    let res = &results[&oid];
    assert!(res.result.is_ok());
    assert_eq!(res.emap.get(0, STRIPE).unwrap(), &data[..]);
}

#[test]
fn small_overwrite_runs_full_rmw_cycle() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let old = object_data(CHUNK as usize);
    cluster.seed_object(oid, &old);

    let new_bytes = vec![0xabu8; 2048];
    let write = ClientWrite::write(2048, Bytes::from(new_bytes.clone()), CHUNK);
    let version = Version::new(10, 1);
    let op = cluster.engine.prepare_write(
        oid,
        version,
        Version::default(),
        Version::default(),
        ReqId::new(1, 1),
        write,
        None,
    );
    cluster.engine.start_rmw(op);

    // The RMW read goes out before any sub-write
    assert!(cluster
        .engine
        .parent()
        .sent
        .iter()
        .all(|(_, m)| matches!(m, ClusterMessage::SubRead(_))));

    cluster.pump();

    assert_eq!(cluster.engine.committed_to(), version);
    assert_eq!(cluster.engine.queued_write_ops(), 0);
    assert_eq!(cluster.engine.pinned_line_count(), 0);
    // Stats were applied exactly once, at dispatch time
    assert_eq!(cluster.engine.parent().stats_applied.len(), 1);

    // Shard 0 carries the merged chunk
    let chunk0 = cluster.shard_bytes(oid, 0, 0, CHUNK);
    assert_eq!(&chunk0[..2048], &old[..2048]);
    assert_eq!(&chunk0[2048..], &new_bytes[..]);

    // Parity matches a from-scratch encode of the final object
    let mut final_bytes = old.clone();
    final_bytes[2048..4096].copy_from_slice(&new_bytes);
    let codec = ReedSolomonCodec::new(K, M).unwrap();
    let mut reference = ShardExtentMap::new(cluster.sinfo());
    reference.insert_ro_buffer(0, &Bytes::from(final_bytes));
    reference.insert_parity_buffers();
    reference.encode(&codec, None, 0).unwrap();
    for parity in [4u8, 5u8] {
        assert_eq!(
            cluster.shard_bytes(oid, parity, 0, CHUNK),
            reference
                .get_buffer(ShardIndex::new(parity), 0, CHUNK, false)
                .unwrap()
        );
    }
}

#[test]
fn overlapping_writes_commit_in_order_and_see_earlier_bytes() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let old = object_data(CHUNK as usize);
    cluster.seed_object(oid, &old);

    let w1_bytes = vec![0x11u8; 2048];
    let w2_bytes = vec![0x22u8; 1024];
    let v1 = Version::new(10, 1);
    let v2 = Version::new(10, 2);

    let op1 = cluster.engine.prepare_write(
        oid,
        v1,
        Version::default(),
        Version::default(),
        ReqId::new(1, 1),
        ClientWrite::write(2048, Bytes::from(w1_bytes.clone()), CHUNK),
        None,
    );
    cluster.engine.start_rmw(op1);

    let reads_after_w1 = cluster.engine.parent().sent.len();
    assert!(reads_after_w1 >= 1);

    // W2 arrives while W1's read is still in flight. Its data dependency
    // is W1's reserved write, so no second backend read goes out.
    let op2 = cluster.engine.prepare_write(
        oid,
        v2,
        Version::default(),
        Version::default(),
        ReqId::new(1, 2),
        ClientWrite::write(0, Bytes::from(w2_bytes.clone()), CHUNK),
        None,
    );
    cluster.engine.start_rmw(op2);
    assert_eq!(cluster.engine.parent().sent.len(), reads_after_w1);

    cluster.pump();

    assert_eq!(cluster.engine.committed_to(), v2);
    assert_eq!(cluster.engine.queued_write_ops(), 0);

    // W2 read W1's bytes: the final chunk is W2 over W1 over the original
    let chunk0 = cluster.shard_bytes(oid, 0, 0, CHUNK);
    assert_eq!(&chunk0[..1024], &w2_bytes[..]);
    assert_eq!(&chunk0[1024..2048], &old[1024..2048]);
    assert_eq!(&chunk0[2048..], &w1_bytes[..]);
}

#[test]
fn failed_peer_triggers_replan_then_success() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let data = object_data(STRIPE as usize);
    cluster.seed_object(oid, &data);

    cluster.engine.parent_mut().mark_missing(2, oid);
    cluster.store.remove(&(oid, ShardIndex::new(2)));
    // The chosen coding shard fails its read
    cluster.failing.insert(OsdId::new(4));

    let (slot, cb) = capture();
    let mut reads = BTreeMap::new();
    reads.insert(oid, vec![EcAlign::new(0, STRIPE)]);
    cluster.engine.objects_read_and_reconstruct(reads, false, cb);
    cluster.pump();

    let results = slot.lock().take().expect("read completed");
    let res = &results[&oid];
    assert!(res.result.is_ok(), "replan should recover via shard 5");
    assert_eq!(res.emap.get(0, STRIPE).unwrap(), &data[..]);
}

#[test]
fn read_fails_with_io_error_when_no_shards_remain() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let data = object_data(STRIPE as usize);
    cluster.seed_object(oid, &data);

    cluster.engine.parent_mut().mark_missing(2, oid);
    cluster.store.remove(&(oid, ShardIndex::new(2)));
    cluster.failing.insert(OsdId::new(4));
    cluster.failing.insert(OsdId::new(5));

    let (slot, cb) = capture();
    let mut reads = BTreeMap::new();
    reads.insert(oid, vec![EcAlign::new(0, STRIPE)]);
    cluster.engine.objects_read_and_reconstruct(reads, false, cb);
    cluster.pump();

    let results = slot.lock().take().expect("read completed");
    let res = &results[&oid];
    assert!(res.result.is_err(), "no decodable set should remain");
    assert!(res.emap.is_empty());
}

#[test]
fn cache_pressure_evicts_down_to_budget_after_unpin() {
    // Budget: four chunks of cache across all shards
    let config = EngineConfig {
        cache_max_bytes: 4 * CHUNK,
        ..EngineConfig::default()
    };
    let mut cluster = TestCluster::new(config);

    let oids: Vec<ObjectId> = (0..3).map(|_| ObjectId::new()).collect();
    for (i, &oid) in oids.iter().enumerate() {
        let op = cluster.engine.prepare_write(
            oid,
            Version::new(10, i as u64 + 1),
            Version::default(),
            Version::default(),
            ReqId::new(1, i as u64 + 1),
            // Aligned append: no reads needed
            ClientWrite::write(0, Bytes::from(vec![i as u8 + 1; CHUNK as usize]), 0),
            None,
        );
        cluster.engine.start_rmw(op);
        cluster.pump();
    }

    // Everything is unpinned; eviction kept the cache within budget
    assert_eq!(cluster.engine.pinned_line_count(), 0);
    assert!(cluster.engine.cache_size() <= 4 * CHUNK);
    assert_eq!(cluster.engine.committed_to(), Version::new(10, 3));
}

#[test]
fn rollforward_op_advances_completed_to() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    // Low rollback watermark: every committed write kicks a rollforward
    cluster.engine.parent_mut().can_rollback_to = Version::default();

    let oid = ObjectId::new();
    let version = Version::new(10, 1);
    let op = cluster.engine.prepare_write(
        oid,
        version,
        Version::default(),
        Version::default(),
        ReqId::new(1, 1),
        ClientWrite::write(0, Bytes::from(vec![9u8; CHUNK as usize]), 0),
        None,
    );
    cluster.engine.start_rmw(op);
    cluster.pump();

    assert_eq!(cluster.engine.committed_to(), version);
    // The transaction-empty rollforward op carried the committed version
    assert_eq!(cluster.engine.completed_to(), version);
    assert_eq!(cluster.engine.queued_write_ops(), 0);
}

#[test]
fn membership_change_drops_everything() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let old = object_data(CHUNK as usize);
    cluster.seed_object(oid, &old);

    // A write whose read we never serve, and a client read
    let op = cluster.engine.prepare_write(
        oid,
        Version::new(10, 1),
        Version::default(),
        Version::default(),
        ReqId::new(1, 1),
        ClientWrite::write(2048, Bytes::from(vec![5u8; 2048]), CHUNK),
        None,
    );
    cluster.engine.start_rmw(op);
    let (slot, cb) = capture();
    let mut reads = BTreeMap::new();
    reads.insert(oid, vec![EcAlign::new(0, CHUNK)]);
    cluster.engine.objects_read_and_reconstruct(reads, false, cb);

    assert!(cluster.engine.queued_write_ops() > 0);
    assert!(cluster.engine.in_flight_reads() > 0);

    cluster.engine.on_change();

    assert_eq!(cluster.engine.queued_write_ops(), 0);
    assert_eq!(cluster.engine.in_flight_reads(), 0);
    assert_eq!(cluster.engine.pinned_line_count(), 0);
    assert_eq!(cluster.engine.cache_size(), 0);
    assert_eq!(cluster.engine.committed_to(), Version::default());
    // The dropped read never completes; the parent replays after resync
    assert!(slot.lock().is_none());
}

#[test]
fn write_ordered_callback_runs_after_queued_writes() {
    let mut cluster = TestCluster::new(EngineConfig::default());
    let oid = ObjectId::new();
    let old = object_data(CHUNK as usize);
    cluster.seed_object(oid, &old);

    let fired = Arc::new(Mutex::new(false));

    // Nothing queued: runs immediately
    {
        let fired = fired.clone();
        cluster
            .engine
            .call_write_ordered(Box::new(move || *fired.lock() = true));
    }
    assert!(*fired.lock());

    // Queued behind a write whose read is outstanding: deferred until
    // that write dispatches
    let op = cluster.engine.prepare_write(
        oid,
        Version::new(10, 1),
        Version::default(),
        Version::default(),
        ReqId::new(1, 1),
        ClientWrite::write(2048, Bytes::from(vec![5u8; 2048]), CHUNK),
        None,
    );
    cluster.engine.start_rmw(op);

    let deferred = Arc::new(Mutex::new(false));
    {
        let deferred = deferred.clone();
        cluster
            .engine
            .call_write_ordered(Box::new(move || *deferred.lock() = true));
    }
    assert!(!*deferred.lock());

    cluster.pump();
    assert!(*deferred.lock());
}
