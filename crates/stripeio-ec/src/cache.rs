//! Pinned, line-addressed shard-extent cache
//!
//! Caches shard extents between the reads and writes of the RMW pipeline.
//! A line covers `chunk_size` bytes per shard at one chunk-aligned offset
//! of one object; write ops pin every line their footprint touches from
//! enqueue until completion. Unpinned lines sit on an LRU and are evicted
//! once the cache exceeds its byte budget.
//!
//! Readiness and backend reads surface as returned [`CacheEvent`]s; the
//! caller drains them, which keeps re-entry deterministic.

use crate::extents::ExtentSet;
use crate::geometry::StripeInfo;
use crate::messages::ShardExtentSets;
use crate::shard_map::ShardExtentMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use stripeio_common::{ObjectId, Tid};
use tracing::{debug, trace};

/// Address of one cache line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LineAddress {
    pub oid: ObjectId,
    /// Chunk-aligned shard-space offset
    pub offset: u64,
}

/// A line is pinned iff `ref_count > 0`; exactly one of pinned / in-LRU
/// holds.
#[derive(Debug, Default)]
struct Line {
    ref_count: u32,
    in_lru: bool,
}

/// What the cache asks of or reports to its driver
#[derive(Debug)]
pub enum CacheEvent {
    /// The head op's read footprint is resident; its data is attached
    Ready {
        tid: Tid,
        oid: ObjectId,
        result: ShardExtentMap,
    },
    /// These shard extents must be read and delivered via `read_done`
    BackendRead {
        oid: ObjectId,
        want: ShardExtentSets,
    },
}

/// A queued cache op: reads it waits for, writes it will eventually insert
struct CacheOp {
    tid: Tid,
    reads: Option<ShardExtentSets>,
    writes: ShardExtentSets,
    complete: bool,
}

/// Per-object cache state
struct CacheObject {
    cache: ShardExtentMap,
    /// Extents wanted but not yet sent to the backend
    requesting: ShardExtentSets,
    /// Extents currently being read
    reading: ShardExtentSets,
    /// Extents reserved for pending write results
    writing: ShardExtentSets,
    waiting_ops: VecDeque<CacheOp>,
}

impl CacheObject {
    fn new(sinfo: Arc<StripeInfo>) -> Self {
        Self {
            cache: ShardExtentMap::new(sinfo),
            requesting: ShardExtentSets::new(),
            reading: ShardExtentSets::new(),
            writing: ShardExtentSets::new(),
            waiting_ops: VecDeque::new(),
        }
    }

    fn cache_maybe_ready(&mut self, oid: ObjectId, events: &mut Vec<CacheEvent>) {
        let Some(op) = self.waiting_ops.front_mut() else {
            return;
        };
        if op.complete {
            return;
        }
        let ready = match &op.reads {
            None => true,
            Some(reads) => self.cache.contains(reads),
        };
        if ready {
            let result = match &op.reads {
                None => ShardExtentMap::new(self.cache.stripe_info().clone()),
                Some(reads) => self.cache.intersect(reads),
            };
            op.complete = true;
            trace!(%oid, tid = op.tid, "cache ready");
            events.push(CacheEvent::Ready {
                tid: op.tid,
                oid,
                result,
            });
        }
    }

    fn send_reads(&mut self, oid: ObjectId, events: &mut Vec<CacheEvent>) {
        if !self.reading.is_empty() || self.requesting.is_empty() {
            return; // read busy
        }
        std::mem::swap(&mut self.reading, &mut self.requesting);
        events.push(CacheEvent::BackendRead {
            oid,
            want: self.reading.clone(),
        });
    }

    /// Insert buffers, release satisfied write reservations, and return
    /// the byte growth
    fn insert(&mut self, buffers: &ShardExtentMap) -> u64 {
        let old_size = self.cache.size();
        self.cache.insert(buffers);
        for (shard, emap) in buffers.extent_maps() {
            if let Some(writing) = self.writing.get_mut(shard) {
                writing.subtract(&emap.interval_set());
            }
        }
        self.writing.retain(|_, eset| !eset.is_empty());
        self.cache.size() - old_size
    }
}

/// Line-granular LRU over per-object shard-extent data.
pub struct ExtentCache {
    sinfo: Arc<StripeInfo>,
    objects: HashMap<ObjectId, CacheObject>,
    lines: HashMap<LineAddress, Line>,
    lru: VecDeque<LineAddress>,
    size: u64,
    max_size: u64,
}

impl ExtentCache {
    /// Create a cache bounded to `max_size` resident bytes
    #[must_use]
    pub fn new(sinfo: Arc<StripeInfo>, max_size: u64) -> Self {
        Self {
            sinfo,
            objects: HashMap::new(),
            lines: HashMap::new(),
            lru: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Resident bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of pinned lines
    #[must_use]
    pub fn pinned_line_count(&self) -> usize {
        self.lines.values().filter(|l| l.ref_count > 0).count()
    }

    /// Whether an object has no queued ops
    #[must_use]
    pub fn idle(&self, oid: ObjectId) -> bool {
        self.objects
            .get(&oid)
            .map_or(true, |obj| obj.waiting_ops.is_empty())
    }

    fn line_addresses(&self, oid: ObjectId, writes: &ShardExtentSets) -> Vec<LineAddress> {
        let chunk_size = self.sinfo.chunk_size();
        let mut footprint = ExtentSet::new();
        for eset in writes.values() {
            footprint.union_with(eset);
        }
        footprint.align(chunk_size);

        let mut addrs = Vec::new();
        for (start, len) in footprint.iter() {
            let mut offset = start;
            while offset < start + len {
                addrs.push(LineAddress { oid, offset });
                offset += chunk_size;
            }
        }
        addrs
    }

    fn pin(&mut self, oid: ObjectId, writes: &ShardExtentSets) {
        for addr in self.line_addresses(oid, writes) {
            let line = self.lines.entry(addr).or_default();
            if line.in_lru {
                line.in_lru = false;
                self.lru.retain(|a| *a != addr);
            }
            line.ref_count += 1;
        }
    }

    /// Register a write op: pin its footprint, reserve its writes, queue
    /// it behind earlier ops on the object, and work out what must be
    /// read.
    ///
    /// Returns a `Ready` event immediately when the cache already holds
    /// everything `reads` wants, and a `BackendRead` for whatever is
    /// missing after subtracting cache content, in-flight reads and
    /// reserved writes.
    pub fn request(
        &mut self,
        tid: Tid,
        oid: ObjectId,
        reads: Option<ShardExtentSets>,
        writes: ShardExtentSets,
    ) -> Vec<CacheEvent> {
        self.pin(oid, &writes);
        let sinfo = self.sinfo.clone();
        let obj = self
            .objects
            .entry(oid)
            .or_insert_with(|| CacheObject::new(sinfo));

        if let Some(reads) = &reads {
            for (shard, eset) in reads {
                let mut request = eset.clone();
                if let Some(emap) = obj.cache.extent_map(*shard) {
                    request.subtract(&emap.interval_set());
                }
                if let Some(reading) = obj.reading.get(shard) {
                    request.subtract(reading);
                }
                if let Some(writing) = obj.writing.get(shard) {
                    request.subtract(writing);
                }
                if !request.is_empty() {
                    obj.requesting.entry(*shard).or_default().union_with(&request);
                }
            }
        }
        // Later ops must not re-read what this op will write
        for (shard, eset) in &writes {
            obj.writing.entry(*shard).or_default().union_with(eset);
        }

        obj.waiting_ops.push_back(CacheOp {
            tid,
            reads,
            writes,
            complete: false,
        });
        debug!(%oid, tid, queued = obj.waiting_ops.len(), "cache request");

        let mut events = Vec::new();
        obj.cache_maybe_ready(oid, &mut events);
        obj.send_reads(oid, &mut events);
        events
    }

    /// Deliver backend read results.
    ///
    /// A partial cover leaves the remainder in `reading`; follow-on
    /// requests that accumulated meanwhile are sent immediately.
    pub fn read_done(&mut self, oid: ObjectId, update: ShardExtentMap) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let Some(obj) = self.objects.get_mut(&oid) else {
            return events;
        };
        let mut still_reading = obj.reading.clone();
        for (shard, emap) in update.extent_maps() {
            if let Some(eset) = still_reading.get_mut(shard) {
                eset.subtract(&emap.interval_set());
            }
        }
        still_reading.retain(|_, eset| !eset.is_empty());
        obj.reading = still_reading;

        self.size += obj.insert(&update);
        if obj.reading.is_empty() {
            obj.send_reads(oid, &mut events);
        }
        obj.cache_maybe_ready(oid, &mut events);
        events
    }

    /// Deliver the buffers a completed write produced.
    ///
    /// The op must be the head of the object's queue; releasing it may
    /// make the next op ready.
    pub fn write_done(&mut self, tid: Tid, oid: ObjectId, update: ShardExtentMap) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let Some(obj) = self.objects.get_mut(&oid) else {
            return events;
        };
        let front = obj
            .waiting_ops
            .pop_front()
            .expect("write_done with no queued op");
        assert_eq!(front.tid, tid, "write_done out of order");

        self.size += obj.insert(&update);
        obj.cache_maybe_ready(oid, &mut events);
        events
    }

    /// Release a completed op's pins; lines whose last pin drops move to
    /// the LRU tail, and the cache sheds down to its budget.
    pub fn complete(&mut self, oid: ObjectId, writes: &ShardExtentSets) {
        for addr in self.line_addresses(oid, writes) {
            let line = self
                .lines
                .get_mut(&addr)
                .expect("completing op with unpinned line");
            assert!(line.ref_count > 0);
            line.ref_count -= 1;
            if line.ref_count == 0 {
                line.in_lru = true;
                self.lru.push_back(addr);
            }
        }
        self.free_maybe();
    }

    /// Evict from the LRU head until the cache fits its budget
    fn free_maybe(&mut self) {
        while self.size > self.max_size {
            let Some(addr) = self.lru.pop_front() else {
                break; // everything resident is pinned
            };
            self.lines.remove(&addr);
            let Some(obj) = self.objects.get_mut(&addr.oid) else {
                continue;
            };
            let before = obj.cache.size();
            obj.cache.erase_stripe(addr.offset, self.sinfo.chunk_size());
            let freed = before - obj.cache.size();
            self.size -= freed;
            debug!(oid = %addr.oid, offset = addr.offset, freed, "evicted cache line");

            if obj.cache.is_empty()
                && obj.waiting_ops.is_empty()
                && obj.requesting.is_empty()
                && obj.reading.is_empty()
            {
                self.objects.remove(&addr.oid);
            }
        }
    }

    /// Drop everything: queued ops, pins, lines and data. Used on
    /// membership change; waiters are owned by the pipeline and dropped
    /// there.
    pub fn on_change(&mut self) {
        self.objects.clear();
        self.lines.clear();
        self.lru.clear();
        self.size = 0;
    }
}
