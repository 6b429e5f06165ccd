//! Per-object cumulative shard hashes
//!
//! Every shard of an object carries a CRC32C folded over each append, so
//! scrubbing can verify a whole shard without replaying writes. The encoded
//! record is persisted as the `hinfo_key` object attribute; a concurrent
//! registry shares one record per object between in-flight writes.

use crate::error::{EcError, EcResult};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use stripeio_common::checksum::{crc32c_append, CRC_INITIAL};
use stripeio_common::{ObjectId, ShardIndex};
use tracing::{debug, warn};

/// Attribute key under which the encoded hash info is persisted
pub const HINFO_KEY: &str = "hinfo_key";

const BLOB_VERSION: u8 = 1;

/// Cumulative per-shard hashes and the shard size they cover.
///
/// `total_chunk_size` counts bytes per shard, not per object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashInfo {
    total_chunk_size: u64,
    cumulative_shard_hashes: Vec<u32>,
}

impl HashInfo {
    /// Create hash info tracking `num_chunks` shards
    #[must_use]
    pub fn new(num_chunks: usize) -> Self {
        Self {
            total_chunk_size: 0,
            cumulative_shard_hashes: vec![CRC_INITIAL; num_chunks],
        }
    }

    /// Fold an append into the cumulative hashes.
    ///
    /// `old_size` must equal the currently covered shard size, and the
    /// buffers must be equal length across every tracked shard.
    pub fn append(&mut self, old_size: u64, to_append: &BTreeMap<ShardIndex, Bytes>) {
        assert_eq!(
            old_size, self.total_chunk_size,
            "hash fold out of order: append at {old_size}, covered {}",
            self.total_chunk_size
        );
        let Some(first) = to_append.values().next() else {
            return;
        };
        let size_to_append = first.len() as u64;
        if self.has_chunk_hash() {
            assert_eq!(
                to_append.len(),
                self.cumulative_shard_hashes.len(),
                "append must cover every tracked shard"
            );
            for (shard, buf) in to_append {
                assert_eq!(buf.len() as u64, size_to_append);
                let slot = &mut self.cumulative_shard_hashes[shard.as_usize()];
                *slot = crc32c_append(*slot, buf);
            }
        }
        self.total_chunk_size += size_to_append;
    }

    /// Cumulative hash of one shard
    #[must_use]
    pub fn chunk_hash(&self, shard: ShardIndex) -> u32 {
        self.cumulative_shard_hashes[shard.as_usize()]
    }

    /// Shard bytes covered by the hashes
    #[must_use]
    pub fn total_chunk_size(&self) -> u64 {
        self.total_chunk_size
    }

    /// Whether hashes are being tracked
    #[must_use]
    pub fn has_chunk_hash(&self) -> bool {
        !self.cumulative_shard_hashes.is_empty()
    }

    /// Reset to an empty record, keeping the shard count
    pub fn clear(&mut self) {
        self.total_chunk_size = 0;
        let n = self.cumulative_shard_hashes.len();
        self.cumulative_shard_hashes = vec![CRC_INITIAL; n];
    }

    /// Record a new size and drop the hashes; used when an overwrite makes
    /// the cumulative hashes unreconstructible
    pub fn set_total_chunk_size_clear_hash(&mut self, new_chunk_size: u64) {
        self.cumulative_shard_hashes.clear();
        self.total_chunk_size = new_chunk_size;
    }

    /// Encode to the persisted attribute format
    #[must_use]
    pub fn encode_blob(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(BLOB_VERSION);
        put_uvarint(&mut out, self.total_chunk_size);
        put_uvarint(&mut out, self.cumulative_shard_hashes.len() as u64);
        for hash in &self.cumulative_shard_hashes {
            out.put_u32_le(*hash);
        }
        out.freeze()
    }

    /// Decode from the persisted attribute format
    pub fn decode_blob(blob: &[u8]) -> EcResult<Self> {
        let mut cursor = blob;
        let version = take_u8(&mut cursor)?;
        if version != BLOB_VERSION {
            return Err(EcError::io(format!("unknown hash info version {version}")));
        }
        let total_chunk_size = take_uvarint(&mut cursor)?;
        let count = take_uvarint(&mut cursor)? as usize;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(take_u32_le(&mut cursor)?);
        }
        Ok(Self {
            total_chunk_size,
            cumulative_shard_hashes: hashes,
        })
    }
}

fn put_uvarint(out: &mut BytesMut, mut val: u64) {
    while val >= 0x80 {
        out.put_u8((val as u8 & 0x7f) | 0x80);
        val >>= 7;
    }
    out.put_u8(val as u8);
}

fn take_u8(cursor: &mut &[u8]) -> EcResult<u8> {
    let (&first, rest) = cursor
        .split_first()
        .ok_or_else(|| EcError::io("truncated hash info"))?;
    *cursor = rest;
    Ok(first)
}

fn take_u32_le(cursor: &mut &[u8]) -> EcResult<u32> {
    if cursor.len() < 4 {
        return Err(EcError::io("truncated hash info"));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn take_uvarint(cursor: &mut &[u8]) -> EcResult<u64> {
    let mut val = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = take_u8(cursor)?;
        val |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(val);
        }
        shift += 7;
        if shift >= 64 {
            return Err(EcError::io("varint overflow in hash info"));
        }
    }
}

/// Shared, in-place-updatable hash info record
pub type HashInfoRef = Arc<RwLock<HashInfo>>;

/// Concurrent keyed cache of per-object hash info.
///
/// Lookup-or-create: racing installers for the same object converge on one
/// shared record. Records are mutated in place only under the write
/// pipeline's per-object ordering.
#[derive(Default)]
pub struct HashInfoRegistry {
    inner: Mutex<HashMap<ObjectId, HashInfoRef>>,
}

impl HashInfoRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing record
    #[must_use]
    pub fn lookup(&self, oid: ObjectId) -> Option<HashInfoRef> {
        self.inner.lock().get(&oid).cloned()
    }

    /// Install a record unless one already exists; returns the shared one
    pub fn lookup_or_create(&self, oid: ObjectId, hinfo: HashInfo) -> HashInfoRef {
        self.inner
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(RwLock::new(hinfo)))
            .clone()
    }

    /// Resolve an object's hash info from the registry or its persisted
    /// attribute.
    ///
    /// A decode failure or a recorded size that disagrees with the on-disk
    /// shard size yields `None`; the caller treats the info as missing.
    pub fn get_hash_info(
        &self,
        oid: ObjectId,
        num_chunks: usize,
        attrs: &BTreeMap<String, Bytes>,
        shard_size: u64,
    ) -> Option<HashInfoRef> {
        if let Some(existing) = self.lookup(oid) {
            return Some(existing);
        }

        let mut create = false;
        let mut hinfo = HashInfo::new(num_chunks);
        match attrs.get(HINFO_KEY) {
            Some(blob) if !blob.is_empty() => {
                match HashInfo::decode_blob(blob) {
                    Ok(decoded) => {
                        if decoded.total_chunk_size() != shard_size {
                            warn!(
                                %oid,
                                recorded = decoded.total_chunk_size(),
                                actual = shard_size,
                                "hash info size mismatch, treating as missing"
                            );
                            return None;
                        }
                        hinfo = decoded;
                        create = true;
                    }
                    Err(e) => {
                        warn!(%oid, error = %e, "cannot decode hash info");
                        return None;
                    }
                }
            }
            _ => {
                debug!(%oid, "missing hash info attr");
                // Empty object with no attribute: start fresh
                if shard_size == 0 {
                    create = true;
                }
            }
        }

        create.then(|| self.lookup_or_create(oid, hinfo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(shards: &[u8], len: usize) -> BTreeMap<ShardIndex, Bytes> {
        shards
            .iter()
            .map(|&s| (ShardIndex::new(s), Bytes::from(vec![s.wrapping_add(1); len])))
            .collect()
    }

    #[test]
    fn test_append_folds_and_grows() {
        let mut hinfo = HashInfo::new(3);
        let bufs = buffers(&[0, 1, 2], 32);
        hinfo.append(0, &bufs);
        assert_eq!(hinfo.total_chunk_size(), 32);
        let first = hinfo.chunk_hash(ShardIndex::new(0));

        hinfo.append(32, &bufs);
        assert_eq!(hinfo.total_chunk_size(), 64);
        assert_ne!(hinfo.chunk_hash(ShardIndex::new(0)), first);

        // Folding equals hashing the concatenation
        let mut whole = vec![1u8; 32];
        whole.extend_from_slice(&[1u8; 32]);
        assert_eq!(
            hinfo.chunk_hash(ShardIndex::new(0)),
            crc32c_append(CRC_INITIAL, &whole)
        );
    }

    #[test]
    #[should_panic(expected = "hash fold out of order")]
    fn test_append_out_of_order_panics() {
        let mut hinfo = HashInfo::new(2);
        hinfo.append(32, &buffers(&[0, 1], 16));
    }

    #[test]
    fn test_blob_round_trip() {
        let mut hinfo = HashInfo::new(6);
        hinfo.append(0, &buffers(&[0, 1, 2, 3, 4, 5], 300));
        let blob = hinfo.encode_blob();
        let decoded = HashInfo::decode_blob(&blob).unwrap();
        assert_eq!(decoded, hinfo);
    }

    #[test]
    fn test_blob_rejects_garbage() {
        assert!(HashInfo::decode_blob(&[]).is_err());
        assert!(HashInfo::decode_blob(&[9, 1, 1]).is_err());
    }

    #[test]
    fn test_registry_lookup_or_create_converges() {
        let registry = HashInfoRegistry::new();
        let oid = ObjectId::new();
        let a = registry.lookup_or_create(oid, HashInfo::new(4));
        let b = registry.lookup_or_create(oid, HashInfo::new(4));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_size_mismatch_is_missing() {
        let registry = HashInfoRegistry::new();
        let oid = ObjectId::new();
        let mut hinfo = HashInfo::new(2);
        hinfo.append(0, &buffers(&[0, 1], 64));

        let mut attrs = BTreeMap::new();
        attrs.insert(HINFO_KEY.to_string(), hinfo.encode_blob());

        assert!(registry.get_hash_info(oid, 2, &attrs, 4096).is_none());
        let found = registry.get_hash_info(oid, 2, &attrs, 64).unwrap();
        assert_eq!(found.read().total_chunk_size(), 64);
    }

    #[test]
    fn test_registry_empty_object_creates() {
        let registry = HashInfoRegistry::new();
        let attrs = BTreeMap::new();
        assert!(registry.get_hash_info(ObjectId::new(), 2, &attrs, 0).is_some());
        // Non-empty object with no attribute stays missing
        assert!(registry
            .get_hash_info(ObjectId::new(), 2, &attrs, 512)
            .is_none());
    }
}
