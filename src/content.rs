// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The content manager (§4.D): wraps a pluggable key-value backend,
//! enforces quota via priority-based eviction, performs on-demand
//! encryption of indexed blocks, and folds multiple `3HASH`/`SBLOCK`
//! results sharing a query key into one row (migrating to the large-reply
//! store once that row grows past [`MIGRATE_AT_COUNT`]).
//!
//! The backend is a trait object (§9 redesign: no dynamic library loading)
//! with one implementation, [`SledBackend`], over the teacher pack's `sled`
//! embedded store (as used for local caching in `r0gue-io-pop-cli/src/
//! db.rs`); any other K/V store can be dropped in by implementing
//! [`Backend`].

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::{
    block::{Block, BlockType, ContentDescriptor, BLOCK_SIZE},
    bloom::BloomFilters,
    fileindex::FileIndex,
    hash::ContentHash,
    largereply,
    peer::PeerId,
};

/// Backend row payload length that means "this row has been migrated to the
/// large-reply store; look there instead" (§4.D, §9 Open Question: the
/// numeric value 42 is a protocol constant that must be preserved).
pub const VERY_LARGE_FILE_SENTINEL: usize = 42;

/// Once a multi-reply row accumulates this many results, the next insert
/// migrates all of them into the large-reply store and replaces the row
/// with the sentinel (§4.D step 5, §8: "Inserting the 16th reply... migrates
/// the row").
pub const MIGRATE_AT_COUNT: usize = 15;

/// Number of blocks evicted per quota-pressure batch (§3 invariants: "never
/// exceeds the configured quota by more than one eviction batch (16
/// blocks)").
pub const EVICTION_BATCH: i64 = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    FileIndex(#[from] crate::fileindex::Error),
    #[error(transparent)]
    LargeReply(#[from] largereply::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Who is asking. Remote inserts are subject to the active-migration gate
/// and probabilistic drop (§4.D step 1); remote retrievals get `read_random`
/// from the large-reply store instead of the full set (§4.C).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    Local,
    Remote(PeerId),
}

impl Origin {
    pub fn is_remote(self) -> bool {
        matches!(self, Origin::Remote(_))
    }
}

/// One result stored at a key. `payload` is empty when `descriptor` is
/// indexed (§3: "the block itself is absent from storage; only a
/// (file-index, offset) descriptor is kept").
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub descriptor: ContentDescriptor,
    pub payload: Vec<u8>,
}

/// A backend row: either a list of results sharing this key, or the
/// large-reply sentinel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Row {
    Entries(Vec<Entry>),
    Sentinel,
}

impl Row {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Row::Sentinel)
    }

    pub fn entries(&self) -> &[Entry] {
        match self {
            Row::Entries(v) => v,
            Row::Sentinel => &[],
        }
    }
}

/// The capability set a pluggable backend must provide (§9 redesign: no
/// plugin loader, a trait object instead). All methods are bucket-scoped;
/// [`compute_bucket`] decides which bucket a key lives in.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, bucket: usize, key: &ContentHash) -> Result<Option<Row>, Error>;
    async fn put(&self, bucket: usize, key: &ContentHash, row: Row) -> Result<(), Error>;
    async fn delete(&self, bucket: usize, key: &ContentHash) -> Result<(), Error>;
    async fn count(&self, bucket: usize) -> Result<u64, Error>;
    /// Free space estimate for `bucket`, in "blocks", relative to this
    /// bucket's quota share (§4.D step 3). Negative means over quota.
    async fn estimate_available(&self, bucket: usize, share_blocks: i64) -> Result<i64, Error>;
    /// Evicts and returns the lowest-priority row in `bucket`, or `None` if
    /// the bucket is empty.
    async fn evict_lowest_priority(
        &self,
        bucket: usize,
    ) -> Result<Option<(ContentHash, Row)>, Error>;
    async fn min_priority(&self, bucket: usize) -> Result<Option<u32>, Error>;
    async fn random_row(&self, bucket: usize) -> Result<Option<(ContentHash, Row)>, Error>;
}

/// Maps a query key to its shard (§4.D): `buckets ≈ quota_mb / 256`. The
/// irregular XOR-of-differences formula exists because the underlying hash
/// is not uniformly distributed in the original implementation; it must be
/// reproduced exactly to keep existing databases' bucket assignments
/// stable.
pub fn compute_bucket(key: &ContentHash, buckets: usize) -> usize {
    let buckets = buckets.max(1);
    let q = key.words();
    let h = key.double().words();
    let mut acc: u32 = 0;
    for i in 0..q.len() {
        acc ^= q[i].wrapping_sub(h[i]);
    }
    ((acc >> 4) as usize) % buckets
}

pub fn bucket_count(quota_mib: u32) -> usize {
    ((quota_mib as usize) / 256).max(1)
}

/// The effective storage key for a descriptor (§4.D step 2): `3HASH` rows
/// are stored at `h(hash)`, everything else at the hash directly.
pub fn storage_key(content_hash: &ContentHash, block_type: BlockType) -> ContentHash {
    if block_type == BlockType::ThreeHash {
        content_hash.double()
    } else {
        *content_hash
    }
}

/// Derives a keystream byte for position `i` under `key` by hashing
/// `key || i` repeatedly; this crate does not implement real cryptographic
/// primitives (§1 non-goals: "providing cryptographic primitives... these
/// are imported"), so on-demand "encryption" here is a placeholder XOR
/// stream whose only contractual property is that it is a deterministic,
/// invertible function of `(plaintext_hash, offset)` — real deployments
/// plug in the ECRS-compatible cipher at this seam.
fn keystream_byte(key: &ContentHash, index: u64) -> u8 {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(index.to_be_bytes());
    let digest = hasher.finalize();
    digest[0]
}

fn encrypt_block(plaintext: &[u8], key: &ContentHash) -> Vec<u8> {
    plaintext
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ keystream_byte(key, i as u64))
        .collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Written,
    Duplicate,
    DroppedQuota,
    DroppedPolicy,
    Migrated,
}

/// One block produced for delivery: either an opaque payload or (for
/// `3HASH`) the double-hash alongside the block (§6 `3HASH_RESULT`).
#[derive(Clone, Debug)]
pub struct Retrieved {
    pub block_type: BlockType,
    pub double_hash: Option<ContentHash>,
    pub payload: Vec<u8>,
}

pub struct Manager<B: Backend> {
    backend: Arc<B>,
    bloom: Arc<BloomFilters>,
    file_index: Arc<FileIndex>,
    large_replies: Arc<largereply::Store>,
    buckets: usize,
    quota_blocks: i64,
    active_migration: bool,
    age: AtomicU64,
}

impl<B: Backend> Manager<B> {
    pub fn new(
        backend: Arc<B>,
        bloom: Arc<BloomFilters>,
        file_index: Arc<FileIndex>,
        large_replies: Arc<largereply::Store>,
        quota_mib: u32,
        active_migration: bool,
        initial_age: u64,
    ) -> Self {
        let buckets = bucket_count(quota_mib);
        let quota_blocks =
            (quota_mib as i64 * 1024 * 1024 / BLOCK_SIZE as i64 / buckets as i64).max(1);
        Self {
            backend,
            bloom,
            file_index,
            large_replies,
            buckets,
            quota_blocks,
            active_migration,
            age: AtomicU64::new(initial_age),
        }
    }

    /// Priority aging (§4.D): called by the 12-hour cron job. Returns the
    /// new age so the caller can persist it.
    pub fn bump_age(&self) -> u64 {
        self.age.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self, payload), fields(block_type = ?block_type))]
    pub async fn insert(
        &self,
        content_hash: ContentHash,
        block_type: BlockType,
        mut priority: u32,
        file_index: u16,
        file_offset: u64,
        payload: Vec<u8>,
        origin: Origin,
    ) -> Result<InsertOutcome, Error> {
        // Step 1: active-migration gate and probabilistic drop.
        if origin.is_remote() {
            if !self.active_migration {
                return Ok(InsertOutcome::DroppedPolicy);
            }
            let drop_prob = 1.0 / (2.0 + priority as f64);
            if rand::thread_rng().gen_bool(drop_prob.clamp(0.0, 1.0)) {
                return Ok(InsertOutcome::DroppedPolicy);
            }
        }

        priority = priority.saturating_add(self.age() as u32);

        // Step 2: effective storage key.
        let key = storage_key(&content_hash, block_type);
        let bucket = compute_bucket(&key, self.buckets);

        // Step 3: quota check / eviction.
        let available = self
            .backend
            .estimate_available(bucket, self.quota_blocks)
            .await?;
        if available <= 0 {
            let min_prio = self.backend.min_priority(bucket).await?.unwrap_or(0);
            if priority <= min_prio {
                return Ok(InsertOutcome::DroppedQuota);
            }
            let to_evict = EVICTION_BATCH - available;
            for _ in 0..to_evict.max(0) {
                match self.backend.evict_lowest_priority(bucket).await? {
                    Some((_evicted_key, row)) => {
                        for entry in row.entries() {
                            self.bloom.on_evict(&entry.descriptor.content_hash, entry.descriptor.block_type);
                        }
                    }
                    None => break,
                }
            }
        }

        // Step 4: read existing entry.
        let existing = self.backend.get(bucket, &key).await?;
        let descriptor = ContentDescriptor {
            content_hash,
            block_type,
            priority,
            file_index,
            file_offset,
        };
        let new_entry = Entry {
            descriptor,
            payload: payload.clone(),
        };

        let outcome = if block_type.is_multi_reply() {
            self.insert_multi(bucket, &key, block_type, existing, new_entry)
                .await?
        } else {
            self.insert_single(bucket, &key, existing, new_entry).await?
        };

        if matches!(outcome, InsertOutcome::Written | InsertOutcome::Migrated) {
            self.bloom.add(&content_hash, block_type);
        }
        Ok(outcome)
    }

    async fn insert_multi(
        &self,
        bucket: usize,
        key: &ContentHash,
        block_type: BlockType,
        existing: Option<Row>,
        new_entry: Entry,
    ) -> Result<InsertOutcome, Error> {
        match existing {
            None => {
                self.backend
                    .put(bucket, key, Row::Entries(vec![new_entry]))
                    .await?;
                Ok(InsertOutcome::Written)
            }
            Some(Row::Sentinel) => {
                // Sentinel rows redirect to the large-reply store; check for
                // a byte-identical duplicate there first.
                let mut existing_blocks = Vec::new();
                self.large_replies.read_all(key, &mut existing_blocks)?;
                if existing_blocks
                    .iter()
                    .any(|b| b.0[..new_entry.payload.len()] == new_entry.payload[..])
                {
                    return Ok(InsertOutcome::Duplicate);
                }
                let (block, _) = Block::from_slice_padded(&new_entry.payload);
                self.large_replies.append(key, &block)?;
                Ok(InsertOutcome::Written)
            }
            Some(Row::Entries(mut entries)) => {
                if entries.len() >= MIGRATE_AT_COUNT {
                    for e in &entries {
                        let (block, _) = Block::from_slice_padded(&e.payload);
                        self.large_replies.append(key, &block)?;
                    }
                    let (block, _) = Block::from_slice_padded(&new_entry.payload);
                    self.large_replies.append(key, &block)?;
                    self.backend.put(bucket, key, Row::Sentinel).await?;
                    return Ok(InsertOutcome::Migrated);
                }
                if entries.iter().any(|e| e.payload == new_entry.payload) {
                    return Ok(InsertOutcome::Duplicate);
                }
                entries.push(new_entry);
                self.backend.put(bucket, key, Row::Entries(entries)).await?;
                let _ = block_type;
                Ok(InsertOutcome::Written)
            }
        }
    }

    async fn insert_single(
        &self,
        bucket: usize,
        key: &ContentHash,
        existing: Option<Row>,
        new_entry: Entry,
    ) -> Result<InsertOutcome, Error> {
        let replace = match existing {
            None => true,
            Some(Row::Sentinel) => true,
            Some(Row::Entries(entries)) => match entries.first() {
                None => true,
                Some(old) => {
                    let old_indexed = old.descriptor.is_indexed();
                    let new_indexed = new_entry.descriptor.is_indexed();
                    match (old_indexed, new_indexed) {
                        (true, true) => new_entry.descriptor.priority > old.descriptor.priority,
                        (true, false) => false,
                        (false, true) => true,
                        (false, false) => {
                            old.payload.len() != new_entry.payload.len()
                                || new_entry.descriptor.priority > old.descriptor.priority
                        }
                    }
                }
            },
        };
        if !replace {
            return Ok(InsertOutcome::Duplicate);
        }
        self.backend
            .put(bucket, key, Row::Entries(vec![new_entry]))
            .await?;
        Ok(InsertOutcome::Written)
    }

    /// Retrieves everything stored at `key` for `block_type`, dispatching
    /// to the large-reply store when the row is a sentinel, and performing
    /// on-demand encryption for indexed descriptors (§4.D Retrieve
    /// algorithm).
    #[tracing::instrument(skip(self))]
    pub async fn retrieve(
        &self,
        query_key: &ContentHash,
        block_type: BlockType,
        origin: Origin,
        priority: u32,
        network_load_up: i64,
    ) -> Result<Vec<Retrieved>, Error> {
        if !self.bloom.test(query_key, block_type) {
            return Ok(Vec::new());
        }
        let key = storage_key(query_key, block_type);
        let bucket = compute_bucket(&key, self.buckets);
        let row = match self.backend.get(bucket, &key).await? {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };

        if row.is_sentinel() {
            let mut blocks = Vec::new();
            if origin.is_remote() {
                self.large_replies
                    .read_random(&key, &mut blocks, priority, network_load_up)?;
            } else {
                self.large_replies.read_all(&key, &mut blocks)?;
            }
            return Ok(blocks
                .into_iter()
                .map(|b| Retrieved {
                    block_type,
                    double_hash: (block_type == BlockType::ThreeHash).then_some(key),
                    payload: b.0.to_vec(),
                })
                .collect());
        }

        let mut out = Vec::new();
        for entry in row.entries() {
            if entry.descriptor.is_indexed() {
                out.extend(self.encode_on_demand(&entry.descriptor, 1)?);
            } else {
                out.push(Retrieved {
                    block_type: entry.descriptor.block_type,
                    double_hash: (entry.descriptor.block_type == BlockType::ThreeHash)
                        .then_some(key),
                    payload: entry.payload.clone(),
                });
            }
        }
        Ok(out)
    }

    /// On-demand encoding for an indexed descriptor: reads `read_count`
    /// sequential blocks starting at `descriptor.file_offset` from the
    /// indexed file and encrypts each with a key derived from the
    /// plaintext's own hash (§4.D Retrieve algorithm; §4.G migration uses
    /// `read_count > 1` to encode a linear run in one disk pass).
    pub fn encode_on_demand(
        &self,
        descriptor: &ContentDescriptor,
        read_count: u32,
    ) -> Result<Vec<Retrieved>, Error> {
        use std::io::{Read, Seek, SeekFrom};

        let path = self.file_index.lookup(descriptor.file_index)?;
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(descriptor.file_offset))?;

        let mut out = Vec::with_capacity(read_count as usize);
        for _ in 0..read_count.max(1) {
            let mut buf = vec![0u8; BLOCK_SIZE];
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            let plaintext_hash = ContentHash::of(&buf);
            let ciphertext = encrypt_block(&buf, &plaintext_hash);
            out.push(Retrieved {
                block_type: descriptor.block_type,
                double_hash: None,
                payload: ciphertext,
            });
        }
        Ok(out)
    }

    /// Picks a uniformly random bucket and asks the backend for a random
    /// row (§4.D "Random retrieval"), used by the migration engine (§4.G).
    pub async fn random_content(&self) -> Result<Option<(ContentHash, Row)>, Error> {
        let bucket = rand::thread_rng().gen_range(0..self.buckets);
        self.backend.random_row(bucket).await
    }

    pub fn bucket_of(&self, key: &ContentHash) -> usize {
        compute_bucket(key, self.buckets)
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }
}

/// A `sled`-backed implementation: one [`sled::Tree`] per bucket, rows
/// serialized as JSON (matching the rest of the crate's persisted-state
/// encoding in [`crate::config`], rather than introducing a second
/// serialization format for one backend).
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(dir.as_ref()).map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    fn tree(&self, bucket: usize) -> Result<sled::Tree, Error> {
        self.db
            .open_tree(format!("bucket-{bucket}"))
            .map_err(|e| Error::Backend(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Row, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Backend(e.to_string()))
    }

    fn encode(row: &Row) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(row).map_err(|e| Error::Backend(e.to_string()))
    }
}

#[async_trait]
impl Backend for SledBackend {
    async fn get(&self, bucket: usize, key: &ContentHash) -> Result<Option<Row>, Error> {
        let tree = self.tree(bucket)?;
        match tree
            .get(key.as_bytes())
            .map_err(|e| Error::Backend(e.to_string()))?
        {
            Some(ivec) => Ok(Some(Self::decode(&ivec)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, bucket: usize, key: &ContentHash, row: Row) -> Result<(), Error> {
        let tree = self.tree(bucket)?;
        let bytes = Self::encode(&row)?;
        tree.insert(key.as_bytes(), bytes)
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, bucket: usize, key: &ContentHash) -> Result<(), Error> {
        let tree = self.tree(bucket)?;
        tree.remove(key.as_bytes())
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(())
    }

    async fn count(&self, bucket: usize) -> Result<u64, Error> {
        Ok(self.tree(bucket)?.len() as u64)
    }

    async fn estimate_available(&self, bucket: usize, share_blocks: i64) -> Result<i64, Error> {
        let used = self.tree(bucket)?.len() as i64;
        Ok(share_blocks - used)
    }

    async fn evict_lowest_priority(
        &self,
        bucket: usize,
    ) -> Result<Option<(ContentHash, Row)>, Error> {
        let tree = self.tree(bucket)?;
        let mut lowest: Option<(ContentHash, Row, u32)> = None;
        for item in tree.iter() {
            let (k, v) = item.map_err(|e| Error::Backend(e.to_string()))?;
            let row = Self::decode(&v)?;
            let prio = row
                .entries()
                .iter()
                .map(|e| e.descriptor.priority)
                .min()
                .unwrap_or(0);
            let hash = ContentHash::try_from(k.as_ref())
                .map_err(|e| Error::Backend(e.to_string()))?;
            if lowest.as_ref().map(|(_, _, p)| prio < *p).unwrap_or(true) {
                lowest = Some((hash, row, prio));
            }
        }
        match lowest {
            Some((hash, row, _)) => {
                tree.remove(hash.as_bytes())
                    .map_err(|e| Error::Backend(e.to_string()))?;
                Ok(Some((hash, row)))
            }
            None => Ok(None),
        }
    }

    async fn min_priority(&self, bucket: usize) -> Result<Option<u32>, Error> {
        let tree = self.tree(bucket)?;
        let mut min = None;
        for item in tree.iter() {
            let (_, v) = item.map_err(|e| Error::Backend(e.to_string()))?;
            let row = Self::decode(&v)?;
            for e in row.entries() {
                min = Some(min.map_or(e.descriptor.priority, |m: u32| m.min(e.descriptor.priority)));
            }
        }
        Ok(min)
    }

    async fn random_row(&self, bucket: usize) -> Result<Option<(ContentHash, Row)>, Error> {
        let tree = self.tree(bucket)?;
        let len = tree.len();
        if len == 0 {
            return Ok(None);
        }
        let skip = rand::thread_rng().gen_range(0..len);
        if let Some(item) = tree.iter().skip(skip).next() {
            let (k, v) = item.map_err(|e| Error::Backend(e.to_string()))?;
            let row = Self::decode(&v)?;
            let hash = ContentHash::try_from(k.as_ref())
                .map_err(|e| Error::Backend(e.to_string()))?;
            return Ok(Some((hash, row)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// A backend double whose quota/priority signals are set directly
    /// rather than derived from thousands of real inserts, so the eviction
    /// decision (§4.D step 3, §8 scenario 4: "priority eviction") can be
    /// tested without filling a real bucket to its quota.
    struct MockBackend {
        available: i64,
        min_priority: Option<u32>,
        evictions: StdMutex<u32>,
        rows: StdMutex<std::collections::HashMap<ContentHash, Row>>,
    }

    impl MockBackend {
        fn new(available: i64, min_priority: Option<u32>) -> Self {
            Self {
                available,
                min_priority,
                evictions: StdMutex::new(0),
                rows: StdMutex::new(std::collections::HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn get(&self, _bucket: usize, key: &ContentHash) -> Result<Option<Row>, Error> {
            Ok(self.rows.lock().unwrap().get(key).cloned())
        }
        async fn put(&self, _bucket: usize, key: &ContentHash, row: Row) -> Result<(), Error> {
            self.rows.lock().unwrap().insert(*key, row);
            Ok(())
        }
        async fn delete(&self, _bucket: usize, key: &ContentHash) -> Result<(), Error> {
            self.rows.lock().unwrap().remove(key);
            Ok(())
        }
        async fn count(&self, _bucket: usize) -> Result<u64, Error> {
            Ok(self.rows.lock().unwrap().len() as u64)
        }
        async fn estimate_available(&self, _bucket: usize, _share_blocks: i64) -> Result<i64, Error> {
            Ok(self.available)
        }
        async fn evict_lowest_priority(
            &self,
            _bucket: usize,
        ) -> Result<Option<(ContentHash, Row)>, Error> {
            *self.evictions.lock().unwrap() += 1;
            Ok(None)
        }
        async fn min_priority(&self, _bucket: usize) -> Result<Option<u32>, Error> {
            Ok(self.min_priority)
        }
        async fn random_row(&self, _bucket: usize) -> Result<Option<(ContentHash, Row)>, Error> {
            Ok(None)
        }
    }

    fn manager(tmp: &tempfile::TempDir) -> Manager<SledBackend> {
        let backend = Arc::new(SledBackend::open(tmp.path().join("db")).unwrap());
        let bloom = Arc::new(BloomFilters::open(tmp.path().join("bloom"), 64).unwrap());
        let file_index = Arc::new(FileIndex::open(tmp.path().join("fi.lst")).unwrap());
        let large_replies = Arc::new(largereply::Store::open(tmp.path().join("lr")).unwrap());
        Manager::new(backend, bloom, file_index, large_replies, 64, true, 0)
    }

    #[tokio::test]
    async fn insert_then_retrieve_round_trips_chk() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let hash = ContentHash::of(b"ciphertext");
        let payload = vec![1u8; BLOCK_SIZE];
        let outcome = mgr
            .insert(hash, BlockType::Chk, 5, 0, 0, payload.clone(), Origin::Local)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Written);

        let got = mgr
            .retrieve(&hash, BlockType::Chk, Origin::Local, 0, 0)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, payload);
    }

    #[tokio::test]
    async fn single_reply_never_downgrades_indexed_to_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let hash = ContentHash::of(b"k");
        mgr.insert(hash, BlockType::Chk, 1, 7, 0, vec![], Origin::Local)
            .await
            .unwrap();
        let outcome = mgr
            .insert(hash, BlockType::Chk, 100, 0, 0, vec![9; 4], Origin::Local)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn multi_reply_migrates_at_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let hash = ContentHash::of(b"kw");
        for i in 0..MIGRATE_AT_COUNT {
            let payload = vec![i as u8; 8];
            let outcome = mgr
                .insert(hash, BlockType::ThreeHash, 1, 0, 0, payload, Origin::Local)
                .await
                .unwrap();
            assert_eq!(outcome, InsertOutcome::Written);
        }
        let final_outcome = mgr
            .insert(
                hash,
                BlockType::ThreeHash,
                1,
                0,
                0,
                vec![0xffu8; 8],
                Origin::Local,
            )
            .await
            .unwrap();
        assert_eq!(final_outcome, InsertOutcome::Migrated);

        let key = storage_key(&hash, BlockType::ThreeHash);
        let bucket = mgr.bucket_of(&key);
        let row = mgr.backend.get(bucket, &key).await.unwrap().unwrap();
        assert!(row.is_sentinel());
    }

    #[tokio::test]
    async fn remote_insert_rejected_without_active_migration() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(SledBackend::open(tmp.path().join("db")).unwrap());
        let bloom = Arc::new(BloomFilters::open(tmp.path().join("bloom"), 64).unwrap());
        let file_index = Arc::new(FileIndex::open(tmp.path().join("fi.lst")).unwrap());
        let large_replies = Arc::new(largereply::Store::open(tmp.path().join("lr")).unwrap());
        let mgr = Manager::new(backend, bloom, file_index, large_replies, 64, false, 0);
        let hash = ContentHash::of(b"k");
        let origin = Origin::Remote(PeerId::new(ContentHash::of(b"peer")));
        let outcome = mgr
            .insert(hash, BlockType::Chk, 5, 0, 0, vec![1, 2, 3], origin)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::DroppedPolicy);
    }

    /// §8 scenario 4: "Node A's database is full. A query/insert for CHK
    /// with priority 1 arrives. Expected: the insert is dropped because the
    /// bucket minimum priority exceeds 1."
    #[tokio::test]
    async fn insert_dropped_when_over_quota_and_below_bucket_minimum_priority() {
        let tmp = tempfile::tempdir().unwrap();
        let bloom = Arc::new(BloomFilters::open(tmp.path().join("bloom"), 64).unwrap());
        let file_index = Arc::new(FileIndex::open(tmp.path().join("fi.lst")).unwrap());
        let large_replies = Arc::new(largereply::Store::open(tmp.path().join("lr")).unwrap());
        let backend = Arc::new(MockBackend::new(-1, Some(5)));
        let mgr = Manager::new(backend, bloom, file_index, large_replies, 64, true, 0);

        let hash = ContentHash::of(b"low-priority-block");
        let outcome = mgr
            .insert(hash, BlockType::Chk, 1, 0, 0, vec![1, 2, 3], Origin::Local)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::DroppedQuota);
        assert_eq!(*mgr.backend.evictions.lock().unwrap(), 0);
    }

    /// Same over-quota condition, but the new priority beats the bucket
    /// minimum: eviction runs and the write proceeds.
    #[tokio::test]
    async fn insert_evicts_and_succeeds_when_priority_beats_bucket_minimum() {
        let tmp = tempfile::tempdir().unwrap();
        let bloom = Arc::new(BloomFilters::open(tmp.path().join("bloom"), 64).unwrap());
        let file_index = Arc::new(FileIndex::open(tmp.path().join("fi.lst")).unwrap());
        let large_replies = Arc::new(largereply::Store::open(tmp.path().join("lr")).unwrap());
        let backend = Arc::new(MockBackend::new(-1, Some(5)));
        let mgr = Manager::new(backend, bloom, file_index, large_replies, 64, true, 0);

        let hash = ContentHash::of(b"high-priority-block");
        let outcome = mgr
            .insert(hash, BlockType::Chk, 100, 0, 0, vec![1, 2, 3], Origin::Local)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Written);
        assert!(*mgr.backend.evictions.lock().unwrap() > 0);
    }

    #[test]
    fn bucket_formula_is_within_range() {
        for seed in 0u8..50 {
            let h = ContentHash::of(&[seed]);
            let b = compute_bucket(&h, 17);
            assert!(b < 17);
        }
    }
}
