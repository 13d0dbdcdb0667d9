// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Two counting bloom filters that short-circuit negative lookups (§4.A).
//!
//! Each filter is sized to `quota_kib · 8` positions and memory-mapped so it
//! survives restarts. `remove` is a counted decrement rather than a plain
//! clear, so that co-located keys sharing a position are not erased by an
//! unrelated eviction (§4.A, §8 round-trip property). The teacher's own
//! `bloom.rs` wraps an external `KMBloomFilter<Xxh3, SipHasher24>` that only
//! exposes plain insert/contains/union — it has no counted removal, which
//! this spec requires, so we keep its two-hash-family construction (`Xxh3`
//! for the primary hash, `SipHasher24` for the secondary, combined by double
//! hashing) but own the bit storage ourselves so eviction can decrement it.
//!
//! Open question resolved here: "sized to quota_kib · 8 bits" is taken to
//! mean that many *counter slots*, one byte each, rather than one bit each —
//! a plain bitset cannot support counted decrement at all. This trades exact
//! on-disk size for the counted-removal semantics the insert/evict path
//! requires; a migration tool converting an old single-bit file into
//! one-byte-per-slot is a deployment concern outside this crate, consistent
//! with §1's non-goal of exact wire/format backwards compatibility.

use std::{
    fs::OpenOptions,
    hash::{Hash, Hasher},
    io,
    path::Path,
};

use memmap2::MmapMut;
use siphasher::sip::SipHasher24;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::{block::BlockType, hash::ContentHash};

/// Hash positions probed per insert/test, chosen for a false-positive rate
/// of roughly 3% at full load (§4.A).
pub const HASHERS: usize = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bloom filter size mismatch: file has {on_disk} slots, configuration wants {wanted}")]
    SizeMismatch { on_disk: usize, wanted: usize },
}

/// A single counting bloom filter backed by a memory-mapped file.
pub struct CountingBloom {
    mmap: MmapMut,
    slots: usize,
    hashers: usize,
}

impl CountingBloom {
    /// Opens an existing filter file, or creates one sized `slots` bytes if
    /// absent. If the file exists but its size disagrees with `slots`, this
    /// is the fatal quota-mismatch condition of §6/§7: the caller must abort
    /// with a migration instruction rather than silently resizing.
    pub fn open(path: impl AsRef<Path>, slots: usize, hashers: usize) -> Result<Self, Error> {
        let path = path.as_ref();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if existed {
            let len = file.metadata()?.len() as usize;
            if len != slots {
                return Err(Error::SizeMismatch {
                    on_disk: len,
                    wanted: slots,
                });
            }
        } else {
            file.set_len(slots as u64)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            slots,
            hashers,
        })
    }

    #[cfg(test)]
    fn in_memory(slots: usize, hashers: usize) -> Self {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(slots as u64).unwrap();
        let mmap = unsafe { MmapMut::map_mut(file.as_file()).unwrap() };
        // Keep the tempfile alive for the lifetime of the test by leaking its
        // handle; tests are short-lived processes.
        std::mem::forget(file);
        Self {
            mmap,
            slots,
            hashers,
        }
    }

    fn positions(&self, key: &ContentHash) -> impl Iterator<Item = usize> + '_ {
        let h1 = xxh3_64(key.as_bytes());
        let h2 = {
            let mut s = SipHasher24::new();
            key.as_bytes().hash(&mut s);
            s.finish()
        };
        (0..self.hashers).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % self.slots as u64) as usize
        })
    }

    pub fn add(&mut self, key: &ContentHash) {
        for pos in self.positions(key).collect::<Vec<_>>() {
            let slot = &mut self.mmap[pos];
            *slot = slot.saturating_add(1);
        }
    }

    pub fn remove(&mut self, key: &ContentHash) {
        for pos in self.positions(key).collect::<Vec<_>>() {
            let slot = &mut self.mmap[pos];
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn test(&self, key: &ContentHash) -> bool {
        self.positions(key).all(|pos| self.mmap[pos] > 0)
    }

    pub fn reset(&mut self) {
        self.mmap.fill(0);
    }

    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

/// The pair of filters the content manager and indirection table share:
/// regular content, and `SUPER` keyword-bundle advertisements (§4.A).
pub struct BloomFilters {
    pub normal: parking_lot::Mutex<CountingBloom>,
    pub super_blocks: parking_lot::Mutex<CountingBloom>,
}

impl BloomFilters {
    pub fn open(
        dir: impl AsRef<Path>,
        quota_kib: u64,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let slots = (quota_kib as usize).saturating_mul(8);
        Ok(Self {
            normal: parking_lot::Mutex::new(CountingBloom::open(
                dir.join("content.bf"),
                slots,
                HASHERS,
            )?),
            super_blocks: parking_lot::Mutex::new(CountingBloom::open(
                dir.join("super.bf"),
                slots,
                HASHERS,
            )?),
        })
    }

    fn filter_for(&self, block_type: BlockType) -> &parking_lot::Mutex<CountingBloom> {
        match block_type {
            BlockType::Super => &self.super_blocks,
            _ => &self.normal,
        }
    }

    pub fn add(&self, key: &ContentHash, block_type: BlockType) {
        self.filter_for(block_type).lock().add(key);
    }

    /// The delete callback the content manager invokes during eviction
    /// (§4.A): routes to the correct filter by inspecting the evicted
    /// block's type.
    pub fn on_evict(&self, key: &ContentHash, block_type: BlockType) {
        self.filter_for(block_type).lock().remove(key);
    }

    pub fn test(&self, key: &ContentHash, block_type: BlockType) -> bool {
        self.filter_for(block_type).lock().test(key)
    }

    pub fn reset_all(&self) {
        self.normal.lock().reset();
        self.super_blocks.lock().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_test_is_true() {
        let mut bf = CountingBloom::in_memory(1024, HASHERS);
        let k = ContentHash::of(b"present");
        assert!(!bf.test(&k));
        bf.add(&k);
        assert!(bf.test(&k));
    }

    #[test]
    fn remove_clears_when_uncontended() {
        let mut bf = CountingBloom::in_memory(4096, HASHERS);
        let k = ContentHash::of(b"only-one");
        bf.add(&k);
        bf.remove(&k);
        assert!(!bf.test(&k));
    }

    #[test]
    fn remove_does_not_erase_colocated_key() {
        // A small filter makes position collisions likely; assert the
        // counted-decrement contract directly by adding the same key twice
        // (simulating two co-located keys whose positions fully overlap)
        // and removing it once.
        let mut bf = CountingBloom::in_memory(64, HASHERS);
        let a = ContentHash::of(b"a");
        bf.add(&a);
        bf.add(&a);
        bf.remove(&a);
        assert!(bf.test(&a), "one remaining reference must keep bits set");
        bf.remove(&a);
        assert!(!bf.test(&a));
    }

    #[test]
    fn reset_clears_everything() {
        let mut bf = CountingBloom::in_memory(1024, HASHERS);
        let k = ContentHash::of(b"x");
        bf.add(&k);
        bf.reset();
        assert!(!bf.test(&k));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bf");
        CountingBloom::open(&path, 1024, HASHERS).unwrap();
        let err = CountingBloom::open(&path, 2048, HASHERS).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { .. }));
    }

    #[test]
    fn routes_super_blocks_to_separate_filter() {
        let dir = tempfile::tempdir().unwrap();
        let filters = BloomFilters::open(dir.path(), 1).unwrap();
        let k = ContentHash::of(b"bundle");
        filters.add(&k, BlockType::Super);
        assert!(filters.test(&k, BlockType::Super));
        assert!(!filters.test(&k, BlockType::Chk));
    }
}
