// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The large-reply store (§4.C): one file per 160-bit query key, holding an
//! append-only sequence of blocks, used when a keyword-search result set
//! outgrows the database's per-row block limit (§4.D step 5).
//!
//! All I/O is serialized by one store-wide mutex rather than a lock per
//! file (§5 Shared-resource policy: "acceptable because large-reply writes
//! are rare").

use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use rand::seq::index::sample;
use thiserror::Error;

use crate::{
    block::{Block, BLOCK_SIZE},
    hash::ContentHash,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Store {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &ContentHash) -> PathBuf {
        self.dir.join(key.to_hex())
    }

    /// Opens (creating if absent) the file for `key`, truncating it to a
    /// whole number of blocks if a prior crash left a partial trailing
    /// block (§7 Recoverable corruption).
    fn open_truncated(&self, key: &ContentHash) -> Result<(fs::File, u64), Error> {
        let path = self.path_for(key);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let rem = len % BLOCK_SIZE as u64;
        let good_len = if rem != 0 {
            tracing::warn!(
                key = %key,
                len,
                "large-reply file length is not a block multiple, truncating"
            );
            let good = len - rem;
            file.set_len(good)?;
            good
        } else {
            len
        };
        Ok((file, good_len))
    }

    pub fn append(&self, key: &ContentHash, block: &Block) -> Result<(), Error> {
        let _guard = self.lock.lock();
        let (mut file, good_len) = self.open_truncated(key)?;
        file.seek(SeekFrom::Start(good_len))?;
        file.write_all(&block.0[..])?;
        Ok(())
    }

    /// Reads every block in the file, in on-disk order (§4.C: used for
    /// local-client queries, which get the full result set).
    pub fn read_all(&self, key: &ContentHash, out: &mut Vec<Block>) -> Result<usize, Error> {
        let _guard = self.lock.lock();
        let (mut file, good_len) = self.open_truncated(key)?;
        file.seek(SeekFrom::Start(0))?;
        let count = (good_len / BLOCK_SIZE as u64) as usize;
        for _ in 0..count {
            let mut block = Block::zeroed();
            file.read_exact(&mut block.0[..])?;
            out.push(block);
        }
        Ok(count)
    }

    /// Selects `min(len, max(1, (50 - network_load_up) · (priority+1)))`
    /// blocks uniformly at random without replacement (§4.C: the mechanism
    /// used to answer remote queries for very popular keywords, trading
    /// completeness for bounded reply size and some traffic shaping).
    pub fn read_random(
        &self,
        key: &ContentHash,
        out: &mut Vec<Block>,
        priority: u32,
        network_load_up: i64,
    ) -> Result<usize, Error> {
        let _guard = self.lock.lock();
        let (mut file, good_len) = self.open_truncated(key)?;
        let total = (good_len / BLOCK_SIZE as u64) as usize;
        if total == 0 {
            return Ok(0);
        }

        let factor = (50 - network_load_up).max(0) as u64;
        let want = (factor * (priority as u64 + 1)).max(1) as usize;
        let want = want.min(total);

        let mut rng = rand::thread_rng();
        let indices = sample(&mut rng, total, want);
        let mut positions: Vec<usize> = indices.iter().collect();
        positions.sort_unstable();

        for pos in positions {
            file.seek(SeekFrom::Start(pos as u64 * BLOCK_SIZE as u64))?;
            let mut block = Block::zeroed();
            file.read_exact(&mut block.0[..])?;
            out.push(block);
        }
        Ok(want)
    }

    pub fn remove(&self, key: &ContentHash) -> Result<(), Error> {
        let _guard = self.lock.lock();
        let path = self.path_for(key);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
