// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The file-index table (§4.B): a persistent `u16 → path` mapping backed by
//! a single newline-delimited file, one mutex guarding both the in-memory
//! vector and the on-disk file (§3 File-index table).

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use thiserror::Error;

/// Position 0 is reserved for "not indexed" (§3); entries are 1-based.
pub const MAX_ENTRIES: usize = 65_535;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("file index is full: {MAX_ENTRIES} entries already registered")]
    Full,

    #[error("no file indexed at position {0}")]
    NotFound(u16),

    #[error("position {0} has been unindexed")]
    Tombstoned(u16),
}

/// One slot in the table: either a live pathname or a tombstone left behind
/// by `unindex` (§4.B: "tombstoned... without renumbering surviving
/// entries").
#[derive(Clone, Debug, Eq, PartialEq)]
enum Entry {
    Live(PathBuf),
    Tombstone,
}

struct Inner {
    path: PathBuf,
    entries: Vec<Entry>,
}

/// Persistent `u16 → path` mapping, one mutex serializing every read and
/// write of both the vector and the backing file (§3).
pub struct FileIndex {
    inner: Mutex<Inner>,
}

impl FileIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)?;
            text.lines()
                .map(|line| {
                    if line.is_empty() {
                        Entry::Tombstone
                    } else {
                        Entry::Live(PathBuf::from(line))
                    }
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            inner: Mutex::new(Inner { path, entries }),
        })
    }

    /// Idempotent: a second `append` of the same path returns the same
    /// index (§8 round-trip property).
    pub fn append(&self, path: impl AsRef<Path>) -> Result<u16, Error> {
        let path = path.as_ref();
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.entries.iter().position(|e| match e {
            Entry::Live(p) => p == path,
            Entry::Tombstone => false,
        }) {
            return Ok((pos + 1) as u16);
        }
        if inner.entries.len() >= MAX_ENTRIES {
            return Err(Error::Full);
        }
        inner.entries.push(Entry::Live(path.to_path_buf()));
        let idx = inner.entries.len() as u16;
        Self::persist(&inner)?;
        Ok(idx)
    }

    pub fn lookup(&self, index: u16) -> Result<PathBuf, Error> {
        if index == 0 {
            return Err(Error::NotFound(0));
        }
        let inner = self.inner.lock();
        match inner.entries.get(index as usize - 1) {
            Some(Entry::Live(p)) => Ok(p.clone()),
            Some(Entry::Tombstone) => Err(Error::Tombstoned(index)),
            None => Err(Error::NotFound(index)),
        }
    }

    pub fn unindex(&self, index: u16) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        match inner.entries.get(index.wrapping_sub(1) as usize) {
            Some(Entry::Live(_)) => {
                inner.entries[index as usize - 1] = Entry::Tombstone;
                Self::persist(&inner)
            }
            Some(Entry::Tombstone) => Ok(()),
            None => Err(Error::NotFound(index)),
        }
    }

    /// Iterates every live entry under the lock, releasing it during each
    /// callback invocation so the callback may itself call back into this
    /// table without deadlocking (§4.B). If `callback` reports failure for
    /// an entry, that entry is tombstoned; the file is rewritten once after
    /// the whole iteration completes.
    pub fn for_each<F>(&self, mut callback: F) -> Result<(), Error>
    where
        F: FnMut(u16, &Path) -> bool,
    {
        let snapshot: Vec<(u16, PathBuf)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .iter()
                .enumerate()
                .filter_map(|(i, e)| match e {
                    Entry::Live(p) => Some(((i + 1) as u16, p.clone())),
                    Entry::Tombstone => None,
                })
                .collect()
        };

        let mut to_tombstone = Vec::new();
        for (index, path) in snapshot {
            if !callback(index, &path) {
                to_tombstone.push(index);
            }
        }

        if !to_tombstone.is_empty() {
            let mut inner = self.inner.lock();
            for index in to_tombstone {
                if let Some(slot) = inner.entries.get_mut(index as usize - 1) {
                    *slot = Entry::Tombstone;
                }
            }
            Self::persist(&inner)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(inner: &Inner) -> Result<(), Error> {
        let mut text = String::new();
        for entry in &inner.entries {
            match entry {
                Entry::Live(p) => {
                    text.push_str(&p.to_string_lossy());
                }
                Entry::Tombstone => {}
            }
            text.push('\n');
        }
        if let Some(parent) = inner.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&inner.path, text)?;
        Ok(())
    }
}
