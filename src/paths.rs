// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Layout of the AFS data directory (§6 External Interfaces: "Bloom filter
//! files in the AFS data directory", "Index directory", "Large-reply
//! directory").
//!
//! This is a thin wrapper, not a general directories abstraction; the node
//! binary resolves `AFS/AFSDIR` via `directories::ProjectDirs` when the
//! operator leaves it unset (see [`crate::config`]), and everything below is
//! relative to whatever that resolves to.

use std::path::{Path, PathBuf};

/// The subdirectories and files `afsd` expects to find (or create) under the
/// configured `AFSDIR`.
#[derive(Clone, Debug)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the two bloom filter files live (§4.A).
    pub fn bloom_dir(&self) -> PathBuf {
        self.root.join("bloom")
    }

    /// The file-index list (§3 File-index table, §6).
    pub fn file_index(&self) -> PathBuf {
        self.root.join("fileindex.lst")
    }

    /// User-indexed files or symlinks to them, named by content-hash hex
    /// (§6 Index directory).
    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    /// One file per exceptional query key, named by hex of the key (§6
    /// Large-reply directory).
    pub fn large_reply_dir(&self) -> PathBuf {
        self.root.join("largereply")
    }

    /// Where the persisted state-store keys (`VERSION`, `AFS-DISKQUOTA`,
    /// `AFS-DATABASETYPE`, the priority-aging counter) live.
    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    /// Creates every directory this layout names, idempotently.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.bloom_dir(),
            self.index_dir(),
            self.large_reply_dir(),
            self.database_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_every_subdir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        paths.ensure().unwrap();
        assert!(paths.bloom_dir().is_dir());
        assert!(paths.index_dir().is_dir());
        assert!(paths.large_reply_dir().is_dir());
        assert!(paths.database_dir().is_dir());
    }
}
