// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The `AFS/*` configuration keys (§6 Configuration) and the persisted
//! state-store keys they are checked against at startup (§6 Persistent
//! state, §7 Fatal-at-startup).

use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::Paths;

/// The on-wire/on-disk protocol version this build implements. Bumped only
/// when the persisted-state schema changes incompatibly (§6 `VERSION`).
pub const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(
        "disk quota mismatch: bloom filters were sized for {on_disk} KiB, configuration wants \
         {configured} KiB; run the migration tool before starting with a different quota"
    )]
    QuotaMismatch { on_disk: u32, configured: u32 },

    #[error("protocol version mismatch: on-disk state is version {on_disk}, this build is {ours}")]
    VersionMismatch { on_disk: u32, ours: u32 },

    #[error("AFS/DISKQUOTA must be > 0")]
    ZeroQuota,
}

/// The six `AFS/*` keys from §6, plus the derived [`Paths`]. Loaded by the
/// `afsd` binary from CLI args (`src/args.rs`) overriding a config file,
/// mirroring the teacher's `node-lib::cfg::Cfg::from_args` composition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// `AFS/DISKQUOTA`: MiB, required, > 0. Sizes the bloom filters and the
    /// content-manager bucket count.
    pub disk_quota_mib: u32,
    /// `AFS/DATABASETYPE`: the selected backend's name.
    pub database_type: String,
    /// `AFS/ACTIVEMIGRATION`: default false.
    #[serde(default)]
    pub active_migration: bool,
    /// `AFS/AFSDIR`: required.
    pub afs_dir: PathBuf,
    /// `AFS/INDEX-DIRECTORY`: required for client-indexing.
    pub index_directory: Option<PathBuf>,
    /// `AFS/INDEX-QUOTA`: MiB, 0 = unlimited.
    #[serde(default)]
    pub index_quota_mib: u32,
    /// `AFS/INDIRECTIONTABLESIZE`: default 8192, rounded up to a power of
    /// two by [`crate::indirect::Table`].
    #[serde(default = "default_indirection_table_size")]
    pub indirection_table_size: u32,
}

fn default_indirection_table_size() -> u32 {
    8192
}

impl Config {
    pub fn paths(&self) -> Paths {
        Paths::new(&self.afs_dir)
    }

    pub fn disk_quota_kib(&self) -> u64 {
        self.disk_quota_mib as u64 * 1024
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.disk_quota_mib == 0 {
            return Err(Error::ZeroQuota);
        }
        Ok(())
    }

    /// Loads the persisted `VERSION` / `AFS-DISKQUOTA` / `AFS-DATABASETYPE`
    /// state and fatally rejects any mismatch with `self` (§6, §7). If no
    /// state file exists yet, one is written for this configuration (first
    /// run).
    pub fn load_persisted(&self) -> Result<PersistedState, Error> {
        self.validate()?;
        let path = self.paths().state_file();
        if !path.exists() {
            let fresh = PersistedState {
                version: VERSION,
                disk_quota_kib: self.disk_quota_kib() as u32,
                database_type: self.database_type.clone(),
                age: 0,
            };
            self.paths().ensure()?;
            fs::write(&path, serde_json::to_vec_pretty(&fresh)?)?;
            return Ok(fresh);
        }
        let bytes = fs::read(&path)?;
        let state: PersistedState = serde_json::from_slice(&bytes)?;
        if state.version != VERSION {
            return Err(Error::VersionMismatch {
                on_disk: state.version,
                ours: VERSION,
            });
        }
        let configured = self.disk_quota_kib() as u32;
        if state.disk_quota_kib != configured {
            return Err(Error::QuotaMismatch {
                on_disk: state.disk_quota_kib,
                configured,
            });
        }
        Ok(state)
    }

    pub fn save_persisted(&self, state: &PersistedState) -> Result<(), Error> {
        let path = self.paths().state_file();
        fs::write(path, serde_json::to_vec_pretty(state)?)?;
        Ok(())
    }
}

/// The `VERSION` / `AFS-DISKQUOTA` / `AFS-DATABASETYPE` keys (§6 Persistent
/// state) plus the priority-aging counter (§4.D Priority aging;
/// `MANAGER_age` in §9's design notes), all folded into one small JSON blob
/// rather than three separate state-store entries, matching how the
/// teacher's `Profile` collapses several on-disk concerns into one file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub disk_quota_kib: u32,
    #[serde(skip)]
    pub database_type: String,
    pub age: u64,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: VERSION,
            disk_quota_kib: 0,
            database_type: String::new(),
            age: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(tmp: &tempfile::TempDir) -> Config {
        Config {
            disk_quota_mib: 64,
            database_type: "sled".into(),
            active_migration: false,
            afs_dir: tmp.path().to_path_buf(),
            index_directory: None,
            index_quota_mib: 0,
            indirection_table_size: 8192,
        }
    }

    #[test]
    fn first_run_creates_state() {
        let tmp = tempfile::tempdir().unwrap();
        let c = cfg(&tmp);
        let state = c.load_persisted().unwrap();
        assert_eq!(state.version, VERSION);
        assert_eq!(state.disk_quota_kib, 64 * 1024);
    }

    #[test]
    fn quota_mismatch_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let c = cfg(&tmp);
        c.load_persisted().unwrap();
        let mut c2 = cfg(&tmp);
        c2.disk_quota_mib = 128;
        let err = c2.load_persisted().unwrap_err();
        assert!(matches!(err, Error::QuotaMismatch { .. }));
    }

    #[test]
    fn zero_quota_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut c = cfg(&tmp);
        c.disk_quota_mib = 0;
        assert!(matches!(c.validate(), Err(Error::ZeroQuota)));
    }
}
