// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Command-line surface for `afsd`, mirroring the teacher's `node-lib::args::
//! Args` composition: one flat struct of `--long` flags, each documented with
//! a doc comment `structopt` turns into `--help` text, corresponding directly
//! to the `AFS/*` keys from §6.

use std::path::PathBuf;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
pub struct Args {
    /// `AFS/DISKQUOTA`: total disk space, in MiB, this node may use for
    /// cached content and its bloom filters.
    #[structopt(long = "disk-quota", env = "AFS_DISKQUOTA")]
    pub disk_quota_mib: u32,

    /// `AFS/DATABASETYPE`: name of the storage backend. Only `sled` is built
    /// in; the name is still recorded so persisted state can detect a
    /// mismatched rebuild.
    #[structopt(long = "database-type", env = "AFS_DATABASETYPE", default_value = "sled")]
    pub database_type: String,

    /// `AFS/ACTIVEMIGRATION`: accept inserts relayed by remote peers rather
    /// than only caching what this node resolves itself.
    #[structopt(long = "active-migration", env = "AFS_ACTIVEMIGRATION")]
    pub active_migration: bool,

    /// `AFS/AFSDIR`: root of the node's persistent state (bloom filters,
    /// file index, large-reply store, database). Falls back to
    /// `directories::ProjectDirs` when unset.
    #[structopt(long = "afs-dir", env = "AFS_AFSDIR")]
    pub afs_dir: Option<PathBuf>,

    /// `AFS/INDEX-DIRECTORY`: where client-indexed files (or symlinks to
    /// them) are expected to live.
    #[structopt(long = "index-directory", env = "AFS_INDEX_DIRECTORY")]
    pub index_directory: Option<PathBuf>,

    /// `AFS/INDEX-QUOTA`: MiB a client may index before further indexing is
    /// refused; 0 means unlimited.
    #[structopt(long = "index-quota", env = "AFS_INDEX_QUOTA", default_value = "0")]
    pub index_quota_mib: u32,

    /// `AFS/INDIRECTIONTABLESIZE`: requested indirection table size, rounded
    /// up to a power of two and floored at
    /// [`crate::indirect::N_MIN`].
    #[structopt(
        long = "indirection-table-size",
        env = "AFS_INDIRECTIONTABLESIZE",
        default_value = "8192"
    )]
    pub indirection_table_size: u32,
}

impl Args {
    /// Resolves the configured `AFSDIR`, falling back to the OS-appropriate
    /// data directory when the operator left it unset (§6: "falls back to
    /// `directories::ProjectDirs` when `AFS/AFSDIR` is not set").
    pub fn resolve_afs_dir(&self) -> Option<PathBuf> {
        self.afs_dir.clone().or_else(|| {
            directories::ProjectDirs::from("", "", "afsd")
                .map(|dirs| dirs.data_dir().to_path_buf())
        })
    }
}

impl From<&Args> for crate::config::Config {
    fn from(args: &Args) -> Self {
        crate::config::Config {
            disk_quota_mib: args.disk_quota_mib,
            database_type: args.database_type.clone(),
            active_migration: args.active_migration,
            afs_dir: args.resolve_afs_dir().unwrap_or_else(|| PathBuf::from(".afs")),
            index_directory: args.index_directory.clone(),
            index_quota_mib: args.index_quota_mib,
            indirection_table_size: args.indirection_table_size,
        }
    }
}
