// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Query-routing and content-management core of an anonymous file-sharing
//! overlay node.
//!
//! This crate is the node-resident engine: it does not parse client-server
//! wire frames (a thin demuxer elsewhere owns that), does not encode files
//! into blocks (the ECRS encoder is a separate library the caller invokes
//! first), and does not open network sockets (the transport layer hands this
//! crate already-decoded messages and asks it to fill outgoing buffers).

pub mod args;
pub mod block;
pub mod bloom;
pub mod config;
pub mod content;
pub mod cron;
pub mod error;
pub mod fileindex;
pub mod handler;
pub mod hash;
pub mod indirect;
pub mod largereply;
pub mod logging;
pub mod migration;
pub mod paths;
pub mod peer;
pub mod policy;
pub mod query;
pub mod stats;
pub mod wire;

use std::{sync::Arc, time::Duration};

pub use error::Error;
pub use hash::ContentHash;
pub use peer::PeerId;

/// Aggregates every subsystem behind the handles the dispatch layer (§4.H)
/// needs. Constructed once at startup; subsystems hold `Arc`s to each other's
/// public handles rather than reaching through globals.
pub struct AfsCore<B: content::Backend> {
    pub config: config::Config,
    pub bloom: Arc<bloom::BloomFilters>,
    pub file_index: Arc<fileindex::FileIndex>,
    pub large_replies: Arc<largereply::Store>,
    pub content: Arc<content::Manager<B>>,
    pub indirection: Arc<indirect::Table>,
    pub query: Arc<query::Manager>,
    pub migration: Arc<migration::Engine>,
    pub stats: Arc<stats::Stats>,
}

impl<B: content::Backend + 'static> AfsCore<B> {
    /// Opens every on-disk subsystem under `config.afs_dir` and wires them
    /// together, picking up wherever `persisted_age` (the priority-aging
    /// counter from [`config::PersistedState`]) left off.
    pub fn assemble(config: config::Config, backend: Arc<B>, persisted_age: u64) -> Result<Self, Error> {
        let paths = config.paths();
        paths.ensure()?;

        let bloom = Arc::new(bloom::BloomFilters::open(paths.bloom_dir(), config.disk_quota_kib())?);
        let file_index = Arc::new(fileindex::FileIndex::open(paths.file_index())?);
        let large_replies = Arc::new(largereply::Store::open(paths.large_reply_dir())?);
        let content = Arc::new(content::Manager::new(
            backend,
            Arc::clone(&bloom),
            Arc::clone(&file_index),
            Arc::clone(&large_replies),
            config.disk_quota_mib,
            config.active_migration,
            persisted_age,
        ));
        let indirection = Arc::new(indirect::Table::new(config.indirection_table_size));
        let query = Arc::new(query::Manager::new());
        let migration = Arc::new(migration::Engine::new());
        let stats = Arc::new(stats::Stats::new());

        Ok(Self {
            config,
            bloom,
            file_index,
            large_replies,
            content,
            indirection,
            query,
            migration,
            stats,
        })
    }

    /// Builds a [`handler::Dispatch`] borrowing this node's subsystem handles.
    /// `sink` and `self_id` come from the connection layer, which owns the
    /// actual transport (§1 non-goals).
    pub fn dispatch(&self, sink: Arc<dyn handler::ReplySink>, self_id: PeerId) -> handler::Dispatch<B> {
        handler::Dispatch {
            indirection: Arc::clone(&self.indirection),
            content: Arc::clone(&self.content),
            query: Arc::clone(&self.query),
            stats: Arc::clone(&self.stats),
            sink,
            self_id,
        }
    }

    /// Spawns the three standing background jobs this node runs for as long
    /// as it is up: priority aging every 12h (§4.D), rankings aging every 2m
    /// (§4.F), and the migration producer (§4.G). Callers shut them down in
    /// order via the returned [`BackgroundJobs`].
    pub fn spawn_background_jobs(&self) -> BackgroundJobs {
        let priority_aging = {
            let content = Arc::clone(&self.content);
            let config = self.config.clone();
            cron::CronHandle::spawn("priority-aging", Duration::from_secs(12 * 3600), move || {
                let content = Arc::clone(&content);
                let config = config.clone();
                async move {
                    let age = content.bump_age();
                    match config.load_persisted() {
                        Ok(mut state) => {
                            state.age = age;
                            if let Err(e) = config.save_persisted(&state) {
                                tracing::warn!(error = %e, "failed to persist priority-aging counter");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to load persisted state for aging"),
                    }
                }
            })
        };

        let rankings_aging = {
            let query = Arc::clone(&self.query);
            cron::CronHandle::spawn("rankings-aging", Duration::from_secs(2 * 60), move || {
                let query = Arc::clone(&query);
                async move {
                    query.age_rankings(indirect::now_ms());
                }
            })
        };

        let migration_producer = self.migration.spawn_producer(Arc::clone(&self.content));

        BackgroundJobs {
            priority_aging,
            rankings_aging,
            migration_producer,
        }
    }
}

/// Handles for the three jobs [`AfsCore::spawn_background_jobs`] starts.
pub struct BackgroundJobs {
    pub priority_aging: cron::CronHandle,
    pub rankings_aging: cron::CronHandle,
    pub migration_producer: tokio::task::JoinHandle<()>,
}

impl BackgroundJobs {
    /// Stops the two cron jobs in order and aborts the migration producer,
    /// which has no natural stopping point of its own (it loops on "is there
    /// room in the buffer", not a fixed interval).
    pub async fn shutdown(self) {
        self.priority_aging.stop().await;
        self.rankings_aging.stop().await;
        self.migration_producer.abort();
    }
}
