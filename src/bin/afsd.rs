// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! `afsd`: the standalone node process. Wires configuration, opens the
//! on-disk subsystems, starts the three background jobs and waits for a
//! shutdown signal, mirroring the teacher's `node-lib::node::run` shape
//! (logging first, then config, then the coalesced task set, then a signal
//! wait). Since this crate does not own any transport (§1 non-goals), the
//! actual query/reply traffic a real deployment would drive through
//! [`afs_core::handler::Dispatch`] is out of scope here; this binary only
//! proves the subsystems start, persist state, and shut down cleanly.

use std::sync::Arc;

use structopt::StructOpt as _;
use tracing::info;

use afs_core::{
    args::Args,
    config::Config,
    content::SledBackend,
    handler::ReplySink,
    logging,
    peer::{ClientHandle, PeerId},
    wire::Reply,
    AfsCore,
};

/// A reply sink that only logs, until a real connection layer is wired in.
struct LoggingSink;

impl ReplySink for LoggingSink {
    fn deliver(&self, remote: &[PeerId], local: &[ClientHandle], _reply: &Reply) {
        info!(remote = remote.len(), local = local.len(), "reply ready for delivery");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::from_args();
    let config: Config = (&args).into();
    config.validate()?;

    let persisted = config.load_persisted()?;
    info!(afs_dir = %config.afs_dir.display(), age = persisted.age, "loaded persisted state");

    let backend = Arc::new(SledBackend::open(config.paths().database_dir())?);
    let core = AfsCore::assemble(config, backend, persisted.age)?;

    let jobs = core.spawn_background_jobs();
    let self_id = PeerId::new(afs_core::ContentHash::of(b"afsd-self"));
    let _dispatch = core.dispatch(Arc::new(LoggingSink), self_id);

    info!("afsd running, send SIGINT/Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    jobs.shutdown().await;
    Ok(())
}
