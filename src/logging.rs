// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Structured logging bootstrap, matching the teacher's `librad/examples/
//! common/logging.rs`: `env_logger` is initialized once as the interop shim
//! for crates still emitting through `log`, and the `tracing` global
//! subscriber's format is controlled by `TRACING_FMT` (`pretty` / `compact`
//! / `json`), defaulting to `compact`.

use std::env;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub fn init() {
    if env_logger::builder().try_init().is_ok() && env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }

    let filter = EnvFilter::from_default_env();
    let fmt = env::var("TRACING_FMT").unwrap_or_else(|_| "compact".to_string());

    let result = match fmt.as_str() {
        "pretty" => tracing::subscriber::set_global_default(
            FmtSubscriber::builder().with_env_filter(filter).pretty().finish(),
        ),
        "json" => tracing::subscriber::set_global_default(
            FmtSubscriber::builder().with_env_filter(filter).json().finish(),
        ),
        _ => tracing::subscriber::set_global_default(
            FmtSubscriber::builder().with_env_filter(filter).compact().finish(),
        ),
    };

    if let Err(e) = result {
        // A second call (e.g. in tests that each init logging) is harmless;
        // anything else is worth a stderr note since tracing isn't up yet.
        eprintln!("afs-core: tracing subscriber already set: {e}");
    }
}
