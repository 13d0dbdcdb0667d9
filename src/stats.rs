// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Counters the handler dispatch layer updates (§2 "H ... updates
//! statistics"; §7 Protocol: malformed messages "dropped with a counter
//! increment"; §9 "concurrent route replacement is a recognized condition,
//! counted in statistics").
//!
//! Plain relaxed atomics, same granularity as the teacher's connection
//! counters in `librad/src/net/protocol.rs`; nothing here needs more than
//! eventual-consistency since these are observability counters, not
//! correctness state.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub queries_received: AtomicU64,
    pub queries_forwarded: AtomicU64,
    pub replies_received: AtomicU64,
    pub replies_delivered: AtomicU64,
    pub replies_dropped_duplicate: AtomicU64,
    pub replies_dropped_stale_route: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub inserts_accepted: AtomicU64,
    pub inserts_dropped_quota: AtomicU64,
    pub inserts_dropped_duplicate: AtomicU64,
    pub evictions: AtomicU64,
    pub migrated_to_large_reply: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        let load = |f: &AtomicU64| f.load(Ordering::Relaxed);
        Snapshot {
            queries_received: load(&self.queries_received),
            queries_forwarded: load(&self.queries_forwarded),
            replies_received: load(&self.replies_received),
            replies_delivered: load(&self.replies_delivered),
            replies_dropped_duplicate: load(&self.replies_dropped_duplicate),
            replies_dropped_stale_route: load(&self.replies_dropped_stale_route),
            protocol_errors: load(&self.protocol_errors),
            inserts_accepted: load(&self.inserts_accepted),
            inserts_dropped_quota: load(&self.inserts_dropped_quota),
            inserts_dropped_duplicate: load(&self.inserts_dropped_duplicate),
            evictions: load(&self.evictions),
            migrated_to_large_reply: load(&self.migrated_to_large_reply),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct Snapshot {
    pub queries_received: u64,
    pub queries_forwarded: u64,
    pub replies_received: u64,
    pub replies_delivered: u64,
    pub replies_dropped_duplicate: u64,
    pub replies_dropped_stale_route: u64,
    pub protocol_errors: u64,
    pub inserts_accepted: u64,
    pub inserts_dropped_quota: u64,
    pub inserts_dropped_duplicate: u64,
    pub evictions: u64,
    pub migrated_to_large_reply: u64,
}
