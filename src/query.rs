// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The query manager (§4.F): the outbound-query ring buffer, peer ranking,
//! the send-buffer filler, and the aging reply-track records used to
//! prefer peers that recently answered for a given origin.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::{
    indirect::{now_ms, TimeMs},
    peer::{PeerId, Waiter},
    wire::{Query, TTL_DECREMENT},
};

/// Size of the pending-forwarding ring (§3 Pending-forwarding record).
pub const RING_SIZE: usize = 512;

/// Number of peer "indices" a bitmap tracks (§3: "a bitmap of `8·16=128`
/// peer indices").
pub const MAX_TRACKED_PEERS: usize = 128;

/// Baseline priority a freshly forwarded query starts from, before any
/// reply crediting (§9 SUPPLEMENTED FROM ORIGINAL: `querymanager.c`'s
/// `BASE_QUERY_PRIORITY`).
pub const BASE_QUERY_PRIORITY: u32 = 1;

/// Probability of the "noclear" heuristic firing for a fresh, rapidly
/// re-sent identical query (§4.F, §9 Open Question: a network-wide
/// parameter, not to be changed without measurements).
const NOCLEAR_PROBABILITY: f64 = 0.25;

/// Best-peers kept per forward (§4.F: "Keep the best four peers").
const FANOUT: usize = 4;

/// A 128-bit membership set of peer indices a query has already been given
/// to (§3).
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct PeerBitmap([u8; MAX_TRACKED_PEERS / 8]);

impl PeerBitmap {
    pub fn get(&self, idx: u8) -> bool {
        (self.0[(idx / 8) as usize] >> (idx % 8)) & 1 != 0
    }

    pub fn set(&mut self, idx: u8) {
        self.0[(idx / 8) as usize] |= 1 << (idx % 8);
    }
}

/// One entry in the pending-forwarding ring (§3).
pub struct PendingQuery {
    pub query: Query,
    pub sent_to: PeerBitmap,
    pub send_after: TimeMs,
    pub expires: TimeMs,
    pub source: Waiter,
}

/// One origin's reply-track record: how many times each responder has
/// answered a query from this origin recently (§3 Reply-track record).
struct RankingEntry {
    last_reply: TimeMs,
    responses: Vec<(PeerId, u32)>,
}

/// Registers peers to small integer indices for the 128-bit bitmaps; a free
/// list recycles indices of disconnected peers.
#[derive(Default)]
struct PeerIndices {
    by_peer: DashMap<PeerId, u8>,
    free: Mutex<Vec<u8>>,
    next: Mutex<u8>,
}

impl PeerIndices {
    fn register(&self, peer: PeerId) -> Option<u8> {
        if let Some(idx) = self.by_peer.get(&peer) {
            return Some(*idx);
        }
        let idx = if let Some(recycled) = self.free.lock().pop() {
            recycled
        } else {
            let mut next = self.next.lock();
            if *next as usize >= MAX_TRACKED_PEERS {
                return None;
            }
            let idx = *next;
            *next += 1;
            idx
        };
        self.by_peer.insert(peer, idx);
        Some(idx)
    }

    fn unregister(&self, peer: &PeerId) {
        if let Some((_, idx)) = self.by_peer.remove(peer) {
            self.free.lock().push(idx);
        }
    }

    fn index_of(&self, peer: &PeerId) -> Option<u8> {
        self.by_peer.get(peer).map(|r| *r)
    }
}

pub struct Manager {
    ring: Mutex<Vec<Option<PendingQuery>>>,
    cursor: AtomicUsize,
    peers: PeerIndices,
    rankings: DashMap<Waiter, RankingEntry>,
}

impl Manager {
    pub fn new() -> Self {
        let mut ring = Vec::with_capacity(RING_SIZE);
        ring.resize_with(RING_SIZE, || None);
        Self {
            ring: Mutex::new(ring),
            cursor: AtomicUsize::new(0),
            peers: PeerIndices::default(),
            rankings: DashMap::new(),
        }
    }

    pub fn register_peer(&self, peer: PeerId) -> Option<u8> {
        self.peers.register(peer)
    }

    pub fn unregister_peer(&self, peer: &PeerId) {
        self.peers.unregister(peer);
    }

    /// Enters `query` into the pending-forwarding ring (§4.F "Forward a
    /// query"): finds the slot already holding an identical query (by its
    /// primary key) or the oldest-expiring slot, and clears the
    /// already-sent bitmap unless the "noclear" heuristic fires.
    pub fn forward(&self, query: Query, source: Waiter, now: TimeMs) -> usize {
        let primary_key = query.keys[0];
        let ttl = query.ttl.max(0);
        let new_expires = now.saturating_add(ttl);

        let mut ring = self.ring.lock();
        if let Some(i) = ring
            .iter()
            .position(|e| e.as_ref().map(|e| e.query.keys[0] == primary_key).unwrap_or(false))
        {
            let entry = ring[i].as_mut().expect("position found an occupied slot");
            let still_fresh = entry.expires > now;
            let noclear = still_fresh
                && new_expires <= entry.expires + TTL_DECREMENT
                && rand::thread_rng().gen_bool(NOCLEAR_PROBABILITY);
            if !noclear {
                entry.sent_to = PeerBitmap::default();
            }
            entry.expires = entry.expires.max(new_expires);
            entry.query = query;
            entry.source = source;
            return i;
        }

        let oldest = ring
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.as_ref().map(|e| e.expires).unwrap_or(TimeMs::MIN))
            .map(|(i, _)| i)
            .expect("ring is never empty");
        ring[oldest] = Some(PendingQuery {
            query,
            sent_to: PeerBitmap::default(),
            send_after: now,
            expires: new_expires,
            source,
        });
        oldest
    }

    /// Marks every pending entry matching `key` as expired, so the
    /// send-buffer filler stops offering it once we already have an answer
    /// (§4.F "Dequeue").
    pub fn dequeue(&self, key: &crate::hash::ContentHash) {
        let mut ring = self.ring.lock();
        for entry in ring.iter_mut().flatten() {
            if entry.query.keys.contains(key) {
                entry.expires = TimeMs::MIN;
            }
        }
    }

    /// Computes rankings for `connected` and keeps the best [`FANOUT`] via
    /// a weighted random draw proportional to ranking (§4.F): `0x7FFF ·
    /// historical_response_count_for_this_origin + 0xFFFF / (1 +
    /// random(mod distance)) + jitter`.
    pub fn rank_peers(
        &self,
        origin: &Waiter,
        connected: &[PeerId],
        distance: impl Fn(&PeerId) -> u32,
    ) -> Vec<PeerId> {
        if connected.is_empty() {
            return Vec::new();
        }
        let history = self.rankings.get(origin);
        let mut rng = rand::thread_rng();
        let mut scored: Vec<(PeerId, u64)> = connected
            .iter()
            .map(|peer| {
                let count = history
                    .as_ref()
                    .and_then(|h| h.responses.iter().find(|(p, _)| p == peer).map(|(_, c)| *c))
                    .unwrap_or(0);
                let dist = distance(peer).max(1) as u64;
                let score = 0x7FFFu64 * count as u64
                    + 0xFFFFu64 / (1 + rng.gen_range(0..dist))
                    + rng.gen_range(0..0xFFu64);
                (*peer, score)
            })
            .collect();
        drop(history);
        weighted_top_n(&mut scored, FANOUT)
    }

    /// Credits `responder` for answering a query originated by `origin`
    /// (called by the handler on reply delivery, §4.E fan-out path).
    pub fn credit_response(&self, origin: Waiter, responder: PeerId, now: TimeMs) {
        let mut entry = self.rankings.entry(origin).or_insert_with(|| RankingEntry {
            last_reply: now,
            responses: Vec::new(),
        });
        entry.last_reply = now;
        match entry.responses.iter_mut().find(|(p, _)| *p == responder) {
            Some((_, count)) => *count += 1,
            None => entry.responses.push((responder, 1)),
        }
    }

    /// The send-buffer filler (§4.F): scans the ring from a persistent
    /// rotating index, copying in every pending query the receiver hasn't
    /// been given yet, until `budget` bytes are used or the whole ring has
    /// been scanned once.
    pub fn fill_send_buffer(&self, receiver: &PeerId, mut budget: usize) -> Vec<Query> {
        let Some(idx) = self.peers.index_of(receiver) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut ring = self.ring.lock();
        let n = ring.len();
        let start = self.cursor.load(Ordering::Relaxed) % n;
        let mut scanned = 0;
        let mut i = start;
        while scanned < n && budget > 0 {
            if let Some(entry) = ring[i].as_mut() {
                if !entry.sent_to.get(idx) {
                    let bytes = entry.query.write().len();
                    if bytes <= budget {
                        out.push(entry.query.clone());
                        entry.sent_to.set(idx);
                        budget -= bytes;
                    }
                }
            }
            i = (i + 1) % n;
            scanned += 1;
        }
        self.cursor.store(i, Ordering::Relaxed);
        out
    }

    /// Rankings aging (§4.F): every 2 minutes, halve every response count,
    /// drop entries whose counts all reach zero, and drop whole origins
    /// whose last reply is more than 10 minutes stale.
    pub fn age_rankings(&self, now: TimeMs) {
        const TEN_MINUTES_MS: TimeMs = 10 * 60 * 1000;
        self.rankings.retain(|_origin, entry| {
            if now - entry.last_reply > TEN_MINUTES_MS {
                return false;
            }
            for (_, count) in entry.responses.iter_mut() {
                *count /= 2;
            }
            entry.responses.retain(|(_, count)| *count > 0);
            !entry.responses.is_empty()
        });
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Weighted random draw without replacement, proportional to `score`,
/// selecting up to `n` items (§4.F: "Keep the best four peers by a
/// weighted random draw proportional to ranking").
fn weighted_top_n(scored: &mut Vec<(PeerId, u64)>, n: usize) -> Vec<PeerId> {
    let mut out = Vec::with_capacity(n.min(scored.len()));
    let mut rng = rand::thread_rng();
    while !scored.is_empty() && out.len() < n {
        let total: u64 = scored.iter().map(|(_, s)| s + 1).sum();
        let mut pick = rng.gen_range(0..total);
        let mut chosen = 0;
        for (i, (_, s)) in scored.iter().enumerate() {
            let weight = s + 1;
            if pick < weight {
                chosen = i;
                break;
            }
            pick -= weight;
        }
        let (peer, _) = scored.remove(chosen);
        out.push(peer);
    }
    out
}
