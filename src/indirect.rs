// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The indirection table (§4.E): the routing core. A fixed-size,
//! power-of-two array of slots, each tracking one in-flight query, its
//! waiters, and the replies already forwarded through it.
//!
//! [`Table::decide`] is "the single function that governs routing" — §4.E's
//! case table (A-K). It is implemented as one ordered `if`/`else if` chain
//! rather than a lookup table: the cases overlap (several apply only when
//! the slot holds the identical query), and the spec's own prose describes
//! them as a priority-ordered decision list, not a partition. See
//! `DESIGN.md` for the precedence this module resolves them in.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;

use crate::{
    block::BlockType,
    hash::ContentHash,
    peer::{ClientHandle, PeerId, Waiter},
    wire::TTL_DECREMENT,
};

/// Milliseconds since the Unix epoch. Kept as a signed integer (not
/// [`std::time::Instant`]) because §4.E's case table compares
/// `slot.deadline - now` against negative quantities directly, and TTLs
/// themselves are signed (§6).
pub type TimeMs = i64;

pub fn now_ms() -> TimeMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as TimeMs
}

/// Minimum table size regardless of configuration (§6
/// `AFS/INDIRECTIONTABLESIZE` default 8192; §9 "SUPPLEMENTED FROM
/// ORIGINAL": preserved as the historical floor).
pub const N_MIN: usize = 8192;

/// §4.E case J: "1-in-K tie-breaker random replacement (K=4)".
pub const TIE_BREAKER_K: u32 = 4;

fn round_up_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

#[derive(Clone, Debug)]
pub struct SlotState {
    pub query_key: ContentHash,
    pub namespace: Option<ContentHash>,
    pub block_type: BlockType,
    pub deadline: TimeMs,
    pub priority: u32,
    pub seen: Vec<ContentHash>,
    pub remote_waiters: Vec<PeerId>,
    pub local_waiters: Vec<ClientHandle>,
    pub local_lookup_in_flight: bool,
}

impl SlotState {
    fn is_identical(&self, query_key: &ContentHash, namespace: Option<&ContentHash>) -> bool {
        &self.query_key == query_key && self.namespace.as_ref() == namespace
    }

    fn has_waiter(&self, waiter: &Waiter) -> bool {
        match waiter {
            Waiter::Remote(p) => self.remote_waiters.contains(p),
            Waiter::Local(c) => self.local_waiters.contains(c),
        }
    }

    fn add_waiter(&mut self, waiter: &Waiter) {
        match waiter {
            Waiter::Remote(p) => {
                if !self.remote_waiters.contains(p) {
                    self.remote_waiters.push(*p);
                }
            }
            Waiter::Local(c) => {
                if !self.local_waiters.contains(c) {
                    self.local_waiters.push(c.clone());
                }
            }
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.remote_waiters.len() + self.local_waiters.len()
    }
}

/// One slot: `None` means unused (equivalent, for routing purposes, to an
/// infinitely-expired slot holding no query).
#[derive(Default)]
pub struct Slot(Option<SlotState>);

impl Slot {
    pub fn state(&self) -> Option<&SlotState> {
        self.0.as_ref()
    }
}

/// A new incoming query (or the locally-originated, delay-queued echo of a
/// local lookup — §4.H treats both uniformly).
#[derive(Clone, Debug)]
pub struct Incoming {
    pub query_key: ContentHash,
    pub namespace: Option<ContentHash>,
    pub block_type: BlockType,
    pub ttl: i64,
    pub priority: u32,
    pub waiter: Waiter,
}

/// The outcome of [`Table::decide`]: whether the caller should attempt a
/// local lookup (`is_routed`) and whether it should forward to peers
/// (`do_forward`) (§4.E).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Decision {
    pub is_routed: bool,
    pub do_forward: bool,
}

impl Decision {
    const NONE: Decision = Decision {
        is_routed: false,
        do_forward: false,
    };
    const BOTH: Decision = Decision {
        is_routed: true,
        do_forward: true,
    };
}

fn significantly_longer(a: TimeMs, b: TimeMs) -> bool {
    b > a + TTL_DECREMENT
}

pub struct Table {
    slots: Vec<Mutex<Slot>>,
    mask: usize,
    /// The 32-bit word of the query hash used for routing, fixed at
    /// construction so collisions are attacker-unpredictable for the
    /// process's lifetime (§4.E).
    word_index: usize,
}

impl Table {
    pub fn new(configured_size: u32) -> Self {
        let size = round_up_pow2((configured_size as usize).max(N_MIN));
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Default::default);
        let word_index = rand::thread_rng().gen_range(0..5);
        Self {
            slots,
            mask: size - 1,
            word_index,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn routing_index(&self, query_key: &ContentHash) -> usize {
        (query_key.words()[self.word_index] as usize) & self.mask
    }

    fn slot(&self, query_key: &ContentHash) -> &Mutex<Slot> {
        &self.slots[self.routing_index(query_key)]
    }

    /// §4.E's case table. Returns the routing [`Decision`] and leaves the
    /// slot mutated according to the matched case's mutation mode
    /// (`Replace` / `Grow` / no-op).
    pub fn decide(&self, incoming: &Incoming, now: TimeMs) -> Decision {
        let mut guard = self.slot(&incoming.query_key).lock();
        let namespace = incoming.namespace.as_ref();
        let new_deadline = now.saturating_add(incoming.ttl);

        let identical = guard
            .0
            .as_ref()
            .map(|s| s.is_identical(&incoming.query_key, namespace))
            .unwrap_or(false);

        if identical {
            let slot = guard.0.as_mut().expect("identical implies occupied");
            let not_in_flight = !slot.local_lookup_in_flight;

            // Case B: stale re-send of a query we already hold.
            if incoming.ttl < 0 {
                slot.add_waiter(&incoming.waiter);
                return Decision::NONE;
            }

            // Case D: nothing forwarded yet for this query.
            if slot.seen.is_empty() {
                let longer = significantly_longer(slot.deadline, new_deadline);
                if longer {
                    replace(slot, incoming, new_deadline);
                } else {
                    slot.add_waiter(&incoming.waiter);
                    if new_deadline > slot.deadline {
                        slot.deadline = new_deadline;
                    }
                }
                return Decision {
                    is_routed: not_in_flight,
                    do_forward: longer,
                };
            }

            // Case E: single CHK reply already seen, renewed with a longer TTL.
            if slot.seen.len() == 1
                && incoming.block_type == BlockType::Chk
                && new_deadline > slot.deadline
            {
                let significantly = significantly_longer(slot.deadline, new_deadline);
                slot.seen.clear();
                replace(slot, incoming, new_deadline);
                return Decision {
                    is_routed: not_in_flight,
                    do_forward: significantly,
                };
            }

            // Case F: multi-reply query this waiter has already been given.
            if incoming.block_type.is_multi_reply() && slot.has_waiter(&incoming.waiter) {
                let higher = new_deadline > slot.deadline;
                slot.add_waiter(&incoming.waiter);
                if higher {
                    slot.deadline = new_deadline;
                }
                return Decision {
                    is_routed: higher,
                    do_forward: false,
                };
            }

            // Identical query, none of the named sub-cases: still register
            // the waiter so it eventually gets a reply, without re-routing.
            slot.add_waiter(&incoming.waiter);
            return Decision::NONE;
        }

        let slot_deadline = guard.0.as_ref().map(|s| s.deadline).unwrap_or(TimeMs::MIN);
        let slot_priority = guard.0.as_ref().map(|s| s.priority).unwrap_or(0);

        // Case A: slot is effectively expired (a decade of TTL_DECREMENTs
        // stale) and the new query is not itself already near-dead.
        if slot_deadline < now - 10 * TTL_DECREMENT && incoming.ttl > -5 * TTL_DECREMENT {
            let slot = &mut guard.0;
            *slot = Some(fresh_slot(incoming, new_deadline));
            return Decision::BOTH;
        }

        // Case C: slot's expiration is well before what the new query would
        // need.
        if significantly_longer(slot_deadline, new_deadline) {
            let not_in_flight = guard
                .0
                .as_ref()
                .map(|s| !s.local_lookup_in_flight)
                .unwrap_or(true);
            let slot = &mut guard.0;
            *slot = Some(fresh_slot(incoming, new_deadline));
            return Decision {
                is_routed: not_in_flight,
                do_forward: not_in_flight,
            };
        }

        // Case G: an expired slot that already delivered its one CHK reply
        // can be reclaimed eagerly, even if not yet "effectively expired".
        let satisfied_chk_expired = guard
            .0
            .as_ref()
            .map(|s| s.seen.len() == 1 && s.block_type == BlockType::Chk && s.deadline < now)
            .unwrap_or(false);
        if satisfied_chk_expired {
            let slot = &mut guard.0;
            *slot = Some(fresh_slot(incoming, new_deadline));
            return Decision::BOTH;
        }

        // Case H: nothing else matched and the new query is already stale.
        if incoming.ttl < 0 {
            return Decision::NONE;
        }

        // Case I: priority comparison, using i128 to avoid overflow on the
        // cross-multiplication.
        let lhs = (slot_deadline - now) as i128 * incoming.priority as i128;
        let rhs = 10i128 * incoming.ttl as i128 * slot_priority as i128;
        if lhs > rhs {
            let slot = &mut guard.0;
            *slot = Some(fresh_slot(incoming, new_deadline));
            return Decision::BOTH;
        }

        // Case J: tie-breaker.
        if rand::thread_rng().gen_ratio(1, TIE_BREAKER_K) {
            let slot = &mut guard.0;
            *slot = Some(fresh_slot(incoming, new_deadline));
            return Decision::BOTH;
        }

        // Case K: busy.
        Decision::NONE
    }

    /// Reply delivery (§4.E): finds the slot whose key (and, for signed
    /// blocks, namespace) matches, checks `seen`, credits the sending
    /// peer's priority once, and returns the waiters to fan the reply out
    /// to (the caller does the actual network/client I/O after releasing
    /// the slot lock — §5 ordering: "the fan-out is called after releasing
    /// the slot lock").
    pub fn on_reply(
        &self,
        query_key: &ContentHash,
        namespace: Option<&ContentHash>,
        content_hash: &ContentHash,
        responder: &PeerId,
    ) -> Option<ReplyFanout> {
        let mut guard = self.slot(query_key).lock();
        let slot = guard.0.as_mut()?;
        if &slot.query_key != query_key || slot.namespace.as_ref() != namespace {
            return None;
        }
        if slot.seen.contains(content_hash) {
            return None;
        }
        let credited_priority = slot.priority;
        slot.priority = 0;
        let fanout = ReplyFanout {
            remote_waiters: slot.remote_waiters.clone(),
            local_waiters: slot.local_waiters.clone(),
            credited_responder: *responder,
            credited_priority,
        };
        slot.seen.push(*content_hash);
        Some(fanout)
    }

    /// Marks a local lookup as in-flight for the slot holding `query_key`,
    /// used while the randomized reply delay is pending (§4.H).
    pub fn set_local_lookup_in_flight(&self, query_key: &ContentHash, value: bool) {
        let mut guard = self.slot(query_key).lock();
        if let Some(slot) = guard.0.as_mut() {
            if &slot.query_key == query_key {
                slot.local_lookup_in_flight = value;
            }
        }
    }

    /// True only if the slot still holds the same query by the time a
    /// delayed reply fires; otherwise the reply must be dropped (§5
    /// Cancellation, §9 Open Question: concurrent route replacement is a
    /// recognized condition, counted in statistics).
    pub fn still_holds(&self, query_key: &ContentHash, namespace: Option<&ContentHash>) -> bool {
        let guard = self.slot(query_key).lock();
        guard
            .0
            .as_ref()
            .map(|s| s.is_identical(query_key, namespace))
            .unwrap_or(false)
    }

    /// Client disconnect (§4.E): walks every slot and removes the
    /// departing client (swap-with-last, no shrink).
    pub fn remove_client(&self, client: &ClientHandle) {
        for slot in &self.slots {
            let mut guard = slot.lock();
            if let Some(s) = guard.0.as_mut() {
                if let Some(pos) = s.local_waiters.iter().position(|c| c == client) {
                    s.local_waiters.swap_remove(pos);
                }
            }
        }
    }

    /// For proptest/invariant checks (§8): iterate every occupied slot.
    pub fn for_each_occupied<F: FnMut(&SlotState)>(&self, mut f: F) {
        for slot in &self.slots {
            let guard = slot.lock();
            if let Some(s) = guard.0.as_ref() {
                f(s);
            }
        }
    }

    /// §6 client opcode "Get-average-priority": the average `priority` of
    /// occupied slots that are routing for at least one remote peer, i.e.
    /// entries that are not purely a local client's own lookup. `None` when
    /// no such slot is occupied.
    pub fn average_non_local_priority(&self) -> Option<f64> {
        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        self.for_each_occupied(|s| {
            if !s.remote_waiters.is_empty() {
                sum += s.priority as u64;
                count += 1;
            }
        });
        if count == 0 {
            None
        } else {
            Some(sum as f64 / count as f64)
        }
    }
}

pub struct ReplyFanout {
    pub remote_waiters: Vec<PeerId>,
    pub local_waiters: Vec<ClientHandle>,
    pub credited_responder: PeerId,
    pub credited_priority: u32,
}

fn fresh_slot(incoming: &Incoming, deadline: TimeMs) -> SlotState {
    let mut s = SlotState {
        query_key: incoming.query_key,
        namespace: incoming.namespace,
        block_type: incoming.block_type,
        deadline,
        priority: incoming.priority,
        seen: Vec::new(),
        remote_waiters: Vec::new(),
        local_waiters: Vec::new(),
        local_lookup_in_flight: false,
    };
    s.add_waiter(&incoming.waiter);
    s
}

fn replace(slot: &mut SlotState, incoming: &Incoming, deadline: TimeMs) {
    slot.seen.clear();
    slot.remote_waiters.clear();
    slot.local_waiters.clear();
    slot.query_key = incoming.query_key;
    slot.namespace = incoming.namespace;
    slot.block_type = incoming.block_type;
    slot.deadline = deadline;
    slot.priority = incoming.priority;
    slot.add_waiter(&incoming.waiter);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(byte: u8) -> Waiter {
        Waiter::Remote(PeerId::new(ContentHash::from([byte; 20])))
    }

    fn incoming(key: ContentHash, ttl: i64, priority: u32, w: u8) -> Incoming {
        Incoming {
            query_key: key,
            namespace: None,
            block_type: BlockType::Chk,
            ttl,
            priority,
            waiter: waiter(w),
        }
    }

    #[test]
    fn table_size_is_power_of_two() {
        let t = Table::new(100);
        assert!(t.len().is_power_of_two());
        assert!(t.len() >= N_MIN);
    }

    #[test]
    fn fresh_query_into_empty_slot_routes_and_forwards() {
        let t = Table::new(8192);
        let key = ContentHash::of(b"q1");
        let d = t.decide(&incoming(key, 60_000, 10, 1), now_ms());
        assert!(d.is_routed);
        assert!(d.do_forward);
    }

    #[test]
    fn duplicate_query_same_waiter_just_grows() {
        let t = Table::new(8192);
        let key = ContentHash::of(b"q2");
        let now = now_ms();
        let first = t.decide(&incoming(key, 60_000, 10, 1), now);
        assert!(first.is_routed && first.do_forward);
        // Same waiter re-sends the identical query almost immediately with a
        // shorter remaining ttl: seen is still empty, ttl not significantly
        // longer -> grow only, no new forward.
        let second = t.decide(&incoming(key, 1_000, 10, 1), now);
        assert!(!second.do_forward);
    }

    #[test]
    fn negative_ttl_resend_of_identical_query_only_grows() {
        let t = Table::new(8192);
        let key = ContentHash::of(b"q3");
        let now = now_ms();
        t.decide(&incoming(key, 60_000, 10, 1), now);
        let d = t.decide(&incoming(key, -1, 10, 2), now);
        assert_eq!(d, Decision::NONE);
        let mut waiters = 0;
        t.for_each_occupied(|s| waiters = s.waiter_count());
        assert_eq!(waiters, 2);
    }

    #[test]
    fn reply_delivery_marks_seen_and_credits_once() {
        let t = Table::new(8192);
        let key = ContentHash::of(b"q4");
        t.decide(&incoming(key, 60_000, 10, 1), now_ms());
        let content = ContentHash::of(b"block");
        let responder = PeerId::new(ContentHash::of(b"r"));
        let fanout = t.on_reply(&key, None, &content, &responder).unwrap();
        assert_eq!(fanout.credited_priority, 10);
        // A second, identical reply is a duplicate: dropped.
        let dup = t.on_reply(&key, None, &content, &responder);
        assert!(dup.is_none());
    }

    #[test]
    fn client_disconnect_removes_from_every_slot() {
        let t = Table::new(8192);
        let client = ClientHandle::new(42);
        let key = ContentHash::of(b"q5");
        t.decide(
            &Incoming {
                query_key: key,
                namespace: None,
                block_type: BlockType::Chk,
                ttl: 60_000,
                priority: 1,
                waiter: Waiter::Local(client.clone()),
            },
            now_ms(),
        );
        t.remove_client(&client);
        let mut waiters = 0;
        t.for_each_occupied(|s| waiters = s.waiter_count());
        assert_eq!(waiters, 0);
    }

    #[test]
    fn average_non_local_priority_ignores_purely_local_slots() {
        let t = Table::new(8192);
        // A purely local lookup: no remote waiter, excluded from the average.
        t.decide(
            &Incoming {
                query_key: ContentHash::of(b"local-only"),
                namespace: None,
                block_type: BlockType::Chk,
                ttl: 60_000,
                priority: 999,
                waiter: Waiter::Local(ClientHandle::new(1)),
            },
            now_ms(),
        );
        t.decide(&incoming(ContentHash::of(b"remote-a"), 60_000, 10, 1), now_ms());
        t.decide(&incoming(ContentHash::of(b"remote-b"), 60_000, 20, 2), now_ms());

        let avg = t.average_non_local_priority().unwrap();
        assert_eq!(avg, 15.0);
    }

    #[test]
    fn average_non_local_priority_is_none_when_table_empty() {
        let t = Table::new(8192);
        assert_eq!(t.average_non_local_priority(), None);
    }

    #[test]
    fn empty_occupied_slot_invariant_holds_after_replace() {
        let t = Table::new(8192);
        let key = ContentHash::of(b"q6");
        t.decide(&incoming(key, 60_000, 10, 1), now_ms());
        let mut found = false;
        t.for_each_occupied(|s| {
            found = true;
            assert!(s.waiter_count() >= 1);
        });
        assert!(found);
    }
}
