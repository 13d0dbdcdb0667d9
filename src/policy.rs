// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Policy hooks the handler dispatch layer applies before consulting the
//! indirection table and query manager (§2: "policy adjusts priority/TTL";
//! §4.H `evaluate_query`).

use rand::Rng;

use crate::wire::TTL_DECREMENT;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    Allow { priority: u32 },
    Deprioritize { priority: u32 },
    Drop,
}

/// Charges the sender's trust at a rate dependent on outbound network load
/// (§4.H `evaluate_query`): the higher the load, the more of the claimed
/// priority gets discounted before admission, and very loaded nodes start
/// dropping low-priority queries outright rather than forwarding them for
/// free.
pub fn evaluate_query(claimed_priority: u32, trust: u32, network_load_up_pct: i64) -> Admission {
    let load = network_load_up_pct.clamp(0, 100) as u32;
    let charge = claimed_priority.min(trust);
    let discount = (charge * load) / 100;
    let effective = charge.saturating_sub(discount);

    if load >= 95 && effective == 0 {
        return Admission::Drop;
    }
    if load >= 80 && effective < claimed_priority / 2 {
        return Admission::Deprioritize { priority: effective };
    }
    Admission::Allow { priority: effective }
}

/// TTL shrinkage applied on every forward (§9 SUPPLEMENTED FROM ORIGINAL:
/// `handler.c`'s `ttl - 2*TTL_DECREMENT - random(TTL_DECREMENT)`, clamped to
/// `(priority+3)*TTL_DECREMENT` for local queries and `(priority+8)*
/// TTL_DECREMENT` for remote queries). Without this the loop-suppression
/// property (§8 scenario 5) would not hold, since TTLs would never decay.
pub fn shrink_ttl(ttl: i64, priority: u32, is_local: bool) -> i64 {
    let jitter = rand::thread_rng().gen_range(0..TTL_DECREMENT);
    let shrunk = ttl - 2 * TTL_DECREMENT - jitter;
    let multiplier = if is_local { priority as i64 + 3 } else { priority as i64 + 8 };
    let ceiling = multiplier * TTL_DECREMENT;
    shrunk.min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_load_passes_priority_through() {
        let a = evaluate_query(10, 10, 0);
        assert_eq!(a, Admission::Allow { priority: 10 });
    }

    #[test]
    fn heavy_load_drops_zero_priority_queries() {
        let a = evaluate_query(0, 0, 100);
        assert_eq!(a, Admission::Drop);
    }

    #[test]
    fn trust_caps_the_charge() {
        let a = evaluate_query(1000, 5, 0);
        assert_eq!(a, Admission::Allow { priority: 5 });
    }

    #[test]
    fn shrink_ttl_always_decreases_or_holds_ceiling() {
        let ttl = 100 * TTL_DECREMENT;
        let shrunk = shrink_ttl(ttl, 1, true);
        assert!(shrunk < ttl);
    }

    #[test]
    fn shrink_ttl_clamps_to_local_ceiling() {
        let shrunk = shrink_ttl(1_000_000 * TTL_DECREMENT, 0, true);
        assert!(shrunk <= 3 * TTL_DECREMENT);
    }
}
