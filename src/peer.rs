// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Peer and local-client identities.
//!
//! Actual key material and transport addresses are the connection layer's
//! concern (§1 non-goals); what the core needs is a stable, orderable,
//! hashable identity to route by and a notion of "distance" for the
//! migration engine's content-based biasing (§4.G).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// A remote peer's overlay identity, represented as the hash of its public
/// key material (which this crate does not itself verify or possess; the
/// connection layer hands us already-authenticated identities).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(ContentHash);

impl PeerId {
    pub fn new(id: ContentHash) -> Self {
        Self(id)
    }

    pub fn as_hash(&self) -> &ContentHash {
        &self.0
    }

    pub fn xor_distance(&self, other: &Self) -> [u8; crate::hash::HASH_LEN] {
        self.0.xor_distance(&other.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

/// A handle to a local client connection (socket, channel, whatever the
/// demuxer uses). Opaque to the core: it is only ever compared, cloned and
/// handed back to the caller to address a reply (§3 Indirection slot,
/// `local_waiters[]`).
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct ClientHandle(u64);

impl ClientHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientHandle({})", self.0)
    }
}

/// Either a remote peer or a local client: the two kinds of "waiter" an
/// indirection slot tracks (§3 Indirection slot).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Waiter {
    Remote(PeerId),
    Local(ClientHandle),
}
