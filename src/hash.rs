// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The 160-bit content identifier (§3 Content identifier).
//!
//! Two derived primitives ride on the same representation: a *query key*
//! (what a client or peer asks for) and an *encryption key* (the hash of the
//! plaintext, used to derive the on-demand-encryption key for indexed
//! content). Both are just [`ContentHash`]; callers track which is which by
//! context, exactly as the wire format does.

use std::{
    convert::TryFrom,
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub const HASH_LEN: usize = 20;

#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub const fn zero() -> Self {
        Self([0u8; HASH_LEN])
    }

    /// Hash an arbitrary byte slice (used both for `hash(ciphertext)` CHK
    /// addressing and for `hash(keyword)`/`hash(hash(keyword))` 3HASH
    /// queries).
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(&digest);
        Self(buf)
    }

    /// `h(q)` as used by the bucket formula in §4.D: hash this hash again.
    pub fn double(&self) -> Self {
        Self::of(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Interpret the hash as four big-endian `u32` words, as the indirection
    /// table's routing-index computation and the bucket formula do (§4.D,
    /// §4.E).
    pub fn words(&self) -> [u32; HASH_LEN / 4] {
        let mut out = [0u32; HASH_LEN / 4];
        for (i, chunk) in self.0.chunks_exact(4).enumerate() {
            out[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out
    }

    /// XOR-distance between two hashes, used by the migration engine's
    /// send-fill callback (§4.G) to find the closest-to-receiver block.
    pub fn xor_distance(&self, other: &Self) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        for i in 0..HASH_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("expected {HASH_LEN} bytes, got {0}")]
    WrongLength(usize),
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for ContentHash {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for ContentHash {
    type Error = ParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != HASH_LEN {
            return Err(ParseError::WrongLength(bytes.len()));
        }
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl From<[u8; HASH_LEN]> for ContentHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(ContentHash::of(b"hello"), ContentHash::of(b"hello"));
        assert_ne!(ContentHash::of(b"hello"), ContentHash::of(b"world"));
    }

    #[test]
    fn round_trips_through_hex() {
        let h = ContentHash::of(b"round-trip me");
        let s = h.to_string();
        let parsed: ContentHash = s.parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn words_are_big_endian() {
        let h = ContentHash::from([0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(h.words()[0], 1);
    }

    #[test]
    fn xor_distance_zero_for_identical() {
        let h = ContentHash::of(b"self");
        assert_eq!(h.xor_distance(&h), [0u8; HASH_LEN]);
    }
}
