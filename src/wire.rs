// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Wire opcodes (§6 External Interfaces) and the protocol constants referred
//! to throughout §4 and §9.
//!
//! All multi-byte integers are big-endian on the wire; every parse routine
//! validates size before touching a single field (§9 redesign: "message
//! struct reinterpretation" is replaced by explicit parse/serialize
//! routines). Internal types use host order exclusively — [`crate::block::
//! ContentDescriptor`] documents that boundary for `priority`.

use thiserror::Error;

use crate::{
    block::{Block, BlockType, BLOCK_SIZE},
    hash::{ContentHash, HASH_LEN},
    peer::PeerId,
};

/// The unit by which query TTLs decay at each hop (§9 GLOSSARY). Expressed
/// in milliseconds, following the historical value this protocol has always
/// used; it is a protocol constant, not a wall-clock quantity, and changing
/// it is a breaking change to the overlay.
pub const TTL_DECREMENT: i64 = 5 * 60 * 1_000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("message size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("unknown block type {0}")]
    UnknownBlockType(u16),
    #[error("query carried zero keys")]
    EmptyKeys,
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn get_i32(buf: &[u8], at: usize) -> i32 {
    get_u32(buf, at) as i32
}

fn get_hash(buf: &[u8], at: usize) -> ContentHash {
    ContentHash::try_from(&buf[at..at + HASH_LEN]).expect("slice is exactly HASH_LEN")
}

/// `QUERY` / `NSQUERY` (§6): a priority, a signed TTL, the peer the answer
/// should be routed back through, an optional namespace (present only for
/// `NSQUERY`) and one or more 160-bit query keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub priority: u32,
    pub ttl: i64,
    pub return_to: PeerId,
    pub namespace: Option<ContentHash>,
    pub keys: Vec<ContentHash>,
}

const QUERY_HEADER_LEN: usize = 4 /* priority */ + 4 /* ttl */ + HASH_LEN /* return_to */;

impl Query {
    /// Parses a plain `QUERY`: header followed by `1..n` query keys, no
    /// namespace. Size must match exactly (§6).
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < QUERY_HEADER_LEN + HASH_LEN {
            return Err(Error::TooShort {
                need: QUERY_HEADER_LEN + HASH_LEN,
                got: buf.len(),
            });
        }
        let rest = buf.len() - QUERY_HEADER_LEN;
        if rest % HASH_LEN != 0 {
            return Err(Error::SizeMismatch {
                expected: buf.len() - rest % HASH_LEN,
                got: buf.len(),
            });
        }
        let priority = get_u32(buf, 0);
        let ttl = get_i32(buf, 4) as i64;
        let return_to = PeerId::new(get_hash(buf, 8));
        let mut keys = Vec::with_capacity(rest / HASH_LEN);
        let mut at = QUERY_HEADER_LEN;
        while at < buf.len() {
            keys.push(get_hash(buf, at));
            at += HASH_LEN;
        }
        if keys.is_empty() {
            return Err(Error::EmptyKeys);
        }
        Ok(Self {
            priority,
            ttl,
            return_to,
            namespace: None,
            keys,
        })
    }

    /// Parses an `NSQUERY`: `QUERY` header, then namespace, then identifier
    /// (the single query key).
    pub fn parse_namespaced(buf: &[u8]) -> Result<Self, Error> {
        let need = QUERY_HEADER_LEN + 2 * HASH_LEN;
        if buf.len() != need {
            return Err(Error::SizeMismatch {
                expected: need,
                got: buf.len(),
            });
        }
        let priority = get_u32(buf, 0);
        let ttl = get_i32(buf, 4) as i64;
        let return_to = PeerId::new(get_hash(buf, 8));
        let namespace = get_hash(buf, QUERY_HEADER_LEN);
        let identifier = get_hash(buf, QUERY_HEADER_LEN + HASH_LEN);
        Ok(Self {
            priority,
            ttl,
            return_to,
            namespace: Some(namespace),
            keys: vec![identifier],
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(QUERY_HEADER_LEN + self.keys.len() * HASH_LEN);
        put_u32(&mut out, self.priority);
        put_u32(&mut out, self.ttl as u32);
        out.extend_from_slice(self.return_to.as_hash().as_bytes());
        if let Some(ns) = &self.namespace {
            out.extend_from_slice(ns.as_bytes());
        }
        for k in &self.keys {
            out.extend_from_slice(k.as_bytes());
        }
        out
    }
}

/// A result message: `CHK_RESULT`, `3HASH_RESULT` or `SBLOCK_RESULT` (§6).
/// `SBLOCK_RESULT`'s signature is opaque here — the ECRS library validates
/// it before this crate ever sees the block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub block_type: BlockType,
    /// Present only for `3HASH_RESULT`, where it is the double-hash
    /// identifying the result alongside the block itself.
    pub double_hash: Option<ContentHash>,
    pub block: Block,
}

impl Reply {
    pub fn parse_chk(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::SizeMismatch {
                expected: BLOCK_SIZE,
                got: buf.len(),
            });
        }
        let (block, _) = Block::from_slice_padded(buf);
        Ok(Self {
            block_type: BlockType::Chk,
            double_hash: None,
            block,
        })
    }

    pub fn parse_three_hash(buf: &[u8]) -> Result<Self, Error> {
        let need = HASH_LEN + BLOCK_SIZE;
        if buf.len() != need {
            return Err(Error::SizeMismatch {
                expected: need,
                got: buf.len(),
            });
        }
        let double_hash = get_hash(buf, 0);
        let (block, _) = Block::from_slice_padded(&buf[HASH_LEN..]);
        Ok(Self {
            block_type: BlockType::ThreeHash,
            double_hash: Some(double_hash),
            block,
        })
    }

    pub fn parse_sblock(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::SizeMismatch {
                expected: BLOCK_SIZE,
                got: buf.len(),
            });
        }
        let (block, _) = Block::from_slice_padded(buf);
        Ok(Self {
            block_type: BlockType::SBlock,
            double_hash: None,
            block,
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_LEN + BLOCK_SIZE);
        if let Some(dh) = &self.double_hash {
            out.extend_from_slice(dh.as_bytes());
        }
        out.extend_from_slice(&self.block.0[..]);
        out
    }
}

/// Opcodes the handler dispatch layer (§4.H) switches on. Unparseable or
/// wrong-size messages are dropped with a counter increment, never torn down
/// (§7 Protocol).
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Opcode {
    Query,
    NsQuery,
    ChkResult,
    ThreeHashResult,
    SBlockResult,
}

impl Opcode {
    pub fn from_u16(tag: u16) -> Result<Self, Error> {
        Ok(match tag {
            0 => Opcode::Query,
            1 => Opcode::NsQuery,
            2 => Opcode::ChkResult,
            3 => Opcode::ThreeHashResult,
            4 => Opcode::SBlockResult,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }
}
