// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Block types and the content descriptor (§3 Block types, Content
//! descriptor).

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Size of an opaque content block on the wire (§3).
pub const BLOCK_SIZE: usize = 1024;

/// The 16-bit `type` tag carried on the wire (§3 Block types).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(u16)]
pub enum BlockType {
    Chk = 0,
    Chks = 1,
    ThreeHash = 2,
    SBlock = 3,
    Super = 4,
}

impl BlockType {
    /// Types for which more than one result may legitimately share a query
    /// key (§4.D step 5).
    pub fn is_multi_reply(self) -> bool {
        matches!(self, BlockType::ThreeHash | BlockType::SBlock)
    }

    pub fn from_u16(tag: u16) -> Option<Self> {
        Some(match tag {
            0 => BlockType::Chk,
            1 => BlockType::Chks,
            2 => BlockType::ThreeHash,
            3 => BlockType::SBlock,
            4 => BlockType::Super,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A fixed-size record describing where a piece of content lives (§3 Content
/// descriptor). `priority` is host-order once decoded; the wire codec in
/// [`crate::wire`] is the only place that deals with network byte order.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub content_hash: ContentHash,
    pub block_type: BlockType,
    pub priority: u32,
    /// 0 means "stored inline"; otherwise a 1-based [`crate::fileindex`]
    /// index.
    pub file_index: u16,
    pub file_offset: u64,
}

impl ContentDescriptor {
    pub fn is_indexed(&self) -> bool {
        self.file_index != 0
    }
}

/// An opaque, encrypted, fixed-size payload (§3 CHK/CHKS).
#[derive(Clone, Eq, PartialEq)]
pub struct Block(pub Box<[u8; BLOCK_SIZE]>);

impl Block {
    pub fn zeroed() -> Self {
        Self(Box::new([0u8; BLOCK_SIZE]))
    }

    pub fn from_slice_padded(data: &[u8]) -> (Self, usize) {
        let mut buf = [0u8; BLOCK_SIZE];
        let n = data.len().min(BLOCK_SIZE);
        buf[..n].copy_from_slice(&data[..n]);
        (Self(Box::new(buf)), n)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block({} bytes)", BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_type_round_trips() {
        for t in [
            BlockType::Chk,
            BlockType::Chks,
            BlockType::ThreeHash,
            BlockType::SBlock,
            BlockType::Super,
        ] {
            assert_eq!(BlockType::from_u16(t.as_u16()), Some(t));
        }
    }

    #[test]
    fn multi_reply_classification() {
        assert!(BlockType::ThreeHash.is_multi_reply());
        assert!(BlockType::SBlock.is_multi_reply());
        assert!(!BlockType::Chk.is_multi_reply());
        assert!(!BlockType::Super.is_multi_reply());
    }

    #[test]
    fn padded_block_records_true_length() {
        let (block, n) = Block::from_slice_padded(b"short");
        assert_eq!(n, 5);
        assert_eq!(&block.0[..5], b"short");
        assert!(block.0[5..].iter().all(|&b| b == 0));
    }
}
