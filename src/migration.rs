// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! The migration engine (§4.G): a background producer that pre-encrypts
//! random blocks into a small buffer, and the send-fill callback that picks
//! the buffered block closest (by XOR distance) to a peer's id whenever a
//! packet has unused payload — biasing the overlay towards content-based
//! routing over time.

use std::{
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::{
    block::BlockType,
    content::{Backend, Manager},
    hash::ContentHash,
};

/// Capacity of the migration buffer (§3 Migration buffer).
pub const BUFFER_SIZE: usize = 128;

/// The producer refuses to top up the buffer until at least this many
/// slots are free, so each disk pass amortizes over a useful batch (§4.G
/// step 1).
const LOW_WATER_MARK: usize = 16;

#[derive(Clone)]
struct Buffered {
    hash: ContentHash,
    ciphertext: Vec<u8>,
}

struct Buffer {
    items: Mutex<Vec<Buffered>>,
    room: Semaphore,
}

impl Buffer {
    fn new() -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(BUFFER_SIZE)),
            room: Semaphore::new(BUFFER_SIZE),
        }
    }

    fn free_slots(&self) -> usize {
        self.room.available_permits()
    }
}

/// The background producer plus the send-fill buffer it feeds (§4.G,
/// §5: "The migration producer and the send-fill consumer synchronize via
/// a (semaphore, mutex) pair on the buffer").
pub struct Engine {
    buffer: Arc<Buffer>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Buffer::new()),
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.items.lock().len()
    }

    /// Spawns the producer task. It runs until the returned handle's task is
    /// aborted (the caller owns shutdown via [`crate::cron::CronHandle`]-style
    /// cancellation at a higher level, since this loop's natural unit is
    /// "one batch", not a fixed interval).
    pub fn spawn_producer<B: Backend + 'static>(
        &self,
        content: Arc<Manager<B>>,
    ) -> tokio::task::JoinHandle<()> {
        let buffer = Arc::clone(&self.buffer);
        tokio::spawn(async move {
            loop {
                // Step 1: block until there is room for a useful batch.
                while buffer.free_slots() < LOW_WATER_MARK {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }

                match produce_batch(&content, &buffer).await {
                    Ok(produced) => {
                        tracing::debug!(produced, "migration producer topped up buffer");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "migration producer batch failed, backing off");
                        let cpu_load_pct: u64 = 10; // placeholder load sample
                        let backoff = (cpu_load_pct / 5).max(2);
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                }
            }
        })
    }

    /// The send-fill callback (§4.G): given `padding` free bytes and a
    /// receiver, picks the buffered block with minimum XOR-distance to the
    /// receiver, removes it (swap-with-last), and returns it for encoding
    /// as a reply message.
    pub fn take_for_receiver(&self, receiver: &ContentHash, padding: usize) -> Option<(ContentHash, Vec<u8>)> {
        let mut items = self.buffer.items.lock();
        if items.is_empty() {
            return None;
        }
        let (best_idx, _) = items
            .iter()
            .enumerate()
            .filter(|(_, b)| b.ciphertext.len() <= padding)
            .min_by_key(|(_, b)| b.hash.xor_distance(receiver))?;
        let chosen = items.swap_remove(best_idx);
        drop(items);
        self.buffer.room.add_permits(1);
        Some((chosen.hash, chosen.ciphertext))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
enum ProduceError {
    #[error(transparent)]
    Content(#[from] crate::content::Error),
}

async fn produce_batch<B: Backend>(
    content: &Manager<B>,
    buffer: &Buffer,
) -> Result<usize, ProduceError> {
    let mut produced = 0;
    while buffer.free_slots() > 0 {
        let Some((hash, row)) = content.random_content().await? else {
            break;
        };
        let entries = row.entries();
        let Some(entry) = entries.first() else {
            continue;
        };

        // Step 3: 3HASH/SUPER are not migratable (multi-reply/advertisement
        // rows don't map to single standalone blocks a receiver can use).
        if matches!(
            entry.descriptor.block_type,
            BlockType::ThreeHash | BlockType::Super
        ) {
            continue;
        }

        let free = buffer.free_slots();
        let produced_blocks = if entry.descriptor.is_indexed() {
            let read_count = free.min(16) as u32;
            content.encode_on_demand(&entry.descriptor, read_count)?
        } else {
            vec![crate::content::Retrieved {
                block_type: entry.descriptor.block_type,
                double_hash: None,
                payload: entry.payload.clone(),
            }]
        };

        for block in produced_blocks {
            match buffer.room.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
            let item_hash = if let Some(dh) = block.double_hash {
                dh
            } else {
                hash
            };
            buffer.items.lock().push(Buffered {
                hash: item_hash,
                ciphertext: block.payload,
            });
            produced += 1;
        }
    }
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_for_receiver_picks_minimum_xor_distance() {
        let engine = Engine::new();
        {
            let mut items = engine.buffer.items.lock();
            items.push(Buffered {
                hash: ContentHash::from([0x00; 20]),
                ciphertext: vec![1; 8],
            });
            items.push(Buffered {
                hash: ContentHash::from([0xff; 20]),
                ciphertext: vec![2; 8],
            });
        }
        let receiver = ContentHash::from([0x01; 20]);
        let (hash, _) = engine.take_for_receiver(&receiver, 1024).unwrap();
        assert_eq!(hash, ContentHash::from([0x00; 20]));
        assert_eq!(engine.buffer_len(), 1);
    }

    #[test]
    fn take_for_receiver_respects_padding_budget() {
        let engine = Engine::new();
        {
            let mut items = engine.buffer.items.lock();
            items.push(Buffered {
                hash: ContentHash::from([0x00; 20]),
                ciphertext: vec![1; 100],
            });
        }
        let receiver = ContentHash::from([0x01; 20]);
        assert!(engine.take_for_receiver(&receiver, 10).is_none());
        assert!(engine.take_for_receiver(&receiver, 200).is_some());
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let engine = Engine::new();
        assert!(engine.take_for_receiver(&ContentHash::of(b"x"), 1024).is_none());
    }
}
