// Copyright © 2026 The AFS Core Contributors
//
// This file is part of afs-core, distributed under the GPLv3 with a linking
// exception. For full terms see the included LICENSE file.

//! Handler dispatch (§4.H): thin adaptors per wire opcode that validate
//! size (done already by [`crate::wire`]'s parse routines), apply policy,
//! and route through the indirection table, query manager and content
//! manager. Actual socket/IPC I/O is the connection layer's concern (§1
//! non-goals); this module calls out to a [`ReplySink`] trait object for
//! the final fan-out instead of holding a socket itself.

use std::{sync::Arc, time::Duration};

use rand::Rng;

use crate::{
    block::BlockType,
    content::{Backend, Manager as ContentManager, Origin},
    hash::ContentHash,
    indirect::{now_ms, Incoming, Table as IndirectionTable},
    peer::{ClientHandle, PeerId, Waiter},
    policy::{self, Admission},
    query::Manager as QueryManager,
    stats::Stats,
    wire::{Query, Reply, TTL_DECREMENT},
};

/// The final delivery step for a reply (§4.E reply delivery, §4.H "queue
/// with random delay"). Implemented by whatever owns the actual peer
/// connections and local client sockets.
pub trait ReplySink: Send + Sync {
    fn deliver(&self, remote: &[PeerId], local: &[ClientHandle], reply: &Reply);
}

/// A reply's identifying query key (§4.E): for `3HASH` this is the
/// double-hash carried alongside the block (itself the query key the
/// requester used); for everything else it is the hash of the block's own
/// bytes, since `CHK`/`CHKS`/`SBLOCK` are addressed by their own content
/// hash.
pub fn reply_query_key(reply: &Reply) -> ContentHash {
    match reply.double_hash {
        Some(dh) => dh,
        None => ContentHash::of(&reply.block.0[..]),
    }
}

pub struct QueryOutcome {
    pub admission: Admission,
    pub local_reply_scheduled: bool,
}

pub struct Dispatch<B: Backend> {
    pub indirection: Arc<IndirectionTable>,
    pub content: Arc<ContentManager<B>>,
    pub query: Arc<QueryManager>,
    pub stats: Arc<Stats>,
    pub sink: Arc<dyn ReplySink>,
    pub self_id: PeerId,
}

impl<B: Backend + 'static> Dispatch<B> {
    /// Handles an incoming `QUERY`/`NSQUERY` (§2 control flow for a remote
    /// query; §4.H).
    #[tracing::instrument(skip(self, query))]
    pub async fn handle_query(
        &self,
        query: Query,
        source: Waiter,
        block_type: BlockType,
        trust: u32,
        network_load_up_pct: i64,
    ) -> QueryOutcome {
        Stats::incr(&self.stats.queries_received);

        let admission = policy::evaluate_query(query.priority, trust, network_load_up_pct);
        let priority = match admission {
            Admission::Drop => {
                return QueryOutcome {
                    admission,
                    local_reply_scheduled: false,
                }
            }
            Admission::Allow { priority } | Admission::Deprioritize { priority } => priority,
        };

        let now = now_ms();
        let incoming = Incoming {
            query_key: query.keys[0],
            namespace: query.namespace,
            block_type,
            ttl: query.ttl,
            priority,
            waiter: source.clone(),
        };
        let decision = self.indirection.decide(&incoming, now);

        let mut local_reply_scheduled = false;
        if decision.is_routed {
            let origin = match &source {
                Waiter::Remote(p) => Origin::Remote(*p),
                Waiter::Local(_) => Origin::Local,
            };
            let results = self
                .content
                .retrieve(
                    &query.keys[0],
                    block_type,
                    origin,
                    priority,
                    network_load_up_pct,
                )
                .await
                .unwrap_or_default();
            for result in results {
                let reply = Reply {
                    block_type: result.block_type,
                    double_hash: result.double_hash,
                    block: crate::block::Block::from_slice_padded(&result.payload).0,
                };
                self.schedule_local_reply(query.keys[0], query.namespace, reply);
                local_reply_scheduled = true;
            }
        }

        if decision.do_forward {
            let is_local = matches!(source, Waiter::Local(_));
            let mut forwarded = query.clone();
            forwarded.ttl = policy::shrink_ttl(query.ttl, priority, is_local);
            self.query.forward(forwarded, source, now);
            Stats::incr(&self.stats.queries_forwarded);
        }

        QueryOutcome {
            admission,
            local_reply_scheduled,
        }
    }

    /// Queues a locally-computed reply for delivery after a random delay
    /// (§4.H: "deliberately delayed by a random fraction of a
    /// TTL_DECREMENT before being handed to the routing code as if it had
    /// come from the network"). `local_lookup_in_flight` guards the slot
    /// for the duration; if the slot has moved on by the time the delay
    /// fires, the reply is dropped (§9 Open Question, §5 Cancellation).
    pub fn schedule_local_reply(
        &self,
        query_key: ContentHash,
        namespace: Option<ContentHash>,
        reply: Reply,
    ) {
        self.indirection.set_local_lookup_in_flight(&query_key, true);
        let indirection = Arc::clone(&self.indirection);
        let query_mgr = Arc::clone(&self.query);
        let stats = Arc::clone(&self.stats);
        let sink = Arc::clone(&self.sink);
        let self_id = self.self_id;
        tokio::spawn(async move {
            let delay_ms = rand::thread_rng().gen_range(0..TTL_DECREMENT.max(1) as u64);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            if !indirection.still_holds(&query_key, namespace.as_ref()) {
                Stats::incr(&stats.replies_dropped_stale_route);
                indirection.set_local_lookup_in_flight(&query_key, false);
                return;
            }

            let content_hash = ContentHash::of(&reply.block.0[..]);
            if let Some(fanout) =
                indirection.on_reply(&query_key, namespace.as_ref(), &content_hash, &self_id)
            {
                Stats::incr(&stats.replies_delivered);
                sink.deliver(&fanout.remote_waiters, &fanout.local_waiters, &reply);
                for waiter in fanout
                    .remote_waiters
                    .iter()
                    .map(|p| Waiter::Remote(*p))
                    .chain(fanout.local_waiters.iter().map(|c| Waiter::Local(c.clone())))
                {
                    query_mgr.credit_response(waiter, self_id, now_ms());
                }
            } else {
                Stats::incr(&stats.replies_dropped_duplicate);
            }
            indirection.set_local_lookup_in_flight(&query_key, false);
        });
    }

    /// Handles an incoming result message (`CHK_RESULT` / `3HASH_RESULT` /
    /// `SBLOCK_RESULT`, §2 control flow for an incoming reply).
    #[tracing::instrument(skip(self, reply))]
    pub async fn handle_reply(&self, reply: Reply, responder: PeerId, namespace: Option<ContentHash>) {
        Stats::incr(&self.stats.replies_received);
        let query_key = reply_query_key(&reply);
        let content_hash = ContentHash::of(&reply.block.0[..]);

        let Some(fanout) = self
            .indirection
            .on_reply(&query_key, namespace.as_ref(), &content_hash, &responder)
        else {
            Stats::incr(&self.stats.replies_dropped_duplicate);
            return;
        };

        Stats::incr(&self.stats.replies_delivered);
        self.sink
            .deliver(&fanout.remote_waiters, &fanout.local_waiters, &reply);

        let now = now_ms();
        for waiter in fanout
            .remote_waiters
            .iter()
            .map(|p| Waiter::Remote(*p))
            .chain(fanout.local_waiters.iter().map(|c| Waiter::Local(c.clone())))
        {
            self.query.credit_response(waiter, responder, now);
        }

        // Best-effort local caching of the content we just relayed (§8
        // scenario 1: "B is stored at C with type=CHK").
        let origin = Origin::Remote(responder);
        let _ = self
            .content
            .insert(
                content_hash,
                reply.block_type,
                fanout.credited_priority,
                0,
                0,
                reply.block.0[..].to_vec(),
                origin,
            )
            .await;
    }

    /// Client disconnect callback (§4.E).
    pub fn on_client_disconnect(&self, client: &ClientHandle) {
        self.indirection.remove_client(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bloom::BloomFilters, content::SledBackend, fileindex::FileIndex, largereply,
    };
    use std::sync::Mutex;

    struct RecordingSink {
        delivered: Mutex<Vec<(Vec<PeerId>, Vec<ClientHandle>)>>,
    }

    impl ReplySink for RecordingSink {
        fn deliver(&self, remote: &[PeerId], local: &[ClientHandle], _reply: &Reply) {
            self.delivered
                .lock()
                .unwrap()
                .push((remote.to_vec(), local.to_vec()));
        }
    }

    fn dispatch(tmp: &tempfile::TempDir) -> (Dispatch<SledBackend>, Arc<RecordingSink>) {
        let backend = Arc::new(SledBackend::open(tmp.path().join("db")).unwrap());
        let bloom = Arc::new(BloomFilters::open(tmp.path().join("bloom"), 64).unwrap());
        let file_index = Arc::new(FileIndex::open(tmp.path().join("fi.lst")).unwrap());
        let large_replies = Arc::new(largereply::Store::open(tmp.path().join("lr")).unwrap());
        let content = Arc::new(ContentManager::new(
            backend,
            bloom,
            file_index,
            large_replies,
            64,
            true,
            0,
        ));
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
        });
        let dispatch = Dispatch {
            indirection: Arc::new(IndirectionTable::new(8192)),
            content,
            query: Arc::new(QueryManager::new()),
            stats: Arc::new(Stats::new()),
            sink: sink.clone() as Arc<dyn ReplySink>,
            self_id: PeerId::new(ContentHash::of(b"self")),
        };
        (dispatch, sink)
    }

    #[tokio::test]
    async fn reply_for_unknown_query_is_dropped_as_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let (dispatch, sink) = dispatch(&tmp);
        let (block, _) = crate::block::Block::from_slice_padded(b"payload");
        let reply = Reply {
            block_type: BlockType::Chk,
            double_hash: None,
            block,
        };
        dispatch
            .handle_reply(reply, PeerId::new(ContentHash::of(b"r")), None)
            .await;
        assert_eq!(sink.delivered.lock().unwrap().len(), 0);
        assert_eq!(dispatch.stats.snapshot().replies_dropped_duplicate, 1);
    }

    #[tokio::test]
    async fn matching_reply_is_delivered_and_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let (dispatch, sink) = dispatch(&tmp);
        let (block, _) = crate::block::Block::from_slice_padded(b"payload-bytes");
        let key = ContentHash::of(&block.0[..]);

        let query = Query {
            priority: 5,
            ttl: 60_000,
            return_to: PeerId::new(ContentHash::of(b"requester")),
            namespace: None,
            keys: vec![key],
        };
        let outcome = dispatch
            .handle_query(
                query,
                Waiter::Local(ClientHandle::new(1)),
                BlockType::Chk,
                100,
                0,
            )
            .await;
        assert!(matches!(outcome.admission, Admission::Allow { .. }));

        let reply = Reply {
            block_type: BlockType::Chk,
            double_hash: None,
            block: block.clone(),
        };
        dispatch
            .handle_reply(reply, PeerId::new(ContentHash::of(b"answerer")), None)
            .await;
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert_eq!(dispatch.stats.snapshot().replies_delivered, 1);
    }
}
