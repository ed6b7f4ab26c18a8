//! Per-peer response sender — transactionally batches block records,
//! extension records, and status transitions into single outbound
//! messages.
//!
//! One sender exists per peer and serializes output for that peer across
//! all of its requests. Everything enqueued inside one transaction is
//! flushed as one [`ResponseMessage`], in enqueue order, never
//! interleaved with another transaction for the same peer. No ordering
//! holds across peers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use lattice_core::link::Link;
use lattice_core::message::{Extension, PeerId, RequestId, ResponseStatus};

// ── Outbound message model ────────────────────────────────────────────────────

/// One record in an outbound message. Records reach the wire in exactly
/// this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRecord {
    /// Block metadata. `size == 0` means the body was suppressed
    /// (dedup / ignore) or missing; the bytes ride in
    /// [`ResponseMessage::blocks`] otherwise.
    Block {
        request_id: RequestId,
        link: Link,
        size: usize,
        index: u64,
    },
    Extension {
        request_id: RequestId,
        extension: Extension,
    },
    Status {
        request_id: RequestId,
        status: ResponseStatus,
    },
}

/// The unit handed to the transport: ordered records plus the block
/// payloads they reference.
#[derive(Debug, Clone, Default)]
pub struct ResponseMessage {
    pub records: Vec<ResponseRecord>,
    pub blocks: Vec<(Link, Bytes)>,
}

impl ResponseMessage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.blocks.is_empty()
    }
}

/// Result of sending one block through a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockData {
    pub link: Link,
    /// 0 when the body was suppressed or missing.
    pub size: usize,
    /// Ordinal of this block record within its request, counting
    /// suppressed records.
    pub index: u64,
}

/// Why a transaction was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("request is paused")]
    Paused,
    #[error("request already finished")]
    Finished,
}

// ── Per-request send state ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RequestSendState {
    dedup_key: Option<String>,
    ignored: HashSet<Link>,
    /// Links already sent for this request; used when no dedup key is set.
    sent: HashSet<Link>,
    /// A link was traversed whose body could not be transmitted.
    missing: bool,
    next_index: u64,
    paused: bool,
    finished: bool,
}

type DedupBuckets = Arc<DashMap<String, HashSet<Link>>>;

// ── Sender manager ────────────────────────────────────────────────────────────

/// Hands out the per-peer senders and owns the cross-request dedup
/// buckets they share.
pub struct PeerSenderManager {
    senders: DashMap<PeerId, Arc<PeerResponseSender>>,
    outbox: mpsc::UnboundedSender<(PeerId, ResponseMessage)>,
    dedup_buckets: DedupBuckets,
}

impl PeerSenderManager {
    /// Returns the manager and the receiving end the transport drains.
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(PeerId, ResponseMessage)>,
    ) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                senders: DashMap::new(),
                outbox,
                dedup_buckets: Arc::new(DashMap::new()),
            }),
            inbox,
        )
    }

    /// The sender for a peer, created on first use.
    pub fn sender_for(&self, peer: PeerId) -> Arc<PeerResponseSender> {
        self.senders
            .entry(peer)
            .or_insert_with(|| {
                Arc::new(PeerResponseSender {
                    peer,
                    outbox: self.outbox.clone(),
                    dedup_buckets: self.dedup_buckets.clone(),
                    state: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }
}

// ── Per-peer sender ───────────────────────────────────────────────────────────

/// Single writer for one peer's outbound records.
pub struct PeerResponseSender {
    peer: PeerId,
    outbox: mpsc::UnboundedSender<(PeerId, ResponseMessage)>,
    dedup_buckets: DedupBuckets,
    /// request id → send state. The mutex IS the per-peer writer lock.
    state: Mutex<HashMap<RequestId, RequestSendState>>,
}

impl PeerResponseSender {
    /// Run `f` with exclusive access to this peer's writer. Everything it
    /// enqueues flushes as one message when `f` returns.
    pub fn transaction<R>(
        &self,
        request_id: RequestId,
        f: impl FnOnce(&mut ResponseTransaction<'_>) -> R,
    ) -> Result<R, TransactionError> {
        let mut state = self.state.lock().expect("peer sender poisoned");
        let request = state.entry(request_id).or_default();
        if request.paused {
            return Err(TransactionError::Paused);
        }
        if request.finished {
            return Err(TransactionError::Finished);
        }

        let mut txn = ResponseTransaction {
            request_id,
            request,
            dedup_buckets: &self.dedup_buckets,
            message: ResponseMessage::default(),
        };
        let result = f(&mut txn);
        let message = txn.message;
        // Flush before releasing the writer lock so two transactions for
        // this peer can never interleave on the wire.
        self.flush(message);
        drop(state);
        Ok(result)
    }

    /// Configure the cross-request dedup bucket for a request. Set before
    /// traversal begins.
    pub fn dedup_key(&self, request_id: RequestId, key: String) {
        let mut state = self.state.lock().expect("peer sender poisoned");
        state.entry(request_id).or_default().dedup_key = Some(key);
    }

    /// Suppress body emission for these links on a request. Set before
    /// traversal begins.
    pub fn ignore_blocks(&self, request_id: RequestId, links: impl IntoIterator<Item = Link>) {
        let mut state = self.state.lock().expect("peer sender poisoned");
        state
            .entry(request_id)
            .or_default()
            .ignored
            .extend(links);
    }

    /// Terminal failure outside a transaction.
    pub fn finish_with_error(&self, request_id: RequestId, status: ResponseStatus) {
        let _ = self.transaction(request_id, |txn| txn.finish_with_error(status));
    }

    /// Lift a pause so transactions on the request are accepted again.
    pub fn unpause_request(&self, request_id: RequestId) {
        let mut state = self.state.lock().expect("peer sender poisoned");
        if let Some(request) = state.get_mut(&request_id) {
            request.paused = false;
        }
    }

    fn flush(&self, message: ResponseMessage) {
        if message.is_empty() {
            return;
        }
        // Receiver gone means the transport shut down first; nothing to do.
        if self.outbox.send((self.peer, message)).is_err() {
            tracing::debug!(
                peer = hex::encode(&self.peer[..8]),
                "response outbox closed, message dropped"
            );
        }
    }
}

// ── Transaction ───────────────────────────────────────────────────────────────

/// Scoped exclusive access to a peer's outbound batcher.
pub struct ResponseTransaction<'a> {
    request_id: RequestId,
    request: &'a mut RequestSendState,
    dedup_buckets: &'a DedupBuckets,
    message: ResponseMessage,
}

impl ResponseTransaction<'_> {
    /// Enqueue a block record. The body is suppressed (metadata-only,
    /// `size == 0`) when the link was already sent under the request's
    /// dedup key, already sent for this request, or sits in the ignore
    /// set. `None` marks a block that could not be retrieved; the request
    /// then completes partially.
    pub fn send_response(&mut self, link: Link, data: Option<Bytes>) -> BlockData {
        let index = self.request.next_index;
        self.request.next_index += 1;

        let send_body = match &data {
            None => {
                self.request.missing = true;
                false
            }
            Some(_) => !self.suppressed(&link),
        };

        let size = match (&data, send_body) {
            (Some(bytes), true) => bytes.len(),
            _ => 0,
        };

        self.message.records.push(ResponseRecord::Block {
            request_id: self.request_id,
            link,
            size,
            index,
        });
        if send_body {
            if let Some(bytes) = data {
                self.message.blocks.push((link, bytes));
            }
        }

        BlockData { link, size, index }
    }

    /// Append an extension record.
    pub fn send_extension(&mut self, extension: Extension) {
        self.message.records.push(ResponseRecord::Extension {
            request_id: self.request_id,
            extension,
        });
    }

    /// Mark the request paused and record the transition. Later
    /// transactions on this id are rejected until unpause; a finish in
    /// this transaction is suppressed.
    pub fn pause_request(&mut self) {
        if self.request.paused {
            return;
        }
        self.request.paused = true;
        self.message.records.push(ResponseRecord::Status {
            request_id: self.request_id,
            status: ResponseStatus::RequestPaused,
        });
    }

    /// Terminal failure.
    pub fn finish_with_error(&mut self, status: ResponseStatus) {
        self.finish(status);
    }

    /// Terminal cancellation.
    pub fn finish_with_cancel(&mut self) {
        self.finish(ResponseStatus::RequestCancelled);
    }

    /// Terminal success. Full when every traversed link was transmitted,
    /// partial otherwise.
    pub fn finish_request(&mut self) -> ResponseStatus {
        let status = if self.request.missing {
            ResponseStatus::CompletedPartial
        } else {
            ResponseStatus::CompletedFull
        };
        self.finish(status);
        status
    }

    fn finish(&mut self, status: ResponseStatus) {
        if self.request.paused || self.request.finished {
            return;
        }
        self.request.finished = true;
        self.message.records.push(ResponseRecord::Status {
            request_id: self.request_id,
            status,
        });
    }

    /// Consult and update dedup state for a link about to be sent.
    fn suppressed(&mut self, link: &Link) -> bool {
        if self.request.ignored.contains(link) {
            return true;
        }
        match &self.request.dedup_key {
            Some(key) => {
                let mut bucket = self.dedup_buckets.entry(key.clone()).or_default();
                !bucket.insert(*link)
            }
            None => !self.request.sent.insert(*link),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::message::extension_names;

    const PEER: PeerId = [7u8; 32];

    fn setup() -> (
        Arc<PeerResponseSender>,
        mpsc::UnboundedReceiver<(PeerId, ResponseMessage)>,
    ) {
        let (manager, inbox) = PeerSenderManager::new();
        (manager.sender_for(PEER), inbox)
    }

    fn body(n: u8) -> Bytes {
        Bytes::from(vec![n; 16])
    }

    #[test]
    fn transaction_flushes_one_message_in_order() {
        let (sender, mut inbox) = setup();
        let link = Link::of(b"block");

        sender
            .transaction(1, |txn| {
                txn.send_extension(Extension::new("app/meta", &b"x"[..]));
                txn.send_response(link, Some(body(1)));
                txn.finish_request();
            })
            .unwrap();

        let (peer, message) = inbox.try_recv().unwrap();
        assert_eq!(peer, PEER);
        assert_eq!(message.records.len(), 3);
        assert!(matches!(message.records[0], ResponseRecord::Extension { .. }));
        assert!(matches!(
            message.records[1],
            ResponseRecord::Block { size: 16, .. }
        ));
        assert!(matches!(
            message.records[2],
            ResponseRecord::Status {
                status: ResponseStatus::CompletedFull,
                ..
            }
        ));
        assert_eq!(message.blocks.len(), 1);
        assert!(inbox.try_recv().is_err(), "exactly one message per txn");
    }

    #[test]
    fn empty_transaction_sends_nothing() {
        let (sender, mut inbox) = setup();
        sender.transaction(1, |_| {}).unwrap();
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn repeat_link_within_request_is_metadata_only() {
        let (sender, mut inbox) = setup();
        let link = Link::of(b"block");

        let (first, second) = sender
            .transaction(1, |txn| {
                (
                    txn.send_response(link, Some(body(1))),
                    txn.send_response(link, Some(body(1))),
                )
            })
            .unwrap();

        assert_eq!(first.size, 16);
        assert_eq!(first.index, 0);
        assert_eq!(second.size, 0);
        assert_eq!(second.index, 1);

        let (_, message) = inbox.try_recv().unwrap();
        assert_eq!(message.blocks.len(), 1, "body rides once");
    }

    #[test]
    fn dedup_key_spans_requests() {
        let (sender, _inbox) = setup();
        let link = Link::of(b"shared");

        sender.dedup_key(1, "bucket".into());
        sender.dedup_key(2, "bucket".into());

        let sent = sender
            .transaction(1, |txn| txn.send_response(link, Some(body(1))))
            .unwrap();
        assert_eq!(sent.size, 16);

        let suppressed = sender
            .transaction(2, |txn| txn.send_response(link, Some(body(1))))
            .unwrap();
        assert_eq!(suppressed.size, 0, "same bucket, link already sent");
    }

    #[test]
    fn distinct_dedup_keys_do_not_interfere() {
        let (sender, _inbox) = setup();
        let link = Link::of(b"shared");

        sender.dedup_key(1, "a".into());
        sender.dedup_key(2, "b".into());

        sender
            .transaction(1, |txn| txn.send_response(link, Some(body(1))))
            .unwrap();
        let other = sender
            .transaction(2, |txn| txn.send_response(link, Some(body(1))))
            .unwrap();
        assert_eq!(other.size, 16);
    }

    #[test]
    fn ignored_links_are_suppressed() {
        let (sender, mut inbox) = setup();
        let link = Link::of(b"ignored");

        sender.ignore_blocks(1, [link]);
        let sent = sender
            .transaction(1, |txn| txn.send_response(link, Some(body(1))))
            .unwrap();
        assert_eq!(sent.size, 0);

        let (_, message) = inbox.try_recv().unwrap();
        assert!(message.blocks.is_empty());
        assert!(matches!(
            message.records[0],
            ResponseRecord::Block { size: 0, .. }
        ));
    }

    #[test]
    fn missing_body_yields_partial_completion() {
        let (sender, _inbox) = setup();
        let status = sender
            .transaction(1, |txn| {
                txn.send_response(Link::of(b"gone"), None);
                txn.finish_request()
            })
            .unwrap();
        assert_eq!(status, ResponseStatus::CompletedPartial);
    }

    #[test]
    fn pause_rejects_later_transactions_until_unpause() {
        let (sender, _inbox) = setup();
        sender.transaction(1, |txn| txn.pause_request()).unwrap();

        assert_eq!(
            sender.transaction(1, |_| ()).unwrap_err(),
            TransactionError::Paused
        );

        sender.unpause_request(1);
        assert!(sender.transaction(1, |_| ()).is_ok());
    }

    #[test]
    fn pause_suppresses_finish_in_same_transaction() {
        let (sender, mut inbox) = setup();
        sender
            .transaction(1, |txn| {
                txn.pause_request();
                txn.finish_request();
            })
            .unwrap();
        let (_, message) = inbox.try_recv().unwrap();
        assert_eq!(
            message.records,
            vec![ResponseRecord::Status {
                request_id: 1,
                status: ResponseStatus::RequestPaused,
            }],
            "pause transition only, finish suppressed"
        );
    }

    #[test]
    fn finished_request_rejects_transactions() {
        let (sender, _inbox) = setup();
        sender
            .transaction(1, |txn| {
                txn.finish_with_error(ResponseStatus::RequestFailedUnknown)
            })
            .unwrap();
        assert_eq!(
            sender.transaction(1, |_| ()).unwrap_err(),
            TransactionError::Finished
        );
    }

    #[test]
    fn finish_with_cancel_writes_cancelled_status() {
        let (sender, mut inbox) = setup();
        sender
            .transaction(1, |txn| txn.finish_with_cancel())
            .unwrap();
        let (_, message) = inbox.try_recv().unwrap();
        assert!(matches!(
            message.records[0],
            ResponseRecord::Status {
                status: ResponseStatus::RequestCancelled,
                ..
            }
        ));
    }

    #[test]
    fn requests_on_one_peer_share_the_sender() {
        let (manager, _inbox) = PeerSenderManager::new();
        let a = manager.sender_for(PEER);
        let b = manager.sender_for(PEER);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn extension_names_are_stable() {
        // Peers depend on these exact strings.
        assert_eq!(extension_names::DEDUP_BY_KEY, "lattice/dedup-by-key");
        assert_eq!(
            extension_names::DO_NOT_SEND_LINKS,
            "lattice/do-not-send-links"
        );
    }
}
