//! Response manager — the serializer that owns the in-progress-response
//! table.
//!
//! The table is touched by exactly one task, which drains a bounded
//! channel of typed messages from workers and from the public API. The
//! serializer never performs I/O; workers do all sending and traversal
//! and report back with messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use lattice_core::cancel::CancelToken;
use lattice_core::config::ResponderConfig;
use lattice_core::message::{PeerId, SyncRequest};
use lattice_core::store::BlockLoader;
use lattice_core::ResponseStatus;

use crate::executor::{ExecutionError, QueryExecutor};
use crate::hooks::ResponderHooks;
use crate::peersender::PeerSenderManager;
use crate::signals::{ResponseSignals, StopReason};
use crate::taskqueue::{ResponseKey, Task, TaskQueue};
use crate::traversal::Traverser;

/// Priority used when re-queuing an unpaused response: ahead of
/// everything else the peer has pending.
const UNPAUSE_PRIORITY: i32 = i32::MAX;

/// Error unpausing a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnpauseError {
    #[error("no in-progress response for that request")]
    NotFound,
    #[error("response is not paused")]
    NotPaused,
    #[error("responder shut down")]
    Shutdown,
}

/// Error pausing or self-cancelling a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("no in-progress response for that request")]
    NotFound,
    #[error("response is already paused")]
    AlreadyPaused,
    #[error("responder shut down")]
    Shutdown,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Context a worker needs to run one task. "Empty" is `None` at the
/// reply level.
pub(crate) struct ResponseTaskData {
    pub ctx: CancelToken,
    pub request: SyncRequest,
    pub loader: Option<Arc<dyn BlockLoader>>,
    pub traverser: Option<Arc<Mutex<Traverser>>>,
    pub signals: ResponseSignals,
}

pub(crate) enum ManagerMessage {
    ProcessRequests {
        peer: PeerId,
        requests: Vec<SyncRequest>,
    },
    ResponseData {
        key: ResponseKey,
        reply: oneshot::Sender<Option<ResponseTaskData>>,
    },
    SetResponseData {
        key: ResponseKey,
        loader: Arc<dyn BlockLoader>,
        traverser: Arc<Mutex<Traverser>>,
    },
    PendingUpdates {
        key: ResponseKey,
        reply: oneshot::Sender<Vec<SyncRequest>>,
    },
    FinishTask {
        key: ResponseKey,
        status: ResponseStatus,
        error: Option<ExecutionError>,
    },
    Unpause {
        key: ResponseKey,
        reply: oneshot::Sender<Result<(), UnpauseError>>,
    },
    Pause {
        key: ResponseKey,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    CancelByCommand {
        key: ResponseKey,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Test barrier: replies once every earlier message has been handled.
    Synchronize { reply: oneshot::Sender<()> },
}

// ── Table entry ───────────────────────────────────────────────────────────────

struct InProgressResponse {
    ctx: CancelToken,
    request: SyncRequest,
    loader: Option<Arc<dyn BlockLoader>>,
    traverser: Option<Arc<Mutex<Traverser>>>,
    signals: ResponseSignals,
    is_paused: bool,
    pending_updates: Vec<SyncRequest>,
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// Handle to the response-side query execution core.
pub struct ResponseManager {
    messages: mpsc::Sender<ManagerMessage>,
    cancel: CancelToken,
    spawn: StdMutex<Option<SpawnState>>,
}

struct SpawnState {
    serializer: Serializer,
    inbox: mpsc::Receiver<ManagerMessage>,
    workers: Vec<QueryExecutor>,
}

impl ResponseManager {
    /// Build a manager. Call [`startup`](Self::startup) to begin
    /// processing.
    pub fn new(
        config: &ResponderConfig,
        loader: Arc<dyn BlockLoader>,
        senders: Arc<PeerSenderManager>,
        hooks: ResponderHooks,
    ) -> Self {
        let cancel = CancelToken::new();
        let (messages, inbox) = mpsc::channel(config.message_channel_capacity.max(1));
        let queue = Arc::new(TaskQueue::new());
        let work_notify = Arc::new(Notify::new());

        let serializer = Serializer {
            cancel: cancel.clone(),
            queue: queue.clone(),
            work_notify: work_notify.clone(),
            senders: senders.clone(),
            hooks: hooks.clone(),
            in_progress: HashMap::new(),
        };

        let workers = (0..config.workers())
            .map(|id| QueryExecutor {
                id,
                cancel: cancel.clone(),
                queue: queue.clone(),
                work_notify: work_notify.clone(),
                messages: messages.clone(),
                senders: senders.clone(),
                hooks: hooks.clone(),
                loader: loader.clone(),
                thaw_interval: config.thaw_interval(),
                target_work: config.target_work_per_pop.max(1),
            })
            .collect();

        Self {
            messages,
            cancel,
            spawn: StdMutex::new(Some(SpawnState {
                serializer,
                inbox,
                workers,
            })),
        }
    }

    /// Spawn the serializer and the worker pool. Subsequent calls are
    /// no-ops.
    pub fn startup(&self) {
        let Some(state) = self.spawn.lock().expect("spawn state poisoned").take() else {
            return;
        };
        let SpawnState {
            serializer,
            inbox,
            workers,
        } = state;
        tracing::info!(workers = workers.len(), "response manager starting");
        for worker in workers {
            tokio::spawn(worker.run());
        }
        tokio::spawn(serializer.run(inbox));
    }

    /// Tear down the serializer, workers, and every in-progress response.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Enqueue inbound requests from a peer. Returns once the message is
    /// accepted or either context is cancelled.
    pub async fn process_requests(
        &self,
        ctx: &CancelToken,
        peer: PeerId,
        requests: Vec<SyncRequest>,
    ) {
        let send = self
            .messages
            .send(ManagerMessage::ProcessRequests { peer, requests });
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = ctx.cancelled() => {}
            _ = send => {}
        }
    }

    /// Resume a previously paused response. Resolves only after the
    /// serializer confirms.
    pub async fn unpause_response(
        &self,
        peer: PeerId,
        request_id: lattice_core::RequestId,
    ) -> Result<(), UnpauseError> {
        let key = ResponseKey::new(peer, request_id);
        let (reply, confirm) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(UnpauseError::Shutdown),
            sent = self.messages.send(ManagerMessage::Unpause { key, reply }) => {
                if sent.is_err() {
                    return Err(UnpauseError::Shutdown);
                }
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(UnpauseError::Shutdown),
            result = confirm => result.unwrap_or(Err(UnpauseError::Shutdown)),
        }
    }

    /// Suspend a running response from the responder side. The traversal
    /// observes the pause at its next block boundary.
    pub async fn pause_response(
        &self,
        peer: PeerId,
        request_id: lattice_core::RequestId,
    ) -> Result<(), ControlError> {
        let key = ResponseKey::new(peer, request_id);
        self.control(|reply| ManagerMessage::Pause { key, reply })
            .await
    }

    /// Cancel a response from the responder side. The requester sees
    /// `RequestCancelled`.
    pub async fn cancel_response(
        &self,
        peer: PeerId,
        request_id: lattice_core::RequestId,
    ) -> Result<(), ControlError> {
        let key = ResponseKey::new(peer, request_id);
        self.control(|reply| ManagerMessage::CancelByCommand { key, reply })
            .await
    }

    async fn control(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<(), ControlError>>) -> ManagerMessage,
    ) -> Result<(), ControlError> {
        let (reply, confirm) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ControlError::Shutdown),
            sent = self.messages.send(message(reply)) => {
                if sent.is_err() {
                    return Err(ControlError::Shutdown);
                }
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ControlError::Shutdown),
            result = confirm => result.unwrap_or(Err(ControlError::Shutdown)),
        }
    }

    /// Barrier for tests: resolves once every message sent before it has
    /// been fully handled.
    pub async fn synchronize(&self) {
        let (reply, confirm) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            sent = self.messages.send(ManagerMessage::Synchronize { reply }) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = confirm => {}
        }
    }
}

// ── Serializer ────────────────────────────────────────────────────────────────

struct Serializer {
    cancel: CancelToken,
    queue: Arc<TaskQueue>,
    work_notify: Arc<Notify>,
    senders: Arc<PeerSenderManager>,
    hooks: ResponderHooks,
    in_progress: HashMap<ResponseKey, InProgressResponse>,
}

impl Serializer {
    async fn run(mut self, mut inbox: mpsc::Receiver<ManagerMessage>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        self.cleanup();
    }

    /// Cancel every in-progress response on teardown.
    fn cleanup(&mut self) {
        for response in self.in_progress.values() {
            response.ctx.cancel();
        }
        self.in_progress.clear();
        tracing::debug!("response table cleaned up");
    }

    fn handle(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::ProcessRequests { peer, requests } => {
                self.process_requests(peer, requests)
            }
            ManagerMessage::ResponseData { key, reply } => {
                let data = self.in_progress.get(&key).map(|r| ResponseTaskData {
                    ctx: r.ctx.clone(),
                    request: r.request.clone(),
                    loader: r.loader.clone(),
                    traverser: r.traverser.clone(),
                    signals: r.signals.clone(),
                });
                let _ = reply.send(data);
            }
            ManagerMessage::SetResponseData {
                key,
                loader,
                traverser,
            } => {
                if let Some(response) = self.in_progress.get_mut(&key) {
                    response.loader = Some(loader);
                    response.traverser = Some(traverser);
                }
            }
            ManagerMessage::PendingUpdates { key, reply } => {
                let updates = self
                    .in_progress
                    .get_mut(&key)
                    .map(|r| std::mem::take(&mut r.pending_updates))
                    .unwrap_or_default();
                let _ = reply.send(updates);
            }
            ManagerMessage::FinishTask { key, status, error } => {
                self.finish_task(key, status, error)
            }
            ManagerMessage::Unpause { key, reply } => {
                let _ = reply.send(self.unpause(key));
            }
            ManagerMessage::Pause { key, reply } => {
                let _ = reply.send(self.pause(key));
            }
            ManagerMessage::CancelByCommand { key, reply } => {
                let result = match self.in_progress.get(&key) {
                    Some(response) => {
                        response.signals.raise_stop(StopReason::SelfCancel);
                        Ok(())
                    }
                    None => Err(ControlError::NotFound),
                };
                let _ = reply.send(result);
            }
            ManagerMessage::Synchronize { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn process_requests(&mut self, peer: PeerId, requests: Vec<SyncRequest>) {
        for request in requests {
            let key = ResponseKey::new(peer, request.id);
            // Cancel wins over update when a request carries both flags.
            if request.is_cancel {
                self.cancel_response(key);
            } else if request.is_update {
                self.queue_update(key, request);
            } else {
                self.accept_new(key, peer, request);
            }
        }
    }

    fn accept_new(&mut self, key: ResponseKey, peer: PeerId, request: SyncRequest) {
        tracing::debug!(
            peer = hex::encode(&peer[..8]),
            request_id = request.id,
            priority = request.priority,
            "request accepted"
        );
        let priority = request.priority;
        self.in_progress.insert(
            key,
            InProgressResponse {
                ctx: CancelToken::new(),
                request,
                loader: None,
                traverser: None,
                signals: ResponseSignals::new(),
                is_paused: false,
                pending_updates: Vec::new(),
            },
        );
        self.queue.push_tasks(
            peer,
            [Task {
                topic: key,
                priority,
                work: 1,
            }],
        );
        self.work_notify.notify_one();
    }

    fn cancel_response(&mut self, key: ResponseKey) {
        self.queue.remove(key, key.peer);
        let Some(response) = self.in_progress.remove(&key) else {
            // Cancelling an absent or already-finished request is a no-op.
            return;
        };
        tracing::debug!(
            peer = hex::encode(&key.peer[..8]),
            request_id = key.request_id,
            "request cancelled by peer"
        );
        response.signals.raise_stop(StopReason::External);
        response.ctx.cancel();
        self.hooks.cancelled.notify(key.peer, &response.request);
    }

    fn queue_update(&mut self, key: ResponseKey, update: SyncRequest) {
        match self.in_progress.get_mut(&key) {
            Some(response) => {
                response.pending_updates.push(update);
                response.signals.raise_update();
            }
            None => {
                tracing::debug!(
                    peer = hex::encode(&key.peer[..8]),
                    request_id = key.request_id,
                    "update for unknown request dropped"
                );
            }
        }
    }

    fn finish_task(
        &mut self,
        key: ResponseKey,
        status: ResponseStatus,
        error: Option<ExecutionError>,
    ) {
        if matches!(error, Some(ExecutionError::Paused)) {
            if let Some(response) = self.in_progress.get_mut(&key) {
                response.is_paused = true;
            }
            return;
        }

        let Some(response) = self.in_progress.remove(&key) else {
            return;
        };
        if let Some(error) = &error {
            tracing::info!(
                peer = hex::encode(&key.peer[..8]),
                request_id = key.request_id,
                %error,
                "response failed"
            );
        }
        response.ctx.cancel();

        // A context cancellation notifies the cancelled listeners; every
        // other terminal outcome (including responder self-cancel) is a
        // completion with its status.
        if matches!(error, Some(ExecutionError::Cancelled)) {
            self.hooks.cancelled.notify(key.peer, &response.request);
        } else {
            self.hooks
                .completed
                .notify(key.peer, &response.request, status);
        }
    }

    fn pause(&mut self, key: ResponseKey) -> Result<(), ControlError> {
        let response = self
            .in_progress
            .get(&key)
            .ok_or(ControlError::NotFound)?;
        if response.is_paused {
            return Err(ControlError::AlreadyPaused);
        }
        response.signals.raise_pause();
        Ok(())
    }

    fn unpause(&mut self, key: ResponseKey) -> Result<(), UnpauseError> {
        let response = self
            .in_progress
            .get_mut(&key)
            .ok_or(UnpauseError::NotFound)?;
        if !response.is_paused {
            return Err(UnpauseError::NotPaused);
        }
        response.is_paused = false;
        self.senders
            .sender_for(key.peer)
            .unpause_request(key.request_id);
        self.queue.push_tasks(
            key.peer,
            [Task {
                topic: key,
                priority: UNPAUSE_PRIORITY,
                work: 1,
            }],
        );
        self.work_notify.notify_one();
        Ok(())
    }
}
