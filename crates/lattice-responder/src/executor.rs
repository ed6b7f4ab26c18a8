//! Query executor — the fixed worker pool that drives traversals.
//!
//! Workers are stateless consumers: they pop prioritized tasks from the
//! queue, fetch the task's context from the serializer, prepare or
//! resume the traversal, push every yielded block through the per-peer
//! sender, and report the outcome back as a `FinishTask` message. All
//! response state lives with the serializer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use lattice_core::cancel::CancelToken;
use lattice_core::message::{
    decode_dedup_key, decode_link_set, extension_names, ExtensionError, SyncRequest,
};
use lattice_core::store::BlockLoader;
use lattice_core::ResponseStatus;

use crate::hooks::{HookDecision, ResponderHooks};
use crate::manager::{ManagerMessage, ResponseTaskData};
use crate::peersender::{PeerResponseSender, PeerSenderManager, TransactionError};
use crate::signals::{ResponseSignals, StopReason};
use crate::taskqueue::{ResponseKey, TaskQueue};
use crate::traversal::{TraversalBuilder, TraversalError, Traverser};

/// Why a task stopped before completing its traversal. `Paused` is
/// deliberately a variant here: pause travels the same return path as
/// failure but is not terminal.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("response paused")]
    Paused,

    /// The response's context was cancelled out from under the worker.
    #[error("response cancelled")]
    Cancelled,

    /// The responder itself asked to cancel.
    #[error("response cancelled by responder")]
    CancelledByCommand,

    #[error("request not valid")]
    NotValid,

    #[error(transparent)]
    MalformedExtension(#[from] ExtensionError),

    #[error(transparent)]
    Traversal(TraversalError),

    #[error("hook rejected the response")]
    Hook,

    /// The per-peer sender refused the transaction.
    #[error("sender rejected transaction: {0}")]
    SenderRejected(TransactionError),
}

pub(crate) struct QueryExecutor {
    pub id: usize,
    pub cancel: CancelToken,
    pub queue: Arc<TaskQueue>,
    pub work_notify: Arc<Notify>,
    pub messages: mpsc::Sender<ManagerMessage>,
    pub senders: Arc<PeerSenderManager>,
    pub hooks: ResponderHooks,
    pub loader: Arc<dyn BlockLoader>,
    pub thaw_interval: Duration,
    pub target_work: u64,
}

impl QueryExecutor {
    pub(crate) async fn run(self) {
        tracing::debug!(worker = self.id, "query executor worker started");
        let mut ticker = tokio::time::interval(self.thaw_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let (peer, tasks, _) = self.queue.pop_tasks(self.target_work);
            let Some(peer) = peer else {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::debug!(worker = self.id, "query executor worker stopping");
                        return;
                    }
                    _ = self.work_notify.notified() => {}
                    _ = ticker.tick() => {
                        self.queue.thaw_round();
                    }
                }
                continue;
            };

            for task in &tasks {
                let key = task.topic;
                let Some(data) = self.response_data(key).await else {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    tracing::info!(
                        peer = hex::encode(&key.peer[..8]),
                        request_id = key.request_id,
                        "empty task on peer request stack"
                    );
                    continue;
                };

                let (status, error) = self.execute_task(key, data).await;
                let finished = self
                    .messages
                    .send(ManagerMessage::FinishTask { key, status, error })
                    .await;
                if finished.is_err() {
                    return;
                }
            }
            self.queue.tasks_done(peer, &tasks);
        }
    }

    /// Ask the serializer for the task's context. `None` covers both an
    /// absent entry and shutdown.
    async fn response_data(&self, key: ResponseKey) -> Option<ResponseTaskData> {
        let (reply, response) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            sent = self.messages.send(ManagerMessage::ResponseData { key, reply }) => {
                sent.ok()?;
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            data = response => data.ok().flatten(),
        }
    }

    async fn execute_task(
        &self,
        key: ResponseKey,
        data: ResponseTaskData,
    ) -> (ResponseStatus, Option<ExecutionError>) {
        let (loader, traverser) = match (data.loader.clone(), data.traverser.clone()) {
            (Some(loader), Some(traverser)) => (loader, traverser),
            _ => match self.prepare_query(&data, key).await {
                Ok(Prepared {
                    loader,
                    traverser,
                    paused: false,
                }) => (loader, traverser),
                Ok(Prepared { paused: true, .. }) => {
                    return (ResponseStatus::RequestPaused, Some(ExecutionError::Paused))
                }
                Err(error) => return (ResponseStatus::RequestFailedUnknown, Some(error)),
            },
        };
        match self
            .execute_query(key, &data.request, &loader, &traverser, &data.signals)
            .await
        {
            Ok(status) => (status, None),
            Err(error) => {
                let status = match &error {
                    ExecutionError::Paused => ResponseStatus::RequestPaused,
                    ExecutionError::Cancelled | ExecutionError::CancelledByCommand => {
                        ResponseStatus::RequestCancelled
                    }
                    _ => ResponseStatus::RequestFailedUnknown,
                };
                (status, Some(error))
            }
        }
    }

    /// First touch of a response: run request hooks, apply filter
    /// extensions, build the traverser, and hand both back to the
    /// serializer for later resumes.
    async fn prepare_query(
        &self,
        data: &ResponseTaskData,
        key: ResponseKey,
    ) -> Result<Prepared, ExecutionError> {
        let request = &data.request;
        let result = self.hooks.request.process(key.peer, request);
        let sender = self.senders.sender_for(key.peer);

        let mut paused = false;
        let valid = sender
            .transaction(request.id, |txn| {
                for extension in result.extensions {
                    txn.send_extension(extension);
                }
                match result.decision {
                    HookDecision::Error(status) => {
                        txn.finish_with_error(status);
                        false
                    }
                    _ if !result.is_validated => {
                        txn.finish_with_error(ResponseStatus::RequestFailedUnknown);
                        false
                    }
                    HookDecision::Pause => {
                        txn.pause_request();
                        paused = true;
                        true
                    }
                    HookDecision::Ok => true,
                }
            })
            .map_err(ExecutionError::SenderRejected)?;
        if !valid {
            return Err(ExecutionError::NotValid);
        }

        self.apply_filter_extensions(request, &sender)?;

        let traverser = TraversalBuilder::new(request.root, request.selector.clone())
            .with_chooser(result.custom_chooser)
            .start(data.ctx.clone());
        let traverser = Arc::new(Mutex::new(traverser));
        let loader = result.custom_loader.unwrap_or_else(|| self.loader.clone());

        let set = self.messages.send(ManagerMessage::SetResponseData {
            key,
            loader: loader.clone(),
            traverser: traverser.clone(),
        });
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            sent = set => {
                if sent.is_err() {
                    return Err(ExecutionError::Cancelled);
                }
            }
        }

        Ok(Prepared {
            loader,
            traverser,
            paused,
        })
    }

    /// Decode and install the `dedup-by-key` and `do-not-send-links`
    /// extensions. A malformed payload is terminal.
    fn apply_filter_extensions(
        &self,
        request: &SyncRequest,
        sender: &PeerResponseSender,
    ) -> Result<(), ExecutionError> {
        if let Some(data) = request.extension(extension_names::DEDUP_BY_KEY) {
            match decode_dedup_key(data) {
                Ok(dedup_key) => sender.dedup_key(request.id, dedup_key),
                Err(error) => {
                    sender.finish_with_error(request.id, ResponseStatus::RequestFailedUnknown);
                    return Err(error.into());
                }
            }
        }
        if let Some(data) = request.extension(extension_names::DO_NOT_SEND_LINKS) {
            match decode_link_set(data) {
                Ok(links) => sender.ignore_blocks(request.id, links),
                Err(error) => {
                    sender.finish_with_error(request.id, ResponseStatus::RequestFailedUnknown);
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    /// Drive the traversal, interleaving signal polls with block sends.
    async fn execute_query(
        &self,
        key: ResponseKey,
        request: &SyncRequest,
        loader: &Arc<dyn BlockLoader>,
        traverser: &Arc<Mutex<Traverser>>,
        signals: &ResponseSignals,
    ) -> Result<ResponseStatus, ExecutionError> {
        let sender = self.senders.sender_for(key.peer);
        let mut traverser = traverser.lock().await;

        let outcome = loop {
            let step = match traverser.advance(loader.as_ref()) {
                Ok(step) => step,
                Err(error) => break Err(map_traversal_error(error)),
            };
            let Some((link, bytes)) = step else {
                break Ok(());
            };

            // Drain control signals before committing this block. The
            // update exchange happens outside the sender transaction; its
            // extensions ride in the same message as the block.
            let update_extensions = match self.poll_signals(key, request, signals).await {
                Ok(extensions) => extensions,
                Err(ExecutionError::Paused) => {
                    sender
                        .transaction(request.id, |txn| txn.pause_request())
                        .map_err(ExecutionError::SenderRejected)?;
                    break Err(ExecutionError::Paused);
                }
                Err(error) => break Err(error),
            };

            let result = sender
                .transaction(request.id, |txn| {
                    for extension in update_extensions {
                        txn.send_extension(extension);
                    }
                    let block = txn.send_response(link, Some(bytes));
                    if block.size == 0 {
                        return Ok(());
                    }
                    let merged = self.hooks.block.process(key.peer, request, block);
                    for extension in merged.extensions {
                        txn.send_extension(extension);
                    }
                    match merged.decision {
                        HookDecision::Ok => Ok(()),
                        HookDecision::Pause => {
                            txn.pause_request();
                            Err(ExecutionError::Paused)
                        }
                        HookDecision::Error(_) => Err(ExecutionError::Hook),
                    }
                })
                .map_err(ExecutionError::SenderRejected)?;
            if let Err(error) = result {
                break Err(error);
            }
        };

        match outcome {
            Ok(()) => sender
                .transaction(request.id, |txn| txn.finish_request())
                .map_err(ExecutionError::SenderRejected),
            Err(ExecutionError::Paused) => Err(ExecutionError::Paused),
            Err(ExecutionError::Cancelled) => {
                let _ = sender.transaction(request.id, |txn| txn.finish_with_cancel());
                Err(ExecutionError::Cancelled)
            }
            Err(ExecutionError::CancelledByCommand) => {
                let _ = sender.transaction(request.id, |txn| {
                    txn.finish_with_error(ResponseStatus::RequestCancelled)
                });
                Err(ExecutionError::CancelledByCommand)
            }
            Err(error) => {
                let _ = sender.transaction(request.id, |txn| {
                    txn.finish_with_error(ResponseStatus::RequestFailedUnknown)
                });
                Err(error)
            }
        }
    }

    /// Non-blocking check of the stop/pause/update mailboxes. Returns
    /// extensions produced by update hooks, to be emitted with the next
    /// block.
    async fn poll_signals(
        &self,
        key: ResponseKey,
        request: &SyncRequest,
        signals: &ResponseSignals,
    ) -> Result<Vec<lattice_core::Extension>, ExecutionError> {
        let mut extensions = Vec::new();
        loop {
            if let Some(reason) = signals.take_stop() {
                return Err(match reason {
                    StopReason::SelfCancel => ExecutionError::CancelledByCommand,
                    StopReason::External => ExecutionError::Cancelled,
                });
            }
            if signals.take_pause() {
                return Err(ExecutionError::Paused);
            }
            if signals.take_update() {
                let updates = self.pending_updates(key).await?;
                for update in updates {
                    let merged = self.hooks.update.process(key.peer, request, &update);
                    extensions.extend(merged.extensions);
                    match merged.decision {
                        HookDecision::Ok => {}
                        HookDecision::Pause => return Err(ExecutionError::Paused),
                        HookDecision::Error(_) => return Err(ExecutionError::Hook),
                    }
                }
                // Re-poll: an update hook may have raised further signals.
                continue;
            }
            return Ok(extensions);
        }
    }

    async fn pending_updates(
        &self,
        key: ResponseKey,
    ) -> Result<Vec<SyncRequest>, ExecutionError> {
        let (reply, response) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            sent = self.messages.send(ManagerMessage::PendingUpdates { key, reply }) => {
                if sent.is_err() {
                    return Err(ExecutionError::Cancelled);
                }
            }
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecutionError::Cancelled),
            updates = response => updates.map_err(|_| ExecutionError::Cancelled),
        }
    }
}

struct Prepared {
    loader: Arc<dyn BlockLoader>,
    traverser: Arc<Mutex<Traverser>>,
    paused: bool,
}

fn map_traversal_error(error: TraversalError) -> ExecutionError {
    if error.is_cancelled() {
        ExecutionError::Cancelled
    } else {
        ExecutionError::Traversal(error)
    }
}
