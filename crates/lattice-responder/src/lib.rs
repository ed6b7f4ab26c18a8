//! lattice-responder — response-side query execution core for the
//! Lattice graph synchronization protocol.
//!
//! A requesting peer names a root link and a selector; this crate walks
//! the selected subgraph locally and streams the visited blocks back in
//! traversal order, letting the application inspect and steer every
//! block and extension exchange, and pausing, resuming, or cancelling
//! mid-traversal.
//!
//! The moving parts: a peer-fair [`taskqueue::TaskQueue`] of pending
//! traversals, a fixed pool of executor workers, transactional
//! [`peersender`] batching per peer, ordered [`hooks`] chains, and a
//! single serializer task ([`manager::ResponseManager`]) that owns all
//! in-progress-response state and is reached only by message passing.

pub mod executor;
pub mod hooks;
pub mod manager;
pub mod peersender;
pub mod signals;
pub mod taskqueue;
pub mod traversal;

pub use executor::ExecutionError;
pub use hooks::{
    BlockHooks, CancelledListeners, CompletedListeners, HookDecision, HookOutcome, RequestHookOutcome,
    RequestHooks, ResponderHooks, UpdateHooks,
};
pub use manager::{ControlError, ResponseManager, UnpauseError};
pub use peersender::{
    BlockData, PeerResponseSender, PeerSenderManager, ResponseMessage, ResponseRecord,
};
pub use signals::{ResponseSignals, StopReason};
pub use taskqueue::{ResponseKey, Task, TaskQueue};
pub use traversal::{LinkChooser, TraversalBuilder, TraversalError, Traverser};
