//! lattice-core — shared types for the Lattice graph synchronization protocol.
//! All other Lattice crates depend on this one.

pub mod block;
pub mod cancel;
pub mod config;
pub mod link;
pub mod message;
pub mod selector;
pub mod store;

pub use block::Block;
pub use cancel::CancelToken;
pub use link::Link;
pub use message::{Extension, PeerId, RequestId, ResponseStatus, SyncRequest};
pub use selector::Selector;
pub use store::{BlockLoader, LoadError, MemoryBlockStore};
