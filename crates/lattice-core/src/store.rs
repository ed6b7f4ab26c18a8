//! Block loading — the content-addressed byte retrieval contract, plus an
//! in-memory store for tests and small deployments.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

use crate::block::Block;
use crate::cancel::CancelToken;
use crate::link::Link;

/// Error loading a block. Not-found is NOT an error — loaders return
/// `Ok(None)` for links they do not have.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The load was abandoned because the request was cancelled.
    #[error("load cancelled")]
    Cancelled,

    /// Backing storage failure.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// A callback that retrieves block bytes by link.
///
/// Implementations that block must poll `cancel` and bail out with
/// `LoadError::Cancelled` when it fires.
pub trait BlockLoader: Send + Sync {
    fn load(&self, link: &Link, cancel: &CancelToken) -> Result<Option<Bytes>, LoadError>;
}

impl<F> BlockLoader for F
where
    F: Fn(&Link, &CancelToken) -> Result<Option<Bytes>, LoadError> + Send + Sync,
{
    fn load(&self, link: &Link, cancel: &CancelToken) -> Result<Option<Bytes>, LoadError> {
        self(link, cancel)
    }
}

/// In-memory block store.
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    /// link → encoded block bytes
    blocks: Arc<DashMap<Link, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(DashMap::new()),
        }
    }

    /// Store raw block bytes under their computed link.
    pub fn put_block(&self, bytes: impl Into<Bytes>) -> Link {
        let bytes = bytes.into();
        let link = Link::of(&bytes);
        self.blocks.insert(link, bytes);
        link
    }

    /// Encode and store a block body.
    pub fn put(&self, value: serde_json::Value, links: Vec<Link>) -> Link {
        self.put_block(Block::new(value, links).encode())
    }

    pub fn contains(&self, link: &Link) -> bool {
        self.blocks.contains_key(link)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockLoader for MemoryBlockStore {
    fn load(&self, link: &Link, cancel: &CancelToken) -> Result<Option<Bytes>, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        Ok(self.blocks.get(link).map(|b| b.clone()))
    }
}
