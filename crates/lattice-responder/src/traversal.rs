//! Traversal driver — walks a selector-described subgraph, yielding
//! `(link, bytes)` pairs in deterministic depth-first pre-order.
//!
//! A traverser is single-use and driven from one worker at a time. Each
//! distinct link is visited at most once per traversal; a block's links
//! are followed in the order the block declares them.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use lattice_core::block::{Block, BlockDecodeError};
use lattice_core::cancel::CancelToken;
use lattice_core::link::Link;
use lattice_core::selector::Selector;
use lattice_core::store::{BlockLoader, LoadError};

/// Rewrites or filters the links a block's children are taken from.
/// Installed by request hooks to steer traversal.
pub type LinkChooser = Arc<dyn Fn(&Link, &[Link]) -> Vec<Link> + Send + Sync>;

/// Error terminating a traversal.
#[derive(Debug, thiserror::Error)]
pub enum TraversalError {
    /// The response's context was cancelled while traversing.
    #[error("traversal cancelled")]
    Cancelled,

    /// The loader had no bytes for a link the selector reached.
    #[error("block not found: {0}")]
    NotFound(Link),

    /// Loader failure other than not-found.
    #[error(transparent)]
    Load(LoadError),

    /// A loaded block failed to decode.
    #[error("block {link} undecodable: {source}")]
    Decode {
        link: Link,
        #[source]
        source: BlockDecodeError,
    },
}

impl TraversalError {
    /// Context-cancellation predicate. Callers branch on this instead of
    /// inspecting error text.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TraversalError::Cancelled)
    }
}

/// Builder for a [`Traverser`].
pub struct TraversalBuilder {
    pub root: Link,
    pub selector: Selector,
    pub chooser: Option<LinkChooser>,
}

impl TraversalBuilder {
    pub fn new(root: Link, selector: Selector) -> Self {
        Self {
            root,
            selector,
            chooser: None,
        }
    }

    pub fn with_chooser(mut self, chooser: Option<LinkChooser>) -> Self {
        self.chooser = chooser;
        self
    }

    pub fn start(self, cancel: CancelToken) -> Traverser {
        Traverser {
            cancel,
            chooser: self.chooser,
            stack: vec![Frame {
                link: self.root,
                selector: self.selector,
            }],
            visited: HashSet::new(),
        }
    }
}

struct Frame {
    link: Link,
    selector: Selector,
}

/// Stateful iterator over the selected subgraph.
pub struct Traverser {
    cancel: CancelToken,
    chooser: Option<LinkChooser>,
    stack: Vec<Frame>,
    visited: HashSet<Link>,
}

impl Traverser {
    /// Advance one step. `Ok(None)` means the selector is exhausted.
    pub fn advance(
        &mut self,
        loader: &dyn BlockLoader,
    ) -> Result<Option<(Link, Bytes)>, TraversalError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TraversalError::Cancelled);
            }

            let Some(frame) = self.stack.pop() else {
                return Ok(None);
            };
            if !self.visited.insert(frame.link) {
                continue;
            }

            let bytes = match loader.load(&frame.link, &self.cancel) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(TraversalError::NotFound(frame.link)),
                Err(LoadError::Cancelled) => return Err(TraversalError::Cancelled),
                Err(e) => return Err(TraversalError::Load(e)),
            };

            let block = Block::decode(&bytes).map_err(|source| TraversalError::Decode {
                link: frame.link,
                source,
            })?;

            if let Some(next) = child_selector(&frame.selector) {
                let children = match &self.chooser {
                    Some(choose) => choose(&frame.link, &block.links),
                    None => block.links.clone(),
                };
                // Reverse push so the declared first link pops first.
                for link in children.into_iter().rev() {
                    self.stack.push(Frame {
                        link,
                        selector: next.clone(),
                    });
                }
            }

            return Ok(Some((frame.link, bytes)));
        }
    }
}

/// Selector to apply to a block's children, or `None` to stop descending.
fn child_selector(selector: &Selector) -> Option<Selector> {
    match selector {
        Selector::Matcher => None,
        Selector::ExploreAll { next } => Some((**next).clone()),
        Selector::ExploreRecursive { limit: None } => {
            Some(Selector::ExploreRecursive { limit: None })
        }
        Selector::ExploreRecursive { limit: Some(0) } => None,
        Selector::ExploreRecursive { limit: Some(depth) } => Some(Selector::ExploreRecursive {
            limit: Some(depth - 1),
        }),
    }
}
