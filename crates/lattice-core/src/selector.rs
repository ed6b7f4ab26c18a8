//! Selectors — declarative documents describing which part of a linked
//! graph to visit starting from a root.
//!
//! Traversal is depth-first pre-order over each block's declared link
//! order, visiting every distinct link at most once.

use serde::{Deserialize, Serialize};

/// A selector document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    /// Visit the current block and stop.
    Matcher,

    /// Visit the current block, then apply `next` to every link it carries.
    ExploreAll { next: Box<Selector> },

    /// Visit the current block and recurse into every carried link.
    /// `limit` bounds recursion depth; `None` means unbounded.
    ExploreRecursive { limit: Option<u32> },
}

impl Selector {
    /// The whole reachable subgraph. What most requesters ask for.
    pub fn all() -> Self {
        Selector::ExploreRecursive { limit: None }
    }

    /// The root block and its immediate children.
    pub fn children() -> Self {
        Selector::ExploreAll {
            next: Box::new(Selector::Matcher),
        }
    }
}
