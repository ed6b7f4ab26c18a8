//! Block encoding — the JSON body format for content-addressed blocks.
//!
//! A block body is `{"value": <json>, "links": ["<hex>", ...]}`. The links
//! list is ordered; traversal follows it as declared, which is what makes
//! visitation order deterministic for a given graph.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::link::Link;

/// Decoded block body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Application payload. Opaque to traversal.
    pub value: serde_json::Value,

    /// Links this block carries, in declared order.
    #[serde(default)]
    pub links: Vec<Link>,
}

/// Error decoding a block body.
#[derive(Debug, thiserror::Error)]
#[error("invalid block body: {0}")]
pub struct BlockDecodeError(#[from] serde_json::Error);

impl Block {
    pub fn new(value: serde_json::Value, links: Vec<Link>) -> Self {
        Self { value, links }
    }

    /// Decode a block body from its raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode to the canonical byte form that links are computed over.
    pub fn encode(&self) -> Bytes {
        // Serialization of a Value + Vec<Link> cannot fail.
        Bytes::from(serde_json::to_vec(self).expect("block body serialization"))
    }

    /// Encode and return the block's link alongside the bytes.
    pub fn seal(&self) -> (Link, Bytes) {
        let bytes = self.encode();
        (Link::of(&bytes), bytes)
    }
}
