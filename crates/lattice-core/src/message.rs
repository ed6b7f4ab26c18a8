//! Request and response vocabulary for the Lattice sync protocol.
//!
//! These types are the protocol-level surface the responder core works
//! with: inbound typed requests, outbound status codes, and the named
//! extension payloads the core understands. The wire framing around them
//! lives with the transport, not here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::link::Link;
use crate::selector::Selector;

/// A peer's identity — its static public key.
pub type PeerId = [u8; 32];

/// Request identifier, unique within a peer.
pub type RequestId = i32;

// ── Extensions ────────────────────────────────────────────────────────────────

/// Canonical extension names recognized by the responder core.
/// Protocol-level names; they must never change once peers ship.
pub mod extension_names {
    /// Per-request dedup bucket. Payload: JSON string key.
    pub const DEDUP_BY_KEY: &str = "lattice/dedup-by-key";

    /// Suppress emission of block bodies for these links.
    /// Payload: JSON array of hex link strings.
    pub const DO_NOT_SEND_LINKS: &str = "lattice/do-not-send-links";
}

/// A named opaque payload exchanged alongside standard request/response
/// fields. Unrecognized extensions pass through to request hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub data: Bytes,
}

impl Extension {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Build a `dedup-by-key` extension.
    pub fn dedup_by_key(key: &str) -> Self {
        let data = serde_json::to_vec(key).expect("string serialization");
        Self::new(extension_names::DEDUP_BY_KEY, data)
    }

    /// Build a `do-not-send-links` extension.
    pub fn do_not_send_links(links: &[Link]) -> Self {
        let data = serde_json::to_vec(links).expect("link list serialization");
        Self::new(extension_names::DO_NOT_SEND_LINKS, data)
    }
}

/// A malformed extension payload. Terminal for the request that carried it.
#[derive(Debug, thiserror::Error)]
#[error("malformed {name} extension: {source}")]
pub struct ExtensionError {
    pub name: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Decode a `dedup-by-key` payload.
pub fn decode_dedup_key(data: &[u8]) -> Result<String, ExtensionError> {
    serde_json::from_slice(data).map_err(|source| ExtensionError {
        name: extension_names::DEDUP_BY_KEY,
        source,
    })
}

/// Decode a `do-not-send-links` payload.
pub fn decode_link_set(data: &[u8]) -> Result<Vec<Link>, ExtensionError> {
    serde_json::from_slice(data).map_err(|source| ExtensionError {
        name: extension_names::DO_NOT_SEND_LINKS,
        source,
    })
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// An inbound request from a peer. Immutable for a given `id`.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub id: RequestId,
    /// Root of the subgraph to traverse. Meaningless on cancels.
    pub root: Link,
    pub selector: Selector,
    /// Higher runs earlier among a peer's pending requests.
    pub priority: i32,
    pub extensions: Vec<Extension>,
    pub is_cancel: bool,
    pub is_update: bool,
}

impl SyncRequest {
    /// A new traversal request.
    pub fn new(id: RequestId, root: Link, selector: Selector, priority: i32) -> Self {
        Self {
            id,
            root,
            selector,
            priority,
            extensions: Vec::new(),
            is_cancel: false,
            is_update: false,
        }
    }

    /// Cancel a previously sent request.
    pub fn cancel(id: RequestId) -> Self {
        Self {
            id,
            root: Link([0u8; 32]),
            selector: Selector::Matcher,
            priority: 0,
            extensions: Vec::new(),
            is_cancel: true,
            is_update: false,
        }
    }

    /// Update a request already in progress, carrying extensions to its
    /// update hooks.
    pub fn update(id: RequestId, extensions: Vec<Extension>) -> Self {
        Self {
            id,
            root: Link([0u8; 32]),
            selector: Selector::Matcher,
            priority: 0,
            extensions,
            is_cancel: false,
            is_update: true,
        }
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Payload of the named extension, if the request carries it.
    pub fn extension(&self, name: &str) -> Option<&Bytes> {
        self.extensions
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.data)
    }
}

// ── Statuses ──────────────────────────────────────────────────────────────────

/// Terminal and non-terminal status codes surfaced to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Traversal finished and every visited block was transmitted.
    CompletedFull,
    /// Traversal finished but some blocks could not be sent.
    CompletedPartial,
    /// Response paused by a hook or the application; resumable.
    RequestPaused,
    /// Cancelled by the requester or by the responder itself.
    RequestCancelled,
    /// Validation, loading, or traversal failure.
    RequestFailedUnknown,
}

impl ResponseStatus {
    /// Whether this status ends the response.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::RequestPaused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_round_trip() {
        let ext = Extension::dedup_by_key("bucket-7");
        assert_eq!(ext.name, extension_names::DEDUP_BY_KEY);
        assert_eq!(decode_dedup_key(&ext.data).unwrap(), "bucket-7");
    }

    #[test]
    fn link_set_round_trip() {
        let links = vec![Link::of(b"a"), Link::of(b"b")];
        let ext = Extension::do_not_send_links(&links);
        assert_eq!(decode_link_set(&ext.data).unwrap(), links);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(decode_dedup_key(b"{not json").is_err());
        assert!(decode_link_set(b"\"not a list\"").is_err());
    }

    #[test]
    fn extension_lookup_by_name() {
        let req = SyncRequest::new(1, Link::of(b"root"), Selector::all(), 0)
            .with_extension(Extension::dedup_by_key("k"));
        assert!(req.extension(extension_names::DEDUP_BY_KEY).is_some());
        assert!(req.extension(extension_names::DO_NOT_SEND_LINKS).is_none());
    }

    #[test]
    fn paused_is_not_terminal() {
        assert!(!ResponseStatus::RequestPaused.is_terminal());
        assert!(ResponseStatus::CompletedFull.is_terminal());
        assert!(ResponseStatus::RequestCancelled.is_terminal());
    }
}
