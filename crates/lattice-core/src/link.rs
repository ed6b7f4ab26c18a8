//! Links — content identifiers for blocks.
//!
//! A link is the BLAKE3 hash of the block's encoded bytes. Whoever holds a
//! link can verify any bytes claimed to be its block. Links are rendered in
//! hex everywhere they surface (logs, selectors, extension payloads).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Content identifier for a block — BLAKE3 hash of the block bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link(pub [u8; 32]);

impl Link {
    /// Compute the link for a block's encoded bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Link(*blake3::hash(bytes).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({})", self.short())
    }
}

/// Error parsing a hex-encoded link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid link: {0}")]
pub struct ParseLinkError(String);

impl FromStr for Link {
    type Err = ParseLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ParseLinkError(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ParseLinkError(format!("expected 32 bytes, got {} hex chars", s.len())))?;
        Ok(Link(arr))
    }
}

impl Serialize for Link {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Link {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_deterministic() {
        let a = Link::of(b"hello");
        let b = Link::of(b"hello");
        let c = Link::of(b"world");
        assert_eq!(a, b, "same input must produce same link");
        assert_ne!(a, c, "different inputs must produce different links");
    }

    #[test]
    fn hex_round_trip() {
        let link = Link::of(b"some block");
        let parsed: Link = link.to_string().parse().unwrap();
        assert_eq!(link, parsed);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("not hex".parse::<Link>().is_err());
        assert!("abcd".parse::<Link>().is_err()); // too short
    }

    #[test]
    fn serde_round_trip() {
        let link = Link::of(b"x");
        let json = serde_json::to_string(&link).unwrap();
        let back: Link = serde_json::from_str(&json).unwrap();
        assert_eq!(link, back);
    }
}
