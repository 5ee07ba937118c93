//! Identity and ordering types for rootsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The identifier a client registers under.
///
/// Chosen by the client and stable across reconnects. The server only
/// requires it to be non-empty; clients normally send a UUID string.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ClientUuid(String);

impl ClientUuid {
    /// Create a ClientUuid from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the identifier is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ClientUuid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ClientUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientUuid({})", self.0)
    }
}

/// The server-assigned logical clock of a file.
///
/// Assigned by the server, never by clients. Only ever increases for a
/// given path, so it orders updates by assignment rather than arrival.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct SyncTimestamp(u64);

impl SyncTimestamp {
    /// Create a SyncTimestamp with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value of this SyncTimestamp.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The baseline of a path the server has never seen.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The next timestamp after this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for SyncTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SyncTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncTimestamp({})", self.0)
    }
}

/// A bounded-use download link pointing at one history snapshot.
///
/// UUID v4 format (16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareLink(uuid::Uuid);

impl ShareLink {
    /// Create a new random ShareLink.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ShareLink {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ShareLink {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareLink({})", self.0)
    }
}

/// Content digest used for `latestHash` values (BLAKE3, lowercase hex).
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_uuid_display_is_raw() {
        let id = ClientUuid::from("a");
        assert_eq!(id.to_string(), "a");
        assert_eq!(format!("{:?}", id), "ClientUuid(a)");
    }

    #[test]
    fn client_uuid_empty() {
        assert!(ClientUuid::default().is_empty());
        assert!(!ClientUuid::new("x").is_empty());
    }

    #[test]
    fn sync_timestamp_ordering() {
        let t1 = SyncTimestamp::new(10);
        let t2 = SyncTimestamp::new(11);
        assert!(t1 < t2);
        assert_eq!(t1.next(), t2);
    }

    #[test]
    fn sync_timestamp_saturates() {
        let t = SyncTimestamp::new(u64::MAX);
        assert_eq!(t.next().value(), u64::MAX);
    }

    #[test]
    fn share_link_parses_its_display_form() {
        let link = ShareLink::new();
        let parsed: ShareLink = link.to_string().parse().unwrap();
        assert_eq!(link, parsed);
        assert_eq!(link.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn share_link_rejects_garbage() {
        assert!("not-a-link".parse::<ShareLink>().is_err());
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let h1 = content_hash(b"v1");
        let h2 = content_hash(b"v1");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, content_hash(b"v2"));
    }
}
