//! Storage layer for rootsync-server.
//!
//! Two halves make up the versioned store:
//! - a flat, prefix-scannable key-value namespace ([`KvStore`], backed by SQLite)
//! - per-root-directory file areas ([`FileArea`]) for `latest`, `history` and `conflict` bytes
//!
//! [`VersionedStore`] combines both behind typed entity accessors. It holds no
//! policy; conflict rules and timestamp assignment live in the engine.

mod area;
mod repo;
mod sqlite;

pub use area::{FileArea, SERVER_SIDE};
pub use repo::VersionedStore;
pub use sqlite::SqliteStorage;

#[cfg(test)]
pub(crate) use repo::tests::test_store;

use crate::error::StorageError;
use async_trait::async_trait;

/// Current layout version written under the `metadata_` namespace.
pub const SCHEMA_VERSION: u32 = 1;

/// Trait for key-value storage backends.
///
/// Every operation is atomic on a single key. Nothing spans keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write `value` at `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Write `value` at `key` only if the key is vacant.
    ///
    /// Returns true if the value was written.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StorageError>;

    /// Remove `key`. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Issue the next value of the named sequence (starting at 1).
    ///
    /// Values are never reused, even if the caller fails to use them.
    async fn next_sequence(&self, name: &str) -> Result<u64, StorageError>;
}

/// Key construction for the flat namespace.
pub mod keys {
    use sync_types::{ClientUuid, ShareLink, SyncTimestamp};

    /// Client records.
    pub const CLIENT: &str = "client_";
    /// Root directory records.
    pub const ROOT_DIR: &str = "root_dir_";
    /// File records.
    pub const FILE: &str = "file_";
    /// History snapshots.
    pub const HISTORY: &str = "history_";
    /// Pending conflicts.
    pub const CONFLICT: &str = "conflict_";
    /// Store metadata.
    pub const METADATA: &str = "metadata_";
    /// Share links.
    pub const SHARING: &str = "sharing_";
    /// Root directory password hashes.
    pub const PASSWORD: &str = "password_";

    /// Width of the zero-padded timestamp suffix of history keys.
    pub const TIMESTAMP_WIDTH: usize = 20;

    /// Key of a client record.
    pub fn client(uuid: &ClientUuid) -> String {
        format!("{CLIENT}{uuid}")
    }

    /// Key of a root directory record.
    pub fn root_dir(after_path: &str) -> String {
        format!("{ROOT_DIR}{after_path}")
    }

    /// Key of a file record.
    pub fn file(after_path: &str) -> String {
        format!("{FILE}{after_path}")
    }

    /// Prefix shared by every snapshot of one file.
    pub fn history_prefix(after_path: &str) -> String {
        format!("{HISTORY}{after_path}_")
    }

    /// Key of one snapshot. Zero padding keeps key order chronological.
    pub fn history(after_path: &str, timestamp: SyncTimestamp) -> String {
        format!(
            "{}{:0width$}",
            history_prefix(after_path),
            timestamp.value(),
            width = TIMESTAMP_WIDTH
        )
    }

    /// Key of a pending conflict.
    pub fn conflict(after_path: &str) -> String {
        format!("{CONFLICT}{after_path}")
    }

    /// Key of a share link.
    pub fn sharing(link: &ShareLink) -> String {
        format!("{SHARING}{link}")
    }

    /// Key of a root directory password hash.
    pub fn password(root_after_path: &str) -> String {
        format!("{PASSWORD}{root_after_path}")
    }

    /// Key of the schema version marker.
    pub fn schema_version() -> String {
        format!("{METADATA}schema_version")
    }

    /// True if `key` is a snapshot of exactly `after_path`.
    ///
    /// A prefix scan for `/r/f` also yields `/r/f_x` snapshots; those are
    /// rejected because their remainder is not a bare timestamp.
    pub fn is_history_of(key: &str, after_path: &str) -> bool {
        key.strip_prefix(&history_prefix(after_path))
            .map(|rest| rest.len() == TIMESTAMP_WIDTH && rest.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    }
}
