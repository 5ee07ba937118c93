//! Records carried inside transaction messages.

use serde::{Deserialize, Serialize};

use crate::{ClientUuid, SyncTimestamp};

/// Attribute bag attached to files and history snapshots.
///
/// Carries no identity of its own; the path it describes is always held
/// by the enclosing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileMetadata {
    /// Base name of the file
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
    /// Client-reported modification time (unix seconds)
    pub modified: u64,
    /// Whether the path is a directory
    pub is_dir: bool,
}

/// The kind of local change a client is pushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A new file appeared
    Create,
    /// An existing file was rewritten
    Write,
    /// The file was deleted locally
    Remove,
}

impl SyncEvent {
    /// Whether this event carries file bytes.
    pub fn has_contents(&self) -> bool {
        !matches!(self, SyncEvent::Remove)
    }
}

/// Which side of a pending conflict wins arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Keep the version the server already held
    Server,
    /// Take the version the contending client pushed
    Client,
}

/// The two options of a conflict pending arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Path of the contested file
    pub after_path: String,
    /// Hash the server held when the conflict was detected
    pub server_side_hash: String,
    /// Timestamp the server held when the conflict was detected
    pub server_side_sync_timestamp: SyncTimestamp,
    /// Hash of the content the client pushed
    pub client_side_hash: String,
    /// Baseline timestamp the client believed was current
    pub client_side_timestamp: SyncTimestamp,
    /// The contending client
    pub client_uuid: ClientUuid,
    /// Metadata of the client's version
    pub client_metadata: FileMetadata,
}

/// One immutable snapshot in a file's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    /// Sequential snapshot id
    pub id: u64,
    /// Unix seconds when the snapshot was written
    pub date: u64,
    /// Author of the snapshot
    pub uuid: ClientUuid,
    /// Path the snapshot belongs to
    pub after_path: String,
    /// Sync timestamp the snapshot was committed at
    pub timestamp: SyncTimestamp,
    /// Content hash (empty for removals)
    pub hash: String,
    /// Whether bytes were retained for this snapshot
    pub contents_existed: bool,
    /// File attributes at snapshot time
    pub metadata: FileMetadata,
}

/// One entry of a client's local listing for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    /// Path of the local file
    pub after_path: String,
    /// Content hash of the local copy
    pub hash: String,
    /// Local modification time (unix seconds)
    pub mod_time: u64,
}

/// What a client should do about one path after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanAction {
    /// The client copy is newer or server-unknown: push it
    PleaseSync,
    /// The server copy is newer or client-unknown: pull it
    MustSync,
    /// Hashes match
    UpToDate,
}

/// Reconciliation outcome for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Path being classified
    pub after_path: String,
    /// Required action
    pub action: ScanAction,
    /// Server hash (empty if the server has no live copy)
    pub latest_hash: String,
    /// Server timestamp (zero if the server never saw the path)
    pub latest_sync_timestamp: SyncTimestamp,
}
