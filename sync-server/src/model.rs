//! Persistent entities of the registration manager and versioned store.
//!
//! Entities reference each other by afterPath, never by embedding: a client
//! lists the roots it is bound to, a file names its root, and both are
//! resolved through the store at read time.

use serde::{Deserialize, Serialize};
use sync_types::{ClientUuid, FileHistory, FileMetadata, ShareLink, SyncTimestamp};

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Client-chosen identifier
    pub uuid: ClientUuid,
    /// Server-issued id from the `client` sequence
    pub sequential_id: u64,
    /// Transport address the client last registered from
    pub address: String,
    /// Root directories the client owns or joined
    pub roots: Vec<RootBinding>,
}

impl Client {
    /// The binding for a root directory, if the client has one.
    pub fn binding(&self, root: &str) -> Option<&RootBinding> {
        self.roots.iter().find(|b| b.after_path == root)
    }

    /// Add or refresh a binding. Returns true if the roots list changed.
    pub fn bind_root(&mut self, after_path: &str, before_path: &str) -> bool {
        match self.roots.iter_mut().find(|b| b.after_path == after_path) {
            Some(existing) if existing.before_path == before_path => false,
            Some(existing) => {
                existing.before_path = before_path.to_string();
                true
            }
            None => {
                self.roots.push(RootBinding {
                    after_path: after_path.to_string(),
                    before_path: before_path.to_string(),
                });
                true
            }
        }
    }

    /// The longest bound root that contains `after_path`.
    pub fn owning_root(&self, after_path: &str) -> Option<&RootBinding> {
        self.roots
            .iter()
            .filter(|b| is_within(&b.after_path, after_path))
            .max_by_key(|b| b.after_path.len())
    }
}

/// A client's subscription to one root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootBinding {
    /// Server-relative path of the root directory
    pub after_path: String,
    /// Where this client keeps the directory locally
    pub before_path: String,
}

/// A registered root directory. Its password hash is stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDirectory {
    /// The owner's local path of the directory
    pub before_path: String,
    /// Server-relative stable path
    pub after_path: String,
    /// Client that registered it
    pub owner: ClientUuid,
}

/// The current state of one synchronized path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File path
    pub after_path: String,
    /// Root directory the path belongs to
    pub root_dir: String,
    /// Hash of the latest accepted content
    pub latest_hash: String,
    /// Logical clock of the latest accepted update
    pub latest_sync_timestamp: SyncTimestamp,
    /// False once the file has been removed
    pub contents_existed: bool,
    /// Attributes of the latest version
    pub metadata: FileMetadata,
}

/// A history snapshot as persisted, with the root its bytes live under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Root directory whose history area holds the bytes
    pub root_dir: String,
    /// The snapshot itself
    pub entry: FileHistory,
}

/// A bounded-use download link for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sharing {
    /// Sequential id from the `sharing` sequence
    pub id: u64,
    /// Downloads so far
    pub count: u32,
    /// Downloads allowed
    pub max_count: u32,
    /// The link
    pub link: ShareLink,
    /// Client that issued it
    pub owner: ClientUuid,
    /// Root directory whose history area holds the bytes
    pub root_dir: String,
    /// The shared snapshot
    pub snapshot: FileHistory,
}

impl Sharing {
    /// Whether another download is allowed.
    pub fn has_remaining(&self) -> bool {
        self.count < self.max_count
    }
}

/// True if `path` lies strictly inside the directory `root`.
pub fn is_within(root: &str, path: &str) -> bool {
    path.strip_prefix(root)
        .map(|rest| rest.starts_with('/') && rest.len() > 1)
        .unwrap_or(false)
}

/// Check that `path` is an absolute, normalized afterPath.
///
/// Rejects empty, `.` and `..` components and NUL bytes. Returns the reason
/// on failure.
pub fn validate_path(path: &str) -> Result<(), String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(format!("path {path:?} must start with '/'"));
    };
    if path.contains('\0') {
        return Err(format!("path {path:?} contains a NUL byte"));
    }
    for component in rest.split('/') {
        match component {
            "" => return Err(format!("path {path:?} has an empty component")),
            "." | ".." => return Err(format!("path {path:?} has a relative component")),
            _ => {}
        }
    }
    Ok(())
}
