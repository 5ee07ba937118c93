//! Transaction messages for rootsync.
//!
//! Every transaction is one stream: the client (or, for pushes, the server)
//! writes a request message and reads the typed response on the same stream.
//! `PLEASESYNC` is the only transaction with two request/response exchanges.

use serde::{Deserialize, Serialize};

use crate::{
    ClientUuid, CodecError, Conflict, FileHistory, FileMetadata, ScanEntry, ScanResult,
    ShareLink, Side, SyncEvent, SyncTimestamp,
};

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Register (or reconnect) a client
    RegisterClient(RegisterClient),
    /// Response to RegisterClient
    RegisterClientAck(RegisterClientAck),
    /// Create or update an owned root directory
    RegisterRootDir(RegisterRootDir),
    /// Join an existing root directory
    SyncRootDir(SyncRootDir),
    /// Response to RegisterRootDir and SyncRootDir
    RootDirAck(RootDirAck),
    /// List a client's root directories
    GetRootDirs(GetRootDirs),
    /// Response to GetRootDirs
    RootDirList(RootDirList),
    /// First PLEASESYNC exchange: ask for the server's view of a file
    PleaseSyncMeta(PleaseSyncMeta),
    /// Response to PleaseSyncMeta
    FileMeta(FileMeta),
    /// Second PLEASESYNC exchange: push a candidate update
    PleaseSyncContent(PleaseSyncContent),
    /// Response to PleaseSyncContent
    PleaseSyncAck(PleaseSyncAck),
    /// Server push: a newer version exists
    MustSync(MustSync),
    /// Server push: conflict-resolved content
    ForceSync(ForceSync),
    /// Client response to MustSync and ForceSync
    SyncAck(SyncAck),
    /// List pending conflicts
    ConflictList(ConflictList),
    /// Response to ConflictList
    ConflictListResponse(ConflictListResponse),
    /// Resolve a pending conflict
    ChooseOne(ChooseOne),
    /// Response to ChooseOne
    ChooseOneAck(ChooseOneAck),
    /// Full local listing for reconciliation (also the reply to Rescan)
    FullScan(FullScan),
    /// Reconciliation outcome
    ScanReport(ScanReport),
    /// Server request for a full local listing
    Rescan(Rescan),
    /// Download a file's latest or historical content
    GiveYou(GiveYou),
    /// Response to GiveYou
    FileContent(FileContent),
    /// List a file's history
    ListHistory(ListHistory),
    /// Response to ListHistory
    HistoryList(HistoryList),
    /// Issue a share link for one snapshot
    ShareHistory(ShareHistory),
    /// Response to ShareHistory
    ShareLinkIssued(ShareLinkIssued),
    /// Remove the client registration
    Disconnect(Disconnect),
    /// Response to Disconnect
    DisconnectAck(DisconnectAck),
    /// Any transaction failure
    Failed(Failed),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec(self).map_err(CodecError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        rmp_serde::from_slice(bytes).map_err(CodecError::Deserialization)
    }

    /// The transaction this message belongs to, as named in logs.
    pub fn transaction_name(&self) -> &'static str {
        match self {
            Message::RegisterClient(_) | Message::RegisterClientAck(_) => "REGISTERCLIENT",
            Message::RegisterRootDir(_) => "REGISTERROOTDIR",
            Message::SyncRootDir(_) => "SYNCROOTDIR",
            Message::RootDirAck(_) => "ROOTDIR",
            Message::GetRootDirs(_) | Message::RootDirList(_) => "GETROOTDIRS",
            Message::PleaseSyncMeta(_)
            | Message::FileMeta(_)
            | Message::PleaseSyncContent(_)
            | Message::PleaseSyncAck(_) => "PLEASESYNC",
            Message::MustSync(_) => "MUSTSYNC",
            Message::ForceSync(_) => "FORCESYNC",
            Message::SyncAck(_) => "SYNCACK",
            Message::ConflictList(_) | Message::ConflictListResponse(_) => "CONFLICTLIST",
            Message::ChooseOne(_) | Message::ChooseOneAck(_) => "CHOOSEONE",
            Message::FullScan(_) | Message::ScanReport(_) => "FULLSCAN",
            Message::Rescan(_) => "RESCAN",
            Message::GiveYou(_) | Message::FileContent(_) => "GIVEYOU",
            Message::ListHistory(_) | Message::HistoryList(_) => "HISTORY",
            Message::ShareHistory(_) | Message::ShareLinkIssued(_) => "SHARE",
            Message::Disconnect(_) | Message::DisconnectAck(_) => "DISCONNECT",
            Message::Failed(_) => "FAILED",
        }
    }
}

/// Register a client with the server password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClient {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Server-wide password
    pub client_password: String,
}

/// Registration accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterClientAck {
    /// Client identifier
    pub uuid: ClientUuid,
}

/// Create or update a root directory owned by the requesting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRootDir {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Password other clients must present to join
    pub root_dir_password: String,
    /// Client-local path of the directory
    pub before_path: String,
    /// Server-relative stable path of the directory
    pub after_path: String,
}

/// Join a root directory registered by another client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRootDir {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Password of the root directory
    pub root_dir_password: String,
    /// Where the joining client keeps the directory locally
    pub before_path: String,
    /// Root directory to join
    pub after_path: String,
}

/// Root directory registration or join accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDirAck {
    /// Client identifier
    pub uuid: ClientUuid,
}

/// Ask for the root directories a client owns or shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRootDirs {
    /// Client identifier
    pub uuid: ClientUuid,
}

/// Root directories visible to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDirList {
    /// Root directory afterPaths
    pub after_paths: Vec<String>,
}

/// Ask for the server's current view of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PleaseSyncMeta {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
}

/// The server's current view of a file (zero-valued for unknown paths).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
    /// Latest known hash
    pub latest_hash: String,
    /// Latest assigned timestamp
    pub latest_sync_timestamp: SyncTimestamp,
    /// Client-reported modification time of the latest version
    pub modified_date: u64,
}

/// Push a candidate update for a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PleaseSyncContent {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Kind of local change
    pub event: SyncEvent,
    /// Client-local path of the file
    pub before_path: String,
    /// File path
    pub after_path: String,
    /// Timestamp the client believed was current
    pub last_update_timestamp: SyncTimestamp,
    /// Hash of the pushed content (empty asks the server to compute it)
    pub last_update_hash: String,
    /// File attributes
    pub metadata: FileMetadata,
    /// Whole-file contents
    pub file_bytes: Vec<u8>,
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PleaseSyncAck {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
    /// Whether the push was parked as a conflict
    pub conflict: bool,
    /// The file's timestamp after this push
    pub latest_sync_timestamp: SyncTimestamp,
}

/// Server push: a newer version of a file exists and should be pulled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MustSync {
    /// New latest hash
    pub latest_hash: String,
    /// New latest timestamp
    pub latest_sync_timestamp: SyncTimestamp,
    /// Recipient's local path of the root directory
    pub before_path: String,
    /// File path
    pub after_path: String,
}

/// Server push: conflict-resolved content, applied without a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSync {
    /// Resolved hash
    pub latest_hash: String,
    /// Resolved timestamp
    pub latest_sync_timestamp: SyncTimestamp,
    /// Recipient's local path of the root directory
    pub before_path: String,
    /// File path
    pub after_path: String,
    /// Resolved contents
    pub file_bytes: Vec<u8>,
}

/// Client acknowledgement of MustSync or ForceSync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
    /// Timestamp the client now holds
    pub latest_sync_timestamp: SyncTimestamp,
    /// Hash the client now holds
    pub latest_sync_hash: String,
}

/// Ask for pending conflicts under root directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictList {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Root directories to inspect (empty means all of the client's)
    pub root_dirs: Vec<String>,
}

/// Pending conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictListResponse {
    /// Conflicts awaiting ChooseOne
    pub conflicts: Vec<Conflict>,
}

/// Resolve a conflict by picking one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChooseOne {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Contested path
    pub after_path: String,
    /// Timestamp of the chosen side (zero skips the staleness check)
    pub selected_timestamp: SyncTimestamp,
    /// Chosen side
    pub side: Side,
}

/// Conflict resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChooseOneAck {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Resolved path
    pub after_path: String,
}

/// A client's full listing of one root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullScan {
    /// Client identifier
    pub uuid: ClientUuid,
    /// Root directory being reconciled
    pub root_dir: String,
    /// Every local file under the root directory
    pub entries: Vec<ScanEntry>,
}

/// Reconciliation outcome for a root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Root directory that was reconciled
    pub root_dir: String,
    /// Classification per path
    pub results: Vec<ScanResult>,
}

/// Server request for a client's listing of a root directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rescan {
    /// Root directory to list
    pub root_dir: String,
}

/// Download a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiveYou {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
    /// Snapshot to fetch (None for latest)
    pub timestamp: Option<SyncTimestamp>,
}

/// File bytes and their bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    /// File path
    pub after_path: String,
    /// Timestamp of the served version
    pub timestamp: SyncTimestamp,
    /// Hash of the served version
    pub hash: String,
    /// Attributes of the served version
    pub metadata: FileMetadata,
    /// Whole-file contents
    pub file_bytes: Vec<u8>,
}

/// List the history of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListHistory {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
}

/// Chronological history of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryList {
    /// Snapshots, oldest first
    pub entries: Vec<FileHistory>,
}

/// Issue a share link for one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareHistory {
    /// Client identifier
    pub uuid: ClientUuid,
    /// File path
    pub after_path: String,
    /// Snapshot to share
    pub timestamp: SyncTimestamp,
    /// How many downloads the link allows
    pub max_count: u32,
}

/// A freshly issued share link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLinkIssued {
    /// The link
    pub link: ShareLink,
}

/// Remove the client registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Client identifier
    pub uuid: ClientUuid,
}

/// Registration removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectAck {
    /// Client identifier
    pub uuid: ClientUuid,
}

/// Error categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad server or root directory password, or unbound identity
    Authentication,
    /// Unknown client, root directory, file, snapshot or conflict
    NotFound,
    /// Concurrent divergent update
    Conflict,
    /// Malformed or missing fields
    Validation,
    /// Storage failure on the server
    Storage,
    /// Payload did not decode to the expected schema
    ProtocolDecode,
}

/// A transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failed {
    /// Failure category
    pub kind: ErrorKind,
    /// Human-readable reason
    pub reason: String,
}
