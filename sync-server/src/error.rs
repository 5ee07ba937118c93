//! Error types for rootsync-server.

use std::path::PathBuf;
use sync_types::ErrorKind;

/// Main error type for rootsync-server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File area I/O error.
    #[error("file area error at {path}: {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Record could not be encoded.
    #[error("record encoding failed for {key}: {source}")]
    Encode {
        /// Key of the record.
        key: String,
        /// Underlying encoder error.
        source: rmp_serde::encode::Error,
    },

    /// Record could not be decoded.
    #[error("record decoding failed for {key}: {source}")]
    Decode {
        /// Key of the record.
        key: String,
        /// Underlying decoder error.
        source: rmp_serde::decode::Error,
    },

    /// Password hashing failed.
    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

impl StorageError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a missing file in a file area.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Invalid message format.
    #[error("invalid message format: {reason}")]
    InvalidMessage {
        /// Reason the message is invalid.
        reason: String,
    },

    /// Message encoding or decoding failed.
    #[error("message codec failed: {0}")]
    Codec(#[from] sync_types::CodecError),

    /// Unexpected message type.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: String,
        /// Actual message type received.
        actual: String,
    },

    /// Connection has not completed REGISTERCLIENT.
    #[error("connection not registered: REGISTERCLIENT required first")]
    NotRegistered,

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Peer did not answer in time.
    #[error("timed out after {secs}s waiting for {waiting_for}")]
    Timeout {
        /// What was being awaited.
        waiting_for: &'static str,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },
}

/// Domain errors of the registration manager, sync engine and satellites.
///
/// These are the errors a transaction answers with a `Failed` response.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Bad server or root directory password, or identity not bound.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Unknown client, root directory, file, snapshot or pending conflict.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent divergent update.
    ///
    /// Transactions report a detected conflict as a successful ack with the
    /// conflict flag set, so the engine never returns this. It completes the
    /// error taxonomy and renders as 409 on the admin API.
    #[error("conflicting update for {after_path}")]
    Conflict {
        /// The contested path.
        after_path: String,
    },

    /// Malformed or missing fields.
    #[error("validation failed: {0}")]
    Validation(String),

    /// KV or file area failure.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Payload did not decode to the expected schema.
    #[error("protocol decode failed: {0}")]
    ProtocolDecode(String),
}

impl SyncError {
    /// The category reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::ProtocolDecode(_) => ErrorKind::ProtocolDecode,
        }
    }

    /// Returns true if the client caused the failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, SyncError::Storage(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NotRegistered => SyncError::Authentication(err.to_string()),
            other => SyncError::ProtocolDecode(other.to_string()),
        }
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for engine operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
