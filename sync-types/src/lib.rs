//! # rootsync-types
//!
//! Wire format types for the rootsync file synchronization protocol.
//!
//! This crate provides the vocabulary shared by the server and its clients:
//! - [`ClientUuid`], [`SyncTimestamp`], [`ShareLink`] - Identity and ordering types
//! - [`Message`] - Transaction messages (RegisterClient, PleaseSync, ChooseOne, etc.)
//! - [`FileMetadata`], [`Conflict`], [`FileHistory`] - Records carried on the wire
//! - [`content_hash`] - The content digest used for `latestHash`
//! - [`CodecError`] - Encoding errors

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod records;

pub use error::CodecError;
pub use ids::{content_hash, ClientUuid, ShareLink, SyncTimestamp};
pub use messages::{
    ChooseOne, ChooseOneAck, ConflictList, ConflictListResponse, Disconnect, DisconnectAck,
    ErrorKind, Failed, FileContent, FileMeta, ForceSync, FullScan, GetRootDirs, GiveYou,
    HistoryList, ListHistory, Message, MustSync, PleaseSyncAck, PleaseSyncContent,
    PleaseSyncMeta, RegisterClient, RegisterClientAck, RegisterRootDir, Rescan, RootDirAck,
    RootDirList, ScanReport, ShareHistory, ShareLinkIssued, SyncAck, SyncRootDir,
};
pub use records::{
    Conflict, FileHistory, FileMetadata, ScanAction, ScanEntry, ScanResult, Side, SyncEvent,
};
