//! # rootsync-server
//!
//! Self-hosted server that keeps root directories synchronized across many
//! clients.
//!
//! This crate implements a server that:
//! - Accepts iroh QUIC connections and serves one transaction per stream
//! - Registers clients and password-protected root directories
//! - Versions every file with a logical clock and keeps full history
//! - Detects concurrent updates and freezes the path until a client resolves it
//! - Pushes accepted changes to every other subscriber of the root
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                    ┌── Client B
//!            │    iroh QUIC       │
//!            ├───────────────────►│
//!            │                    │
//!        ┌───┴────────────────────┴───┐
//!        │       rootsync-server      │
//!        │  registrar ─ sync engine   │
//!        │  ┌──────────┐ ┌─────────┐  │
//!        │  │  SQLite  │ │  file   │  │
//!        │  │ records  │ │  areas  │  │
//!        │  └──────────┘ └─────────┘  │
//!        └────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! The server uses ALPN `/rootsync/1`. Client-initiated transactions:
//! - REGISTERCLIENT, REGISTERROOTDIR, SYNCROOTDIR, GETROOTDIRS
//! - PLEASESYNC (meta, then content), CONFLICTLIST, CHOOSEONE
//! - FULLSCAN, GIVEYOU, HISTORY, SHARE, DISCONNECT
//!
//! Server-initiated: MUSTSYNC, FORCESYNC and RESCAN.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod http;
pub mod limits;
pub mod locks;
pub mod model;
pub mod peer;
pub mod protocol;
pub mod registration;
pub mod registry;
pub mod rescan;
pub mod server;
pub mod session;
pub mod storage;
pub mod transaction;
