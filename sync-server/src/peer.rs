//! Server-to-client delivery over a live connection.
//!
//! The registry and engine only see [`PeerConnection`]; the iroh-backed
//! implementation opens a fresh stream per push.

use crate::codec::{read_message, write_message};
use crate::error::{ProtocolError, ProtocolResult};
use async_trait::async_trait;
use iroh::endpoint::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sync_types::Message;

/// Shared handle to a live connection.
pub type PeerHandle = Arc<dyn PeerConnection>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Issue a process-unique connection id.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A connection the server can push transactions over.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Process-unique id, used to tell a reconnect apart from the original.
    fn id(&self) -> u64;

    /// Printable remote address.
    fn remote(&self) -> String;

    /// Open a transaction and wait for the single reply.
    async fn request(&self, message: &Message) -> ProtocolResult<Message>;

    /// Send a message that expects no reply.
    async fn notify(&self, message: &Message) -> ProtocolResult<()>;
}

/// A peer reached through an iroh QUIC connection.
#[derive(Debug, Clone)]
pub struct IrohPeer {
    id: u64,
    connection: Connection,
    max_frame: usize,
}

impl IrohPeer {
    /// Wrap an accepted connection.
    pub fn new(connection: Connection, max_frame: usize) -> Self {
        Self {
            id: next_connection_id(),
            connection,
            max_frame,
        }
    }
}

#[async_trait]
impl PeerConnection for IrohPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote(&self) -> String {
        self.connection.remote_id().to_string()
    }

    async fn request(&self, message: &Message) -> ProtocolResult<Message> {
        let (mut send, mut recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| ProtocolError::Connection(format!("open_bi failed: {e}")))?;

        write_message(&mut send, message).await?;
        send.finish()
            .map_err(|e| ProtocolError::Stream(format!("finish failed: {e}")))?;

        read_message(&mut recv, self.max_frame)
            .await?
            .ok_or_else(|| {
                ProtocolError::Stream(format!(
                    "{} closed without a reply",
                    message.transaction_name()
                ))
            })
    }

    async fn notify(&self, message: &Message) -> ProtocolResult<()> {
        let mut send = self
            .connection
            .open_uni()
            .await
            .map_err(|e| ProtocolError::Connection(format!("open_uni failed: {e}")))?;

        write_message(&mut send, message).await?;
        send.finish()
            .map_err(|e| ProtocolError::Stream(format!("finish failed: {e}")))?;
        Ok(())
    }
}
