//! Per-connection session management.
//!
//! A session first waits for REGISTERCLIENT, serving streams inline until the
//! connection is bound to a client or the registration window closes. After
//! that every accepted stream runs as its own task, so a slow transaction
//! never blocks the next one.

use crate::peer::{IrohPeer, PeerHandle};
use crate::server::SyncServer;
use crate::transaction::{serve_stream, ConnectionContext, Outcome};
use iroh::endpoint::{Connection, RecvStream, SendStream};
use std::sync::Arc;
use std::time::Duration;

/// Close code sent when registration did not happen in time.
pub const CLOSE_UNREGISTERED: u32 = 3;

/// Close code sent after DISCONNECT.
pub const CLOSE_DISCONNECTED: u32 = 0;

/// A per-connection session.
pub struct Session {
    connection: Connection,
    ctx: Arc<ConnectionContext>,
}

impl Session {
    /// Create a new session for a connection.
    pub fn new(server: Arc<SyncServer>, connection: Connection) -> Self {
        let max_frame = server.config().max_frame_size();
        let peer: PeerHandle = Arc::new(IrohPeer::new(connection.clone(), max_frame));
        Self {
            connection,
            ctx: Arc::new(ConnectionContext::new(server, peer)),
        }
    }

    /// Run the session until the connection closes.
    pub async fn run(self) {
        let remote_id = self.connection.remote_id();
        tracing::info!("New connection from {}", remote_id);

        if self.await_registration().await {
            self.serve().await;
        }

        if let Some(uuid) = self.ctx.client() {
            let server = self.ctx.server();
            if server
                .registry()
                .unbind_if_same(uuid, self.ctx.peer().id())
            {
                tracing::info!("{} went offline", uuid);
            }
        }
        tracing::debug!("Connection from {} closed", remote_id);
    }

    /// Serve streams inline until REGISTERCLIENT succeeds.
    async fn await_registration(&self) -> bool {
        let timeout_secs = self.ctx.server().config().limits.register_timeout_secs;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

        while self.ctx.client().is_none() {
            let (send, recv) =
                match tokio::time::timeout_at(deadline, self.connection.accept_bi()).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        tracing::debug!("Connection closed during registration: {}", e);
                        return false;
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Registration timeout ({}s) for {}",
                            timeout_secs,
                            self.connection.remote_id()
                        );
                        self.connection
                            .close(CLOSE_UNREGISTERED.into(), b"registration required");
                        return false;
                    }
                };

            if let Outcome::Registered(uuid) = handle_stream(&self.ctx, send, recv).await {
                tracing::info!("{} registered from {}", uuid, self.connection.remote_id());
            }
        }
        true
    }

    /// Accept streams until the connection closes.
    async fn serve(&self) {
        loop {
            let (send, recv) = match self.connection.accept_bi().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("Connection closed: {}", e);
                    break;
                }
            };

            let ctx = self.ctx.clone();
            let connection = self.connection.clone();
            tokio::spawn(async move {
                if handle_stream(&ctx, send, recv).await == Outcome::Disconnected {
                    connection.close(CLOSE_DISCONNECTED.into(), b"disconnected");
                }
            });
        }
    }
}

/// Serve one stream and finish its send side.
async fn handle_stream(ctx: &ConnectionContext, mut send: SendStream, mut recv: RecvStream) -> Outcome {
    match serve_stream(ctx, &mut recv, &mut send).await {
        Ok(outcome) => {
            if let Err(e) = send.finish() {
                tracing::debug!("Stream finish failed: {}", e);
            }
            outcome
        }
        Err(e) => {
            tracing::warn!("Stream error from {}: {}", ctx.peer().remote(), e);
            Outcome::Done
        }
    }
}
