//! Protocol handler for /rootsync/1 ALPN.
//!
//! Implements iroh's ProtocolHandler trait to accept incoming connections.

use crate::server::SyncServer;
use crate::session::Session;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Protocol identifier for rootsync.
pub const ALPN: &[u8] = b"/rootsync/1";

/// Protocol handler for accepting rootsync connections.
#[derive(Clone, Debug)]
pub struct SyncProtocol {
    server: Arc<SyncServer>,
}

impl SyncProtocol {
    /// Create a new protocol handler.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }
}

impl ProtocolHandler for SyncProtocol {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let server = self.server.clone();
        async move {
            let remote_id = connection.remote_id();
            if let Err(e) = server.rate_limits().check_connection(remote_id.as_bytes()) {
                tracing::warn!("Connection rate limited for {}: {}", remote_id, e);
                server
                    .metrics()
                    .rate_limit_hits
                    .fetch_add(1, Ordering::Relaxed);
                connection.close(1u32.into(), b"rate limited");
                return Ok(());
            }

            let max_sessions = server.config().limits.max_concurrent_sessions as u64;
            let active = server.metrics().active_connections.load(Ordering::Relaxed);
            if active >= max_sessions {
                tracing::warn!(
                    "Session limit reached ({}/{}), rejecting {}",
                    active,
                    max_sessions,
                    remote_id
                );
                connection.close(2u32.into(), b"too many sessions");
                return Ok(());
            }

            let guard = server.metrics().connection_opened();
            let session = Session::new(server, connection);
            tokio::spawn(async move {
                session.run().await;
                drop(guard);
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_is_versioned() {
        assert_eq!(ALPN, b"/rootsync/1");
        assert!(ALPN.ends_with(b"/1"));
    }
}
