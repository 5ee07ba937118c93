//! In-memory map from client uuid to its live connection.
//!
//! Lookups hand out cloned handles, so fan-out never holds a map shard while
//! it awaits a delivery and a concurrent `unbind` cannot race the iteration.

use crate::error::{SyncError, SyncResult};
use crate::peer::{PeerConnection, PeerHandle};
use dashmap::DashMap;
use sync_types::ClientUuid;

/// Connection registry.
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: DashMap<ClientUuid, PeerHandle>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("bound", &self.peers.len())
            .finish()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a uuid to a connection. Last write wins; the replaced handle is returned.
    pub fn bind(&self, uuid: ClientUuid, peer: PeerHandle) -> Option<PeerHandle> {
        let previous = self.peers.insert(uuid.clone(), peer);
        tracing::debug!(
            "Bound {} (replaced: {}, total: {})",
            uuid,
            previous.is_some(),
            self.peers.len()
        );
        previous
    }

    /// The connection of an online client.
    pub fn lookup(&self, uuid: &ClientUuid) -> SyncResult<PeerHandle> {
        self.peers
            .get(uuid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::NotFound(format!("client {uuid} is not connected")))
    }

    /// Connections of the online clients among `uuids`. Offline ones are skipped.
    pub fn lookup_many(&self, uuids: &[ClientUuid]) -> Vec<(ClientUuid, PeerHandle)> {
        uuids
            .iter()
            .filter_map(|uuid| {
                self.peers
                    .get(uuid)
                    .map(|entry| (uuid.clone(), entry.value().clone()))
            })
            .collect()
    }

    /// Remove a binding regardless of which connection holds it.
    pub fn unbind(&self, uuid: &ClientUuid) -> Option<PeerHandle> {
        self.peers.remove(uuid).map(|(_, peer)| peer)
    }

    /// Remove a binding only if it still points at connection `connection_id`.
    ///
    /// Used when a connection closes: a reconnect that already replaced the
    /// binding is left intact.
    pub fn unbind_if_same(&self, uuid: &ClientUuid, connection_id: u64) -> bool {
        self.peers
            .remove_if(uuid, |_, peer| peer.id() == connection_id)
            .is_some()
    }

    /// Snapshot of every binding.
    pub fn bound(&self) -> Vec<(ClientUuid, PeerHandle)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Number of bound clients.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True if no client is bound.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::MockPeer;

    #[test]
    fn bind_and_lookup() {
        let registry = ConnectionRegistry::new();
        let peer = MockPeer::new("a");
        let id = peer.id();

        assert!(registry.bind(ClientUuid::from("a"), peer).is_none());
        assert_eq!(registry.lookup(&ClientUuid::from("a")).unwrap().id(), id);
        assert!(matches!(
            registry.lookup(&ClientUuid::from("b")),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn rebind_replaces_previous_handle() {
        let registry = ConnectionRegistry::new();
        let first = MockPeer::new("a");
        let second = MockPeer::new("a");
        let first_id = first.id();
        let second_id = second.id();

        registry.bind(ClientUuid::from("a"), first);
        let replaced = registry.bind(ClientUuid::from("a"), second).unwrap();

        assert_eq!(replaced.id(), first_id);
        assert_eq!(registry.lookup(&ClientUuid::from("a")).unwrap().id(), second_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_many_skips_offline_clients() {
        let registry = ConnectionRegistry::new();
        registry.bind(ClientUuid::from("a"), MockPeer::new("a"));
        registry.bind(ClientUuid::from("c"), MockPeer::new("c"));

        let found = registry.lookup_many(&[
            ClientUuid::from("a"),
            ClientUuid::from("b"),
            ClientUuid::from("c"),
        ]);
        let uuids: Vec<_> = found.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(uuids, vec!["a", "c"]);
    }

    #[test]
    fn stale_close_does_not_unbind_reconnect() {
        let registry = ConnectionRegistry::new();
        let old = MockPeer::new("a");
        let old_id = old.id();
        registry.bind(ClientUuid::from("a"), old);
        let new = MockPeer::new("a");
        let new_id = new.id();
        registry.bind(ClientUuid::from("a"), new);

        assert!(!registry.unbind_if_same(&ClientUuid::from("a"), old_id));
        assert!(registry.lookup(&ClientUuid::from("a")).is_ok());
        assert!(registry.unbind_if_same(&ClientUuid::from("a"), new_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn unbind_removes_entry() {
        let registry = ConnectionRegistry::new();
        registry.bind(ClientUuid::from("a"), MockPeer::new("a"));
        assert!(registry.unbind(&ClientUuid::from("a")).is_some());
        assert!(registry.unbind(&ClientUuid::from("a")).is_none());
    }
}
