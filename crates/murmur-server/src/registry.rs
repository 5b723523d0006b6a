use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use murmur_core::ConnectionId;
use tokio::sync::mpsc;

use crate::connection::ClientConnection;

/// Every live client connection, keyed by id.
///
/// `remove` is the single point where a connection stops being tracked, so
/// whoever gets `Some` back owns the rest of the teardown.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    next_ordinal: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_ordinal: AtomicU64::new(1),
        }
    }

    pub fn register(&self, outbound: mpsc::Sender<Message>) -> Arc<ClientConnection> {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), ordinal, outbound));
        let _ = self.connections.insert(conn.id.clone(), Arc::clone(&conn));
        conn
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Owned handles to every connection; no map shard stays locked.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let a = registry.register(tx.clone());
        let b = registry.register(tx);
        assert_eq!(registry.len(), 2);
        assert!(b.ordinal > a.ordinal);

        assert!(registry.remove(&a.id).is_some());
        assert!(registry.remove(&a.id).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&b.id).is_some());
    }

    #[test]
    fn snapshot_allows_removal_while_walking() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        for _ in 0..3 {
            let _ = registry.register(tx.clone());
        }
        for conn in registry.snapshot() {
            let _ = registry.remove(&conn.id);
        }
        assert!(registry.is_empty());
    }
}
