//! Connection pool — registry of active connections keyed by peer id.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::connection::PeerConnection;
use crate::identity::PeerId;

/// Registry mapping a peer id to the live transport used to reach it.
///
/// All mutation and lookup is serialized against concurrent accept and
/// connect flows. The last `add_connection` for a given id wins; entries
/// are removed explicitly when the engine observes a disconnect.
pub struct ConnectionPool {
    connections: RwLock<HashMap<PeerId, PeerConnection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite the connection for its peer id.
    pub fn add_connection(&self, connection: PeerConnection) {
        let id = connection.peer_id().clone();
        self.connections
            .write()
            .expect("pool lock poisoned")
            .insert(id, connection);
    }

    /// Look up a connection by peer id. Returns a cloned handle.
    pub fn get_connection(&self, id: &PeerId) -> Option<PeerConnection> {
        self.connections
            .read()
            .expect("pool lock poisoned")
            .get(id)
            .cloned()
    }

    /// Remove a connection by peer id, returning the handle if present.
    pub fn remove_connection(&self, id: &PeerId) -> Option<PeerConnection> {
        self.connections
            .write()
            .expect("pool lock poisoned")
            .remove(id)
    }

    /// Whether a connection is registered for the id.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.connections
            .read()
            .expect("pool lock poisoned")
            .contains_key(id)
    }

    /// Ids of all registered connections.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.connections
            .read()
            .expect("pool lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Close every registered connection and clear the registry.
    pub fn close_all(&self) {
        let mut connections = self.connections.write().expect("pool lock poisoned");
        for connection in connections.values() {
            connection.close();
        }
        connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
