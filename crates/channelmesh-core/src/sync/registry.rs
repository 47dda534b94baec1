//! Live connection bookkeeping shared by the connectivity providers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::mux::{ConnectionId, PeerConnection};

/// Capacity of the new-connection broadcast
const CONNECTION_EVENT_CAPACITY: usize = 256;

/// Set of live connections plus a feed of new ones.
///
/// Closed connections remove themselves.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<ConnectionId, PeerConnection>>>,
    added: broadcast::Sender<PeerConnection>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (added, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            added,
        }
    }

    /// Track `conn` until it closes and announce it to subscribers
    pub fn add(&self, conn: PeerConnection) {
        if conn.is_closed() {
            return;
        }
        self.connections.lock().insert(conn.id(), conn.clone());
        debug!(connection_id = conn.id(), remote = %conn.remote_id(), "Connection registered");

        let connections = self.connections.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            connections.lock().remove(&watched.id());
            debug!(connection_id = watched.id(), "Connection unregistered");
        });

        // No subscribers is fine
        let _ = self.added.send(conn);
    }

    pub fn connections(&self) -> Vec<PeerConnection> {
        self.connections
            .lock()
            .values()
            .filter(|conn| !conn.is_closed())
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerConnection> {
        self.added.subscribe()
    }

    /// Whether a live connection to `remote` exists
    pub fn is_connected_to(&self, remote: &str) -> bool {
        self.connections
            .lock()
            .values()
            .any(|conn| conn.remote_id() == remote && !conn.is_closed())
    }

    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every tracked connection
    pub fn close_all(&self) {
        let all: Vec<_> = self.connections.lock().drain().map(|(_, conn)| conn).collect();
        for conn in all {
            conn.close();
        }
    }
}
