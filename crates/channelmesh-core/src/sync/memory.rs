//! In-process connectivity
//!
//! [`MemoryNetwork`] wires [`MemoryNode`]s together over `tokio::io::duplex`
//! pipes running the real mux, so multi-peer scenarios run without sockets.
//! Topic joins behave like a rendezvous: a client-mode join connects to
//! every other node that joined the same topic in server mode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{MeshError, MeshResult};
use crate::sync::connectivity::{Connectivity, JoinOptions, TopicJoin};
use crate::sync::mux::PeerConnection;
use crate::sync::registry::ConnectionRegistry;
use crate::types::TopicKey;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Arc<MemoryNode>>,
    /// Server-mode members per topic
    servers: HashMap<TopicKey, HashSet<String>>,
}

/// A set of in-process nodes that can connect to each other
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node with a unique name
    pub fn node(&self, name: &str) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode {
            name: name.to_string(),
            network: self.clone(),
            registry: ConnectionRegistry::new(),
        });
        self.state.lock().nodes.insert(name.to_string(), node.clone());
        node
    }

    /// Connect two nodes directly, returning `a`'s end of the connection
    pub fn connect(&self, a: &MemoryNode, b: &MemoryNode) -> PeerConnection {
        let (a_end, b_end) = PeerConnection::pipe(&a.name, &b.name, DEFAULT_MAX_FRAME_SIZE);
        debug!(a = %a.name, b = %b.name, "Memory connection");
        a.registry.add(a_end.clone());
        b.registry.add(b_end);
        a_end
    }

    fn join(&self, node: &MemoryNode, topic: TopicKey, options: JoinOptions) -> MeshResult<()> {
        let peers: Vec<Arc<MemoryNode>> = {
            let mut state = self.state.lock();
            if !state.nodes.contains_key(&node.name) {
                return Err(MeshError::Network(format!(
                    "{} is not part of this network",
                    node.name
                )));
            }
            if options.server {
                state
                    .servers
                    .entry(topic)
                    .or_default()
                    .insert(node.name.clone());
            }
            if !options.client {
                return Ok(());
            }
            state
                .servers
                .get(&topic)
                .into_iter()
                .flatten()
                .filter(|name| **name != node.name)
                .filter_map(|name| state.nodes.get(name).cloned())
                .collect()
        };

        for peer in peers {
            if !node.registry.is_connected_to(&peer.name) {
                self.connect(node, &peer);
            }
        }
        Ok(())
    }
}

/// One in-process node
pub struct MemoryNode {
    name: String,
    network: MemoryNetwork,
    registry: ConnectionRegistry,
}

impl MemoryNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Drop every connection this node has
    pub fn disconnect_all(&self) {
        self.registry.close_all();
    }
}

impl Connectivity for MemoryNode {
    fn local_id(&self) -> String {
        self.name.clone()
    }

    fn connections(&self) -> Vec<PeerConnection> {
        self.registry.connections()
    }

    fn subscribe_connections(&self) -> broadcast::Receiver<PeerConnection> {
        self.registry.subscribe()
    }

    fn join(&self, topic: TopicKey, options: JoinOptions) -> MeshResult<TopicJoin> {
        self.network.join(self, topic, options)?;
        Ok(TopicJoin::flushed_now(topic))
    }
}
