//! iroh-backed connectivity
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  IrohConnectivity                                             │
//! │  ├── Endpoint (QUIC transport, NAT traversal, node key)       │
//! │  ├── Gossip (topic membership = rendezvous)                   │
//! │  ├── Router                                                   │
//! │  │    ├── GOSSIP_ALPN -> Gossip                               │
//! │  │    └── MESH_ALPN   -> MeshProtocolHandler                  │
//! │  └── ConnectionRegistry (one mux connection per peer)         │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Joining a topic subscribes to the matching gossip topic. When a neighbor
//! shows up, each side sends it a [`JoinAnnouncement`] carrying its join
//! mode. A client dials neighbors that announced server mode on `MESH_ALPN`;
//! if both sides would dial, only the one with the smaller endpoint id does.
//! The single bi-stream of that connection carries the channel mux.

use std::collections::HashSet;
use std::sync::Arc;

use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, VarInt};
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::{MeshError, MeshResult};
use crate::sync::connectivity::{Connectivity, JoinOptions, TopicJoin};
use crate::sync::mux::PeerConnection;
use crate::sync::registry::ConnectionRegistry;
use crate::types::TopicKey;

/// ALPN of the channel mux
pub const MESH_ALPN: &[u8] = b"/channelmesh/mux/1";

/// Parse an endpoint id as printed by [`IrohConnectivity::endpoint_id`]
pub fn parse_endpoint_id(s: &str) -> MeshResult<EndpointId> {
    s.trim()
        .parse::<EndpointId>()
        .map_err(|e| MeshError::Network(format!("Invalid endpoint id '{}': {}", s, e)))
}

/// Join mode a node sends to its direct neighbors on a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JoinAnnouncement {
    node: String,
    server: bool,
    client: bool,
    /// Distinct per send so gossip does not drop a repeat as already seen
    seq: u64,
}

/// Whether the local side dials a neighbor that sent `remote`
fn dials_neighbor(local_id: &str, local: JoinOptions, remote: &JoinAnnouncement) -> bool {
    if !local.client || !remote.server {
        return false;
    }
    // Both would dial: the smaller id does.
    if local.server && remote.client {
        return local_id < remote.node.as_str();
    }
    true
}

/// Accepts incoming mux connections
#[derive(Clone)]
struct MeshProtocolHandler {
    registry: ConnectionRegistry,
    local_id: String,
    max_frame_size: usize,
}

impl std::fmt::Debug for MeshProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshProtocolHandler")
            .field("local_id", &self.local_id)
            .field("registry", &"<ConnectionRegistry>")
            .finish()
    }
}

impl MeshProtocolHandler {
    async fn handle_connection(
        connection: Connection,
        registry: ConnectionRegistry,
        local_id: String,
        max_frame_size: usize,
    ) -> MeshResult<()> {
        let remote_id = connection.remote_id();
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| MeshError::Network(format!("Failed to accept bi stream: {}", e)))?;

        let peer = PeerConnection::new(&local_id, remote_id.to_string(), recv, send, max_frame_size);
        registry.add(peer.clone());
        info!(remote = %remote_id, connection_id = peer.id(), "Accepted mux connection");

        hold_until_closed(connection, peer).await;
        Ok(())
    }
}

impl ProtocolHandler for MeshProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let registry = self.registry.clone();
        let local_id = self.local_id.clone();
        let max_frame_size = self.max_frame_size;

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting mux connection");
            if let Err(e) = Self::handle_connection(conn, registry, local_id, max_frame_size).await {
                error!(error = ?e, "Failed to handle mux connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

/// Keep the QUIC connection alive for as long as the mux runs on it
async fn hold_until_closed(connection: Connection, peer: PeerConnection) {
    tokio::select! {
        _ = peer.closed() => {}
        reason = connection.closed() => {
            debug!(connection_id = peer.id(), reason = %reason, "QUIC connection closed");
            peer.close();
        }
    }
    connection.close(VarInt::from_u32(0), b"closed");
}

struct IrohInner {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    static_provider: StaticProvider,
    registry: ConnectionRegistry,
    local_id: String,
    max_frame_size: usize,
    bootstrap: Mutex<Vec<EndpointId>>,
    dialing: Mutex<HashSet<EndpointId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// [`Connectivity`] over an iroh endpoint
#[derive(Clone)]
pub struct IrohConnectivity {
    inner: Arc<IrohInner>,
}

impl std::fmt::Debug for IrohConnectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohConnectivity")
            .field("endpoint_id", &self.inner.local_id)
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

impl IrohConnectivity {
    /// Bind an endpoint with the given node key and start accepting
    pub async fn bind(secret_key: SecretKey, config: &NetworkConfig) -> MeshResult<Self> {
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec(), MESH_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| MeshError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(config.max_frame_size)
            .spawn(endpoint.clone());

        let registry = ConnectionRegistry::new();
        let local_id = endpoint_id.to_string();
        let handler = MeshProtocolHandler {
            registry: registry.clone(),
            local_id: local_id.clone(),
            max_frame_size: config.max_frame_size,
        };
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(MESH_ALPN, handler)
            .spawn();
        info!("Router spawned");

        let bootstrap = config
            .bootstrap_peers
            .iter()
            .filter_map(|peer| match parse_endpoint_id(peer) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "Skipping bootstrap peer");
                    None
                }
            })
            .collect();

        Ok(Self {
            inner: Arc::new(IrohInner {
                endpoint,
                gossip,
                router,
                static_provider,
                registry,
                local_id,
                max_frame_size: config.max_frame_size,
                bootstrap: Mutex::new(bootstrap),
                dialing: Mutex::new(HashSet::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.inner.endpoint.id()
    }

    /// Full address (relay and direct addresses) for out-of-band sharing
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.inner.endpoint.addr()
    }

    /// Make a peer's address known without DNS discovery
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        debug!(peer = %addr.id, "Adding peer address to static discovery");
        self.inner.static_provider.add_endpoint_info(addr);
    }

    /// Use `peer` as a bootstrap for topics joined from now on
    pub fn add_bootstrap(&self, peer: EndpointId) {
        let mut bootstrap = self.inner.bootstrap.lock();
        if !bootstrap.contains(&peer) {
            bootstrap.push(peer);
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Open a mux connection to `peer`
    pub async fn dial(&self, peer: EndpointId) -> MeshResult<PeerConnection> {
        let connection = self
            .inner
            .endpoint
            .connect(peer, MESH_ALPN)
            .await
            .map_err(|e| MeshError::Network(format!("Failed to connect to {}: {}", peer, e)))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| MeshError::Network(format!("Failed to open bi stream: {}", e)))?;

        let conn = PeerConnection::new(
            &self.inner.local_id,
            peer.to_string(),
            recv,
            send,
            self.inner.max_frame_size,
        );
        self.inner.registry.add(conn.clone());
        info!(remote = %peer, connection_id = conn.id(), "Dialed mux connection");

        tokio::spawn(hold_until_closed(connection, conn.clone()));
        Ok(conn)
    }

    /// Dial a topic neighbor unless already connected or dialing
    fn maybe_dial(&self, peer: EndpointId) {
        if self.inner.registry.is_connected_to(&peer.to_string()) {
            return;
        }
        if !self.inner.dialing.lock().insert(peer) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.dial(peer).await {
                warn!(peer = %peer, error = %e, "Dial to topic neighbor failed");
            }
            this.inner.dialing.lock().remove(&peer);
        });
    }

    async fn run_topic(self, topic: TopicKey, options: JoinOptions, flushed: watch::Sender<bool>) {
        use iroh_gossip::api::Event;
        use n0_future::StreamExt;

        let bootstrap = self.inner.bootstrap.lock().clone();
        let topic_id = TopicId::from_bytes(*topic.as_bytes());
        info!(?topic, peer_count = bootstrap.len(), "Subscribing to topic");

        let subscription = match self.inner.gossip.subscribe(topic_id, bootstrap.clone()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(?topic, error = %e, "Failed to subscribe to topic");
                return;
            }
        };
        // The sender half keeps the membership alive.
        let (sender, mut receiver) = subscription.split();
        let mut seq = 0u64;

        if bootstrap.is_empty() {
            // Nobody to announce to yet; later neighbors find us.
            flushed.send_replace(true);
        }

        loop {
            match receiver.try_next().await {
                Ok(Some(event)) => match event {
                    Event::NeighborUp(peer) => {
                        info!(?topic, %peer, "Neighbor joined");
                        flushed.send_replace(true);
                        seq += 1;
                        let announcement = JoinAnnouncement {
                            node: self.inner.local_id.clone(),
                            server: options.server,
                            client: options.client,
                            seq,
                        };
                        match serde_json::to_vec(&announcement) {
                            Ok(bytes) => {
                                if let Err(e) = sender.broadcast_neighbors(bytes.into()).await {
                                    debug!(?topic, error = %e, "Failed to announce join mode");
                                }
                            }
                            Err(e) => warn!(?topic, error = %e, "Failed to encode join announcement"),
                        }
                    }
                    Event::NeighborDown(peer) => {
                        debug!(?topic, %peer, "Neighbor left");
                    }
                    Event::Received(msg) => {
                        match serde_json::from_slice::<JoinAnnouncement>(&msg.content) {
                            Ok(announcement) if announcement.node == msg.delivered_from.to_string() => {
                                debug!(
                                    ?topic,
                                    peer = %msg.delivered_from,
                                    server = announcement.server,
                                    client = announcement.client,
                                    "Neighbor join mode"
                                );
                                if dials_neighbor(&self.inner.local_id, options, &announcement) {
                                    self.maybe_dial(msg.delivered_from);
                                }
                            }
                            _ => trace!(?topic, from = %msg.delivered_from, "Ignoring topic payload"),
                        }
                    }
                    Event::Lagged => {
                        warn!(?topic, "Lagged behind on topic");
                    }
                },
                Ok(None) => {
                    debug!(?topic, "Topic subscription closed");
                    break;
                }
                Err(e) => {
                    warn!(?topic, error = ?e, "Error receiving from topic");
                    break;
                }
            }
            if receiver.is_joined() {
                flushed.send_replace(true);
            }
        }
    }

    /// Stop topic tasks, close every connection and the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down connectivity");
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.registry.close_all();

        if let Err(e) = self.inner.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.inner.endpoint.close().await;
        info!("Connectivity shutdown complete");
    }
}

impl Connectivity for IrohConnectivity {
    fn local_id(&self) -> String {
        self.inner.local_id.clone()
    }

    fn connections(&self) -> Vec<PeerConnection> {
        self.inner.registry.connections()
    }

    fn subscribe_connections(&self) -> broadcast::Receiver<PeerConnection> {
        self.inner.registry.subscribe()
    }

    fn join(&self, topic: TopicKey, options: JoinOptions) -> MeshResult<TopicJoin> {
        let (join, flushed) = TopicJoin::pending(topic);
        let task = tokio::spawn(self.clone().run_topic(topic, options, flushed));
        self.inner.tasks.lock().push(task);
        Ok(join)
    }
}
