//! MeshEngine - wires storage, connectivity and both managers together
//!
//! ```ignore
//! use channelmesh_core::{MeshConfig, MeshEngine, MemorySearchIndex};
//!
//! let engine = MeshEngine::online("~/.channelmesh/data", MeshConfig::default(),
//!     Arc::new(MemorySearchIndex::new())).await?;
//! engine.start().await;
//! engine.feed().submit_channel(&drive_key, None)?;
//! let hits = engine.query().search("cats", SearchOptions::default()).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use iroh::SecretKey;
use tracing::{info, warn};

use crate::config::MeshConfig;
use crate::error::MeshResult;
use crate::search::SearchEngine;
use crate::storage::Storage;
use crate::sync::connectivity::Connectivity;
use crate::sync::endpoint::{parse_endpoint_id, IrohConnectivity};
use crate::sync::feed_manager::GossipFeedManager;
use crate::sync::query::FederatedQueryCoordinator;
use crate::types::FeedStats;

/// File name of the redb database inside the data directory
pub const DATABASE_FILE: &str = "channelmesh.redb";

/// Summary of a node for display
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub data_dir: PathBuf,
    /// Endpoint id, once a node key exists
    pub node_id: Option<String>,
    pub stats: FeedStats,
    pub online: bool,
}

/// A channelmesh node
pub struct MeshEngine {
    data_dir: PathBuf,
    config: MeshConfig,
    storage: Arc<Storage>,
    connectivity: Option<IrohConnectivity>,
    feed: GossipFeedManager,
    query: FederatedQueryCoordinator,
}

impl MeshEngine {
    /// Open the node's storage without any networking.
    ///
    /// The feed is local-only and searches never leave this process.
    pub fn offline(
        data_dir: impl AsRef<Path>,
        config: MeshConfig,
        search: Arc<dyn SearchEngine>,
    ) -> MeshResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let storage = Arc::new(Storage::new(data_dir.join(DATABASE_FILE))?);
        let feed = GossipFeedManager::new(None, storage.clone(), config.feed.clone());
        let query = FederatedQueryCoordinator::new(search, None, config.query.clone());
        Ok(Self {
            data_dir,
            config,
            storage,
            connectivity: None,
            feed,
            query,
        })
    }

    /// Open storage and bind an iroh endpoint with the node's persistent key
    pub async fn online(
        data_dir: impl AsRef<Path>,
        config: MeshConfig,
        search: Arc<dyn SearchEngine>,
    ) -> MeshResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let storage = Arc::new(Storage::new(data_dir.join(DATABASE_FILE))?);

        let secret_key = load_or_create_secret_key(&storage)?;
        let connectivity = IrohConnectivity::bind(secret_key, &config.network).await?;
        let shared: Arc<dyn Connectivity> = Arc::new(connectivity.clone());

        let feed = GossipFeedManager::new(Some(shared.clone()), storage.clone(), config.feed.clone());
        let query = FederatedQueryCoordinator::new(search, Some(shared), config.query.clone());
        info!(node_id = %connectivity.endpoint_id(), "Mesh engine online");

        Ok(Self {
            data_dir,
            config,
            storage,
            connectivity: Some(connectivity),
            feed,
            query,
        })
    }

    /// Start the feed and, when online, dial the configured bootstrap peers
    pub async fn start(&self) {
        if let Some(connectivity) = &self.connectivity {
            for peer in &self.config.network.bootstrap_peers {
                let peer = match parse_endpoint_id(peer) {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!(error = %e, "Skipping bootstrap peer");
                        continue;
                    }
                };
                if let Err(e) = connectivity.dial(peer).await {
                    warn!(%peer, error = %e, "Bootstrap dial failed");
                }
            }
        }
        self.feed.start().await;
    }

    /// Join the search topic for `resource_key`
    pub async fn join_search(&self, resource_key: &str) -> MeshResult<()> {
        self.query.setup_topic(resource_key).await
    }

    pub fn feed(&self) -> &GossipFeedManager {
        &self.feed
    }

    pub fn query(&self) -> &FederatedQueryCoordinator {
        &self.query
    }

    pub fn connectivity(&self) -> Option<&IrohConnectivity> {
        self.connectivity.as_ref()
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Endpoint id of this node, if a node key has been created
    pub fn node_id(&self) -> MeshResult<Option<String>> {
        if let Some(connectivity) = &self.connectivity {
            return Ok(Some(connectivity.endpoint_id().to_string()));
        }
        Ok(self
            .storage
            .load_endpoint_secret_key()?
            .map(|bytes| SecretKey::from(bytes).public().to_string()))
    }

    pub fn node_info(&self) -> MeshResult<NodeInfo> {
        Ok(NodeInfo {
            data_dir: self.data_dir.clone(),
            node_id: self.node_id()?,
            stats: self.feed.get_stats(),
            online: self.connectivity.is_some(),
        })
    }

    /// Flush pending feed writes and close the endpoint
    pub async fn shutdown(self) {
        self.feed.shutdown();
        self.query.shutdown();
        if let Some(connectivity) = &self.connectivity {
            connectivity.shutdown().await;
        }
        info!("Mesh engine shut down");
    }
}

/// The node key persists so the endpoint id is stable across restarts
fn load_or_create_secret_key(storage: &Storage) -> MeshResult<SecretKey> {
    match storage.load_endpoint_secret_key()? {
        Some(key_bytes) => {
            info!("Loaded persistent endpoint secret key from storage");
            Ok(SecretKey::from(key_bytes))
        }
        None => {
            info!("No endpoint secret key found, generating new one");
            let secret_key = SecretKey::generate(&mut rand::rng());
            storage.save_endpoint_secret_key(&secret_key.to_bytes())?;
            Ok(secret_key)
        }
    }
}
