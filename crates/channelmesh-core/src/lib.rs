//! channelmesh core library
//!
//! Channel discovery and federated search for a peer-to-peer video
//! network.
//!
//! ## Overview
//!
//! Every node keeps a feed of publisher channels it has heard about. Feeds
//! spread by gossip: peers swap their whole feed when they connect and push
//! each newly published channel onward. Users can hide channels they never
//! want to see again. Searches run against the local index and, when
//! federated, fan out to every connected peer for a fixed window before the
//! answers are merged.
//!
//! ## Quick Start
//!
//! ```ignore
//! use channelmesh_core::{MeshConfig, MeshEngine, MemorySearchIndex, SearchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let index = Arc::new(MemorySearchIndex::load("index.json")?);
//!     let engine = MeshEngine::online("~/.channelmesh/data", MeshConfig::default(), index).await?;
//!     engine.start().await;
//!
//!     engine.feed().submit_channel(&my_drive_key, None)?;
//!     for entry in engine.feed().get_feed() {
//!         println!("{} ({:?})", entry.drive_key.short(), entry.source);
//!     }
//!
//!     engine.join_search("video-index").await?;
//!     let hits = engine.query().search("cats", SearchOptions::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod search;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{FeedConfig, MeshConfig, NetworkConfig, QueryConfig};
pub use engine::{MeshEngine, NodeInfo};
pub use error::{MeshError, MeshResult};
pub use search::{IndexedDocument, MemorySearchIndex, SearchEngine};
pub use storage::{KvStore, MemoryStore, Storage};
pub use sync::{
    FeedEvent, FederatedQueryCoordinator, GossipFeedManager, IrohConnectivity, MemoryNetwork,
    MemoryNode, SearchOptions,
};
pub use types::*;
