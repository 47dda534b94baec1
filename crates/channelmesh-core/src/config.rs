//! Runtime configuration
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

/// Frames larger than this are rejected by the mux codec
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Top-level configuration for a mesh node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub feed: FeedConfig,
    pub query: QueryConfig,
    pub network: NetworkConfig,
}

impl MeshConfig {
    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            MeshError::Serialization(format!("Invalid config {}: {}", path.display(), e))
        })
    }
}

/// Gossip feed settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Delay before a burst of feed mutations is written out
    pub persist_debounce_ms: u64,
    /// Cap on discovered entries written to the store (newest kept)
    pub max_persisted_entries: usize,
    /// How long start() waits for the discovery topic join to flush
    pub flush_timeout_ms: u64,
    /// Capacity of the feed event broadcast channel
    pub event_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: 1_000,
            max_persisted_entries: 1_000,
            flush_timeout_ms: 10_000,
            event_capacity: 256,
        }
    }
}

impl FeedConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Federated search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Deadline for peer responses when the caller gives none
    pub default_timeout_ms: u64,
    /// Result count when the caller gives none
    pub default_top_k: usize,
    /// How long setup_topic() waits for the topic join to flush
    pub flush_timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 3_000,
            default_top_k: 10,
            flush_timeout_ms: 10_000,
        }
    }
}

impl QueryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Endpoint ids (hex or z-base32 as printed by `channelmesh info`) to
    /// bootstrap topic membership from
    pub bootstrap_peers: Vec<String>,
    /// Maximum size of one mux frame
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
