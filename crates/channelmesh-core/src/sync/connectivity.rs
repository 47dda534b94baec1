//! Connection provider seam
//!
//! The managers never dial or accept on their own. They are handed a
//! [`Connectivity`] that tells them about every connection (existing and
//! future) and lets them join rendezvous topics.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::MeshResult;
use crate::sync::mux::PeerConnection;
use crate::types::TopicKey;

/// Seed of the channel discovery topic
pub const FEED_TOPIC_SEED: &[u8] = b"channelmesh:feeds:v1";

/// Prefix of per-resource search topics
pub const SEARCH_TOPIC_PREFIX: &[u8] = b"channelmesh:search:v1:";

/// Topic every feed participant joins
pub fn feed_topic() -> TopicKey {
    TopicKey::derive(FEED_TOPIC_SEED)
}

/// Topic for federated search over one shared resource
pub fn search_topic(resource_key: &str) -> TopicKey {
    TopicKey::derive_scoped(SEARCH_TOPIC_PREFIX, resource_key.as_bytes())
}

/// Announce/lookup mode for a topic join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Accept connections from peers that find us through the topic
    pub server: bool,
    /// Actively connect to peers found through the topic
    pub client: bool,
}

impl JoinOptions {
    pub const BOTH: JoinOptions = JoinOptions {
        server: true,
        client: true,
    };
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self::BOTH
    }
}

/// A topic membership in progress
#[derive(Debug)]
pub struct TopicJoin {
    topic: TopicKey,
    flushed: watch::Receiver<bool>,
}

impl TopicJoin {
    /// A join plus the sender its provider uses to report the flush
    pub fn pending(topic: TopicKey) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { topic, flushed: rx }, tx)
    }

    /// A join that has already propagated
    pub fn flushed_now(topic: TopicKey) -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { topic, flushed: rx }
    }

    pub fn topic(&self) -> TopicKey {
        self.topic
    }

    pub fn is_flushed(&self) -> bool {
        *self.flushed.borrow()
    }

    /// Resolves once the join has propagated.
    ///
    /// Returns `false` if the provider gave up on the join.
    pub async fn flushed(&mut self) -> bool {
        self.flushed.wait_for(|flushed| *flushed).await.is_ok()
    }

    /// Wait for the flush, bounded by `timeout`. Logs and returns `false`
    /// rather than failing when the bound is hit.
    pub async fn flushed_within(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.flushed()).await {
            Ok(true) => {
                debug!(topic = ?self.topic, "Topic join flushed");
                true
            }
            Ok(false) => {
                warn!(topic = ?self.topic, "Topic join abandoned before flushing");
                false
            }
            Err(_) => {
                warn!(
                    topic = ?self.topic,
                    timeout_ms = timeout.as_millis() as u64,
                    "Topic join did not flush in time, continuing"
                );
                false
            }
        }
    }
}

/// Source of authenticated, multiplexed peer connections
pub trait Connectivity: Send + Sync + 'static {
    /// Identifier of the local node
    fn local_id(&self) -> String;

    /// Currently live connections
    fn connections(&self) -> Vec<PeerConnection>;

    /// Every connection established after this call.
    ///
    /// Subscribe before calling [`Connectivity::connections`] so that no
    /// connection falls between the two.
    fn subscribe_connections(&self) -> broadcast::Receiver<PeerConnection>;

    /// Join a rendezvous topic
    fn join(&self, topic: TopicKey, options: JoinOptions) -> MeshResult<TopicJoin>;
}
