//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use channelmesh_core::sync::{ChannelEvent, Connectivity, PeerConnection, ProtocolChannel};
use channelmesh_core::{FeedConfig, GossipFeedManager, MemoryNode, MemoryStore};
use tokio::sync::mpsc::UnboundedReceiver;

/// 64-char hex key made of one repeated character
pub fn key(c: char) -> String {
    c.to_string().repeat(64)
}

/// Poll `condition` every 10ms until it holds or `timeout` expires
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Feed manager for an in-memory node, backed by a fresh store
pub fn feed_for(node: &Arc<MemoryNode>) -> (GossipFeedManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let connectivity: Arc<dyn Connectivity> = node.clone();
    let feed = GossipFeedManager::new(Some(connectivity), store.clone(), FeedConfig::default());
    (feed, store)
}

/// A hand-driven protocol endpoint used to observe exactly what a manager
/// sends
pub struct RawPeer {
    pub channel: ProtocolChannel,
    pub events: UnboundedReceiver<ChannelEvent>,
}

impl RawPeer {
    pub fn open(conn: &PeerConnection, protocol: &str) -> Self {
        let (channel, events) = conn.open_channel(protocol).unwrap();
        Self { channel, events }
    }

    /// Next message payload, skipping `Opened`
    pub async fn next_message(&mut self, timeout: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .ok()??;
            match event {
                ChannelEvent::Message(value) => return Some(value),
                ChannelEvent::Opened => continue,
                ChannelEvent::Closed => return None,
            }
        }
    }

    /// Every message received until `quiet` passes without traffic
    pub async fn drain(&mut self, quiet: Duration) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message(quiet).await {
            messages.push(message);
        }
        messages
    }
}
