//! Core types for channelmesh

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Identifier of a published channel's drive (or its metadata index).
///
/// 32 bytes, canonically rendered as 64 lowercase hex characters. Parsing
/// accepts either case but anything else is rejected, so a `DriveKey` in
/// hand is always well-formed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriveKey([u8; 32]);

impl DriveKey {
    /// Create a DriveKey from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the 64-hex-character form
    pub fn parse(s: &str) -> Result<Self, MeshError> {
        if s.len() != 64 {
            return Err(MeshError::InvalidKey(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| MeshError::InvalidKey(format!("{}: {}", s, e)))?;
        Ok(Self(bytes))
    }

    /// Canonical lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for logs (first 8 hex chars)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for DriveKey {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DriveKey {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DriveKey> for String {
    fn from(key: DriveKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Display for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriveKey({})", self.short())
    }
}

/// Where a feed entry was first learned from. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    /// Received via gossip from a peer
    Peer,
    /// Submitted by the local user
    Local,
}

impl fmt::Display for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySource::Peer => write!(f, "peer"),
            EntrySource::Local => write!(f, "local"),
        }
    }
}

/// One known publisher channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    /// Primary key
    pub drive_key: DriveKey,
    /// Key of the publisher's metadata index, if known yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_bee_key: Option<DriveKey>,
    /// Unix millis of local first observation (never a peer-claimed time)
    pub added_at: i64,
    /// Provenance
    pub source: EntrySource,
}

impl FeedEntry {
    /// Create an entry observed now
    pub fn new(drive_key: DriveKey, source: EntrySource, public_bee_key: Option<DriveKey>) -> Self {
        Self {
            drive_key,
            public_bee_key,
            added_at: chrono::Utc::now().timestamp_millis(),
            source,
        }
    }
}

/// A channel authored by the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedChannel {
    pub drive_key: DriveKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_bee_key: Option<DriveKey>,
}

/// Counters exposed for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    /// Entries in the feed (hidden keys are never in it)
    pub total_entries: usize,
    /// Keys vetoed by the local user
    pub hidden_count: usize,
    /// Feed channels currently open
    pub open_channels: usize,
    /// Channels authored locally
    pub published_count: usize,
    /// Sends that failed on a closing channel
    pub send_failures: u64,
}

/// 32-byte rendezvous identifier for a discovery topic
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(pub [u8; 32]);

impl TopicKey {
    /// Derive a topic from a fixed seed
    pub fn derive(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }

    /// Derive a topic from a prefix and a resource identifier
    pub fn derive_scoped(prefix: &[u8], resource: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(prefix);
        hasher.update(resource);
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic_{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One ranked search result, local or from a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SearchHit {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
