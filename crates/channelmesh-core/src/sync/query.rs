//! Federated search across connected peers
//!
//! A search always runs against the local engine first. When federated, the
//! query is also sent to every peer with an open search channel; whatever
//! answers arrive before the deadline are merged with the local hits.
//!
//! ```text
//! search() ── local engine ──┐
//!      │                      ├── merge_results ──> top_k hits
//!      └── SEARCH_QUERY ──> peers ── SEARCH_RESPONSE ──┘   (until timeout)
//! ```
//!
//! The wait is always the full timeout. Peers that answer late are ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::QueryConfig;
use crate::error::{MeshError, MeshResult};
use crate::search::SearchEngine;
use crate::sync::channel::{attach_all, ChannelHandler, ChannelTable};
use crate::sync::connectivity::{search_topic, Connectivity, JoinOptions};
use crate::sync::mux::ProtocolChannel;
use crate::sync::query_protocol::{new_query_id, QueryMessage, QUERY_PROTOCOL};
use crate::types::SearchHit;

/// Per-call search settings; unset fields fall back to [`QueryConfig`]
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    /// Ask connected peers as well
    pub federated: bool,
    /// How long to collect peer answers
    pub timeout: Option<Duration>,
    /// Restrict the search to one resource
    pub scope_key: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: None,
            federated: true,
            timeout: None,
            scope_key: None,
        }
    }
}

impl SearchOptions {
    pub fn local() -> Self {
        Self {
            federated: false,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct PendingQuery {
    result_sets: Vec<Vec<SearchHit>>,
}

struct QueryInner {
    self_ref: Weak<QueryInner>,
    engine: Arc<dyn SearchEngine>,
    connectivity: Option<Arc<dyn Connectivity>>,
    config: QueryConfig,
    channels: ChannelTable,
    pending: Mutex<HashMap<String, PendingQuery>>,
    attached: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs local searches and fans them out to peers
#[derive(Clone)]
pub struct FederatedQueryCoordinator {
    inner: Arc<QueryInner>,
}

impl FederatedQueryCoordinator {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        connectivity: Option<Arc<dyn Connectivity>>,
        config: QueryConfig,
    ) -> Self {
        let inner = Arc::new_cyclic(|self_ref| QueryInner {
            self_ref: self_ref.clone(),
            engine,
            connectivity,
            config,
            channels: ChannelTable::new(),
            pending: Mutex::new(HashMap::new()),
            attached: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Join the search topic of `resource_key` and speak the search protocol
    /// on every current and future connection.
    pub async fn setup_topic(&self, resource_key: &str) -> MeshResult<()> {
        let Some(connectivity) = self.inner.connectivity.clone() else {
            return Err(MeshError::InvalidOperation(
                "federated search needs connectivity".to_string(),
            ));
        };

        let join = connectivity.join(search_topic(resource_key), JoinOptions::BOTH);
        if !self.inner.attached.swap(true, Ordering::SeqCst) {
            let task = attach_all(&self.inner, connectivity);
            self.inner.tasks.lock().push(task);
        }

        let mut join = join?;
        join.flushed_within(self.inner.config.flush_timeout()).await;
        info!(resource = resource_key, topic = ?join.topic(), "Search topic ready");
        Ok(())
    }

    /// Search locally and, when federated, across peers.
    ///
    /// A local engine failure is returned for local-only searches; a
    /// federated search carries on with whatever the peers return.
    pub async fn search(&self, query: &str, options: SearchOptions) -> MeshResult<Vec<SearchHit>> {
        let top_k = options.top_k.unwrap_or(self.inner.config.default_top_k);
        let scope = options.scope_key.as_deref();
        let local = self.inner.engine.search(query, top_k, scope).await;

        if !options.federated || self.inner.connectivity.is_none() {
            return local;
        }

        let local = local.unwrap_or_else(|e| {
            warn!(error = %e, "Local search failed, using peer results only");
            Vec::new()
        });
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());
        let batches = self
            .broadcast_search(query, top_k, timeout, options.scope_key.clone())
            .await;
        Ok(merge_results(local, batches, top_k))
    }

    /// Send the query to every open channel and collect answers until the
    /// deadline.
    async fn broadcast_search(
        &self,
        query: &str,
        top_k: usize,
        timeout: Duration,
        scope_key: Option<String>,
    ) -> Vec<Vec<SearchHit>> {
        let query_id = new_query_id();
        let channels = self.inner.channels.open_channels();

        // Registered before sending so an instant answer is not lost.
        self.inner
            .pending
            .lock()
            .insert(query_id.clone(), PendingQuery::default());

        let message = QueryMessage::SearchQuery {
            query_id: query_id.clone(),
            scope_key,
            query: query.to_string(),
            top_k,
        };
        let sent = channels
            .iter()
            .filter(|channel| self.inner.channels.send(channel, &message))
            .count();
        debug!(%query_id, peers = sent, timeout_ms = timeout.as_millis() as u64, "Search broadcast");

        // The deadline owns the pending entry, so it lives exactly until the
        // timeout even if this future is dropped.
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let id = query_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let batches = inner
                .pending
                .lock()
                .remove(&id)
                .map(|pending| pending.result_sets)
                .unwrap_or_default();
            let _ = tx.send(batches);
        });

        let batches = rx.await.unwrap_or_default();
        debug!(%query_id, responses = batches.len(), "Search deadline reached");
        batches
    }

    /// Queries still waiting for their deadline
    pub fn pending_queries(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Peers with an open search channel
    pub fn open_channels(&self) -> usize {
        self.inner.channels.open_count()
    }

    pub fn send_failures(&self) -> u64 {
        self.inner.channels.send_failures()
    }

    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Fuse local hits with peer batches.
///
/// Local hits seed the result; an id seen again gets the arithmetic mean of
/// its current and new score. Sorted by score (stable), truncated to `top_k`.
pub fn merge_results(
    local: Vec<SearchHit>,
    peer_batches: Vec<Vec<SearchHit>>,
    top_k: usize,
) -> Vec<SearchHit> {
    let mut merged: Vec<SearchHit> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for hit in local {
        if !index.contains_key(&hit.id) {
            index.insert(hit.id.clone(), merged.len());
            merged.push(hit);
        }
    }
    for hit in peer_batches.into_iter().flatten() {
        match index.get(&hit.id) {
            Some(&i) => merged[i].score = (merged[i].score + hit.score) / 2.0,
            None => {
                index.insert(hit.id.clone(), merged.len());
                merged.push(hit);
            }
        }
    }

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(top_k);
    merged
}

impl QueryInner {
    /// Local answer to a peer's query; never fails
    async fn answer(&self, query: &str, top_k: usize, scope: Option<&str>) -> Vec<SearchHit> {
        if let Err(e) = self.engine.prepare_scope(scope).await {
            debug!(?scope, error = %e, "Scope preparation failed, searching anyway");
        }
        match self.engine.search(query, top_k, scope).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Local search for peer failed, answering empty");
                Vec::new()
            }
        }
    }
}

impl ChannelHandler for QueryInner {
    fn protocol(&self) -> &'static str {
        QUERY_PROTOCOL
    }

    fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    fn on_open(&self, channel: &ProtocolChannel) {
        debug!(remote = %channel.remote_id(), "Search channel open");
    }

    fn on_message(&self, channel: &ProtocolChannel, message: serde_json::Value) {
        let message = match QueryMessage::decode(message) {
            Ok(message) => message,
            Err(e) => {
                debug!(remote = %channel.remote_id(), error = %e, "Ignoring undecodable search message");
                return;
            }
        };

        match message {
            QueryMessage::SearchQuery {
                query_id,
                scope_key,
                query,
                top_k,
            } => {
                let Some(inner) = self.self_ref.upgrade() else { return };
                let channel = channel.clone();
                debug!(%query_id, remote = %channel.remote_id(), "Answering peer search");
                tokio::spawn(async move {
                    let results = inner.answer(&query, top_k, scope_key.as_deref()).await;
                    let reply = QueryMessage::SearchResponse { query_id, results };
                    inner.channels.send(&channel, &reply);
                });
            }
            QueryMessage::SearchResponse { query_id, results } => {
                match self.pending.lock().get_mut(&query_id) {
                    Some(pending) => {
                        trace!(%query_id, hits = results.len(), "Search response");
                        pending.result_sets.push(results);
                    }
                    None => trace!(%query_id, "Ignoring response for unknown query"),
                }
            }
        }
    }

    fn on_closed(&self, channel: &ProtocolChannel) {
        debug!(remote = %channel.remote_id(), "Search channel closed");
    }
}
