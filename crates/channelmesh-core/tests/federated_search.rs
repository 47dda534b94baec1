//! Federated search across in-memory nodes

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use channelmesh_core::sync::{Connectivity, QUERY_PROTOCOL};
use channelmesh_core::{
    FederatedQueryCoordinator, MemoryNetwork, MemoryNode, MeshError, MeshResult, QueryConfig,
    SearchEngine, SearchHit, SearchOptions,
};
use common::{wait_until, RawPeer};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);
const RESOURCE: &str = "video-index";

/// Returns a fixed hit list and records the scopes it was asked for
struct FixedEngine {
    hits: Vec<SearchHit>,
    scopes: Mutex<Vec<Option<String>>>,
    fail: bool,
}

impl FixedEngine {
    fn new(hits: Vec<SearchHit>) -> Arc<Self> {
        Arc::new(Self {
            hits,
            scopes: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            hits: Vec::new(),
            scopes: Mutex::new(Vec::new()),
            fail: true,
        })
    }
}

impl SearchEngine for FixedEngine {
    fn search<'a>(
        &'a self,
        _query: &'a str,
        top_k: usize,
        scope: Option<&'a str>,
    ) -> BoxFuture<'a, MeshResult<Vec<SearchHit>>> {
        Box::pin(async move {
            self.scopes.lock().push(scope.map(str::to_string));
            if self.fail {
                return Err(MeshError::Search("index offline".to_string()));
            }
            Ok(self.hits.iter().take(top_k).cloned().collect())
        })
    }
}

fn coordinator(node: &Arc<MemoryNode>, engine: Arc<FixedEngine>) -> FederatedQueryCoordinator {
    let connectivity: Arc<dyn Connectivity> = node.clone();
    FederatedQueryCoordinator::new(engine, Some(connectivity), QueryConfig::default())
}

fn options(timeout_ms: u64) -> SearchOptions {
    SearchOptions {
        timeout: Some(Duration::from_millis(timeout_ms)),
        ..SearchOptions::default()
    }
}

#[tokio::test]
async fn test_search_waits_for_deadline_and_merges_answers() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let b = network.node("b");
    let c = network.node("c");
    let silent = network.node("silent");

    let a_query = coordinator(&a, FixedEngine::new(vec![SearchHit::new("x", 0.8)]));
    let b_query = coordinator(
        &b,
        FixedEngine::new(vec![SearchHit::new("y", 0.5), SearchHit::new("x", 0.4)]),
    );
    let c_query = coordinator(&c, FixedEngine::new(vec![SearchHit::new("z", 0.3)]));

    a_query.setup_topic(RESOURCE).await.unwrap();
    b_query.setup_topic(RESOURCE).await.unwrap();
    c_query.setup_topic(RESOURCE).await.unwrap();

    // Opens the protocol but never answers
    let silent_conn = network.connect(&silent, &a);
    let mut silent_peer = RawPeer::open(&silent_conn, QUERY_PROTOCOL);

    assert!(wait_until(WAIT, || a_query.open_channels() == 3).await);

    let started = Instant::now();
    let hits = a_query.search("cats", options(500)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(500), "resolved early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_000), "blocked past deadline: {:?}", elapsed);

    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids, vec!["x", "y", "z"]);
    assert!((hits[0].score - 0.6).abs() < 1e-9);
    assert_eq!(hits[1].score, 0.5);
    assert_eq!(hits[2].score, 0.3);
    assert_eq!(a_query.pending_queries(), 0);

    let query = silent_peer.next_message(WAIT).await.expect("SEARCH_QUERY");
    assert_eq!(query["type"], "SEARCH_QUERY");
    assert_eq!(query["query"], "cats");
}

#[tokio::test]
async fn test_local_only_search_ignores_peers() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let b = network.node("b");
    let local = vec![SearchHit::new("only-local", 0.9), SearchHit::new("second", 0.1)];
    let a_query = coordinator(&a, FixedEngine::new(local.clone()));
    let b_query = coordinator(&b, FixedEngine::new(vec![SearchHit::new("remote", 1.0)]));
    a_query.setup_topic(RESOURCE).await.unwrap();
    b_query.setup_topic(RESOURCE).await.unwrap();
    assert!(wait_until(WAIT, || a_query.open_channels() == 1).await);

    let started = Instant::now();
    let hits = a_query.search("cats", SearchOptions::local()).await.unwrap();
    assert_eq!(hits, local);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_peer_answers_with_its_scope_and_never_fails() {
    let network = MemoryNetwork::new();
    let b = network.node("b");
    let engine = FixedEngine::failing();
    let b_query = coordinator(&b, engine.clone());
    b_query.setup_topic(RESOURCE).await.unwrap();

    let conn = network.connect(&network.node("asker"), &b);
    let mut raw = RawPeer::open(&conn, QUERY_PROTOCOL);
    assert!(wait_until(WAIT, || b_query.open_channels() == 1).await);

    raw.channel
        .send(&json!({
            "type": "SEARCH_QUERY",
            "queryId": "q1",
            "scopeKey": "drive-1",
            "query": "cats",
            "topK": 5
        }))
        .unwrap();

    let response = raw.next_message(WAIT).await.expect("SEARCH_RESPONSE");
    assert_eq!(response["type"], "SEARCH_RESPONSE");
    assert_eq!(response["queryId"], "q1");
    assert_eq!(response["results"], json!([]));
    assert_eq!(engine.scopes.lock().as_slice(), &[Some("drive-1".to_string())]);
}

#[tokio::test]
async fn test_late_and_unknown_responses_are_ignored() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let a_query = coordinator(&a, FixedEngine::new(vec![SearchHit::new("x", 0.8)]));
    a_query.setup_topic(RESOURCE).await.unwrap();

    let conn = network.connect(&network.node("slow"), &a);
    let mut slow = RawPeer::open(&conn, QUERY_PROTOCOL);
    assert!(wait_until(WAIT, || a_query.open_channels() == 1).await);

    slow.channel
        .send(&json!({"type": "SEARCH_RESPONSE", "queryId": "never-asked", "results": [{"id": "bogus", "score": 1.0}]}))
        .unwrap();

    let hits = a_query.search("cats", options(200)).await.unwrap();
    assert_eq!(hits, vec![SearchHit::new("x", 0.8)]);

    let query = slow.next_message(WAIT).await.expect("SEARCH_QUERY");
    slow.channel
        .send(&json!({"type": "SEARCH_RESPONSE", "queryId": query["queryId"], "results": [{"id": "late", "score": 1.0}]}))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a_query.pending_queries(), 0);
}

#[tokio::test]
async fn test_peer_disconnect_mid_query_still_resolves() {
    let network = MemoryNetwork::new();
    let a = network.node("a");
    let a_query = coordinator(&a, FixedEngine::new(vec![SearchHit::new("x", 0.8)]));
    a_query.setup_topic(RESOURCE).await.unwrap();

    let conn = network.connect(&network.node("flaky"), &a);
    let mut flaky = RawPeer::open(&conn, QUERY_PROTOCOL);
    assert!(wait_until(WAIT, || a_query.open_channels() == 1).await);

    let search = {
        let a_query = a_query.clone();
        tokio::spawn(async move { a_query.search("cats", options(300)).await })
    };
    flaky.next_message(WAIT).await.expect("SEARCH_QUERY");
    conn.close();

    let hits = search.await.unwrap().unwrap();
    assert_eq!(hits, vec![SearchHit::new("x", 0.8)]);
    assert!(wait_until(WAIT, || a_query.open_channels() == 0).await);
}
