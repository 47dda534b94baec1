//! Federated search protocol messages
//!
//! Carried on the `channelmesh/search/1` mux channel. A query id correlates
//! a `SEARCH_RESPONSE` with the `SEARCH_QUERY` it answers.

use serde::{Deserialize, Serialize};

use crate::types::SearchHit;

/// Protocol name negotiated on the mux
pub const QUERY_PROTOCOL: &str = "channelmesh/search/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueryMessage {
    #[serde(rename = "SEARCH_QUERY")]
    SearchQuery {
        #[serde(rename = "queryId")]
        query_id: String,
        #[serde(rename = "scopeKey", default, skip_serializing_if = "Option::is_none")]
        scope_key: Option<String>,
        query: String,
        #[serde(rename = "topK")]
        top_k: usize,
    },

    #[serde(rename = "SEARCH_RESPONSE")]
    SearchResponse {
        #[serde(rename = "queryId")]
        query_id: String,
        #[serde(default)]
        results: Vec<SearchHit>,
    },
}

impl QueryMessage {
    pub fn decode(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn query_id(&self) -> &str {
        match self {
            QueryMessage::SearchQuery { query_id, .. } => query_id,
            QueryMessage::SearchResponse { query_id, .. } => query_id,
        }
    }
}

/// Random 128-bit query id in hex
pub fn new_query_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
