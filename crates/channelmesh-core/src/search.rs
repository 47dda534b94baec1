//! Local search engine seam
//!
//! The coordinator treats ranking as a black box behind [`SearchEngine`].
//! [`MemorySearchIndex`] is a plain term-overlap index so nodes without a
//! real engine still answer queries.

use std::collections::HashSet;
use std::path::Path;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::types::SearchHit;

/// Ranked search over locally available content
pub trait SearchEngine: Send + Sync + 'static {
    /// Up to `top_k` hits for `query`, best first, restricted to `scope`
    /// when given
    fn search<'a>(
        &'a self,
        query: &'a str,
        top_k: usize,
        scope: Option<&'a str>,
    ) -> BoxFuture<'a, MeshResult<Vec<SearchHit>>>;

    /// Make sure the index for `scope` is ready before searching it
    fn prepare_scope<'a>(&'a self, _scope: Option<&'a str>) -> BoxFuture<'a, MeshResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A document known to the in-memory index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl IndexedDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            scope: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Term-overlap index: score is the fraction of query terms a document
/// contains.
#[derive(Default)]
pub struct MemorySearchIndex {
    documents: RwLock<Vec<IndexedDocument>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: Vec<IndexedDocument>) -> Self {
        Self {
            documents: RwLock::new(documents),
        }
    }

    /// Load a JSON array of documents
    pub fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let documents: Vec<IndexedDocument> = serde_json::from_slice(&bytes).map_err(|e| {
            MeshError::Serialization(format!("Invalid index {}: {}", path.display(), e))
        })?;
        Ok(Self::with_documents(documents))
    }

    pub fn insert(&self, document: IndexedDocument) {
        let mut documents = self.documents.write();
        documents.retain(|d| d.id != document.id);
        documents.push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rank(&self, query: &str, top_k: usize, scope: Option<&str>) -> Vec<SearchHit> {
        let terms = tokenize(query);
        if terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let documents = self.documents.read();
        let mut hits: Vec<SearchHit> = documents
            .iter()
            .filter(|doc| scope.is_none() || doc.scope.as_deref() == scope)
            .filter_map(|doc| {
                let words = tokenize(&doc.text);
                let matched = terms.iter().filter(|t| words.contains(*t)).count();
                (matched > 0).then(|| {
                    SearchHit::new(doc.id.clone(), matched as f64 / terms.len() as f64)
                        .with_metadata(doc.metadata.clone())
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        hits
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SearchEngine for MemorySearchIndex {
    fn search<'a>(
        &'a self,
        query: &'a str,
        top_k: usize,
        scope: Option<&'a str>,
    ) -> BoxFuture<'a, MeshResult<Vec<SearchHit>>> {
        Box::pin(async move { Ok(self.rank(query, top_k, scope)) })
    }
}
