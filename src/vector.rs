//! Vector-store contract for semantic lookups.
//!
//! Used as a secondary check for page-state similarity and for semantic
//! hypothesis dedup. The store is optional: when absent, callers simply get
//! no semantic hits and fall back to structural comparison.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;

/// Default similarity threshold for treating two documents as the same.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;

/// One hit returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    /// Raw distance reported by the store (smaller is closer)
    pub distance: f64,
    pub metadata: HashMap<String, Value>,
}

impl VectorHit {
    /// Map a distance to a similarity in [0, 1].
    pub fn similarity(&self) -> f64 {
        1.0 / (1.0 + self.distance.max(0.0))
    }

    /// Whether this hit clears the semantic-dedup threshold.
    pub fn is_match(&self, threshold: f64) -> bool {
        self.similarity() >= threshold
    }
}

/// Contract with an embedding-backed document store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Add a document to a collection.
    async fn add(
        &self,
        collection: &str,
        id: &str,
        document: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<()>;

    /// Query a collection for the `k` nearest documents.
    async fn query(&self, collection: &str, text: &str, k: usize) -> Result<Vec<VectorHit>>;
}

/// Query for a semantic duplicate; absence of a store degrades to no match.
pub async fn find_semantic_match(
    store: Option<&dyn VectorStore>,
    collection: &str,
    text: &str,
    threshold: f64,
) -> Result<Option<VectorHit>> {
    let Some(store) = store else {
        return Ok(None);
    };

    let hits = store.query(collection, text, 1).await?;
    Ok(hits.into_iter().next().filter(|hit| hit.is_match(threshold)))
}
