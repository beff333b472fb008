//! Vector Store
//!
//! Query-side access to a pre-built index of table-description embeddings.
//! The index itself is produced offline; this module loads and searches it.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// One ranked hit from a nearest-neighbour query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    pub score: f32,
}

/// Nearest-neighbour lookup over a fixed-dimension index.
#[async_trait]
pub trait NeighborIndex: Send + Sync {
    /// Up to `k` neighbours of `vector`, highest similarity first.
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    fn dimension(&self) -> usize;
}

/// Document in the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub text: String,
    pub embedding: Embedding,
}

/// In-memory vector store with exact cosine-similarity search.
///
/// Suitable for catalogs of up to a few thousand tables; search is a linear
/// scan over all stored vectors.
#[derive(Debug)]
pub struct InMemoryVectorStore {
    documents: HashMap<String, Document>,
    dimension: usize,
}

impl InMemoryVectorStore {
    /// Create a new vector store with specified embedding dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            documents: HashMap::new(),
            dimension,
        }
    }

    /// Add a document. A vector of the wrong length is a configuration error.
    pub fn add_document(&mut self, document: Document) -> Result<()> {
        if document.embedding.len() != self.dimension {
            return Err(PipelineError::Configuration(format!(
                "Embedding dimension {} for '{}' doesn't match store dimension {}",
                document.embedding.len(),
                document.id,
                self.dimension
            )));
        }
        self.documents.insert(document.id.clone(), document);
        Ok(())
    }

    /// Load a JSON-lines export, one `{"id", "embedding", "table_name", "text"}`
    /// object per line.
    pub fn load_jsonl(path: &Path, dimension: usize) -> Result<Self> {
        let file = File::open(path).map_err(|e| PipelineError::IndexUnavailable {
            message: format!("Failed to open vector index {}: {}", path.display(), e),
            retryable: false,
        })?;

        let mut store = Self::new(dimension);
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| PipelineError::IndexUnavailable {
                message: format!("Failed to read vector index {}: {}", path.display(), e),
                retryable: false,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let document: Document = serde_json::from_str(&line).map_err(|e| PipelineError::IndexUnavailable {
                message: format!("Malformed record on line {} of {}: {}", idx + 1, path.display(), e),
                retryable: false,
            })?;
            store.add_document(document)?;
        }

        info!("Loaded vector index with {} documents from {}", store.len(), path.display());
        Ok(store)
    }

    /// Get document by ID
    pub fn get_document(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Get number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Exact top-k search over tables. A table with several vectors is ranked by
    /// its best-scoring one. Ties are broken by id so results are stable.
    pub fn search_sync(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        if query_embedding.len() != self.dimension {
            return Err(PipelineError::Configuration(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query_embedding.len(),
                self.dimension
            )));
        }

        let mut best: HashMap<&str, f32> = HashMap::new();
        for doc in self.documents.values() {
            let table = doc.table_name.as_deref().unwrap_or(doc.id.as_str());
            let score = cosine_similarity(query_embedding, &doc.embedding);
            best.entry(table)
                .and_modify(|s| *s = s.max(score))
                .or_insert(score);
        }

        let mut results: Vec<Neighbor> = best
            .into_iter()
            .map(|(id, score)| Neighbor {
                id: id.to_string(),
                score,
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(top_k);

        Ok(results)
    }
}

#[async_trait]
impl NeighborIndex for InMemoryVectorStore {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_sync(vector, k)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
