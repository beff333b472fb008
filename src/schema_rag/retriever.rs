//! Schema RAG Retriever
//!
//! Rewrites the user query, embeds it, and ranks catalog tables by vector
//! similarity.

use crate::catalog::SchemaCatalog;
use crate::config::Timeouts;
use crate::error::{PipelineError, Result};
use crate::llm::{LanguageModel, ENRICHMENT_ROLE};
use crate::safety::with_timeout;
use crate::schema_rag::embedder::Embedder;
use crate::schema_rag::vector_store::{Document, InMemoryVectorStore, Neighbor, NeighborIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTable {
    pub id: String,
    pub score: f32,
}

/// Output of retrieval: the rewritten query plus catalog tables ranked most
/// similar first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub enriched_query: String,
    pub tables: Vec<RankedTable>,
}

impl RetrievalResult {
    pub fn table_ids(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

pub struct TableRetriever {
    enricher: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn NeighborIndex>,
    catalog: Arc<SchemaCatalog>,
    timeouts: Timeouts,
}

impl TableRetriever {
    pub fn new(
        enricher: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn NeighborIndex>,
        catalog: Arc<SchemaCatalog>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            enricher,
            embedder,
            index,
            catalog,
            timeouts,
        }
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult> {
        let enriched_query = self.enrich(query).await?;
        debug!("Enriched query: {}", enriched_query);

        if k == 0 {
            return Ok(RetrievalResult {
                enriched_query,
                tables: Vec::new(),
            });
        }

        let embedding = with_timeout("embedding", self.timeouts.embedding, async {
            self.embedder.embed(&enriched_query).await.map_err(as_embedding_error)
        })
        .await?;

        if embedding.len() != self.index.dimension() {
            return Err(PipelineError::Configuration(format!(
                "Query embedding has {} dimensions but the index expects {}",
                embedding.len(),
                self.index.dimension()
            )));
        }

        // Stale or unknown ids are skipped, so widen the request until `k`
        // catalog tables are found or the index runs out.
        let mut fetch = k;
        let tables = loop {
            let neighbors = with_timeout("index lookup", self.timeouts.index, async {
                self.index.search(&embedding, fetch).await.map_err(as_index_error)
            })
            .await?;
            let exhausted = neighbors.len() < fetch;
            let tables = self.rank_known(neighbors, k);
            if tables.len() >= k || exhausted {
                break tables;
            }
            debug!("Only {} catalog table(s) in top {}; widening search", tables.len(), fetch);
            fetch = fetch.saturating_mul(2);
        };

        info!(
            "Retrieved {} table(s): {:?}",
            tables.len(),
            tables.iter().map(|t| t.id.as_str()).collect::<Vec<_>>()
        );

        Ok(RetrievalResult { enriched_query, tables })
    }

    /// Keep catalog tables only, best score per table, highest first, at most `k`.
    fn rank_known(&self, neighbors: Vec<Neighbor>, k: usize) -> Vec<RankedTable> {
        let mut tables: Vec<RankedTable> = neighbors
            .into_iter()
            .filter(|n| {
                let known = self.catalog.contains(&n.id);
                if !known {
                    debug!("Dropping neighbour '{}' which is not in the schema catalog", n.id);
                }
                known
            })
            .map(|n| RankedTable { id: n.id, score: n.score })
            .collect();

        tables.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let mut seen = HashSet::new();
        tables.retain(|t| seen.insert(t.id.clone()));
        tables.truncate(k);
        tables
    }

    async fn enrich(&self, query: &str) -> Result<String> {
        let prompt = format!(
            "{}\nRewrite the following short user query into a detailed data-analysis request. \
             Clarify goals, metrics, filters, and time windows. Return only the rewritten request.\n\n\
             User query: {}\nDetailed request:",
            ENRICHMENT_ROLE, query
        );

        let rewritten = with_timeout("query enrichment", self.timeouts.llm, async {
            self.enricher.complete(&prompt).await.map_err(|e| match e {
                PipelineError::Timeout { .. } => e,
                other => PipelineError::EnrichmentFailed(other.to_string()),
            })
        })
        .await?;

        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return Err(PipelineError::EnrichmentFailed(
                "query rewriting model returned empty text".to_string(),
            ));
        }
        Ok(rewritten.to_string())
    }
}

/// Embed every catalog table's description into a fresh in-memory index.
/// Used when no pre-built index file is configured.
pub async fn index_catalog(catalog: &SchemaCatalog, embedder: &dyn Embedder) -> Result<InMemoryVectorStore> {
    let mut store = InMemoryVectorStore::new(embedder.dimension());
    for name in catalog.table_names() {
        let text = catalog.describe_tables(&[name.as_str()]);
        let embedding = embedder.embed(&text).await.map_err(as_embedding_error)?;
        store.add_document(Document {
            id: name.clone(),
            table_name: Some(name),
            text,
            embedding,
        })?;
    }
    info!("Indexed {} catalog tables in memory", store.len());
    Ok(store)
}

fn as_embedding_error(e: PipelineError) -> PipelineError {
    match e {
        PipelineError::EmbeddingFailed { .. }
        | PipelineError::Timeout { .. }
        | PipelineError::Configuration(_) => e,
        other => PipelineError::EmbeddingFailed {
            message: other.to_string(),
            retryable: false,
        },
    }
}

fn as_index_error(e: PipelineError) -> PipelineError {
    match e {
        PipelineError::IndexUnavailable { .. }
        | PipelineError::Timeout { .. }
        | PipelineError::Configuration(_) => e,
        other => PipelineError::IndexUnavailable {
            message: other.to_string(),
            retryable: false,
        },
    }
}
