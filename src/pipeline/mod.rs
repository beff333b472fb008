//! Pipeline
//!
//! Retrieval -> availability -> generation -> validation -> repair (only on a
//! failed validation) -> execution. Stages are sequenced explicitly; the run
//! stops at the first error and cancellation is checked before every stage.

pub mod stages;
pub mod state;

pub use stages::*;
pub use state::*;

use crate::availability::AvailabilityChecker;
use crate::catalog::SchemaCatalog;
use crate::config::{PipelineConfig, Timeouts};
use crate::error::{PipelineError, Result};
use crate::execution::{DataStore, PolarsDataStore, QueryExecutor, ResultSet};
use crate::execution_loop::{RepairLoop, Transition};
use crate::generator::{LlmSqlGenerator, SqlGenerator};
use crate::llm::{LanguageModel, LlmClient};
use crate::observability::{RunLog, RunRecord};
use crate::reference::ReferenceDocs;
use crate::safety::CancellationFlag;
use crate::schema_rag::{index_catalog, Embedder, InMemoryVectorStore, NeighborIndex, OpenAiEmbedder, RankedTable, TableRetriever};
use crate::validator::{LlmSqlValidator, SqlValidator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub run_id: Uuid,
    pub user_query: String,
    pub enriched_query: String,
    pub tables: Vec<RankedTable>,
    pub sql: String,
    pub repair_attempts: u32,
    pub repair_transitions: Vec<Transition>,
    pub result: ResultSet,
}

/// Collaborators a pipeline is assembled from.
#[derive(Clone)]
pub struct PipelineComponents {
    pub catalog: Arc<SchemaCatalog>,
    pub enricher: Arc<dyn LanguageModel>,
    pub reasoner: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn NeighborIndex>,
    pub generator: Arc<dyn SqlGenerator>,
    pub validator: Arc<dyn SqlValidator>,
    pub store: Arc<dyn DataStore>,
}

/// Knobs that are not collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    pub max_repairs: u32,
    pub timeouts: Timeouts,
    pub row_limit: Option<usize>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_repairs: 1,
            timeouts: Timeouts::default(),
            row_limit: None,
        }
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            top_k: config.top_k,
            max_repairs: config.max_repairs,
            timeouts: config.timeouts.clone(),
            row_limit: config.row_limit,
        }
    }
}

pub struct Pipeline {
    catalog: Arc<SchemaCatalog>,
    retriever: Arc<TableRetriever>,
    retrieval: RetrievalStage,
    availability: AvailabilityStage,
    generation: GenerationStage,
    validation: ValidationStage,
    repair: RepairStage,
    execution: ExecutionStage,
    run_log: RunLog,
}

impl Pipeline {
    pub fn new(components: PipelineComponents, settings: PipelineSettings) -> Self {
        let PipelineComponents {
            catalog,
            enricher,
            reasoner,
            embedder,
            index,
            generator,
            validator,
            store,
        } = components;

        let retriever = Arc::new(TableRetriever::new(
            enricher,
            embedder,
            index,
            Arc::clone(&catalog),
            settings.timeouts.clone(),
        ));
        let checker = AvailabilityChecker::new(reasoner, settings.timeouts.llm);
        let executor = QueryExecutor::new(store, settings.timeouts.store).with_row_limit(settings.row_limit);

        Self {
            retrieval: RetrievalStage::new(Arc::clone(&retriever), Arc::clone(&catalog), settings.top_k),
            availability: AvailabilityStage::new(checker),
            generation: GenerationStage::new(Arc::clone(&generator)),
            validation: ValidationStage::new(Arc::clone(&validator)),
            repair: RepairStage::new(RepairLoop::new(settings.max_repairs), generator, validator),
            execution: ExecutionStage::new(executor),
            catalog,
            retriever,
            run_log: RunLog::default(),
        }
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = run_log;
        self
    }

    /// Assemble the production pipeline: OpenAI-compatible models, a JSONL
    /// or freshly embedded index, and a Polars store over `data_dir`.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        if config.is_offline() {
            warn!("No API key configured; model calls are answered offline");
        }

        let catalog = Arc::new(SchemaCatalog::load(&config.catalog_path)?);
        info!("Loaded {} tables from {}", catalog.len(), config.catalog_path.display());

        let reasoner = Arc::new(LlmClient::from_config(config)?);
        let enricher = Arc::new(LlmClient::enrichment_from_config(config)?);
        let embedder = Arc::new(OpenAiEmbedder::from_config(config)?);

        let index: Arc<dyn NeighborIndex> = match &config.index_path {
            Some(path) => Arc::new(InMemoryVectorStore::load_jsonl(path, config.embedding_dim)?),
            None => Arc::new(index_catalog(&catalog, embedder.as_ref()).await?),
        };

        let reference_docs = config
            .reference_docs_path
            .as_deref()
            .and_then(ReferenceDocs::load)
            .map(ReferenceDocs::into_string);

        let generator = Arc::new(
            LlmSqlGenerator::new(reasoner.clone(), config.timeouts.llm, config.sql_dialect.clone())
                .with_dataset(config.dataset.clone())
                .with_reference_docs(reference_docs),
        );
        let validator = Arc::new(LlmSqlValidator::new(
            reasoner.clone(),
            config.timeouts.llm,
            config.sql_dialect.clone(),
        ));
        let store = Arc::new(PolarsDataStore::new(config.data_dir.clone()).with_qualifier(config.dataset.clone()));

        let components = PipelineComponents {
            catalog,
            enricher,
            reasoner,
            embedder,
            index,
            generator,
            validator,
            store,
        };
        Ok(Self::new(components, PipelineSettings::from(config)).with_run_log(RunLog::new(config.run_log_path.clone())))
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn retriever(&self) -> &TableRetriever {
        &self.retriever
    }

    pub async fn run(&self, query: &str) -> Result<PipelineOutput> {
        self.run_with_cancellation(query, &CancellationFlag::new()).await
    }

    pub async fn run_with_cancellation(&self, query: &str, cancel: &CancellationFlag) -> Result<PipelineOutput> {
        if query.trim().is_empty() {
            return Err(PipelineError::InvalidInput("query must not be empty".to_string()));
        }

        let mut record = RunRecord::new(query);
        let mut state = PipelineState::new(query.trim());
        info!(run_id = %record.run_id, "Pipeline run started: {}", query.trim());

        let outcome = self.drive(&mut state, cancel).await;

        record.enriched_query = state.retrieval().map(|r| r.enriched_query.clone());
        record.tables = state.retrieval().map(|r| r.table_ids()).unwrap_or_default();
        record.final_sql = state.generated_sql().map(|s| s.to_string());
        record.repair_attempts = state.retry_count();

        match outcome {
            Ok(()) => {
                let output = self.finish(record.run_id, &mut state)?;
                self.run_log.record(&record.with_success(output.result.row_count()));
                Ok(output)
            }
            Err(e) => {
                self.run_log.record(&record.with_error(e.kind(), e.to_string()));
                Err(e)
            }
        }
    }

    async fn drive(&self, state: &mut PipelineState, cancel: &CancellationFlag) -> Result<()> {
        self.step(&self.retrieval, state, cancel).await?;
        self.step(&self.availability, state, cancel).await?;
        self.step(&self.generation, state, cancel).await?;
        self.step(&self.validation, state, cancel).await?;
        if !state.require_validation_status()?.is_valid() {
            self.step(&self.repair, state, cancel).await?;
        }
        self.step(&self.execution, state, cancel).await
    }

    async fn step(&self, stage: &dyn Stage, state: &mut PipelineState, cancel: &CancellationFlag) -> Result<()> {
        cancel.check(stage.name())?;
        stage.run(state).await.map_err(|e| {
            warn!("Stage '{}' failed: {}", stage.name(), e);
            e
        })
    }

    fn finish(&self, run_id: Uuid, state: &mut PipelineState) -> Result<PipelineOutput> {
        let retrieval = state.require_retrieval()?.clone();
        let sql = state.require_generated_sql()?.to_string();
        Ok(PipelineOutput {
            run_id,
            user_query: state.user_query().to_string(),
            enriched_query: retrieval.enriched_query,
            tables: retrieval.tables,
            sql,
            repair_attempts: state.retry_count(),
            repair_transitions: state.repair_transitions().to_vec(),
            result: state.take_result()?,
        })
    }
}
