//! Pipeline stages
//!
//! Each stage reads the fields it needs from [`PipelineState`], calls one
//! collaborator and writes its own output back.

use crate::availability::AvailabilityChecker;
use crate::catalog::SchemaCatalog;
use crate::error::{PipelineError, Result};
use crate::execution::QueryExecutor;
use crate::execution_loop::{RepairLoop, RepairState};
use crate::generator::SqlGenerator;
use crate::pipeline::state::PipelineState;
use crate::schema_rag::TableRetriever;
use crate::validator::SqlValidator;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &mut PipelineState) -> Result<()>;
}

/// Narrows the catalog to the tables most similar to the query.
pub struct RetrievalStage {
    retriever: Arc<TableRetriever>,
    catalog: Arc<SchemaCatalog>,
    top_k: usize,
}

impl RetrievalStage {
    pub fn new(retriever: Arc<TableRetriever>, catalog: Arc<SchemaCatalog>, top_k: usize) -> Self {
        Self {
            retriever,
            catalog,
            top_k,
        }
    }
}

#[async_trait]
impl Stage for RetrievalStage {
    fn name(&self) -> &'static str {
        "retrieval"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let retrieval = self.retriever.retrieve(state.user_query(), self.top_k).await?;

        let context = if retrieval.is_empty() {
            warn!("Retrieval matched no catalog tables; using the full catalog as schema context");
            self.catalog.describe()
        } else {
            self.catalog.describe_tables(&retrieval.table_ids())
        };

        state.set_table_context(context);
        state.set_retrieval(retrieval);
        Ok(())
    }
}

pub struct AvailabilityStage {
    checker: AvailabilityChecker,
}

impl AvailabilityStage {
    pub fn new(checker: AvailabilityChecker) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl Stage for AvailabilityStage {
    fn name(&self) -> &'static str {
        "availability"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let schema_text = state.require_table_context()?.clone();
        let verdict = self.checker.check(state.user_query(), &schema_text).await?;
        let available = verdict.available;
        let explanation = verdict.explanation.clone();
        state.set_verdict(verdict);

        if !available {
            return Err(unanswerable(explanation));
        }
        Ok(())
    }
}

fn unanswerable(explanation: Option<String>) -> PipelineError {
    PipelineError::Unanswerable(explanation.unwrap_or_else(|| {
        "the available tables do not contain the data this question needs".to_string()
    }))
}

pub struct GenerationStage {
    generator: Arc<dyn SqlGenerator>,
}

impl GenerationStage {
    pub fn new(generator: Arc<dyn SqlGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Stage for GenerationStage {
    fn name(&self) -> &'static str {
        "generation"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let verdict = state.require_verdict()?;
        if !verdict.available {
            return Err(unanswerable(verdict.explanation.clone()));
        }
        let sql = self
            .generator
            .generate(&verdict.user_query, &verdict.raw_schema_text, None)
            .await?;
        state.set_generated_sql(sql);
        Ok(())
    }
}

pub struct ValidationStage {
    validator: Arc<dyn SqlValidator>,
}

impl ValidationStage {
    pub fn new(validator: Arc<dyn SqlValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let sql = state.require_generated_sql()?;
        let schema_text = &state.require_verdict()?.raw_schema_text;
        let status = self.validator.validate(sql, schema_text).await?;
        state.set_validation_status(status);
        Ok(())
    }
}

/// Drives the repair loop after a failed validation.
pub struct RepairStage {
    repair_loop: RepairLoop,
    generator: Arc<dyn SqlGenerator>,
    validator: Arc<dyn SqlValidator>,
}

impl RepairStage {
    pub fn new(repair_loop: RepairLoop, generator: Arc<dyn SqlGenerator>, validator: Arc<dyn SqlValidator>) -> Self {
        Self {
            repair_loop,
            generator,
            validator,
        }
    }
}

#[async_trait]
impl Stage for RepairStage {
    fn name(&self) -> &'static str {
        "repair"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let status = state.require_validation_status()?.clone();
        if status.is_valid() {
            return Ok(());
        }
        let candidate = state.require_generated_sql()?.clone();
        let verdict = state.require_verdict()?;

        let outcome = self
            .repair_loop
            .resume(
                &verdict.user_query,
                &verdict.raw_schema_text,
                candidate,
                status,
                self.generator.as_ref(),
                self.validator.as_ref(),
            )
            .await?;

        info!(
            "Repair finished in state {} after {} cycle(s)",
            outcome.state, outcome.attempts
        );
        state.record_repair(outcome.attempts, outcome.transitions.clone());
        state.set_generated_sql(outcome.candidate.clone());
        state.set_validation_status(outcome.status.clone());

        if outcome.state != RepairState::Valid {
            outcome.into_validated()?;
        }
        Ok(())
    }
}

pub struct ExecutionStage {
    executor: QueryExecutor,
}

impl ExecutionStage {
    pub fn new(executor: QueryExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Stage for ExecutionStage {
    fn name(&self) -> &'static str {
        "execution"
    }

    async fn run(&self, state: &mut PipelineState) -> Result<()> {
        let sql = state.require_generated_sql()?;
        let status = state.require_validation_status()?;
        match self.executor.execute(sql, status).await {
            Ok(result) => {
                state.set_result(result);
                Ok(())
            }
            Err(e) => {
                state.set_execution_error(e.to_string());
                Err(e)
            }
        }
    }
}
