//! Data store contract and the guarded query executor.

use crate::error::{PipelineError, Result};
use crate::execution::result::ResultSet;
use crate::generator::SqlCandidate;
use crate::llm::strip_code_fences;
use crate::safety::with_timeout;
use crate::validator::ValidationStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Something that can run SQL and hand back rows.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Engine name (e.g. "polars")
    fn name(&self) -> &'static str;

    async fn execute(&self, sql: &str) -> Result<ResultSet>;

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Runs validated SQL against a [`DataStore`].
pub struct QueryExecutor {
    store: Arc<dyn DataStore>,
    timeout: Duration,
    row_limit: Option<usize>,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DataStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            row_limit: None,
        }
    }

    pub fn with_row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub async fn execute(&self, sql: &SqlCandidate, status: &ValidationStatus) -> Result<ResultSet> {
        if !status.is_valid() {
            warn!("Refusing to execute SQL with status '{}'", status);
            return Err(PipelineError::NotValidated);
        }

        let sql_text = strip_code_fences(sql.as_str());
        let start = Instant::now();
        info!("Executing SQL on {}: {}", self.store.name(), sql_text);

        let mut result = with_timeout("query execution", self.timeout, self.store.execute(&sql_text))
            .await
            .map_err(|e| match e {
                PipelineError::Timeout { .. } | PipelineError::ExecutionFailed(_) => e,
                other => PipelineError::ExecutionFailed(other.to_string()),
            })?;

        if let Some(limit) = self.row_limit {
            result.truncate(limit);
        }

        info!(
            "Query returned {} row(s) in {}ms{}",
            result.row_count(),
            start.elapsed().as_millis(),
            if result.truncated { " (truncated)" } else { "" }
        );
        Ok(result)
    }
}
