//! SQL Generator
//!
//! Turns a request plus schema context into a bare SQL statement.

use crate::error::{PipelineError, Result};
use crate::execution_loop::error_recovery::FailureContext;
use crate::llm::{strip_code_fences, LanguageModel, GENERATOR_ROLE};
use crate::safety::with_timeout;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A non-empty SQL statement with no surrounding markup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SqlCandidate(String);

impl SqlCandidate {
    /// `None` when `sql` is blank.
    pub fn new(sql: impl Into<String>) -> Option<Self> {
        let sql = sql.into();
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SqlCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// `failure` is only set on repair calls.
    async fn generate(
        &self,
        request: &str,
        schema_context: &str,
        failure: Option<&FailureContext>,
    ) -> Result<SqlCandidate>;
}

/// Generator backed by a language model
pub struct LlmSqlGenerator {
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
    dialect: String,
    dataset: Option<String>,
    reference_docs: Option<String>,
}

impl LlmSqlGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, timeout: Duration, dialect: impl Into<String>) -> Self {
        Self {
            llm,
            timeout,
            dialect: dialect.into(),
            dataset: None,
            reference_docs: None,
        }
    }

    pub fn with_dataset(mut self, dataset: Option<String>) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_reference_docs(mut self, docs: Option<String>) -> Self {
        self.reference_docs = docs;
        self
    }

    fn build_prompt(&self, request: &str, schema_context: &str, failure: Option<&FailureContext>) -> String {
        let mut parts = Vec::new();
        parts.push(GENERATOR_ROLE.to_string());
        parts.push(format!("Write one {} statement that answers the question.", self.dialect));
        parts.push(String::new());
        parts.push("SCHEMA:".to_string());
        parts.push(schema_context.to_string());
        parts.push(String::new());
        parts.push(format!("QUESTION: {}", request));

        if let Some(ref docs) = self.reference_docs {
            parts.push(String::new());
            parts.push("REFERENCE DOCUMENTATION:".to_string());
            parts.push(docs.clone());
        }

        if let Some(failure) = failure {
            parts.push(String::new());
            parts.push(failure.to_prompt_section(request));
        }

        parts.push(String::new());
        parts.push("INSTRUCTIONS:".to_string());
        if let Some(ref dataset) = self.dataset {
            parts.push(format!(
                "- All tables live in dataset {}; always fully qualify them (e.g. {}.table_name).",
                dataset, dataset
            ));
        }
        parts.push("- Use only tables and columns listed in SCHEMA.".to_string());
        parts.push("- Use clear, self-documenting aliases (e.g. COUNT(*) AS num_users).".to_string());
        parts.push("- Return raw SQL only: no markdown, no comments, no prose.".to_string());

        parts.join("\n")
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(
        &self,
        request: &str,
        schema_context: &str,
        failure: Option<&FailureContext>,
    ) -> Result<SqlCandidate> {
        let prompt = self.build_prompt(request, schema_context, failure);
        debug!("Generation prompt ({} chars)", prompt.len());

        let raw = with_timeout("sql generation", self.timeout, async {
            self.llm.complete(&prompt).await.map_err(|e| match e {
                PipelineError::Timeout { .. } => e,
                other => PipelineError::GenerationFailed(other.to_string()),
            })
        })
        .await?;

        let candidate = SqlCandidate::new(clean_sql(&raw))
            .ok_or_else(|| PipelineError::GenerationFailed("model returned empty SQL".to_string()))?;

        info!(
            "Generated SQL{}: {}",
            failure.map(|f| format!(" (repair {})", f.attempt)).unwrap_or_default(),
            candidate
        );
        Ok(candidate)
    }
}

/// Strip fences, a leading `SQL:` label, a `{"sql": "..."}` wrapper and
/// trailing semicolons from a model reply.
pub fn clean_sql(raw: &str) -> String {
    let mut cleaned = strip_code_fences(raw);

    if let Some(rest) = cleaned.strip_prefix("SQL:") {
        cleaned = rest.trim().to_string();
    }

    if cleaned.starts_with('{') && cleaned.contains("\"sql\"") {
        if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
            if let Some(sql_value) = json_value.get("sql").and_then(|v| v.as_str()) {
                cleaned = strip_code_fences(sql_value);
            }
        }
    }

    cleaned.trim().trim_end_matches(';').trim().to_string()
}
