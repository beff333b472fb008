use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Schema catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Query enrichment failed: {0}")]
    EnrichmentFailed(String),

    #[error("Embedding failed: {message}")]
    EmbeddingFailed { message: String, retryable: bool },

    #[error("Vector index unavailable: {message}")]
    IndexUnavailable { message: String, retryable: bool },

    #[error("Malformed availability verdict: {0}")]
    MalformedVerdict(String),

    #[error("SQL generation failed: {0}")]
    GenerationFailed(String),

    #[error("SQL repair budget exhausted, last validator reason: {0}")]
    Exhausted(String),

    #[error("Query execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {elapsed_ms}ms during {stage}")]
    Timeout { stage: String, elapsed_ms: u64 },

    #[error("Query cannot be answered with the available schema: {0}")]
    Unanswerable(String),

    #[error("Missing precondition: {0} has not been populated")]
    MissingPrecondition(&'static str),

    #[error("Refusing to execute SQL that has not been validated")]
    NotValidated,

    #[error("Pipeline run cancelled before {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<csv::Error> for PipelineError {
    fn from(e: csv::Error) -> Self {
        PipelineError::Io(e.into())
    }
}

/// Stable, caller-facing classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CatalogUnavailable,
    EnrichmentFailed,
    EmbeddingFailed,
    IndexUnavailable,
    MalformedVerdict,
    GenerationFailed,
    Exhausted,
    ExecutionFailed,
    Timeout,
    Unanswerable,
    MissingPrecondition,
    NotValidated,
    Cancelled,
    Configuration,
    InvalidInput,
    Llm,
    Io,
    Json,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CatalogUnavailable => "catalog_unavailable",
            ErrorKind::EnrichmentFailed => "enrichment_failed",
            ErrorKind::EmbeddingFailed => "embedding_failed",
            ErrorKind::IndexUnavailable => "index_unavailable",
            ErrorKind::MalformedVerdict => "malformed_verdict",
            ErrorKind::GenerationFailed => "generation_failed",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unanswerable => "unanswerable",
            ErrorKind::MissingPrecondition => "missing_precondition",
            ErrorKind::NotValidated => "not_validated",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "configuration",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Llm => "llm",
            ErrorKind::Io => "io",
            ErrorKind::Json => "json",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::CatalogUnavailable(_) => ErrorKind::CatalogUnavailable,
            PipelineError::EnrichmentFailed(_) => ErrorKind::EnrichmentFailed,
            PipelineError::EmbeddingFailed { .. } => ErrorKind::EmbeddingFailed,
            PipelineError::IndexUnavailable { .. } => ErrorKind::IndexUnavailable,
            PipelineError::MalformedVerdict(_) => ErrorKind::MalformedVerdict,
            PipelineError::GenerationFailed(_) => ErrorKind::GenerationFailed,
            PipelineError::Exhausted(_) => ErrorKind::Exhausted,
            PipelineError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Unanswerable(_) => ErrorKind::Unanswerable,
            PipelineError::MissingPrecondition(_) => ErrorKind::MissingPrecondition,
            PipelineError::NotValidated => ErrorKind::NotValidated,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::Llm(_) => ErrorKind::Llm,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Json(_) => ErrorKind::Json,
        }
    }

    /// Transient infrastructure failures a caller may choose to retry.
    /// The pipeline itself never retries them.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::EmbeddingFailed { retryable, .. }
            | PipelineError::IndexUnavailable { retryable, .. } => *retryable,
            PipelineError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// The caller-facing `{kind, message}` pair.
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        let report = PipelineError::Exhausted("column foo missing".to_string()).to_report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "exhausted");
        assert!(json["message"].as_str().unwrap().contains("column foo missing"));
    }

    #[test]
    fn test_execution_and_validation_failures_are_distinct() {
        let exec = PipelineError::ExecutionFailed("permission denied".to_string());
        let exhausted = PipelineError::Exhausted("unknown column".to_string());
        assert_ne!(exec.kind(), exhausted.kind());
    }

    #[test]
    fn test_retryable_classification() {
        let transient = PipelineError::EmbeddingFailed {
            message: "503".to_string(),
            retryable: true,
        };
        let fatal = PipelineError::Configuration("dimension mismatch".to_string());
        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!PipelineError::Unanswerable("no signup column".to_string()).is_retryable());
    }
}
