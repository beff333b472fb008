//! SQL Validator
//!
//! Delegates syntax and schema checks to a judge model and decodes its
//! `valid` / `invalid: <reason>` reply.

use crate::error::Result;
use crate::generator::SqlCandidate;
use crate::llm::{strip_code_fences, LanguageModel, VALIDATOR_ROLE};
use crate::safety::with_timeout;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const GENERIC_REASON: &str = "validator rejected the query without a reason";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid(String),
}

impl ValidationStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationStatus::Valid)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ValidationStatus::Valid => None,
            ValidationStatus::Invalid(reason) => Some(reason),
        }
    }

    /// `valid`, or `invalid: <reason>`.
    pub fn encode(&self) -> String {
        match self {
            ValidationStatus::Valid => "valid".to_string(),
            ValidationStatus::Invalid(reason) => format!("invalid: {}", reason),
        }
    }

    /// Decode a judge reply by its leading token, case-insensitively.
    pub fn parse(reply: &str) -> Self {
        let cleaned = strip_code_fences(reply);
        let cleaned = cleaned.trim().trim_matches(|c| c == '"' || c == '`').trim();
        let lowered = cleaned.to_ascii_lowercase();

        // "invalid" has to be tested first since it contains "valid"
        if lowered.starts_with("invalid") {
            let rest = cleaned["invalid".len()..]
                .trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace())
                .trim();
            if rest.is_empty() {
                return ValidationStatus::Invalid(GENERIC_REASON.to_string());
            }
            return ValidationStatus::Invalid(rest.to_string());
        }

        if lowered.starts_with("valid") {
            let tail = &lowered["valid".len()..];
            if tail.chars().next().map(|c| !c.is_alphanumeric()).unwrap_or(true) {
                return ValidationStatus::Valid;
            }
        }

        ValidationStatus::Invalid(format!("unrecognised validator reply: {}", truncate(cleaned, 200)))
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[async_trait]
pub trait SqlValidator: Send + Sync {
    /// Infrastructure failures are errors; a rejected query is `Ok(Invalid)`.
    async fn validate(&self, candidate: &SqlCandidate, schema_context: &str) -> Result<ValidationStatus>;
}

pub struct LlmSqlValidator {
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
    dialect: String,
}

impl LlmSqlValidator {
    pub fn new(llm: Arc<dyn LanguageModel>, timeout: Duration, dialect: impl Into<String>) -> Self {
        Self {
            llm,
            timeout,
            dialect: dialect.into(),
        }
    }

    fn build_prompt(&self, candidate: &SqlCandidate, schema_context: &str) -> String {
        let mut parts = Vec::new();
        parts.push(VALIDATOR_ROLE.to_string());
        parts.push(format!(
            "Check the query below for {} syntax errors and for references to tables or columns that do not exist.",
            self.dialect
        ));
        if !schema_context.trim().is_empty() {
            parts.push(String::new());
            parts.push("SCHEMA:".to_string());
            parts.push(schema_context.to_string());
        }
        parts.push(String::new());
        parts.push("SQL:".to_string());
        parts.push(candidate.as_str().to_string());
        parts.push(String::new());
        parts.push("Reply with exactly one line:".to_string());
        parts.push("- valid".to_string());
        parts.push("- invalid: <short reason>".to_string());
        parts.join("\n")
    }
}

#[async_trait]
impl SqlValidator for LlmSqlValidator {
    async fn validate(&self, candidate: &SqlCandidate, schema_context: &str) -> Result<ValidationStatus> {
        let prompt = self.build_prompt(candidate, schema_context);
        let reply = with_timeout("sql validation", self.timeout, self.llm.complete(&prompt)).await?;

        let status = ValidationStatus::parse(&reply);
        match &status {
            ValidationStatus::Valid => info!("Validator accepted SQL"),
            ValidationStatus::Invalid(reason) => warn!("Validator rejected SQL: {}", reason),
        }
        Ok(status)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}…", head)
}
