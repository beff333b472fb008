//! Data Availability Checker
//!
//! Decides whether a question can be answered from the schema text it is
//! given. The verdict always echoes the exact schema text that was checked.

use crate::error::{PipelineError, Result};
use crate::llm::{strip_code_fences, LanguageModel, AVAILABILITY_ROLE};
use crate::safety::with_timeout;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Handoff between availability checking and SQL generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityVerdict {
    pub available: bool,
    pub user_query: String,
    pub raw_schema_text: String,
    /// Model's short justification; not part of the encoded form.
    pub explanation: Option<String>,
}

/// Canonical wire shape: exactly three fields.
#[derive(Serialize, Deserialize)]
struct EncodedVerdict<'a> {
    available: bool,
    #[serde(borrow)]
    user_query: std::borrow::Cow<'a, str>,
    #[serde(borrow)]
    raw_schema_text: std::borrow::Cow<'a, str>,
}

/// What the reasoning model is asked to return. Only `available` is trusted.
#[derive(Deserialize)]
struct ModelReply {
    available: bool,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    missing: Option<serde_json::Value>,
}

impl AvailabilityVerdict {
    /// Bare JSON with `available`, `user_query` and `raw_schema_text`.
    pub fn encode(&self) -> String {
        let encoded = EncodedVerdict {
            available: self.available,
            user_query: self.user_query.as_str().into(),
            raw_schema_text: self.raw_schema_text.as_str().into(),
        };
        // Serializing a struct of a bool and two strings cannot fail
        serde_json::to_string(&encoded).unwrap_or_default()
    }

    /// Decode the canonical form, tolerating surrounding code fences.
    pub fn decode(text: &str) -> Result<Self> {
        let cleaned = strip_code_fences(text);
        let encoded: EncodedVerdict = serde_json::from_str(&cleaned)
            .map_err(|e| PipelineError::MalformedVerdict(format!("{}: {}", e, truncate(&cleaned, 200))))?;
        Ok(Self {
            available: encoded.available,
            user_query: encoded.user_query.into_owned(),
            raw_schema_text: encoded.raw_schema_text.into_owned(),
            explanation: None,
        })
    }
}

pub struct AvailabilityChecker {
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl AvailabilityChecker {
    pub fn new(llm: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn check(&self, query: &str, schema_text: &str) -> Result<AvailabilityVerdict> {
        let prompt = build_prompt(query, schema_text);

        // Transport failures keep their own kind; only the reply text can be malformed
        let reply = with_timeout("availability check", self.timeout, self.llm.complete(&prompt)).await?;

        let parsed = parse_reply(&reply)?;
        let explanation = parsed
            .explanation
            .filter(|e| !e.trim().is_empty())
            .or_else(|| parsed.missing.map(|m| format!("missing: {}", m)));

        if parsed.available {
            info!("Availability check: answerable");
        } else {
            warn!(
                "Availability check: not answerable ({})",
                explanation.as_deref().unwrap_or("no explanation given")
            );
        }

        Ok(AvailabilityVerdict {
            available: parsed.available,
            user_query: query.to_string(),
            raw_schema_text: schema_text.to_string(),
            explanation,
        })
    }
}

fn parse_reply(reply: &str) -> Result<ModelReply> {
    let cleaned = strip_code_fences(reply);
    if cleaned.is_empty() {
        return Err(PipelineError::MalformedVerdict("empty reply".to_string()));
    }
    let value: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| PipelineError::MalformedVerdict(format!("{}: {}", e, truncate(&cleaned, 200))))?;
    if !value.get("available").map(|v| v.is_boolean()).unwrap_or(false) {
        return Err(PipelineError::MalformedVerdict(format!(
            "reply has no boolean 'available' field: {}",
            truncate(&cleaned, 200)
        )));
    }
    serde_json::from_value(value).map_err(|e| PipelineError::MalformedVerdict(e.to_string()))
}

fn build_prompt(query: &str, schema_text: &str) -> String {
    format!(
        r#"{}
Decide whether the user's question can be answered using only the tables and columns below.

SCHEMA:
{}

USER QUESTION: "{}"

Instructions:
1. Identify which tables and columns the question needs.
2. If a required table, column, or concept (for example a timestamp for a time-window question) is absent, the question is NOT answerable.
3. Return bare JSON, no code fences, no commentary:
{{"available": true|false, "user_query": "<question verbatim>", "raw_schema_text": "<schema verbatim>", "explanation": "<one sentence naming what is missing, or why it is answerable>"}}"#,
        AVAILABILITY_ROLE, schema_text, query
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}…", head)
}
