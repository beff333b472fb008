use crate::config::{PipelineConfig, DUMMY_API_KEY};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tracing::debug;

/// First line of the query rewriting prompt.
pub const ENRICHMENT_ROLE: &str = "You are a query rewriting assistant for data analysis.";
/// First line of the availability prompt.
pub const AVAILABILITY_ROLE: &str = "You are the Data Availability Checker.";
/// First line of the generation prompt.
pub const GENERATOR_ROLE: &str = "You are a SQL generator.";
/// First line of the validation prompt.
pub const VALIDATOR_ROLE: &str = "You are a SQL validator.";

lazy_static::lazy_static! {
    static ref LEADING_FENCE: Regex = Regex::new(r"^\s*```(?:[A-Za-z0-9_-]*[ \t]*\r?\n)?").unwrap();
    static ref TRAILING_FENCE: Regex = Regex::new(r"\r?\n?[ \t]*```\s*$").unwrap();
    static ref TABLE_LINE: Regex = Regex::new(r"(?m)^Table:\s*([A-Za-z0-9_.`]+)").unwrap();
    static ref USER_QUERY_LINE: Regex = Regex::new(r"(?m)^User query:\s*(.+)$").unwrap();
}

/// Text-in, text-out reasoning model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Remove markdown code fences wrapped around a model reply.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let without_leading = LEADING_FENCE.replace(trimmed, "");
    let without_trailing = TRAILING_FENCE.replace(&without_leading, "");
    without_trailing.trim().to_string()
}

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            base_url,
            model,
            timeout,
            http,
        })
    }

    /// Client for the main reasoning model.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.api_key.clone(),
            config.llm_model.clone(),
            config.base_url.clone(),
            config.timeouts.llm,
        )
    }

    /// Client for the query rewriting model.
    pub fn enrichment_from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.api_key.clone(),
            config.enrichment_model.clone(),
            config.base_url.clone(),
            config.timeouts.llm,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn call_llm(&self, prompt: &str) -> Result<String> {
        if self.api_key == DUMMY_API_KEY {
            return Ok(dummy_response(prompt));
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.0,
        });

        debug!("Calling {} ({} prompt chars)", self.model, prompt.len());

        let response = self
            .http
            .post(&format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout {
                        stage: format!("llm call ({})", self.model),
                        elapsed_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    PipelineError::Llm(format!("LLM API call failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PipelineError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(PipelineError::Llm(format!("LLM API error: {}", error)));
        }

        let content = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| PipelineError::Llm("No message content in LLM response".to_string()))?;

        Ok(content.to_string())
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.call_llm(prompt).await
    }
}

/// Deterministic offline replies, keyed on the prompt's role line.
fn dummy_response(prompt: &str) -> String {
    let role = prompt.lines().next().unwrap_or("").trim();

    if role == ENRICHMENT_ROLE {
        return USER_QUERY_LINE
            .captures(prompt)
            .map(|c| format!("Detailed analysis request: {}", c[1].trim()))
            .unwrap_or_else(|| "Detailed analysis request".to_string());
    }

    if role == AVAILABILITY_ROLE {
        return serde_json::json!({
            "available": true,
            "user_query": "",
            "raw_schema_text": "",
            "explanation": "offline mode assumes the query is answerable"
        })
        .to_string();
    }

    if role == VALIDATOR_ROLE {
        return "valid".to_string();
    }

    if role == GENERATOR_ROLE {
        let table = TABLE_LINE
            .captures(prompt)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "dual".to_string());
        return format!("SELECT * FROM {} LIMIT 10", table);
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```  "), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```SELECT 1```"), "SELECT 1");
        assert_eq!(strip_code_fences("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn test_dummy_generator_uses_first_table() {
        let prompt = format!("{}\nSchema:\nTable: mock_users\nDescription: users", GENERATOR_ROLE);
        assert_eq!(dummy_response(&prompt), "SELECT * FROM mock_users LIMIT 10");
    }

    #[tokio::test]
    async fn test_dummy_client_answers_without_network() {
        let client = LlmClient::new(
            DUMMY_API_KEY.to_string(),
            "gpt-4o-mini".to_string(),
            "http://localhost".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        let reply = client.complete(&format!("{}\nSQL: SELECT 1", VALIDATOR_ROLE)).await.unwrap();
        assert_eq!(reply, "valid");
    }
}
