//! Pipeline Configuration
//!
//! Settings are read from the process environment (after `.env` has been
//! loaded by the binary) with defaults for everything except credentials.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// API key value that switches the model clients into offline mode.
pub const DUMMY_API_KEY: &str = "dummy-api-key";

/// Per-collaborator call timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub llm: Duration,
    pub embedding: Duration,
    pub index: Duration,
    pub store: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            llm: Duration::from_secs(60),
            embedding: Duration::from_secs(30),
            index: Duration::from_secs(10),
            store: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub api_key: String,
    pub base_url: String,
    /// Model used for availability, generation and validation
    pub llm_model: String,
    /// Model used to rewrite the user query before retrieval
    pub enrichment_model: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub top_k: usize,
    /// Repair cycles allowed after the first validation
    pub max_repairs: u32,
    pub timeouts: Timeouts,
    pub catalog_path: PathBuf,
    pub index_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub reference_docs_path: Option<PathBuf>,
    pub run_log_path: Option<PathBuf>,
    pub sql_dialect: String,
    /// When set, generated SQL must qualify every table with this dataset
    pub dataset: Option<String>,
    pub row_limit: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: DUMMY_API_KEY.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            enrichment_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dim: 1536,
            top_k: 3,
            max_repairs: 1,
            timeouts: Timeouts::default(),
            catalog_path: PathBuf::from("configs"),
            index_path: None,
            data_dir: PathBuf::from("data"),
            reference_docs_path: None,
            run_log_path: None,
            sql_dialect: "ANSI SQL".to_string(),
            dataset: None,
            row_limit: None,
        }
    }
}

impl PipelineConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| lookup(k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        let llm_model = get(&["ECHOQL_LLM_MODEL", "FAST_LLM_MODEL"]).unwrap_or(defaults.llm_model);
        let enrichment_model = get(&["ECHOQL_ENRICHMENT_MODEL"]).unwrap_or_else(|| llm_model.clone());

        let timeouts = Timeouts {
            llm: parse_secs(get(&["ECHOQL_LLM_TIMEOUT_SECS"]), "ECHOQL_LLM_TIMEOUT_SECS", defaults.timeouts.llm)?,
            embedding: parse_secs(
                get(&["ECHOQL_EMBEDDING_TIMEOUT_SECS"]),
                "ECHOQL_EMBEDDING_TIMEOUT_SECS",
                defaults.timeouts.embedding,
            )?,
            index: parse_secs(get(&["ECHOQL_INDEX_TIMEOUT_SECS"]), "ECHOQL_INDEX_TIMEOUT_SECS", defaults.timeouts.index)?,
            store: parse_secs(get(&["ECHOQL_STORE_TIMEOUT_SECS"]), "ECHOQL_STORE_TIMEOUT_SECS", defaults.timeouts.store)?,
        };

        let config = Self {
            api_key: get(&["OPENAI_API_KEY"]).unwrap_or(defaults.api_key),
            base_url: get(&["OPENAI_BASE_URL"]).unwrap_or(defaults.base_url),
            llm_model,
            enrichment_model,
            embedding_model: get(&["ECHOQL_EMBEDDING_MODEL", "EMBEDDING_MODEL"]).unwrap_or(defaults.embedding_model),
            embedding_dim: parse_or(get(&["ECHOQL_EMBEDDING_DIM", "EMBEDDING_DIM"]), "ECHOQL_EMBEDDING_DIM", defaults.embedding_dim)?,
            top_k: parse_or(get(&["ECHOQL_TOP_K"]), "ECHOQL_TOP_K", defaults.top_k)?,
            max_repairs: parse_or(get(&["ECHOQL_MAX_REPAIRS"]), "ECHOQL_MAX_REPAIRS", defaults.max_repairs)?,
            timeouts,
            catalog_path: get(&["ECHOQL_CATALOG_PATH"]).map(PathBuf::from).unwrap_or(defaults.catalog_path),
            index_path: get(&["ECHOQL_INDEX_PATH"]).map(PathBuf::from),
            data_dir: get(&["ECHOQL_DATA_DIR"]).map(PathBuf::from).unwrap_or(defaults.data_dir),
            reference_docs_path: get(&["ECHOQL_REFERENCE_DOCS"]).map(PathBuf::from),
            run_log_path: get(&["ECHOQL_RUN_LOG"]).map(PathBuf::from),
            sql_dialect: get(&["ECHOQL_SQL_DIALECT"]).unwrap_or(defaults.sql_dialect),
            dataset: get(&["ECHOQL_DATASET"]),
            row_limit: match get(&["ECHOQL_ROW_LIMIT"]) {
                Some(v) => Some(parse_value(&v, "ECHOQL_ROW_LIMIT")?),
                None => None,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(PipelineError::Configuration(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(PipelineError::Configuration("base URL must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn is_offline(&self) -> bool {
        self.api_key == DUMMY_API_KEY
    }
}

fn parse_value<T: FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| PipelineError::Configuration(format!("{} has an invalid value: '{}'", key, raw)))
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        Some(v) => parse_value(&v, key),
        None => Ok(default),
    }
}

fn parse_secs(raw: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match raw {
        Some(v) => {
            let secs: f64 = parse_value(&v, key)?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(PipelineError::Configuration(format!(
                    "{} must be a positive number of seconds, got '{}'",
                    key, v
                )));
            }
            Ok(Duration::from_secs_f64(secs))
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_repairs, 1);
        assert_eq!(config.top_k, 3);
        assert!(config.is_offline());
        assert_eq!(config.enrichment_model, config.llm_model);
    }

    #[test]
    fn test_overrides_and_fallback_keys() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("FAST_LLM_MODEL", "gemini-2.0-flash"),
            ("EMBEDDING_DIM", "768"),
            ("ECHOQL_MAX_REPAIRS", "3"),
            ("ECHOQL_STORE_TIMEOUT_SECS", "2.5"),
            ("ECHOQL_DATASET", "Mock_KPIs"),
        ]))
        .unwrap();
        assert_eq!(config.llm_model, "gemini-2.0-flash");
        assert_eq!(config.embedding_dim, 768);
        assert_eq!(config.max_repairs, 3);
        assert_eq!(config.timeouts.store, Duration::from_millis(2500));
        assert_eq!(config.dataset.as_deref(), Some("Mock_KPIs"));
    }

    #[test]
    fn test_invalid_numbers_are_configuration_errors() {
        let err = PipelineConfig::from_lookup(lookup(&[("ECHOQL_TOP_K", "three")])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));

        let err = PipelineConfig::from_lookup(lookup(&[("ECHOQL_LLM_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));

        let err = PipelineConfig::from_lookup(lookup(&[("EMBEDDING_DIM", "0")])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
