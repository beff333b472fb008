//! Polars Data Store
//!
//! Local data store over a directory of CSV and Parquet files. Each file is
//! registered as a table named after its file stem and queried through the
//! Polars SQL context.

use crate::error::{PipelineError, Result};
use crate::execution::engine::DataStore;
use crate::execution::result::ResultSet;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct PolarsDataStore {
    data_dir: PathBuf,
    /// Dataset prefix stripped from table references before execution
    qualifier: Option<String>,
}

impl PolarsDataStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            qualifier: None,
        }
    }

    /// Treat `<dataset>.<table>` references as local `<table>` files.
    pub fn with_qualifier(mut self, dataset: Option<String>) -> Self {
        self.qualifier = dataset.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Tables found in the data directory, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = table_files(&self.data_dir)?.into_iter().map(|(name, _)| name).collect();
        names.sort();
        Ok(names)
    }

    fn unqualify(&self, sql: &str) -> Result<String> {
        match &self.qualifier {
            None => Ok(sql.to_string()),
            Some(dataset) => {
                let pattern = format!(r"`?\b{}\b`?\s*\.\s*", regex::escape(dataset));
                let re = Regex::new(&pattern)
                    .map_err(|e| PipelineError::Configuration(format!("Bad dataset qualifier '{}': {}", dataset, e)))?;
                Ok(re.replace_all(sql, "").into_owned())
            }
        }
    }
}

#[async_trait]
impl DataStore for PolarsDataStore {
    fn name(&self) -> &'static str {
        "polars"
    }

    async fn execute(&self, sql: &str) -> Result<ResultSet> {
        let sql = self.unqualify(sql)?;
        let data_dir = self.data_dir.clone();

        tokio::task::spawn_blocking(move || run_sql(&data_dir, &sql))
            .await
            .map_err(|e| PipelineError::ExecutionFailed(format!("Polars worker failed: {}", e)))?
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.data_dir.is_dir())
    }
}

fn run_sql(data_dir: &Path, sql: &str) -> Result<ResultSet> {
    let mut ctx = SQLContext::new();
    let tables = table_files(data_dir)?;
    if tables.is_empty() {
        return Err(PipelineError::ExecutionFailed(format!(
            "No CSV or Parquet tables found in {}",
            data_dir.display()
        )));
    }

    for (name, path) in &tables {
        let lf = load_table(path)?;
        debug!("Registered table '{}' from {}", name, path.display());
        ctx.register(name, lf);
    }

    let df = ctx
        .execute(sql)
        .and_then(|lf| lf.collect())
        .map_err(|e| PipelineError::ExecutionFailed(e.to_string()))?;

    info!("Polars returned {} row(s) x {} column(s)", df.height(), df.width());
    ResultSet::from_dataframe(&df)
}

fn load_table(path: &Path) -> Result<LazyFrame> {
    let is_parquet = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("parquet"))
        .unwrap_or(false);

    if is_parquet {
        LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .map_err(|e| PipelineError::ExecutionFailed(format!("Failed to load Parquet {}: {}", path.display(), e)))
    } else {
        LazyCsvReader::new(path)
            .with_has_header(true)
            .finish()
            .map_err(|e| PipelineError::ExecutionFailed(format!("Failed to load CSV {}: {}", path.display(), e)))
    }
}

/// `(table name, path)` for every `.csv` / `.parquet` file directly under `dir`.
fn table_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        PipelineError::ExecutionFailed(format!("Cannot read data directory {}: {}", dir.display(), e))
    })?;

    let mut tables = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if !matches!(ext.as_deref(), Some("csv") | Some("parquet")) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            tables.push((stem.to_string(), path.clone()));
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn sessions_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("mock_user_sessions.csv"),
            "session_id,user_id,duration_min,session_date\n\
             1,10,5,2024-01-01\n\
             2,10,7,2024-01-02\n\
             3,11,3,2024-01-02\n\
             4,12,9,2024-01-03\n\
             5,10,1,2024-01-04\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not a table").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_group_by_returns_one_row_per_user() {
        let dir = sessions_dir();
        let store = PolarsDataStore::new(dir.path());
        let result = store
            .execute(
                "SELECT user_id, COUNT(*) AS num_sessions FROM mock_user_sessions \
                 GROUP BY user_id ORDER BY user_id",
            )
            .await
            .unwrap();

        assert_eq!(result.column_names(), vec!["user_id", "num_sessions"]);
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.rows[0][0], json!(10));
        assert_eq!(result.rows[0][1], json!(3));
    }

    #[tokio::test]
    async fn test_dataset_qualifier_is_stripped() {
        let dir = sessions_dir();
        let store = PolarsDataStore::new(dir.path()).with_qualifier(Some("Mock_KPIs".to_string()));
        let result = store
            .execute("SELECT COUNT(*) AS n FROM `Mock_KPIs`.mock_user_sessions")
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], json!(5));
    }

    #[tokio::test]
    async fn test_unknown_table_is_execution_failure() {
        let dir = sessions_dir();
        let err = PolarsDataStore::new(dir.path())
            .execute("SELECT * FROM nope")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExecutionFailed(_)));
    }

    #[test]
    fn test_table_names_skip_other_files() {
        let dir = sessions_dir();
        let names = PolarsDataStore::new(dir.path()).table_names().unwrap();
        assert_eq!(names, vec!["mock_user_sessions"]);
    }
}
