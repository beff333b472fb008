//! Run Logging
//!
//! One structured record per pipeline run, emitted through `tracing` and
//! optionally appended to a JSON lines file.

use crate::error::{ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub user_query: String,
    pub enriched_query: Option<String>,
    pub tables: Vec<String>,
    pub final_sql: Option<String>,
    pub repair_attempts: u32,
    /// `"ok"` or the error kind
    pub outcome: String,
    pub error_message: Option<String>,
    pub row_count: Option<usize>,
    pub elapsed_ms: u64,
}

impl RunRecord {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            user_query: user_query.into(),
            enriched_query: None,
            tables: Vec::new(),
            final_sql: None,
            repair_attempts: 0,
            outcome: "pending".to_string(),
            error_message: None,
            row_count: None,
            elapsed_ms: 0,
        }
    }

    pub fn with_success(mut self, row_count: usize) -> Self {
        self.outcome = "ok".to_string();
        self.row_count = Some(row_count);
        self.finish()
    }

    pub fn with_error(mut self, kind: ErrorKind, message: String) -> Self {
        self.outcome = kind.as_str().to_string();
        self.error_message = Some(message);
        self.finish()
    }

    fn finish(mut self) -> Self {
        let now = Utc::now();
        self.elapsed_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == "ok"
    }
}

/// Append-only run log
#[derive(Debug, Default)]
pub struct RunLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Log the record; failures to persist it never fail the run.
    pub fn record(&self, record: &RunRecord) {
        info!(
            run_id = %record.run_id,
            outcome = %record.outcome,
            repair_attempts = record.repair_attempts,
            rows = ?record.row_count,
            elapsed_ms = record.elapsed_ms,
            "Pipeline run finished"
        );
        if let Err(e) = self.append(record) {
            warn!("Could not append run record {}: {}", record.run_id, e);
        }
    }

    fn append(&self, record: &RunRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Every record in the log file, oldest first.
    pub fn read_all(path: &Path) -> Result<Vec<RunRecord>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}
