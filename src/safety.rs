//! Safety
//!
//! Deadlines for external calls and cooperative cancellation between stages.

use crate::error::{PipelineError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Run `fut` with a deadline. Expiry maps to [`PipelineError::Timeout`] for `stage`.
pub async fn with_timeout<F, T>(stage: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            warn!("{} timed out after {}ms (limit {:?})", stage, elapsed_ms, limit);
            Err(PipelineError::Timeout {
                stage: stage.to_string(),
                elapsed_ms,
            })
        }
    }
}

/// Shared cancellation signal, checked by the pipeline before each stage.
///
/// Cloning shares the underlying flag, so one handle can be given to the
/// caller while another travels with the run.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`PipelineError::Cancelled`] if the run has been aborted.
    pub fn check(&self, next_stage: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled(next_stage.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_stage_error() {
        let result: Result<()> = with_timeout("index lookup", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(PipelineError::Timeout { stage, .. }) => assert_eq!(stage, "index lookup"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_future_passes_through() {
        let value = with_timeout("llm", Duration::from_secs(1), async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let handle = flag.clone();
        assert!(flag.check("retrieval").is_ok());
        handle.cancel();
        assert!(matches!(flag.check("generation"), Err(PipelineError::Cancelled(s)) if s == "generation"));
    }
}
