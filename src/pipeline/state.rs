//! Per-run pipeline state.
//!
//! Every field is filled by exactly one stage. Reading a field before its
//! producer has run fails with [`PipelineError::MissingPrecondition`].

use crate::availability::AvailabilityVerdict;
use crate::error::{PipelineError, Result};
use crate::execution::ResultSet;
use crate::execution_loop::Transition;
use crate::generator::SqlCandidate;
use crate::schema_rag::RetrievalResult;
use crate::validator::ValidationStatus;

#[derive(Debug, Clone)]
pub struct PipelineState {
    user_query: String,
    retrieval: Option<RetrievalResult>,
    table_context: Option<String>,
    verdict: Option<AvailabilityVerdict>,
    generated_sql: Option<SqlCandidate>,
    validation_status: Option<ValidationStatus>,
    retry_count: u32,
    repair_transitions: Vec<Transition>,
    result: Option<ResultSet>,
    execution_error: Option<String>,
}

macro_rules! required {
    ($field:ident, $getter:ident, $setter:ident, $ty:ty) => {
        pub fn $getter(&self) -> Result<&$ty> {
            self.$field
                .as_ref()
                .ok_or(PipelineError::MissingPrecondition(stringify!($field)))
        }

        pub fn $setter(&mut self, value: $ty) {
            self.$field = Some(value);
        }
    };
}

impl PipelineState {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            retrieval: None,
            table_context: None,
            verdict: None,
            generated_sql: None,
            validation_status: None,
            retry_count: 0,
            repair_transitions: Vec::new(),
            result: None,
            execution_error: None,
        }
    }

    pub fn user_query(&self) -> &str {
        &self.user_query
    }

    required!(retrieval, require_retrieval, set_retrieval, RetrievalResult);
    required!(table_context, require_table_context, set_table_context, String);
    required!(verdict, require_verdict, set_verdict, AvailabilityVerdict);
    required!(generated_sql, require_generated_sql, set_generated_sql, SqlCandidate);
    required!(validation_status, require_validation_status, set_validation_status, ValidationStatus);
    required!(result, require_result, set_result, ResultSet);

    pub fn retrieval(&self) -> Option<&RetrievalResult> {
        self.retrieval.as_ref()
    }

    pub fn generated_sql(&self) -> Option<&SqlCandidate> {
        self.generated_sql.as_ref()
    }

    pub fn validation_status(&self) -> Option<&ValidationStatus> {
        self.validation_status.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn repair_transitions(&self) -> &[Transition] {
        &self.repair_transitions
    }

    pub fn record_repair(&mut self, attempts: u32, transitions: Vec<Transition>) {
        self.retry_count = attempts;
        self.repair_transitions = transitions;
    }

    pub fn execution_error(&self) -> Option<&str> {
        self.execution_error.as_deref()
    }

    pub fn set_execution_error(&mut self, message: impl Into<String>) {
        self.execution_error = Some(message.into());
    }

    pub fn take_result(&mut self) -> Result<ResultSet> {
        self.result.take().ok_or(PipelineError::MissingPrecondition("result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpopulated_field_is_missing_precondition() {
        let state = PipelineState::new("q");
        let err = state.require_generated_sql().unwrap_err();
        assert!(matches!(err, PipelineError::MissingPrecondition("generated_sql")));
        assert!(matches!(
            state.require_table_context().unwrap_err(),
            PipelineError::MissingPrecondition("table_context")
        ));
    }

    #[test]
    fn test_populated_field_is_readable() {
        let mut state = PipelineState::new("q");
        state.set_validation_status(ValidationStatus::Valid);
        assert!(state.require_validation_status().unwrap().is_valid());
        assert_eq!(state.retry_count(), 0);
    }
}
