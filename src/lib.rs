pub mod availability;
pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod generator;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod reference;
pub mod safety;
pub mod schema_rag;
pub mod validator;

pub use availability::{AvailabilityChecker, AvailabilityVerdict};
pub use catalog::{SchemaCatalog, SchemaDescriptor};
pub use config::PipelineConfig;
pub use error::{ErrorKind, ErrorReport, PipelineError, Result};
pub use execution::{DataStore, QueryExecutor, ResultSet};
pub use execution_loop::{RepairLoop, RepairOutcome, RepairState, RetryBudget};
pub use generator::{SqlCandidate, SqlGenerator};
pub use pipeline::{Pipeline, PipelineComponents, PipelineOutput, PipelineSettings, PipelineState, Stage};
pub use safety::CancellationFlag;
pub use schema_rag::{RetrievalResult, TableRetriever};
pub use validator::{SqlValidator, ValidationStatus};
