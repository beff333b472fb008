//! Repair Loop
//!
//! Bounded regenerate-then-revalidate state machine. Owns the retry budget;
//! the generator and validator it drives stay stateless.

use crate::error::{PipelineError, Result};
use crate::execution_loop::error_recovery::FailureContext;
use crate::generator::{SqlCandidate, SqlGenerator};
use crate::validator::{SqlValidator, ValidationStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Initial,
    Validating,
    Repairing,
    Valid,
    Exhausted,
}

impl RepairState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RepairState::Valid | RepairState::Exhausted)
    }
}

impl fmt::Display for RepairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairState::Initial => "initial",
            RepairState::Validating => "validating",
            RepairState::Repairing => "repairing",
            RepairState::Valid => "valid",
            RepairState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Repair cycles left for one run. Only ever counts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { max, remaining: max }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn used(&self) -> u32 {
        self.max - self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Take one cycle; `false` when nothing is left.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RepairState,
    pub to: RepairState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub state: RepairState,
    /// Last candidate that went through validation
    pub candidate: SqlCandidate,
    pub status: ValidationStatus,
    pub budget_remaining: u32,
    /// Repair cycles started
    pub attempts: u32,
    pub transitions: Vec<Transition>,
}

impl RepairOutcome {
    /// The validated candidate, or `Exhausted` with the last validator reason.
    pub fn into_validated(self) -> Result<SqlCandidate> {
        match self.state {
            RepairState::Valid => Ok(self.candidate),
            _ => Err(PipelineError::Exhausted(
                self.status
                    .reason()
                    .unwrap_or("repair loop stopped before validation")
                    .to_string(),
            )),
        }
    }
}

struct Trace {
    state: RepairState,
    transitions: Vec<Transition>,
}

impl Trace {
    fn new() -> Self {
        Self {
            state: RepairState::Initial,
            transitions: Vec::new(),
        }
    }

    fn go(&mut self, to: RepairState, detail: Option<String>) {
        info!(
            "Repair loop: {} -> {}{}",
            self.state,
            to,
            detail.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default()
        );
        self.transitions.push(Transition {
            from: self.state,
            to,
            detail,
        });
        self.state = to;
    }
}

/// Validate/repair orchestrator
pub struct RepairLoop {
    max_repairs: u32,
}

impl RepairLoop {
    pub fn new(max_repairs: u32) -> Self {
        Self { max_repairs }
    }

    pub fn max_repairs(&self) -> u32 {
        self.max_repairs
    }

    /// Validate a freshly generated candidate, repairing as the budget allows.
    pub async fn run(
        &self,
        request: &str,
        schema_context: &str,
        candidate: SqlCandidate,
        generator: &dyn SqlGenerator,
        validator: &dyn SqlValidator,
    ) -> Result<RepairOutcome> {
        let mut trace = Trace::new();
        trace.go(RepairState::Validating, None);
        let status = validator.validate(&candidate, schema_context).await?;
        self.drive(request, schema_context, candidate, status, trace, generator, validator)
            .await
    }

    /// Continue from a validation that has already happened.
    pub async fn resume(
        &self,
        request: &str,
        schema_context: &str,
        candidate: SqlCandidate,
        status: ValidationStatus,
        generator: &dyn SqlGenerator,
        validator: &dyn SqlValidator,
    ) -> Result<RepairOutcome> {
        let mut trace = Trace::new();
        trace.go(RepairState::Validating, None);
        self.drive(request, schema_context, candidate, status, trace, generator, validator)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        request: &str,
        schema_context: &str,
        mut candidate: SqlCandidate,
        mut status: ValidationStatus,
        mut trace: Trace,
        generator: &dyn SqlGenerator,
        validator: &dyn SqlValidator,
    ) -> Result<RepairOutcome> {
        let mut budget = RetryBudget::new(self.max_repairs);

        loop {
            let reason = match &status {
                ValidationStatus::Valid => {
                    trace.go(RepairState::Valid, None);
                    break;
                }
                ValidationStatus::Invalid(reason) => reason.clone(),
            };

            if !budget.consume() {
                warn!("Repair budget exhausted, last reason: {}", reason);
                trace.go(RepairState::Exhausted, Some(reason));
                break;
            }
            trace.go(RepairState::Repairing, Some(reason.clone()));

            let failure = FailureContext::new(candidate.clone(), reason, budget.used());
            match generator.generate(request, schema_context, Some(&failure)).await {
                Ok(repaired) => {
                    candidate = repaired;
                    trace.go(RepairState::Validating, None);
                    status = validator.validate(&candidate, schema_context).await?;
                }
                Err(e @ PipelineError::Timeout { .. }) | Err(e @ PipelineError::Cancelled(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("Regeneration failed: {}", e);
                    trace.go(RepairState::Exhausted, Some(format!("regeneration failed: {}", e)));
                    break;
                }
            }
        }

        Ok(RepairOutcome {
            state: trace.state,
            candidate,
            status,
            budget_remaining: budget.remaining(),
            attempts: budget.used(),
            transitions: trace.transitions,
        })
    }
}

impl Default for RepairLoop {
    fn default() -> Self {
        Self::new(1)
    }
}
