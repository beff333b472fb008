//! Error Recovery
//!
//! Carries a rejected candidate and the validator's reason into the next
//! generation attempt.

use crate::generator::SqlCandidate;
use serde::{Deserialize, Serialize};

/// Failure context handed to the generator on a repair call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub previous_sql: SqlCandidate,
    /// Validator's reason, passed through verbatim
    pub reason: String,
    /// 1-based repair cycle number
    pub attempt: u32,
}

impl FailureContext {
    pub fn new(previous_sql: SqlCandidate, reason: impl Into<String>, attempt: u32) -> Self {
        Self {
            previous_sql,
            reason: reason.into(),
            attempt,
        }
    }

    /// Prompt section prepended to the regular generation prompt.
    pub fn to_prompt_section(&self, user_request: &str) -> String {
        let mut parts = Vec::new();
        parts.push(format!(
            "RETRY ATTEMPT {}: the following SQL was rejected by the validator.",
            self.attempt
        ));
        parts.push(String::new());
        parts.push("REJECTED SQL:".to_string());
        parts.push(self.previous_sql.as_str().to_string());
        parts.push(String::new());
        parts.push("VALIDATOR SAID:".to_string());
        parts.push(self.reason.clone());
        parts.push(String::new());
        parts.push(format!(
            "Regenerate a corrected SQL statement that fulfils: \"{}\"",
            user_request
        ));
        parts.push("The new statement must fix the error above and must not repeat the rejected SQL.".to_string());
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_section_carries_sql_and_reason_verbatim() {
        let ctx = FailureContext::new(
            SqlCandidate::new("SELECT signup_date FROM mock_users").unwrap(),
            "invalid: column signup_date does not exist in mock_users",
            1,
        );
        let section = ctx.to_prompt_section("users per month");
        assert!(section.contains("SELECT signup_date FROM mock_users"));
        assert!(section.contains("column signup_date does not exist in mock_users"));
        assert!(section.contains("users per month"));
        assert!(section.starts_with("RETRY ATTEMPT 1"));
    }
}
