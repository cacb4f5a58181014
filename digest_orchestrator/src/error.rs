//! Error kinds shared across the workflow engine.
//!
//! Provider errors are converted into [`FailureKind`] at the agent boundary;
//! nothing below the orchestrator lets a raw provider error reach workflow
//! state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification attached to every `AgentResult::Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or rate-limit style failure, safe to retry.
    Transient,
    /// The call exceeded its time budget.
    Timeout,
    /// The agent does not declare the requested task.
    UnsupportedTask,
    /// The stage plan could not be built.
    PlanInvalid,
    /// The health monitor short-circuited the call.
    CircuitOpen,
    /// The provider answered with something that is not a stage payload.
    InvalidPayload,
    /// The provider answered but produced nothing usable.
    EmptyResult,
    /// Non-retryable provider rejection.
    Provider,
    /// No agent is registered for the requested capability.
    Unavailable,
}

impl FailureKind {
    /// Transient failures are retried with backoff before escalation.
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::Timeout)
    }

    /// Configuration mistakes surface immediately, regardless of stage criticality.
    pub fn is_programming_error(self) -> bool {
        matches!(self, FailureKind::UnsupportedTask | FailureKind::PlanInvalid)
    }

    /// Whether the failure is charged to the agent's circuit breaker.
    pub fn counts_against_health(self) -> bool {
        !matches!(
            self,
            FailureKind::CircuitOpen | FailureKind::UnsupportedTask | FailureKind::PlanInvalid
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Timeout => "timeout",
            FailureKind::UnsupportedTask => "unsupported_task",
            FailureKind::PlanInvalid => "plan_invalid",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::InvalidPayload => "invalid_payload",
            FailureKind::EmptyResult => "empty_result",
            FailureKind::Provider => "provider",
            FailureKind::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a capability provider may return.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::Transient(_)
            | ProviderError::RateLimited(_)
            | ProviderError::Unreachable(_) => FailureKind::Transient,
            ProviderError::Rejected(_) => FailureKind::Provider,
            ProviderError::Malformed(_) => FailureKind::InvalidPayload,
        }
    }
}

/// Errors returned directly to callers of the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("a workflow is already running for user '{user_id}'")]
    AlreadyRunning { user_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert_eq!(ProviderError::RateLimited("429".into()).kind(), FailureKind::Transient);
        assert_eq!(ProviderError::Unreachable("dns".into()).kind(), FailureKind::Transient);
        assert_eq!(ProviderError::Rejected("bad key".into()).kind(), FailureKind::Provider);
        assert_eq!(ProviderError::Malformed("{".into()).kind(), FailureKind::InvalidPayload);
    }

    #[test]
    fn test_failure_kind_policies() {
        assert!(FailureKind::Timeout.is_transient());
        assert!(!FailureKind::Provider.is_transient());
        assert!(FailureKind::PlanInvalid.is_programming_error());
        assert!(!FailureKind::CircuitOpen.counts_against_health());
        assert!(FailureKind::InvalidPayload.counts_against_health());
        assert_eq!(
            serde_json::to_value(FailureKind::UnsupportedTask).unwrap(),
            serde_json::json!("unsupported_task")
        );
    }
}
