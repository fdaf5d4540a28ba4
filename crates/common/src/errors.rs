//! Error taxonomy for the coordination core
//!
//! Component-local errors (validation, memory lookups) go back to the
//! immediate caller. Workflow-level failures travel through the workflow's
//! terminal event and are also returned from `WorkflowHandle::wait`.

use thiserror::Error;

/// Malformed request or memory operation. Rejected immediately, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Value out of range: {field} (got {value}, expected {min}-{max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid memory tier: {0}")]
    InvalidTier(String),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Shared memory store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Lookup miss. A normal outcome, not a fault.
    #[error("Key '{key}' not found in {tier} tier")]
    NotFound { tier: String, key: String },

    #[error("Memory operation rejected: {0}")]
    Validation(#[from] ValidationError),
}

impl MemoryError {
    pub fn not_found(tier: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            tier: tier.into(),
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Why the router refused a task request. No workflow exists for a rejected request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("No registered agent advertises capability '{capability}'")]
    ResourceUnavailable { capability: String },

    #[error("Concurrency ceiling of {limit} in-flight workflows reached")]
    Overloaded { limit: usize },

    #[error("Invalid task request: {0}")]
    Invalid(#[from] ValidationError),
}

impl RejectionReason {
    /// Stable label used in events and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceUnavailable { .. } => "resource_unavailable",
            Self::Overloaded { .. } => "overloaded",
            Self::Invalid(_) => "validation",
        }
    }
}

/// Failure of a single phase attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("Phase '{phase_id}' timed out after {timeout_ms}ms")]
    Timeout { phase_id: String, timeout_ms: u64 },

    #[error("Phase '{phase_id}' failed: {reason}")]
    Failure { phase_id: String, reason: String },

    #[error("No available agent for capability '{capability}'")]
    NoAgent { capability: String },

    #[error("Workflow cancelled by submitter {point} phase '{phase_id}'")]
    Cancelled { phase_id: String, point: CancelPoint },
}

/// Where a workflow was when its cancellation took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPoint {
    /// No attempt of the phase had started
    Before,
    /// Between a failed attempt and its retry
    During,
    /// The phase finished after cancellation was requested
    After,
}

impl std::fmt::Display for CancelPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelPoint::Before => write!(f, "before"),
            CancelPoint::During => write!(f, "during"),
            CancelPoint::After => write!(f, "after"),
        }
    }
}

impl PhaseError {
    pub fn failure(phase_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failure {
            phase_id: phase_id.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(phase_id: impl Into<String>, point: CancelPoint) -> Self {
        Self::Cancelled {
            phase_id: phase_id.into(),
            point,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// How a caller should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry with backoff up to the configured attempt count
    Retry,
    /// Caller may resubmit later
    RetryLater,
    /// Normal miss, continue
    Continue,
    /// Don't attempt recovery
    FailFast,
}

/// Top-level error type for the coordination core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Task rejected: {0}")]
    Rejected(#[from] RejectionReason),

    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),

    #[error("Workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinationError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::WorkflowNotFound(_) => {
                RecoveryStrategy::FailFast
            }
            Self::Memory(MemoryError::NotFound { .. }) => RecoveryStrategy::Continue,
            Self::Memory(MemoryError::Validation(_)) => RecoveryStrategy::FailFast,
            Self::Rejected(RejectionReason::Overloaded { .. }) => RecoveryStrategy::RetryLater,
            Self::Rejected(_) => RecoveryStrategy::FailFast,
            Self::Phase(PhaseError::Cancelled { .. }) => RecoveryStrategy::FailFast,
            Self::Phase(_) => RecoveryStrategy::Retry,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.recovery_strategy() == RecoveryStrategy::Retry
    }

    /// Human-readable reason without the category prefix, as stored on an
    /// aborted workflow
    pub fn reason(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Memory(e) => e.to_string(),
            Self::Rejected(e) => e.to_string(),
            Self::Phase(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CoordinationError::from(ValidationError::MissingField("phases".into())), RecoveryStrategy::FailFast)]
    #[case(CoordinationError::from(MemoryError::not_found("short_term", "a")), RecoveryStrategy::Continue)]
    #[case(CoordinationError::from(RejectionReason::Overloaded { limit: 2 }), RecoveryStrategy::RetryLater)]
    #[case(CoordinationError::from(RejectionReason::ResourceUnavailable { capability: "review".into() }), RecoveryStrategy::FailFast)]
    #[case(CoordinationError::from(PhaseError::Timeout { phase_id: "p".into(), timeout_ms: 10 }), RecoveryStrategy::Retry)]
    #[case(CoordinationError::from(PhaseError::failure("p", "boom")), RecoveryStrategy::Retry)]
    #[case(CoordinationError::from(PhaseError::cancelled("p", CancelPoint::During)), RecoveryStrategy::FailFast)]
    fn test_recovery_strategy_follows_taxonomy(
        #[case] error: CoordinationError,
        #[case] expected: RecoveryStrategy,
    ) {
        assert_eq!(error.recovery_strategy(), expected);
    }

    #[test]
    fn test_only_phase_failures_are_retryable() {
        assert!(CoordinationError::from(PhaseError::failure("p", "x")).is_retryable());
        assert!(!CoordinationError::from(RejectionReason::Overloaded { limit: 1 }).is_retryable());
    }

    #[test]
    fn test_rejection_kind_labels() {
        assert_eq!(RejectionReason::Overloaded { limit: 1 }.kind(), "overloaded");
        assert_eq!(
            RejectionReason::ResourceUnavailable {
                capability: "x".into()
            }
            .kind(),
            "resource_unavailable"
        );
        assert_eq!(
            RejectionReason::from(ValidationError::MissingField("id".into())).kind(),
            "validation"
        );
    }

    #[test]
    fn test_error_messages_are_readable() {
        let err = MemoryError::not_found("long_term", "plan");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Key 'plan' not found in long_term tier");

        let err = PhaseError::Timeout {
            phase_id: "implement".into(),
            timeout_ms: 250,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Phase 'implement' timed out after 250ms");
    }

    #[test]
    fn test_cancellation_names_phase_and_point() {
        let err = CoordinationError::from(PhaseError::cancelled("implement", CancelPoint::After));
        assert!(!err.is_retryable());
        assert_eq!(
            err.reason(),
            "Workflow cancelled by submitter after phase 'implement'"
        );
        assert_eq!(
            err.to_string(),
            "Phase error: Workflow cancelled by submitter after phase 'implement'"
        );
    }
}
