pub mod config;
pub mod errors;
pub mod structured_logging;

pub use config::{BackoffConfig, CoordinatorConfig};

pub use errors::{
    CoordinationError, CoordinationResult,
    MemoryError, MemoryResult,
    CancelPoint, PhaseError,
    RejectionReason,
    RecoveryStrategy,
    ValidationError,
};

pub use structured_logging::{
    init_structured_logging,
    LoggingConfig,
    StructuredLogEntry,
    ExecutionContext,
    OperationTimer,
};
