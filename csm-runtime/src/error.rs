//! Runtime error types.

use thiserror::Error;

/// Errors from the execution engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] csm_core::CoreError),

    #[error("storage error: {0}")]
    Storage(#[from] csm_storage::StorageError),

    #[error("non-determinism detected in state '{state}' for {trigger}: {count} transitions selected")]
    NonDeterminism {
        state: String,
        trigger: String,
        count: usize,
    },

    #[error("state not found: {state}")]
    StateNotFound { state: String },

    #[error("instance has no active state")]
    NoActiveState,

    #[error("timer already running: {name}")]
    DuplicateTimer { name: String },

    #[error("timer not found: {name}")]
    TimerNotFound { name: String },

    #[error("invalid timer '{name}': {reason}")]
    InvalidTimer { name: String, reason: String },

    #[error("no implementation for service type '{service_type}'")]
    ServiceNotFound { service_type: String },

    #[error("service '{service}' failed: {reason}")]
    ServiceFailed { service: String, reason: String },

    #[error("event delivery failed: {0}")]
    Delivery(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("runtime is shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns whether this error terminates an instance when raised by a
    /// control command. Action errors are always logged and skipped.
    pub fn is_fatal(&self) -> bool {
        match self {
            RuntimeError::NonDeterminism { .. }
            | RuntimeError::StateNotFound { .. }
            | RuntimeError::NoActiveState
            | RuntimeError::InvalidTimer { .. }
            | RuntimeError::DuplicateTimer { .. }
            | RuntimeError::Storage(_)
            | RuntimeError::Io(_) => true,
            RuntimeError::Core(e) => !matches!(
                e,
                csm_core::CoreError::VariableNotFound { .. }
                    | csm_core::CoreError::VariableExists { .. }
            ),
            _ => false,
        }
    }

    /// Returns a stable error code for logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Storage(_) => "STORAGE_ERROR",
            RuntimeError::NonDeterminism { .. } => "NON_DETERMINISM",
            RuntimeError::StateNotFound { .. } => "STATE_NOT_FOUND",
            RuntimeError::NoActiveState => "NO_ACTIVE_STATE",
            RuntimeError::DuplicateTimer { .. } => "DUPLICATE_TIMER",
            RuntimeError::TimerNotFound { .. } => "TIMER_NOT_FOUND",
            RuntimeError::InvalidTimer { .. } => "INVALID_TIMER",
            RuntimeError::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            RuntimeError::ServiceFailed { .. } => "SERVICE_FAILED",
            RuntimeError::Delivery(_) => "DELIVERY_FAILED",
            RuntimeError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            RuntimeError::ShutDown => "SHUT_DOWN",
            RuntimeError::Io(_) => "IO_ERROR",
        }
    }
}
