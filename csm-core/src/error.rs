//! Core error types.

use thiserror::Error;

/// Errors from the state machine model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid state machine description: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("failed to evaluate '{expression}': {reason}")]
    Evaluation { expression: String, reason: String },

    #[error("variable not found: {name}")]
    VariableNotFound { name: String },

    #[error("variable already exists: {name}")]
    VariableExists { name: String },

    #[error("context backend error: {reason}")]
    ContextBackend { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error was produced while building a description,
    /// as opposed to while running one.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::InvalidExpression { .. }
                | CoreError::Json(_)
        )
    }

    /// Returns a stable error code for logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidExpression { .. } => "INVALID_EXPRESSION",
            CoreError::Evaluation { .. } => "EVALUATION_FAILED",
            CoreError::VariableNotFound { .. } => "VARIABLE_NOT_FOUND",
            CoreError::VariableExists { .. } => "VARIABLE_EXISTS",
            CoreError::ContextBackend { .. } => "CONTEXT_BACKEND",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}
