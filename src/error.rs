//! Error handling module
//!
//! Provides the unified error taxonomy for analysis, planning, execution and validation.

use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Target table/column is absent. Read-only analysis treats this as "no dependencies".
    #[error("Schema object not found: {0}")]
    SchemaNotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Planning error: {0}")]
    Planning(String),

    /// CRITICAL risk without an explicit override. Raised before any DDL is issued.
    #[error("Blocked by safety gate: {reason}")]
    SafetyBlocked {
        reason: String,
        blocking: Vec<String>,
    },

    /// A stage failed mid-execution; rollback has been attempted.
    #[error("Transaction failed during {stage}: {message}")]
    TransactionFailure {
        stage: String,
        message: String,
        recovery_instructions: Vec<String>,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Staging error: {0}")]
    Staging(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::Database(_) => "DATABASE_ERROR",
            GuardError::Pool(_) => "POOL_EXHAUSTED",
            GuardError::SchemaNotFound(_) => "SCHEMA_NOT_FOUND",
            GuardError::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            GuardError::Planning(_) => "PLANNING_ERROR",
            GuardError::SafetyBlocked { .. } => "SAFETY_BLOCKED",
            GuardError::TransactionFailure { .. } => "TRANSACTION_FAILED",
            GuardError::Timeout(_) => "TIMEOUT",
            GuardError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            GuardError::Validation(_) => "VALIDATION_ERROR",
            GuardError::Staging(_) => "STAGING_ERROR",
            GuardError::Config(_) => "CONFIG_ERROR",
            GuardError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Recovery steps for failures that may have left partial state.
    ///
    /// Safety-blocked and dry-run failures return nothing: no state changed.
    pub fn recovery_instructions(&self) -> &[String] {
        match self {
            GuardError::TransactionFailure {
                recovery_instructions,
                ..
            } => recovery_instructions,
            _ => &[],
        }
    }

    /// Whether the error is the non-fatal "target does not exist" case
    pub fn is_not_found(&self) -> bool {
        matches!(self, GuardError::SchemaNotFound(_))
    }
}

/// Serializable error shape for reports and CLI output
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub success: bool,
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovery_instructions: Vec<String>,
}

impl From<&GuardError> for ErrorReport {
    fn from(err: &GuardError) -> Self {
        match err {
            GuardError::Database(e) => error!("Database error: {:?}", e),
            GuardError::Internal(msg) => error!("Internal error: {}", msg),
            _ => {}
        }

        Self {
            success: false,
            message: err.to_string(),
            code: err.code().to_string(),
            recovery_instructions: err.recovery_instructions().to_vec(),
        }
    }
}

/// Result type alias for engine operations
pub type GuardResult<T> = Result<T, GuardError>;

/// Helper function to create a planning error
pub fn planning_error(msg: impl Into<String>) -> GuardError {
    GuardError::Planning(msg.into())
}

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> GuardError {
    GuardError::Validation(msg.into())
}
