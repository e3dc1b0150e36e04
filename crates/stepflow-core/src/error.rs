use thiserror::Error;

use crate::retry::ErrorKind;
use crate::workflow::{AttemptFailure, StepError, StepRecord};

/// Core error type for STEPFLOW operations.
#[derive(Error, Debug)]
pub enum StepflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A step failure that the retry policy may retry.
    #[error("Transient step error ({kind}): {message}")]
    TransientStep { kind: ErrorKind, message: String },

    /// A step failure that is never retried.
    #[error("Permanent step error ({kind}): {message}")]
    PermanentStep { kind: ErrorKind, message: String },

    /// Malformed event, dropped at ingestion.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Lost a compare-and-set race; `current` holds the winning record.
    #[error("Store conflict on step '{}' of run {}", current.step_name, current.run_id)]
    StoreConflict { current: Box<StepRecord> },

    /// A step gave up (permanent error or attempts exhausted).
    #[error("Step '{step}' failed after {attempts} attempt(s): {last_error}")]
    StepFailed {
        step: String,
        attempts: u32,
        last_error: String,
        history: Vec<AttemptFailure>,
    },
}

impl StepflowError {
    /// Classification used by the retry policy when this error escapes a step.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientStep { kind, .. } | Self::PermanentStep { kind, .. } => *kind,
            Self::Deserialization(_) | Self::Serialization(_) => ErrorKind::MalformedInput,
            Self::Dispatch(_) => ErrorKind::Validation,
            Self::Database(_) | Self::Sql(_) | Self::Io(_) => ErrorKind::Network,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for StepflowError {
    fn from(e: serde_json::Error) -> Self {
        StepflowError::Serialization(e.to_string())
    }
}

impl From<StepError> for StepflowError {
    fn from(e: StepError) -> Self {
        if e.kind.is_transient() {
            StepflowError::TransientStep {
                kind: e.kind,
                message: e.message,
            }
        } else {
            StepflowError::PermanentStep {
                kind: e.kind,
                message: e.message,
            }
        }
    }
}

/// Result type alias using StepflowError.
pub type Result<T> = std::result::Result<T, StepflowError>;
