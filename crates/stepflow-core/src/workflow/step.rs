use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::ErrorKind;
use crate::StepflowError;

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step has been attempted but has not finished successfully yet.
    Pending,
    /// Step completed successfully; the record is frozen.
    Succeeded,
    /// Step gave up; the record is frozen.
    Failed,
}

impl StepStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Whether the record can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl FromStr for StepStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Pending,
        })
    }
}

/// One failed attempt of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Attempt number (1-based).
    pub attempt: u32,
    /// Failure classification.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

impl AttemptFailure {
    pub fn new(attempt: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            attempt,
            kind,
            message: message.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Step execution record, keyed by `(run_id, step_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Parent workflow run ID.
    pub run_id: Uuid,
    /// Step name, unique within the run.
    pub step_name: String,
    /// Step status.
    pub status: StepStatus,
    /// Memoized result (set once succeeded).
    pub result: Option<serde_json::Value>,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Every failed attempt, oldest first.
    pub history: Vec<AttemptFailure>,
    /// When the first attempt started.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the record became terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Create a new pending record with no attempts.
    pub fn new(run_id: Uuid, step_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            step_name: step_name.into(),
            status: StepStatus::Pending,
            result: None,
            attempt_count: 0,
            last_error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Start another attempt. No-op once terminal.
    pub fn begin_attempt(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.attempt_count += 1;
        self.updated_at = Utc::now();
    }

    /// Freeze the record with a successful result.
    pub fn succeed(&mut self, result: serde_json::Value) {
        let now = Utc::now();
        self.status = StepStatus::Succeeded;
        self.result = Some(result);
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Record a failed attempt; `terminal` freezes the record as failed.
    pub fn record_failure(&mut self, failure: AttemptFailure, terminal: bool) {
        if self.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.last_error = Some(failure.message.clone());
        self.history.push(failure);
        self.updated_at = now;
        if terminal {
            self.status = StepStatus::Failed;
            self.completed_at = Some(now);
        }
    }

    /// Error surfaced to the run when this step has failed.
    pub fn failure_error(&self) -> StepflowError {
        StepflowError::StepFailed {
            step: self.step_name.clone(),
            attempts: self.attempt_count,
            last_error: self.last_error.clone().unwrap_or_default(),
            history: self.history.clone(),
        }
    }
}

/// Error returned by a step function.
///
/// The `kind` decides whether the retry policy re-invokes the step.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn malformed_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether the retry policy may retry this error.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed_input(e.to_string())
    }
}

impl From<StepflowError> for StepError {
    fn from(e: StepflowError) -> Self {
        match e {
            StepflowError::TransientStep { kind, message }
            | StepflowError::PermanentStep { kind, message } => Self::new(kind, message),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_conversion() {
        assert_eq!(StepStatus::Pending.as_str(), "pending");
        assert_eq!(StepStatus::Succeeded.as_str(), "succeeded");
        assert_eq!(StepStatus::Failed.as_str(), "failed");

        assert_eq!("pending".parse::<StepStatus>(), Ok(StepStatus::Pending));
        assert_eq!("succeeded".parse::<StepStatus>(), Ok(StepStatus::Succeeded));
        assert_eq!("failed".parse::<StepStatus>(), Ok(StepStatus::Failed));
    }

    #[test]
    fn test_record_attempts_and_failures() {
        let mut record = StepRecord::new(Uuid::new_v4(), "scrape-urls");
        assert_eq!(record.attempt_count, 0);

        record.begin_attempt();
        record.record_failure(AttemptFailure::new(1, ErrorKind::Timeout, "slow"), false);
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.last_error.as_deref(), Some("slow"));

        record.begin_attempt();
        record.record_failure(AttemptFailure::new(2, ErrorKind::Timeout, "slower"), true);
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.history.len(), 2);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_succeeded_record_is_frozen() {
        let mut record = StepRecord::new(Uuid::new_v4(), "extract-urls");
        record.begin_attempt();
        record.succeed(serde_json::json!(["https://example.com"]));

        record.begin_attempt();
        record.record_failure(AttemptFailure::new(2, ErrorKind::Network, "late"), true);

        assert_eq!(record.status, StepStatus::Succeeded);
        assert_eq!(record.attempt_count, 1);
        assert!(record.history.is_empty());
    }

    #[test]
    fn test_failure_error_carries_history() {
        let mut record = StepRecord::new(Uuid::new_v4(), "fail");
        record.begin_attempt();
        record.record_failure(AttemptFailure::new(1, ErrorKind::Validation, "boom"), true);

        match record.failure_error() {
            StepflowError::StepFailed {
                step,
                attempts,
                last_error,
                history,
            } => {
                assert_eq!(step, "fail");
                assert_eq!(attempts, 1);
                assert_eq!(last_error, "boom");
                assert_eq!(history.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_step_error_from_stepflow_error() {
        let err: StepError = StepflowError::Deserialization("bad json".into()).into();
        assert_eq!(err.kind, ErrorKind::MalformedInput);
        assert!(!err.is_transient());

        let err: StepError = StepflowError::TransientStep {
            kind: ErrorKind::RateLimited,
            message: "429".into(),
        }
        .into();
        assert_eq!(err, StepError::rate_limited("429"));
    }
}
