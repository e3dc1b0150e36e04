use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::{AttemptFailure, StepRecord};
use crate::StepflowError;

/// Workflow run status.
///
/// `Pending -> Running -> {Succeeded | Failed}`, never leaving a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run created, not yet picked up.
    Pending,
    /// Run is being executed (or was interrupted mid-execution).
    Running,
    /// Run body returned a result.
    Succeeded,
    /// A step failure propagated out of the body.
    Failed,
}

impl RunStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Check if the run is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is allowed. `Running -> Running` covers resumption.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Running, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }
}

impl FromStr for RunStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Pending,
        })
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Failing step, if the failure came from a step.
    pub step: Option<String>,
    /// Error message.
    pub message: String,
    /// Attempts made by the failing step.
    pub attempts: u32,
    /// Attempt history of the failing step.
    pub history: Vec<AttemptFailure>,
}

impl RunFailure {
    /// Failure not attributable to a single step.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            step: None,
            message: message.into(),
            attempts: 0,
            history: Vec::new(),
        }
    }
}

impl From<&StepflowError> for RunFailure {
    fn from(e: &StepflowError) -> Self {
        match e {
            StepflowError::StepFailed {
                step,
                attempts,
                last_error,
                history,
            } => Self {
                step: Some(step.clone()),
                message: last_error.clone(),
                attempts: *attempts,
                history: history.clone(),
            },
            other => Self::message(other.to_string()),
        }
    }
}

/// A workflow run, unique per `(workflow_id, event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run ID.
    pub id: Uuid,
    /// Workflow definition ID.
    pub workflow_id: String,
    /// Triggering event ID.
    pub event_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Final result (if succeeded).
    pub result: Option<serde_json::Value>,
    /// Failure details (if failed).
    pub error: Option<RunFailure>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run first started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run became terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// Create a new pending run.
    pub fn new(workflow_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            event_id: event_id.into(),
            status: RunStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Mark as running. Returns false if the run is already terminal.
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(RunStatus::Running) {
            return false;
        }
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        true
    }

    /// Mark as succeeded. Returns false if the run is already terminal.
    pub fn succeed(&mut self, result: serde_json::Value) -> bool {
        if !self.status.can_transition_to(RunStatus::Succeeded) {
            return false;
        }
        self.status = RunStatus::Succeeded;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Mark as failed. Returns false if the run is already terminal.
    pub fn fail(&mut self, failure: RunFailure) -> bool {
        if !self.status.can_transition_to(RunStatus::Failed) {
            return false;
        }
        self.status = RunStatus::Failed;
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Answer to a run status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub event_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    /// Step records in the order they were first attempted.
    pub step_history: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunStatusReport {
    pub fn new(run: WorkflowRun, step_history: Vec<StepRecord>) -> Self {
        Self {
            run_id: run.id,
            workflow_id: run.workflow_id,
            event_id: run.event_id,
            status: run.status,
            result: run.result,
            error: run.error,
            step_history,
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }

    /// Find a step record by name.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.step_history.iter().find(|s| s.step_name == name)
    }
}
