//! Storage contracts for step records, runs and events.
//!
//! The [`StateStore`] is the only shared mutable resource between executors.
//! Every cross-executor race is arbitrated by its compare-and-set operation,
//! so implementations must make `cas_succeeded` atomic.

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::event::Event;
use crate::workflow::{AttemptFailure, RunFailure, StepRecord, StepStatus, WorkflowRun};
use crate::Result;

/// Durable ledger of step outcomes keyed by `(run_id, step_name)`.
pub trait StateStore: Send + Sync + 'static {
    /// Read the record for a step.
    fn get<'a>(&'a self, run_id: Uuid, step_name: &'a str)
        -> BoxFuture<'a, Result<Option<StepRecord>>>;

    /// Create the record (attempt 1) or advance a pending one by one attempt.
    ///
    /// Terminal records are returned untouched.
    fn put_if_absent_or_pending<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
    ) -> BoxFuture<'a, Result<StepRecord>>;

    /// Write `record` as succeeded if the stored status equals `expected_prior`.
    ///
    /// On mismatch returns [`StepflowError::StoreConflict`](crate::StepflowError::StoreConflict)
    /// carrying the stored record.
    fn cas_succeeded(
        &self,
        expected_prior: StepStatus,
        record: StepRecord,
    ) -> BoxFuture<'_, Result<StepRecord>>;

    /// Append a failed attempt; `terminal` freezes the record as failed.
    ///
    /// Records that are already terminal are returned untouched.
    fn record_failure<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
        failure: AttemptFailure,
        terminal: bool,
    ) -> BoxFuture<'a, Result<StepRecord>>;

    /// All records of a run in the order they were created.
    fn list(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepRecord>>>;
}

/// Persistence for events and workflow runs.
pub trait RunStore: Send + Sync + 'static {
    /// Store an event unless one with the same ID exists.
    ///
    /// Returns the stored event and whether it was inserted by this call.
    fn insert_event_if_absent(&self, event: Event) -> BoxFuture<'_, Result<(Event, bool)>>;

    /// Read an event.
    fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<Option<Event>>>;

    /// Create a pending run for `(workflow_id, event_id)` unless one exists.
    ///
    /// Returns the stored run and whether it was created by this call.
    fn create_run_if_absent<'a>(
        &'a self,
        workflow_id: &'a str,
        event_id: &'a str,
    ) -> BoxFuture<'a, Result<(WorkflowRun, bool)>>;

    /// Read a run.
    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<WorkflowRun>>>;

    /// Runs created for an event.
    fn runs_for_event<'a>(&'a self, event_id: &'a str)
        -> BoxFuture<'a, Result<Vec<WorkflowRun>>>;

    /// Move a pending or running run to running. Terminal runs are returned untouched.
    fn mark_running(&self, run_id: Uuid) -> BoxFuture<'_, Result<WorkflowRun>>;

    /// Mark a run succeeded. Terminal runs are returned untouched.
    fn complete_run(
        &self,
        run_id: Uuid,
        result: serde_json::Value,
    ) -> BoxFuture<'_, Result<WorkflowRun>>;

    /// Mark a run failed. Terminal runs are returned untouched.
    fn fail_run(&self, run_id: Uuid, failure: RunFailure) -> BoxFuture<'_, Result<WorkflowRun>>;

    /// Pending or running runs ordered by `(created_at, id)`, starting after `after`.
    fn list_unfinished(
        &self,
        after: Option<RunCursor>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>>;
}

/// Keyset position in the unfinished-run listing.
///
/// Runs finishing between two pages never shift the position, unlike an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl RunCursor {
    /// Cursor positioned just after `run`.
    pub fn after(run: &WorkflowRun) -> Self {
        Self {
            created_at: run.created_at,
            id: run.id,
        }
    }
}
