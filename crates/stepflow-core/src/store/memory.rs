use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RunCursor, RunStore, StateStore};
use crate::event::Event;
use crate::workflow::{AttemptFailure, RunFailure, StepRecord, StepStatus, WorkflowRun};
use crate::{Result, StepflowError};

#[derive(Default)]
struct Inner {
    /// Step records per run, in creation order.
    steps: HashMap<Uuid, Vec<StepRecord>>,
    events: HashMap<String, Event>,
    runs: HashMap<Uuid, WorkflowRun>,
    /// `(workflow_id, event_id) -> run_id`
    run_keys: HashMap<(String, String), Uuid>,
}

impl Inner {
    fn step_mut(&mut self, run_id: Uuid, step_name: &str) -> Option<&mut StepRecord> {
        self.steps
            .get_mut(&run_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.step_name == step_name))
    }

    fn run_mut(&mut self, run_id: Uuid) -> Result<&mut WorkflowRun> {
        self.runs
            .get_mut(&run_id)
            .ok_or_else(|| StepflowError::NotFound(format!("Workflow run {} not found", run_id)))
    }
}

/// In-process store for tests and single-node deployments.
///
/// All operations hold one lock, which makes every call atomic, including
/// compare-and-set. State does not survive a process restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<StepRecord>>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            Ok(inner.step_mut(run_id, step_name).map(|s| s.clone()))
        })
    }

    fn put_if_absent_or_pending<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
    ) -> BoxFuture<'a, Result<StepRecord>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if let Some(record) = inner.step_mut(run_id, step_name) {
                record.begin_attempt();
                return Ok(record.clone());
            }

            let mut record = StepRecord::new(run_id, step_name);
            record.begin_attempt();
            inner
                .steps
                .entry(run_id)
                .or_default()
                .push(record.clone());
            Ok(record)
        })
    }

    fn cas_succeeded(
        &self,
        expected_prior: StepStatus,
        record: StepRecord,
    ) -> BoxFuture<'_, Result<StepRecord>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let stored = inner
                .step_mut(record.run_id, &record.step_name)
                .ok_or_else(|| {
                    StepflowError::NotFound(format!(
                        "Step '{}' of run {} not found",
                        record.step_name, record.run_id
                    ))
                })?;

            if stored.status != expected_prior {
                return Err(StepflowError::StoreConflict {
                    current: Box::new(stored.clone()),
                });
            }

            stored.succeed(record.result.unwrap_or(serde_json::Value::Null));
            Ok(stored.clone())
        })
    }

    fn record_failure<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
        failure: AttemptFailure,
        terminal: bool,
    ) -> BoxFuture<'a, Result<StepRecord>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let stored = inner.step_mut(run_id, step_name).ok_or_else(|| {
                StepflowError::NotFound(format!(
                    "Step '{}' of run {} not found",
                    step_name, run_id
                ))
            })?;
            stored.record_failure(failure, terminal);
            Ok(stored.clone())
        })
    }

    fn list(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner.steps.get(&run_id).cloned().unwrap_or_default())
        })
    }
}

impl RunStore for MemoryStore {
    fn insert_event_if_absent(&self, event: Event) -> BoxFuture<'_, Result<(Event, bool)>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if let Some(existing) = inner.events.get(&event.id) {
                return Ok((existing.clone(), false));
            }
            inner.events.insert(event.id.clone(), event.clone());
            Ok((event, true))
        })
    }

    fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<Option<Event>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner.events.get(event_id).cloned())
        })
    }

    fn create_run_if_absent<'a>(
        &'a self,
        workflow_id: &'a str,
        event_id: &'a str,
    ) -> BoxFuture<'a, Result<(WorkflowRun, bool)>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let key = (workflow_id.to_string(), event_id.to_string());
            if let Some(run) = inner.run_keys.get(&key).and_then(|id| inner.runs.get(id)) {
                return Ok((run.clone(), false));
            }

            let run = WorkflowRun::new(workflow_id, event_id);
            inner.run_keys.insert(key, run.id);
            inner.runs.insert(run.id, run.clone());
            Ok((run, true))
        })
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner.runs.get(&run_id).cloned())
        })
    }

    fn runs_for_event<'a>(
        &'a self,
        event_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<WorkflowRun>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut runs: Vec<WorkflowRun> = inner
                .runs
                .values()
                .filter(|r| r.event_id == event_id)
                .cloned()
                .collect();
            runs.sort_by_key(|r| r.created_at);
            Ok(runs)
        })
    }

    fn mark_running(&self, run_id: Uuid) -> BoxFuture<'_, Result<WorkflowRun>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let run = inner.run_mut(run_id)?;
            run.start();
            Ok(run.clone())
        })
    }

    fn complete_run(
        &self,
        run_id: Uuid,
        result: serde_json::Value,
    ) -> BoxFuture<'_, Result<WorkflowRun>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let run = inner.run_mut(run_id)?;
            run.succeed(result);
            Ok(run.clone())
        })
    }

    fn fail_run(&self, run_id: Uuid, failure: RunFailure) -> BoxFuture<'_, Result<WorkflowRun>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let run = inner.run_mut(run_id)?;
            run.fail(failure);
            Ok(run.clone())
        })
    }

    fn list_unfinished(
        &self,
        after: Option<RunCursor>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut runs: Vec<WorkflowRun> = inner
                .runs
                .values()
                .filter(|r| !r.status.is_terminal())
                .filter(|r| after.map_or(true, |cursor| RunCursor::after(r) > cursor))
                .cloned()
                .collect();
            runs.sort_by_key(RunCursor::after);
            runs.truncate(limit);
            Ok(runs)
        })
    }
}
