use std::sync::Arc;

use uuid::Uuid;

use super::registry::WorkflowRegistry;
use stepflow_core::workflow::{RunFailure, RunStatusReport, Services, WorkflowContext, WorkflowRun};
use stepflow_core::{Result, RetryPolicy, RunStatus, RunStore, StateStore, StepflowError};

/// Drives workflow runs to a terminal status.
#[derive(Clone)]
pub struct WorkflowExecutor {
    registry: Arc<WorkflowRegistry>,
    runs: Arc<dyn RunStore>,
    steps: Arc<dyn StateStore>,
    retry: RetryPolicy,
    services: Arc<Services>,
}

impl WorkflowExecutor {
    /// Create a new workflow executor.
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        runs: Arc<dyn RunStore>,
        steps: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            registry,
            runs,
            steps,
            retry: RetryPolicy::default(),
            services: Arc::new(Services::new()),
        }
    }

    /// Set the retry policy applied to every step.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Retry policy applied to steps, also used to back off store failures.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Set the collaborator services handed to workflow bodies.
    pub fn with_services(mut self, services: Arc<Services>) -> Self {
        self.services = services;
        self
    }

    /// Execute a run until it is terminal.
    ///
    /// A terminal run is returned as stored. A run found in `running` was
    /// interrupted and is resumed; completed steps are answered from the
    /// state store. Store failures leave the run unfinished and are returned
    /// as errors; callers may execute the run again.
    pub async fn execute(&self, run_id: Uuid) -> Result<WorkflowRun> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(
                run_id = %run_id,
                status = run.status.as_str(),
                "Run already terminal, skipping"
            );
            return Ok(run);
        }
        let resumed = run.status == RunStatus::Running;

        let Some(definition) = self.registry.get(&run.workflow_id).cloned() else {
            tracing::error!(
                run_id = %run_id,
                workflow_id = %run.workflow_id,
                "Workflow is not registered"
            );
            return self
                .runs
                .fail_run(
                    run_id,
                    RunFailure::message(format!("Workflow '{}' is not registered", run.workflow_id)),
                )
                .await;
        };

        let event = self.runs.get_event(&run.event_id).await?.ok_or_else(|| {
            StepflowError::NotFound(format!("Event {} not found", run.event_id))
        })?;

        let run = self.runs.mark_running(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let mut ctx = WorkflowContext::new(run_id, &definition.id, event, self.steps.clone())
            .with_retry(self.retry.clone())
            .with_services(self.services.clone());
        if resumed {
            ctx = ctx.resumed();
        }

        tracing::info!(
            run_id = %run_id,
            workflow_id = %definition.id,
            event_id = %run.event_id,
            resumed,
            "Executing workflow run"
        );

        let payload = ctx.event().payload.clone();
        match (definition.handler)(&ctx, payload).await {
            Ok(output) => {
                let run = self.runs.complete_run(run_id, output).await?;
                tracing::info!(run_id = %run_id, workflow_id = %definition.id, "Workflow run succeeded");
                Ok(run)
            }
            Err(e @ (StepflowError::Sql(_) | StepflowError::Database(_) | StepflowError::Io(_))) => {
                tracing::error!(
                    run_id = %run_id,
                    error = %e,
                    "Workflow run interrupted by a store failure"
                );
                Err(e)
            }
            Err(e) => {
                let failure = RunFailure::from(&e);
                tracing::error!(
                    run_id = %run_id,
                    workflow_id = %definition.id,
                    step = failure.step.as_deref().unwrap_or("-"),
                    error = %e,
                    "Workflow run failed"
                );
                self.runs.fail_run(run_id, failure).await
            }
        }
    }

    /// Get run status with its step history.
    pub async fn status(&self, run_id: Uuid) -> Result<RunStatusReport> {
        let run = self.get_run(run_id).await?;
        let steps = self.steps.list(run_id).await?;
        Ok(RunStatusReport::new(run, steps))
    }

    /// Status reports of every run an event created.
    pub async fn runs_for_event(&self, event_id: &str) -> Result<Vec<RunStatusReport>> {
        let runs = self.runs.runs_for_event(event_id).await?;
        let mut reports = Vec::with_capacity(runs.len());
        for run in runs {
            let steps = self.steps.list(run.id).await?;
            reports.push(RunStatusReport::new(run, steps));
        }
        Ok(reports)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| StepflowError::NotFound(format!("Workflow run {} not found", run_id)))
    }
}
