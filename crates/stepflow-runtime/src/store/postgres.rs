use futures::future::BoxFuture;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use stepflow_core::event::Event;
use stepflow_core::store::{RunCursor, RunStore, StateStore};
use stepflow_core::workflow::{
    AttemptFailure, RunFailure, RunStatus, StepRecord, StepStatus, WorkflowRun,
};
use stepflow_core::{Result, StepflowError};

const STEP_COLUMNS: &str = "run_id, step_name, status, result, attempt_count, last_error, \
                            history, created_at, updated_at, completed_at";

const RUN_COLUMNS: &str = "id, workflow_id, event_id, status, result, error, \
                           created_at, started_at, completed_at";

/// PostgreSQL-backed state and run store.
///
/// Compare-and-set is a conditional `UPDATE ... WHERE status = $expected`;
/// the row lock taken by the update serializes racing executors.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_step(&self, run_id: Uuid, step_name: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM stepflow_steps WHERE run_id = $1 AND step_name = $2"
        ))
        .bind(run_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn require_step(&self, run_id: Uuid, step_name: &str) -> Result<StepRecord> {
        self.fetch_step(run_id, step_name).await?.ok_or_else(|| {
            StepflowError::NotFound(format!("Step '{}' of run {} not found", step_name, run_id))
        })
    }

    async fn fetch_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM stepflow_runs WHERE id = $1"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn require_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.fetch_run(run_id)
            .await?
            .ok_or_else(|| StepflowError::NotFound(format!("Workflow run {} not found", run_id)))
    }

    /// Apply a guarded run transition; terminal runs are returned unchanged.
    async fn transition_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<WorkflowRun> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE stepflow_runs
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                started_at = COALESCE(started_at, NOW()),
                completed_at = CASE WHEN $2 IN ('succeeded', 'failed') THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => run_from_row(&row),
            None => self.require_run(run_id).await,
        }
    }
}

impl StateStore for PostgresStore {
    fn get<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<StepRecord>>> {
        Box::pin(self.fetch_step(run_id, step_name))
    }

    fn put_if_absent_or_pending<'a>(
        &'a self,
        run_id: Uuid,
        step_name: &'a str,
    ) -> BoxFuture<'a, Result<StepRecord>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO stepflow_steps (run_id, step_name, status, attempt_count)
                VALUES ($1, $2, 'pending', 1)
                ON CONFLICT (run_id, step_name) DO UPDATE
                SET attempt_count = stepflow_steps.attempt_count + 1,
                    updated_at = NOW()
                WHERE stepflow_steps.status = 'pending'
                RETURNING {STEP_COLUMNS}
                "#
            ))
            .bind(run_id)
            .bind(step_name)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => step_from_row(&row),
                // Conflict with a terminal record: nothing was updated.
                None => self.require_step(run_id, step_name).await,
            }
        })
    }

    fn cas_succeeded(
        &self,
        expected_prior: StepStatus,
        record: StepRecord,
    ) -> BoxFuture<'_, Result<StepRecord>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r#"
                UPDATE stepflow_steps
                SET status = 'succeeded',
                    result = $4,
                    updated_at = NOW(),
                    completed_at = NOW()
                WHERE run_id = $1 AND step_name = $2 AND status = $3
                RETURNING {STEP_COLUMNS}
                "#
            ))
            .bind(record.run_id)
            .bind(&record.step_name)
            .bind(expected_prior.as_str())
            .bind(record.result.clone().unwrap_or(serde_json::Value::Null))
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => step_from_row(&row),
                None => {
                    let current = self.require_step(record.run_id, &record.step_name).await?;
                    Err(StepflowError::StoreConflict {
                        current: Box::new(current),
                    })
                }
            }
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
            let entry = serde_json::to_value(vec![&failure])?;
            let row = sqlx::query(&format!(
                r#"
                UPDATE stepflow_steps
                SET last_error = $3,
                    history = history || $4::jsonb,
                    updated_at = NOW(),
                    status = CASE WHEN $5 THEN 'failed' ELSE status END,
                    completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END
                WHERE run_id = $1 AND step_name = $2 AND status = 'pending'
                RETURNING {STEP_COLUMNS}
                "#
            ))
            .bind(run_id)
            .bind(step_name)
            .bind(&failure.message)
            .bind(entry)
            .bind(terminal)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => step_from_row(&row),
                None => self.require_step(run_id, step_name).await,
            }
        })
    }

    fn list(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {STEP_COLUMNS} FROM stepflow_steps WHERE run_id = $1 ORDER BY seq"
            ))
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(step_from_row).collect()
        })
    }
}

impl RunStore for PostgresStore {
    fn insert_event_if_absent(&self, event: Event) -> BoxFuture<'_, Result<(Event, bool)>> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r#"
                INSERT INTO stepflow_events (id, name, payload, received_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(&event.id)
            .bind(&event.name)
            .bind(&event.payload)
            .bind(event.received_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
                == 1;

            if inserted {
                return Ok((event, true));
            }

            let stored = self.get_event(&event.id).await?.ok_or_else(|| {
                StepflowError::Database(format!("Event {} vanished after conflict", event.id))
            })?;
            Ok((stored, false))
        })
    }

    fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<Option<Event>>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, name, payload, received_at FROM stepflow_events WHERE id = $1",
            )
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

            row.map(|row| {
                Ok(Event {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    payload: row.try_get("payload")?,
                    received_at: row.try_get("received_at")?,
                })
            })
            .transpose()
        })
    }

    fn create_run_if_absent<'a>(
        &'a self,
        workflow_id: &'a str,
        event_id: &'a str,
    ) -> BoxFuture<'a, Result<(WorkflowRun, bool)>> {
        Box::pin(async move {
            let run = WorkflowRun::new(workflow_id, event_id);
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO stepflow_runs (id, workflow_id, event_id, status, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (workflow_id, event_id) DO NOTHING
                RETURNING {RUN_COLUMNS}
                "#
            ))
            .bind(run.id)
            .bind(&run.workflow_id)
            .bind(&run.event_id)
            .bind(run.status.as_str())
            .bind(run.created_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                return Ok((run_from_row(&row)?, true));
            }

            let row = sqlx::query(&format!(
                "SELECT {RUN_COLUMNS} FROM stepflow_runs WHERE workflow_id = $1 AND event_id = $2"
            ))
            .bind(workflow_id)
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
            Ok((run_from_row(&row)?, false))
        })
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
        Box::pin(self.fetch_run(run_id))
    }

    fn runs_for_event<'a>(
        &'a self,
        event_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<WorkflowRun>>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {RUN_COLUMNS} FROM stepflow_runs WHERE event_id = $1 ORDER BY created_at"
            ))
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(run_from_row).collect()
        })
    }

    fn mark_running(&self, run_id: Uuid) -> BoxFuture<'_, Result<WorkflowRun>> {
        Box::pin(self.transition_run(run_id, RunStatus::Running, None, None))
    }

    fn complete_run(
        &self,
        run_id: Uuid,
        result: serde_json::Value,
    ) -> BoxFuture<'_, Result<WorkflowRun>> {
        Box::pin(self.transition_run(run_id, RunStatus::Succeeded, Some(result), None))
    }

    fn fail_run(&self, run_id: Uuid, failure: RunFailure) -> BoxFuture<'_, Result<WorkflowRun>> {
        Box::pin(async move {
            let error = serde_json::to_value(&failure)?;
            self.transition_run(run_id, RunStatus::Failed, None, Some(error))
                .await
        })
    }

    fn list_unfinished(
        &self,
        after: Option<RunCursor>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {RUN_COLUMNS} FROM stepflow_runs
                WHERE status IN ('pending', 'running')
                  AND ($1::timestamptz IS NULL OR (created_at, id) > ($1, $2::uuid))
                ORDER BY created_at, id
                LIMIT $3
                "#
            ))
            .bind(after.map(|c| c.created_at))
            .bind(after.map(|c| c.id))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(run_from_row).collect()
        })
    }
}

fn step_from_row(row: &PgRow) -> Result<StepRecord> {
    let status: String = row.try_get("status")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;
    let history: serde_json::Value = row.try_get("history")?;

    Ok(StepRecord {
        run_id: row.try_get("run_id")?,
        step_name: row.try_get("step_name")?,
        status: status.parse().unwrap_or(StepStatus::Pending),
        result: row.try_get("result")?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        last_error: row.try_get("last_error")?,
        history: serde_json::from_value(history)
            .map_err(|e| StepflowError::Deserialization(format!("step history: {}", e)))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<WorkflowRun> {
    let status: String = row.try_get("status")?;
    let error: Option<serde_json::Value> = row.try_get("error")?;

    Ok(WorkflowRun {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        event_id: row.try_get("event_id")?,
        status: status.parse().unwrap_or(RunStatus::Pending),
        result: row.try_get("result")?,
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StepflowError::Deserialization(format!("run error: {}", e)))?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
