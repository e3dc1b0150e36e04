use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::WorkflowExecutor;
use stepflow_core::config::WorkerConfig;
use stepflow_core::{Result, RetryDecision, RunCursor, RunStore, StepflowError};

/// Pool of workers executing queued runs.
///
/// Runs arrive on an in-process queue fed by the dispatcher. On start the pool
/// also re-executes every unfinished run found in the run store, which is how
/// runs interrupted by a crash are resumed. A run id already executing in this
/// pool is not started a second time.
pub struct WorkerPool {
    config: WorkerConfig,
    executor: Arc<WorkflowExecutor>,
    runs: Arc<dyn RunStore>,
    queue: mpsc::Receiver<Uuid>,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    pub fn new(
        config: WorkerConfig,
        executor: Arc<WorkflowExecutor>,
        runs: Arc<dyn RunStore>,
        queue: mpsc::Receiver<Uuid>,
    ) -> Self {
        Self {
            config,
            executor,
            runs,
            queue,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the pool until `shutdown` is cancelled or the queue closes.
    ///
    /// In-flight runs are aborted on shutdown; they stay `running` in the
    /// store and resume on the next start.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_runs.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(
            max_concurrent_runs = self.config.max_concurrent_runs,
            "Worker pool started"
        );

        self.recover(&mut tasks, &semaphore, &shutdown).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker pool shutting down");
                    break;
                }
                next = self.queue.recv() => {
                    let Some(run_id) = next else {
                        tracing::info!("Run queue closed, worker pool stopping");
                        break;
                    };
                    self.spawn_run(&mut tasks, &semaphore, run_id).await?;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Workflow task panicked");
                        }
                    }
                }
            }
        }

        if shutdown.is_cancelled() {
            tasks.shutdown().await;
        } else {
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }

    /// Re-execute every unfinished run, one page of `recovery_page_size` at a time.
    async fn recover(
        &self,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let page_size = self.config.recovery_page_size.max(1);
        let mut cursor = None;
        let mut recovered = 0usize;

        while !shutdown.is_cancelled() {
            let page = self.runs.list_unfinished(cursor, page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(RunCursor::after(last));
            let full = page.len() == page_size;

            recovered += page.len();
            for run in page {
                self.spawn_run(tasks, semaphore, run.id).await?;
            }
            if !full {
                break;
            }
        }

        if recovered > 0 {
            tracing::info!(runs = recovered, "Recovered unfinished runs");
        }
        Ok(())
    }

    async fn spawn_run(
        &self,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        run_id: Uuid,
    ) -> Result<()> {
        let Some(guard) = ActiveRun::claim(&self.active, run_id) else {
            tracing::debug!(run_id = %run_id, "Run already executing, skipping");
            return Ok(());
        };
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StepflowError::Internal(format!("Worker semaphore closed: {}", e)))?;
        let executor = self.executor.clone();

        tasks.spawn(async move {
            tracing::debug!(run_id = %run_id, "Processing run");
            drive_run(&executor, run_id).await;
            drop(permit);
            drop(guard);
        });

        Ok(())
    }
}

/// Execute a run, backing off and retrying when the store fails mid-run.
async fn drive_run(executor: &WorkflowExecutor, run_id: Uuid) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match executor.execute(run_id).await {
            Ok(run) => {
                tracing::debug!(run_id = %run_id, status = run.status.as_str(), "Run processed");
                return;
            }
            Err(e) => match executor.retry_policy().decide(attempt, e.kind()) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        run_id = %run_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Run execution error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    tracing::error!(run_id = %run_id, attempt, error = %e, "Run execution error");
                    return;
                }
            },
        }
    }
}

/// Membership of a run id in the pool's active set, released on drop
/// (including task abort and panic).
struct ActiveRun {
    active: Arc<Mutex<HashSet<Uuid>>>,
    run_id: Uuid,
}

impl ActiveRun {
    fn claim(active: &Arc<Mutex<HashSet<Uuid>>>, run_id: Uuid) -> Option<Self> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        set.insert(run_id).then(|| Self {
            active: active.clone(),
            run_id,
        })
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use super::*;
    use crate::workflow::dispatcher::EventDispatcher;
    use crate::workflow::registry::{WorkflowDefinition, WorkflowRegistry};
    use stepflow_core::event::Event;
    use stepflow_core::workflow::{RunFailure, WorkflowRun};
    use stepflow_core::{MemoryStore, NewEvent, RetryPolicy, RunStatus};

    /// Run store whose first `complete_run` fails like a dropped connection.
    struct FlakyCompletion {
        inner: Arc<MemoryStore>,
        failed: AtomicBool,
    }

    impl RunStore for FlakyCompletion {
        fn insert_event_if_absent(&self, event: Event) -> BoxFuture<'_, Result<(Event, bool)>> {
            self.inner.insert_event_if_absent(event)
        }

        fn get_event<'a>(&'a self, event_id: &'a str) -> BoxFuture<'a, Result<Option<Event>>> {
            self.inner.get_event(event_id)
        }

        fn create_run_if_absent<'a>(
            &'a self,
            workflow_id: &'a str,
            event_id: &'a str,
        ) -> BoxFuture<'a, Result<(WorkflowRun, bool)>> {
            self.inner.create_run_if_absent(workflow_id, event_id)
        }

        fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<Option<WorkflowRun>>> {
            self.inner.get_run(run_id)
        }

        fn runs_for_event<'a>(
            &'a self,
            event_id: &'a str,
        ) -> BoxFuture<'a, Result<Vec<WorkflowRun>>> {
            self.inner.runs_for_event(event_id)
        }

        fn mark_running(&self, run_id: Uuid) -> BoxFuture<'_, Result<WorkflowRun>> {
            self.inner.mark_running(run_id)
        }

        fn complete_run(
            &self,
            run_id: Uuid,
            result: serde_json::Value,
        ) -> BoxFuture<'_, Result<WorkflowRun>> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Box::pin(async {
                    Err(StepflowError::Database("connection reset".to_string()))
                });
            }
            self.inner.complete_run(run_id, result)
        }

        fn fail_run(&self, run_id: Uuid, failure: RunFailure) -> BoxFuture<'_, Result<WorkflowRun>> {
            self.inner.fail_run(run_id, failure)
        }

        fn list_unfinished(
            &self,
            after: Option<RunCursor>,
            limit: usize,
        ) -> BoxFuture<'_, Result<Vec<WorkflowRun>>> {
            self.inner.list_unfinished(after, limit)
        }
    }

    fn registry() -> Arc<WorkflowRegistry> {
        Arc::new(
            WorkflowRegistry::builder()
                .definition(WorkflowDefinition::from_fn("echo", "test/echo", |_ctx, payload| {
                    Box::pin(async move { Ok(payload) })
                }))
                .build()
                .unwrap(),
        )
    }

    async fn wait_for_status(store: &MemoryStore, run_id: Uuid, status: RunStatus) {
        for _ in 0..200 {
            if store.get_run(run_id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_pool_executes_dispatched_runs() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry();
        let (tx, rx) = mpsc::channel(8);
        let executor = Arc::new(WorkflowExecutor::new(
            registry.clone(),
            store.clone(),
            store.clone(),
        ));
        let pool = WorkerPool::new(WorkerConfig::default(), executor, store.clone(), rx);
        let dispatcher = EventDispatcher::new(registry, store.clone(), tx);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pool.run(shutdown.clone()));

        let ack = dispatcher
            .publish(NewEvent::new("test/echo", serde_json::json!({"hello": "world"})))
            .await
            .unwrap();
        wait_for_status(&store, ack.runs[0], RunStatus::Succeeded).await;

        let run = store.get_run(ack.runs[0]).await.unwrap().unwrap();
        assert_eq!(run.result, Some(serde_json::json!({"hello": "world"})));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pool_recovers_unfinished_runs() {
        let store = Arc::new(MemoryStore::new());
        let event = NewEvent::new("test/echo", serde_json::json!({"n": 1}))
            .into_event()
            .unwrap();
        store.insert_event_if_absent(event.clone()).await.unwrap();
        let (pending, _) = store.create_run_if_absent("echo", &event.id).await.unwrap();

        let (_tx, rx) = mpsc::channel(8);
        let executor = Arc::new(WorkflowExecutor::new(registry(), store.clone(), store.clone()));
        let pool = WorkerPool::new(WorkerConfig::default(), executor, store.clone(), rx);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pool.run(shutdown.clone()));

        wait_for_status(&store, pending.id, RunStatus::Succeeded).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pool_stops_when_queue_closes() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(1);
        let executor = Arc::new(WorkflowExecutor::new(registry(), store.clone(), store.clone()));
        let pool = WorkerPool::new(WorkerConfig::default(), executor, store, rx);

        drop(tx);
        pool.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_on_completion_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let runs = Arc::new(FlakyCompletion {
            inner: store.clone(),
            failed: AtomicBool::new(false),
        });
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = Arc::new(
            WorkflowRegistry::builder()
                .definition(WorkflowDefinition::from_fn("count", "test/count", move |ctx, _| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        let n: u32 = ctx
                            .run_step("count", || {
                                let counter = counter.clone();
                                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
                            })
                            .await?;
                        Ok(serde_json::json!({ "n": n }))
                    })
                }))
                .build()
                .unwrap(),
        );

        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            ..Default::default()
        };
        let executor = Arc::new(
            WorkflowExecutor::new(registry.clone(), runs.clone(), store.clone()).with_retry(retry),
        );
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::new(WorkerConfig::default(), executor, runs.clone(), rx);
        let dispatcher = EventDispatcher::new(registry, runs.clone(), tx);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pool.run(shutdown.clone()));

        let ack = dispatcher
            .publish(NewEvent::new("test/count", serde_json::json!({})))
            .await
            .unwrap();
        wait_for_status(&store, ack.runs[0], RunStatus::Succeeded).await;

        let run = store.get_run(ack.runs[0]).await.unwrap().unwrap();
        assert_eq!(run.result, Some(serde_json::json!({ "n": 1 })));
        assert!(runs.failed.load(Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recovery_pages_through_all_unfinished_runs() {
        let store = Arc::new(MemoryStore::new());
        let mut pending = Vec::new();
        for n in 0..7 {
            let event = NewEvent::new("test/echo", serde_json::json!({ "n": n }))
                .into_event()
                .unwrap();
            store.insert_event_if_absent(event.clone()).await.unwrap();
            let (run, _) = store.create_run_if_absent("echo", &event.id).await.unwrap();
            pending.push(run.id);
        }

        let config = WorkerConfig {
            recovery_page_size: 3,
            ..Default::default()
        };
        let (_tx, rx) = mpsc::channel(8);
        let executor = Arc::new(WorkflowExecutor::new(registry(), store.clone(), store.clone()));
        let pool = WorkerPool::new(config, executor, store.clone(), rx);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(pool.run(shutdown.clone()));

        for run_id in pending {
            wait_for_status(&store, run_id, RunStatus::Succeeded).await;
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_active_run_is_claimed_once() {
        let active = Arc::new(Mutex::new(HashSet::new()));
        let run_id = Uuid::new_v4();

        let guard = ActiveRun::claim(&active, run_id).unwrap();
        assert!(ActiveRun::claim(&active, run_id).is_none());

        drop(guard);
        assert!(ActiveRun::claim(&active, run_id).is_some());
    }
}
