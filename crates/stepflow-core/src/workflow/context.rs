use std::future::Future;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::services::Services;
use super::step::{AttemptFailure, StepError, StepRecord, StepStatus};
use crate::event::Event;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::StateStore;
use crate::{Result, StepflowError};

/// Context available to workflow bodies.
///
/// One context exists per execution of a run. Re-executing a run (after a
/// crash or a redispatch) builds a fresh context over the same store, and
/// every step that already succeeded is answered from its record.
pub struct WorkflowContext {
    /// Workflow run ID.
    pub run_id: Uuid,
    /// Workflow definition ID.
    pub workflow_id: String,
    event: Event,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    services: Arc<Services>,
    is_resumed: bool,
}

impl WorkflowContext {
    /// Create a new workflow context.
    pub fn new(
        run_id: Uuid,
        workflow_id: impl Into<String>,
        event: Event,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            event,
            store,
            retry: RetryPolicy::default(),
            services: Arc::new(Services::new()),
            is_resumed: false,
        }
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the collaborator services.
    pub fn with_services(mut self, services: Arc<Services>) -> Self {
        self.services = services;
        self
    }

    /// Mark this execution as a resumption of an interrupted run.
    pub fn resumed(mut self) -> Self {
        self.is_resumed = true;
        self
    }

    /// Check if this is a resumed execution.
    pub fn is_resumed(&self) -> bool {
        self.is_resumed
    }

    /// Get the triggering event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Get the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Look up a collaborator client by type.
    pub fn service<T: Clone + Send + Sync + 'static>(&self) -> Result<T> {
        self.services.get::<T>()
    }

    /// Run a named, memoized step.
    ///
    /// A step that already succeeded in this run returns its stored result
    /// without calling `f`; a step that already failed returns its failure.
    /// Otherwise `f` is invoked, retried per the retry policy on transient
    /// errors, and its result is committed through compare-and-set. If another
    /// executor committed first, the stored result is returned instead.
    pub async fn run_step<T, F, Fut>(&self, name: &str, mut f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, StepError>> + Send,
    {
        if let Some(record) = self.store.get(self.run_id, name).await? {
            if record.status.is_terminal() {
                tracing::debug!(
                    run_id = %self.run_id,
                    step = name,
                    status = record.status.as_str(),
                    "Step already recorded, skipping"
                );
                return decode_terminal(record);
            }
        }

        loop {
            let record = self
                .store
                .put_if_absent_or_pending(self.run_id, name)
                .await?;
            // Another executor may have finished the step since the read above.
            if record.status.is_terminal() {
                return decode_terminal(record);
            }
            let attempt = record.attempt_count;

            tracing::debug!(run_id = %self.run_id, step = name, attempt, "Running step");

            let outcome = f().await.and_then(|value| {
                let json = serde_json::to_value(&value).map_err(StepError::from)?;
                Ok((value, json))
            });

            match outcome {
                Ok((value, json)) => {
                    let mut done = record;
                    done.result = Some(json);
                    match self.store.cas_succeeded(StepStatus::Pending, done).await {
                        Ok(_) => {
                            tracing::info!(
                                run_id = %self.run_id,
                                step = name,
                                attempt,
                                "Step succeeded"
                            );
                            return Ok(value);
                        }
                        Err(StepflowError::StoreConflict { current }) => {
                            tracing::info!(
                                run_id = %self.run_id,
                                step = name,
                                status = current.status.as_str(),
                                "Step committed by another executor, discarding local result"
                            );
                            return decode_terminal(*current);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(err) => {
                    let decision = self.retry.decide(attempt, err.kind);
                    let terminal = decision == RetryDecision::GiveUp;
                    let stored = self
                        .store
                        .record_failure(
                            self.run_id,
                            name,
                            AttemptFailure::new(attempt, err.kind, err.message.clone()),
                            terminal,
                        )
                        .await?;

                    if stored.status == StepStatus::Succeeded {
                        return decode_terminal(stored);
                    }

                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::warn!(
                                run_id = %self.run_id,
                                step = name,
                                attempt,
                                kind = err.kind.as_str(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err.message,
                                "Step failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            tracing::error!(
                                run_id = %self.run_id,
                                step = name,
                                attempt,
                                kind = err.kind.as_str(),
                                error = %err.message,
                                "Step failed"
                            );
                            return Err(stored.failure_error());
                        }
                    }
                }
            }
        }
    }
}

/// Answer from a terminal record: the memoized value or the recorded failure.
fn decode_terminal<T: DeserializeOwned>(record: StepRecord) -> Result<T> {
    match record.status {
        StepStatus::Succeeded => {
            let value = record.result.unwrap_or(serde_json::Value::Null);
            serde_json::from_value(value).map_err(|e| {
                StepflowError::Deserialization(format!(
                    "Stored result of step '{}' does not decode: {}",
                    record.step_name, e
                ))
            })
        }
        StepStatus::Failed => Err(record.failure_error()),
        StepStatus::Pending => Err(StepflowError::InvalidState(format!(
            "Step '{}' is still pending",
            record.step_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::event::NewEvent;
    use crate::retry::ErrorKind;
    use crate::store::MemoryStore;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            ..Default::default()
        }
    }

    fn context(store: Arc<MemoryStore>, run_id: Uuid) -> WorkflowContext {
        let event = NewEvent::new("test/event", serde_json::json!({}))
            .with_id("evt-1")
            .into_event()
            .unwrap();
        WorkflowContext::new(run_id, "test-workflow", event, store).with_retry(fast_retry(3))
    }

    #[tokio::test]
    async fn test_second_call_is_memoized() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), Uuid::new_v4());
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let first: String = ctx
            .run_step("greet", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("hello".to_string())
            })
            .await
            .unwrap();
        let second: String = ctx
            .run_step("greet", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("different".to_string())
            })
            .await
            .unwrap();

        assert_eq!(first, "hello");
        assert_eq!(second, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replay_skips_completed_steps() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::new_v4();
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let ctx = context(store.clone(), run_id);
        let _: u32 = ctx
            .run_step("count", || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 10)
            })
            .await
            .unwrap();

        let replay = context(store.clone(), run_id).resumed();
        assert!(replay.is_resumed());
        let value: u32 = replay
            .run_step("count", || async move {
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 10)
            })
            .await
            .unwrap();

        assert_eq!(value, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::new_v4();
        let ctx = context(store.clone(), run_id);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let value: String = ctx
            .run_step("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(StepError::network("connection reset"));
                }
                Ok("done".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        let record = store.get(run_id, "flaky").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Succeeded);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[0].attempt, 1);
        assert_eq!(record.history[1].kind, ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::new_v4();
        let ctx = context(store.clone(), run_id);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = ctx
            .run_step::<(), _, _>("fail", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StepError::validation("bad input"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match err {
            StepflowError::StepFailed {
                step,
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(step, "fail");
                assert_eq!(attempts, 1);
                assert_eq!(last_error, "bad input");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // The failure is frozen: a replay does not call the body again.
        let replay = context(store.clone(), run_id);
        assert!(replay
            .run_step::<(), _, _>("fail", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausting_attempts_fails_the_step() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::new_v4();
        let ctx = context(store.clone(), run_id);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = ctx
            .run_step::<(), _, _>("always-slow", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StepError::timeout("deadline exceeded"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, StepflowError::StepFailed { attempts: 3, .. }));

        let record = store.get(run_id, "always-slow").await.unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.history.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_winner_supersedes_local_result() {
        let store = Arc::new(MemoryStore::new());
        let run_id = Uuid::new_v4();
        let ctx = context(store.clone(), run_id);

        let value: String = ctx
            .run_step("race", || {
                let store = store.clone();
                async move {
                    // A second executor commits while this attempt is in flight.
                    let mut winner = store.get(run_id, "race").await?.ok_or_else(|| {
                        StepError::internal("record missing")
                    })?;
                    winner.result = Some(serde_json::json!("winner"));
                    store.cas_succeeded(StepStatus::Pending, winner).await?;
                    Ok::<_, StepError>("loser".to_string())
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "winner");
        let record = store.get(run_id, "race").await.unwrap().unwrap();
        assert_eq!(record.result, Some(serde_json::json!("winner")));
    }

    #[tokio::test]
    async fn test_services_lookup() {
        let store = Arc::new(MemoryStore::new());
        let services = Arc::new(Services::new().with(7u8));
        let ctx = context(store, Uuid::new_v4()).with_services(services);

        assert_eq!(ctx.service::<u8>().unwrap(), 7);
        assert!(ctx.service::<String>().is_err());
        assert_eq!(ctx.event().id, "evt-1");
    }
}
