use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::WorkflowRegistry;
use stepflow_core::{NewEvent, Result, RunStore};

/// Acknowledgment returned by [`EventDispatcher::publish`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    /// ID of the stored event.
    pub event_id: String,
    /// Whether the event had been ingested before.
    pub duplicate: bool,
    /// Runs for this event, one per matching workflow.
    pub runs: Vec<Uuid>,
}

/// Ingests events and turns them into workflow runs.
///
/// Delivery is at-least-once. The event is stored on first sight and a run is
/// created per matching workflow unless one already exists, so redelivery
/// never produces a second run for the same `(workflow, event)` pair. An
/// existing run that is not yet terminal is queued again; the worker pool
/// ignores it while it is still executing.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: Arc<WorkflowRegistry>,
    runs: Arc<dyn RunStore>,
    queue: mpsc::Sender<Uuid>,
}

impl EventDispatcher {
    /// Create a dispatcher feeding new runs into `queue`.
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        runs: Arc<dyn RunStore>,
        queue: mpsc::Sender<Uuid>,
    ) -> Self {
        Self {
            registry,
            runs,
            queue,
        }
    }

    /// Publish an event.
    ///
    /// Malformed events are rejected with a dispatch error and never stored.
    /// Events no workflow listens to are stored and acknowledged with an empty
    /// run list.
    pub async fn publish(&self, event: NewEvent) -> Result<PublishAck> {
        let event = match event.into_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected malformed event");
                return Err(e);
            }
        };

        let (event, inserted) = self.runs.insert_event_if_absent(event).await?;
        let duplicate = !inserted;
        if duplicate {
            tracing::debug!(event_id = %event.id, event = %event.name, "Duplicate event delivery");
        }

        let definitions = self.registry.for_event(&event.name);
        if definitions.is_empty() {
            tracing::warn!(event_id = %event.id, event = %event.name, "No workflow registered for event");
            return Ok(PublishAck {
                event_id: event.id,
                duplicate,
                runs: Vec::new(),
            });
        }

        let mut runs = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let (run, created) = self
                .runs
                .create_run_if_absent(&definition.id, &event.id)
                .await?;
            runs.push(run.id);

            if created {
                tracing::info!(
                    run_id = %run.id,
                    workflow_id = %definition.id,
                    event_id = %event.id,
                    "Workflow run created"
                );
            } else if run.status.is_terminal() {
                continue;
            } else {
                tracing::debug!(
                    run_id = %run.id,
                    status = run.status.as_str(),
                    "Re-enqueueing unfinished run on redelivery"
                );
            }

            // A closed queue leaves the run unfinished; startup recovery picks it up.
            if self.queue.send(run.id).await.is_err() {
                tracing::warn!(run_id = %run.id, "Run queue closed, run left unfinished");
            }
        }

        Ok(PublishAck {
            event_id: event.id,
            duplicate,
            runs,
        })
    }
}
