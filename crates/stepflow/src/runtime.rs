//! STEPFLOW runtime: durable, event-triggered workflows in a single binary.
//!
//! Wires together:
//! - the state and run stores (in-memory, or PostgreSQL with migrations)
//! - the workflow registry and executor
//! - the event dispatcher and its run queue
//! - the worker pool
//! - the HTTP gateway

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stepflow_core::config::StepflowConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::workflow::{RunStatusReport, Services, Workflow};
use stepflow_core::{MemoryStore, NewEvent, RunStore, StateStore};
use stepflow_runtime::db::Database;
use stepflow_runtime::gateway::GatewayServer;
use stepflow_runtime::migrations::MigrationRunner;
use stepflow_runtime::store::PostgresStore;
use stepflow_runtime::workflow::{
    EventDispatcher, PublishAck, WorkerPool, WorkflowDefinition, WorkflowExecutor,
    WorkflowRegistry, WorkflowRegistryBuilder,
};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;

    pub use stepflow_core::config::StepflowConfig;
    pub use stepflow_core::error::{Result, StepflowError};
    pub use stepflow_core::workflow::{
        ParallelGroup, RunStatus, RunStatusReport, StepError, Workflow, WorkflowContext,
        WorkflowInfo,
    };
    pub use stepflow_core::{ErrorKind, NewEvent, RetryPolicy};
    pub use stepflow_runtime::workflow::{PublishAck, WorkflowDefinition};

    pub use crate::{Stepflow, StepflowBuilder};
}

/// The main STEPFLOW runtime.
pub struct Stepflow {
    config: StepflowConfig,
    db: Option<Database>,
    registry: Arc<WorkflowRegistry>,
    runs: Arc<dyn RunStore>,
    executor: Arc<WorkflowExecutor>,
    dispatcher: EventDispatcher,
    queue: mpsc::Receiver<Uuid>,
    shutdown: CancellationToken,
}

impl Stepflow {
    /// Create a new builder for configuring STEPFLOW.
    pub fn builder() -> StepflowBuilder {
        StepflowBuilder::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &StepflowConfig {
        &self.config
    }

    /// Get the workflow registry.
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Get the event dispatcher.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Get the workflow executor.
    pub fn executor(&self) -> Arc<WorkflowExecutor> {
        self.executor.clone()
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Publish an event.
    pub async fn publish(&self, event: NewEvent) -> Result<PublishAck> {
        self.dispatcher.publish(event).await
    }

    /// Get a run's status, result or error, and step history.
    pub async fn run_status(&self, run_id: Uuid) -> Result<RunStatusReport> {
        self.executor.status(run_id).await
    }

    /// Run the worker pool and gateway until shutdown.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            workflows = self.registry.len(),
            persistent = self.db.is_some(),
            "STEPFLOW runtime starting"
        );

        let shutdown = self.shutdown.clone();
        let mut handles = Vec::new();

        let pool = WorkerPool::new(
            self.config.worker.clone(),
            self.executor.clone(),
            self.runs.clone(),
            self.queue,
        );
        let pool_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = pool.run(pool_shutdown).await {
                tracing::error!("Worker pool error: {}", e);
            }
        }));

        let gateway = GatewayServer::new(
            self.config.gateway.clone(),
            self.dispatcher.clone(),
            self.executor.clone(),
        );
        let gateway_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = gateway.run(gateway_shutdown).await {
                tracing::error!("Gateway server error: {}", e);
            }
        }));

        tracing::info!("STEPFLOW runtime started successfully");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Received shutdown notification");
            }
        }

        tracing::info!("Starting graceful shutdown...");
        shutdown.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        if let Some(ref db) = self.db {
            db.close().await;
        }

        tracing::info!("STEPFLOW runtime stopped");
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Builder for configuring the STEPFLOW runtime.
pub struct StepflowBuilder {
    config: Option<StepflowConfig>,
    registry: WorkflowRegistryBuilder,
    services: Services,
}

impl StepflowBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            registry: WorkflowRegistry::builder(),
            services: Services::new(),
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: StepflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a [`Workflow`] implementor.
    pub fn register<W: Workflow>(mut self) -> Self {
        self.registry = self.registry.register::<W>();
        self
    }

    /// Register a workflow definition.
    pub fn definition(mut self, definition: WorkflowDefinition) -> Self {
        self.registry = self.registry.definition(definition);
        self
    }

    /// Register a collaborator client, looked up in step bodies by type.
    pub fn service<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.services = self.services.with(value);
        self
    }

    /// Build the STEPFLOW runtime.
    ///
    /// An empty `database.url` selects the in-memory store. Otherwise the
    /// database is connected and the schema migrated before returning.
    pub async fn build(self) -> Result<Stepflow> {
        let config = self
            .config
            .ok_or_else(|| StepflowError::Config("Configuration is required".to_string()))?;
        config.validate()?;

        let registry = Arc::new(self.registry.build()?);

        let (db, runs, steps): (Option<Database>, Arc<dyn RunStore>, Arc<dyn StateStore>) =
            if config.database.is_persistent() {
                let db = Database::from_config(&config.database).await?;
                tracing::info!("Connected to database");

                MigrationRunner::new(db.pool().clone()).run().await?;
                tracing::info!("Migrations completed");

                let store = Arc::new(PostgresStore::new(db.pool().clone()));
                (Some(db), store.clone(), store)
            } else {
                tracing::info!("No database configured, using the in-memory store");
                let store = Arc::new(MemoryStore::new());
                (None, store.clone(), store)
            };

        let executor = Arc::new(
            WorkflowExecutor::new(registry.clone(), runs.clone(), steps)
                .with_retry(config.retry.policy())
                .with_services(Arc::new(self.services)),
        );

        let (queue_tx, queue) = mpsc::channel(config.worker.queue_capacity.max(1));
        let dispatcher = EventDispatcher::new(registry.clone(), runs.clone(), queue_tx);

        Ok(Stepflow {
            config,
            db,
            registry,
            runs,
            executor,
            dispatcher,
            queue,
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for StepflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}
