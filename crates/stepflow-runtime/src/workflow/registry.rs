use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepflow_core::workflow::{Workflow, WorkflowContext};
use stepflow_core::{ErrorKind, Result, StepflowError};

/// Type alias for boxed workflow handler function.
pub type BoxedWorkflowHandler = Arc<
    dyn for<'a> Fn(
            &'a WorkflowContext,
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>
        + Send
        + Sync,
>;

/// A registered workflow definition.
#[derive(Clone)]
pub struct WorkflowDefinition {
    /// Workflow ID, unique within the registry.
    pub id: String,
    /// Event name that triggers the workflow.
    pub trigger: String,
    /// Body (takes the raw event payload, returns the serialized result).
    pub handler: BoxedWorkflowHandler,
}

impl WorkflowDefinition {
    /// Create a definition from a [`Workflow`] implementor.
    pub fn new<W: Workflow>() -> Self {
        let info = W::info();
        Self::from_fn(info.id, info.trigger, |ctx, payload| {
            Box::pin(async move {
                let payload: W::Payload =
                    serde_json::from_value(payload).map_err(|e| StepflowError::PermanentStep {
                        kind: ErrorKind::MalformedInput,
                        message: format!("Event payload does not match workflow input: {}", e),
                    })?;
                let output = W::execute(ctx, payload).await?;
                serde_json::to_value(output).map_err(StepflowError::from)
            })
        })
    }

    /// Create a definition from a closure over the raw payload.
    pub fn from_fn<F>(id: impl Into<String>, trigger: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(
                &'a WorkflowContext,
                serde_json::Value,
            ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            trigger: trigger.into(),
            handler: Arc::new(handler),
        }
    }
}

impl std::fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// Collects definitions at startup.
#[derive(Default)]
pub struct WorkflowRegistryBuilder {
    definitions: Vec<WorkflowDefinition>,
}

impl WorkflowRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`Workflow`] implementor.
    pub fn register<W: Workflow>(self) -> Self {
        self.definition(WorkflowDefinition::new::<W>())
    }

    /// Register a prepared definition.
    pub fn definition(mut self, definition: WorkflowDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Freeze the registry. Duplicate or empty IDs are configuration errors.
    pub fn build(self) -> Result<WorkflowRegistry> {
        let mut by_id = HashMap::with_capacity(self.definitions.len());
        let mut by_trigger: HashMap<String, Vec<Arc<WorkflowDefinition>>> = HashMap::new();

        for definition in self.definitions {
            if definition.id.trim().is_empty() {
                return Err(StepflowError::Config("Workflow ID cannot be empty".into()));
            }
            if definition.trigger.trim().is_empty() {
                return Err(StepflowError::Config(format!(
                    "Workflow '{}' has no trigger event",
                    definition.id
                )));
            }
            if by_id.contains_key(&definition.id) {
                return Err(StepflowError::Config(format!(
                    "Workflow '{}' is registered more than once",
                    definition.id
                )));
            }

            let definition = Arc::new(definition);
            by_trigger
                .entry(definition.trigger.clone())
                .or_default()
                .push(definition.clone());
            by_id.insert(definition.id.clone(), definition);
        }

        tracing::debug!(workflows = by_id.len(), "Workflow registry built");
        Ok(WorkflowRegistry { by_id, by_trigger })
    }
}

/// Immutable table of workflow definitions, indexed by ID and by trigger.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    by_id: HashMap<String, Arc<WorkflowDefinition>>,
    by_trigger: HashMap<String, Vec<Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::new()
    }

    /// Get a definition by workflow ID.
    pub fn get(&self, id: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.by_id.get(id)
    }

    /// Definitions triggered by an event name, in registration order.
    pub fn for_event(&self, name: &str) -> &[Arc<WorkflowDefinition>] {
        self.by_trigger
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Get the number of registered workflows.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Get all workflow IDs.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.by_id.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_core::WorkflowInfo;

    struct Echo;

    impl Workflow for Echo {
        type Payload = serde_json::Value;
        type Output = serde_json::Value;

        fn info() -> WorkflowInfo {
            WorkflowInfo::new("echo", "test/echo")
        }

        fn execute(
            _ctx: &WorkflowContext,
            payload: Self::Payload,
        ) -> Pin<Box<dyn Future<Output = Result<Self::Output>> + Send + '_>> {
            Box::pin(async move { Ok(payload) })
        }
    }

    fn noop(id: &str, trigger: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_fn(id, trigger, |_ctx, payload| {
            Box::pin(async move { Ok(payload) })
        })
    }

    #[test]
    fn test_empty_registry() {
        let registry = WorkflowRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.for_event("anything").is_empty());
    }

    #[test]
    fn test_lookup_by_trigger_keeps_registration_order() {
        let registry = WorkflowRegistry::builder()
            .register::<Echo>()
            .definition(noop("first", "user/signup"))
            .definition(noop("second", "user/signup"))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 3);
        let ids: Vec<&str> = registry
            .for_event("user/signup")
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        assert_eq!(ids, ["first", "second"]);
        assert_eq!(registry.get("echo").unwrap().trigger, "test/echo");
        assert_eq!(registry.ids(), ["echo", "first", "second"]);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let err = WorkflowRegistry::builder()
            .definition(noop("dup", "a"))
            .definition(noop("dup", "b"))
            .build()
            .unwrap_err();
        assert!(matches!(err, StepflowError::Config(_)));
    }

    #[test]
    fn test_empty_trigger_is_rejected() {
        let err = WorkflowRegistry::builder()
            .definition(noop("lonely", " "))
            .build()
            .unwrap_err();
        assert!(matches!(err, StepflowError::Config(_)));
    }
}
