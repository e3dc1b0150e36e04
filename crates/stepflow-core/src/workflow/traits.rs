use std::future::Future;
use std::pin::Pin;

use serde::{de::DeserializeOwned, Serialize};

use super::context::WorkflowContext;
use crate::Result;

/// Trait for workflow bodies.
///
/// The event payload is decoded into `Payload` before `execute` is called; a
/// payload that does not decode fails the run permanently.
pub trait Workflow: Send + Sync + 'static {
    /// Decoded event payload.
    type Payload: DeserializeOwned + Send;
    /// Final result of the run.
    type Output: Serialize + Send;

    /// Get workflow metadata.
    fn info() -> WorkflowInfo;

    /// Execute the workflow body.
    fn execute(
        ctx: &WorkflowContext,
        payload: Self::Payload,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output>> + Send + '_>>;
}

/// Workflow metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowInfo {
    /// Workflow ID, unique within the registry.
    pub id: &'static str,
    /// Name of the event that triggers this workflow.
    pub trigger: &'static str,
}

impl WorkflowInfo {
    pub const fn new(id: &'static str, trigger: &'static str) -> Self {
        Self { id, trigger }
    }
}
