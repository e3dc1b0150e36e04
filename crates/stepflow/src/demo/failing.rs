use std::future::Future;
use std::pin::Pin;

use stepflow_core::workflow::{StepError, Workflow, WorkflowContext, WorkflowInfo};
use stepflow_core::Result;

/// A workflow whose only step always fails permanently.
pub struct DemoError;

impl Workflow for DemoError {
    type Payload = serde_json::Value;
    type Output = ();

    fn info() -> WorkflowInfo {
        WorkflowInfo::new("demo-error", "demo/error")
    }

    fn execute(
        ctx: &WorkflowContext,
        _payload: Self::Payload,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Output>> + Send + '_>> {
        Box::pin(async move {
            ctx.run_step::<(), _, _>("fail", || async {
                Err(StepError::internal("Background job failed!"))
            })
            .await
        })
    }
}
