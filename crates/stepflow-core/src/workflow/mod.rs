mod context;
mod parallel;
mod run;
mod services;
mod step;
mod traits;

pub use context::WorkflowContext;
pub use parallel::ParallelGroup;
pub use run::{RunFailure, RunStatus, RunStatusReport, WorkflowRun};
pub use services::Services;
pub use step::{AttemptFailure, StepError, StepRecord, StepStatus};
pub use traits::{Workflow, WorkflowInfo};
