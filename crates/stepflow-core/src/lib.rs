pub mod config;
pub mod error;
pub mod event;
pub mod retry;
pub mod store;
pub mod workflow;

pub use config::StepflowConfig;
pub use error::{Result, StepflowError};
pub use event::{Event, NewEvent};
pub use retry::{BackoffStrategy, ErrorKind, RetryDecision, RetryPolicy};
pub use store::{MemoryStore, RunCursor, RunStore, StateStore};
pub use workflow::{
    ParallelGroup, RunStatus, RunStatusReport, Services, StepError, StepRecord, StepStatus,
    Workflow, WorkflowContext, WorkflowInfo, WorkflowRun,
};
