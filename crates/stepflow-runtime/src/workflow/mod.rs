mod dispatcher;
mod executor;
mod registry;
mod worker;

pub use dispatcher::{EventDispatcher, PublishAck};
pub use executor::WorkflowExecutor;
pub use registry::{BoxedWorkflowHandler, WorkflowDefinition, WorkflowRegistry, WorkflowRegistryBuilder};
pub use worker::WorkerPool;
