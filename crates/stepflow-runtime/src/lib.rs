pub mod db;
pub mod gateway;
pub mod migrations;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use db::Database;
pub use gateway::{ApiError, GatewayServer};
pub use migrations::{Migration, MigrationRunner};
pub use store::PostgresStore;
pub use workflow::{
    EventDispatcher, PublishAck, WorkerPool, WorkflowDefinition, WorkflowExecutor,
    WorkflowRegistry, WorkflowRegistryBuilder,
};
