mod postgres;

pub use postgres::PostgresStore;
pub use stepflow_core::store::{MemoryStore, RunStore, StateStore};
