//! Schema migrations, embedded in the binary and applied at startup.

mod runner;

pub use runner::{builtin_migrations, Migration, MigrationRunner};
