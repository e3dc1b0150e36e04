//! STEPFLOW - durable, event-triggered background workflows.
//!
//! Workflows are sequences of named steps. Each step's outcome is recorded in
//! a state store, so a run that is interrupted or redelivered replays without
//! repeating completed side effects.

pub mod demo;
mod runtime;

pub use stepflow_core;
pub use stepflow_runtime;

pub use runtime::prelude;
pub use runtime::{Stepflow, StepflowBuilder};
