//! Dependency planning, log pipeline, artifact snapshot/restore, and
//! the runtime scheduler that drives a spec against an `Engine`.

pub mod fs;
pub mod log_pipeline;
pub mod planner;
pub mod runtime;
pub mod snapshot;

pub use planner::{plan, PlanError, Stage};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeError};
