//! Error kinds surfaced by the runtime.

use thiserror::Error;

/// The terminal error kinds a pipeline run can fail with.
///
/// `OomError` takes precedence over `ExitError` when a step's container
/// both exited non-zero and was OOM-killed.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The run's cancellation token fired before the run completed.
    #[error("cancelled")]
    Cancelled,

    /// A step's container exited with a non-zero code.
    #[error("{name} : exit code {code}")]
    ExitError { name: String, code: i32 },

    /// A step's container was killed by the out-of-memory killer.
    #[error("{name} : received oom kill")]
    OomError { name: String, code: i32 },

    /// A backend (engine) operation failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// A hook returned an error.
    #[error("hook error: {0}")]
    Hook(String),
}

pub type Result<T> = std::result::Result<T, Error>;
