//! Core spec model and engine contract for the pipeline execution runtime.
//!
//! This crate contains:
//! - the `Spec`/`Step`/`Secret`/`Volume`/`File` data model and its JSON codec
//! - the `Engine` trait pluggable backends implement
//! - the `Hooks` trait callers implement to observe a run
//! - shared error types

pub mod engine;
pub mod error;
pub mod hooks;
pub mod runtime_state;
pub mod spec;

pub use engine::{Engine, cancellable};
pub use error::{Error, Result};
pub use hooks::{BeforeEachDecision, Hooks, Line, NoopHooks};
pub use runtime_state::RuntimeState;
