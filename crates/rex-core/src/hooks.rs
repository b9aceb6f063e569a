//! Caller-supplied lifecycle callbacks.

use crate::engine::FileInfo;
use crate::spec::Step;
use crate::{Error, Result, RuntimeState};
use async_trait::async_trait;
use bytes::Bytes;

/// A single log line produced by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: i64,
    pub message: String,
    pub timestamp: i64,
}

/// What `before_each` decided for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeEachDecision {
    /// Proceed with the step as normal.
    Proceed,
    /// Treat the step as skipped (successfully), without creating it.
    Skip,
}

/// Caller-supplied callbacks invoked at defined points in a run.
/// Every method has a no-op default; implementors override only what
/// they need.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Invoked once, before `setup`. An error aborts the run.
    async fn before(&self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    /// Invoked once, after every stage has resolved.
    async fn after(&self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }

    /// Invoked before a step is created. Returning `Skip` elides the
    /// step entirely (it is treated as successfully skipped).
    async fn before_each(&self, _state: &RuntimeState, _step: &Step) -> Result<BeforeEachDecision> {
        Ok(BeforeEachDecision::Proceed)
    }

    /// Invoked after a step resolves. `outcome` is the error computed
    /// from the step's terminal state, if any.
    ///
    /// Returning `Some(result)` overrides the step's final outcome and
    /// bypasses `ignore_err` entirely — the hook has taken
    /// responsibility for the outcome. Returning `None` (the default,
    /// for hooks that only observe) leaves `outcome` as computed,
    /// still subject to `ignore_err` suppression.
    async fn after_each(
        &self,
        _state: &RuntimeState,
        _step: &Step,
        _outcome: Option<Error>,
    ) -> Option<Result<()>> {
        None
    }

    /// Invoked once per emitted log line, awaited before the next line
    /// is processed.
    async fn got_line(&self, _state: &RuntimeState, _step: &Step, _line: &Line) {}

    /// Invoked once per step after its log stream closes, with the
    /// full (possibly capped) buffer of lines.
    async fn got_logs(&self, _state: &RuntimeState, _step: &Step, _lines: &[Line]) {}

    /// Invoked once per `Export` entry. The hook is responsible for
    /// consuming `data` in full.
    async fn got_file(&self, _state: &RuntimeState, _info: &FileInfo, _data: Bytes) {}
}

/// A `Hooks` implementation that does nothing; the default when the
/// caller doesn't need lifecycle callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}
