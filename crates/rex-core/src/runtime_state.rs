//! The ephemeral snapshot passed to every hook.

use crate::spec::{Spec, Step};
use crate::Error;
use std::sync::Arc;

/// A read-only snapshot of where a run currently is, handed to every
/// hook invocation. Hooks never mutate it.
#[derive(Clone)]
pub struct RuntimeState {
    pub spec: Arc<Spec>,
    pub current_step: Option<Step>,
    pub last_error: Option<Arc<Error>>,
    pub started_at_unix: i64,
}

impl RuntimeState {
    pub fn new(spec: Arc<Spec>, started_at_unix: i64) -> Self {
        Self {
            spec,
            current_step: None,
            last_error: None,
            started_at_unix,
        }
    }

    pub fn with_step(&self, step: &Step) -> Self {
        Self {
            spec: self.spec.clone(),
            current_step: Some(step.clone()),
            last_error: self.last_error.clone(),
            started_at_unix: self.started_at_unix,
        }
    }

    pub fn with_error(&self, error: Option<Arc<Error>>) -> Self {
        Self {
            spec: self.spec.clone(),
            current_step: self.current_step.clone(),
            last_error: error,
            started_at_unix: self.started_at_unix,
        }
    }
}
