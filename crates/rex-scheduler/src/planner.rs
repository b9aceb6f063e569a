//! Dependency planning: groups a spec's steps into concurrent stages.

use rex_core::spec::{Spec, Step};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("step {from:?} depends on unknown step {to:?}")]
    UnknownDependency { from: String, to: String },
    #[error("dependency cycle detected involving step {0:?}")]
    Cycle(String),
}

/// A group of step names that may be executed concurrently.
pub type Stage = Vec<String>;

/// Computes the execution plan for a spec: an ordered list of stages.
///
/// If no step declares any `depends_on` edge, the pipeline is treated
/// as "trivially serial": each step becomes its own singleton stage,
/// in declared order. Otherwise stages are the topological leveling of
/// the dependency DAG.
pub fn plan(spec: &Spec) -> Result<Vec<Stage>, PlanError> {
    validate_edges(spec)?;

    if spec.steps.iter().all(|s| s.depends_on.is_empty()) {
        return Ok(spec
            .steps
            .iter()
            .map(|s| vec![s.metadata.name.clone()])
            .collect());
    }

    leveled_stages(spec)
}

fn validate_edges(spec: &Spec) -> Result<(), PlanError> {
    let names: HashSet<&str> = spec.steps.iter().map(|s| s.metadata.name.as_str()).collect();
    for step in &spec.steps {
        for dep in &step.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    from: step.metadata.name.clone(),
                    to: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm, grouping by level so that every step in a level
/// has all of its dependencies in a strictly earlier level.
fn leveled_stages(spec: &Spec) -> Result<Vec<Stage>, PlanError> {
    let by_name: HashMap<&str, &Step> = spec
        .steps
        .iter()
        .map(|s| (s.metadata.name.as_str(), s))
        .collect();

    let mut remaining: HashMap<&str, HashSet<&str>> = by_name
        .iter()
        .map(|(name, step)| (*name, step.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut stages = Vec::new();
    let total = by_name.len();
    let mut scheduled = 0usize;

    while scheduled < total {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            let stuck = remaining.keys().next().copied().unwrap_or_default();
            return Err(PlanError::Cycle(stuck.to_string()));
        }

        // Preserve declared order within a stage.
        let mut stage: Stage = spec
            .steps
            .iter()
            .map(|s| s.metadata.name.clone())
            .filter(|n| ready.contains(&n.as_str()))
            .collect();
        stage.sort();
        stage.dedup();

        for name in &stage {
            remaining.remove(name.as_str());
        }
        for deps in remaining.values_mut() {
            for name in &stage {
                deps.remove(name.as_str());
            }
        }

        scheduled += stage.len();
        stages.push(stage);
    }

    Ok(stages)
}
