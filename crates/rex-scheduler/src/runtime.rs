//! The runtime scheduler: drives a spec's steps to completion against
//! an `Engine`, honoring dependencies, run policies, detachment,
//! hooks, and cancellation.

use crate::fs::FileSystem;
use crate::log_pipeline::{LineWriter, Masker};
use crate::planner::{self, PlanError};
use crate::snapshot;
use futures::StreamExt;
use rex_core::engine::Engine;
use rex_core::hooks::BeforeEachDecision;
use rex_core::spec::{Spec, State, Step};
use rex_core::{Error, Hooks, Result, RuntimeState};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Run(#[from] Error),
}

/// Builds a `Runtime`. Mirrors the functional-options style used
/// elsewhere in this codebase's config layer, but as a plain builder.
pub struct RuntimeBuilder {
    engine: Arc<dyn Engine>,
    hooks: Arc<dyn Hooks>,
    fs: Option<Arc<dyn FileSystem>>,
    log_cap: Option<usize>,
}

impl RuntimeBuilder {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            hooks: Arc::new(rex_core::NoopHooks),
            fs: None,
            log_cap: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_log_cap(mut self, cap: usize) -> Self {
        self.log_cap = Some(cap);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            engine: self.engine,
            hooks: self.hooks,
            fs: self.fs,
            log_cap: self.log_cap,
        }
    }
}

/// Drives one spec through `Setup` → staged step execution → `Destroy`.
pub struct Runtime {
    engine: Arc<dyn Engine>,
    hooks: Arc<dyn Hooks>,
    fs: Option<Arc<dyn FileSystem>>,
    log_cap: Option<usize>,
}

impl Runtime {
    /// Run the whole pipeline from the first stage.
    pub async fn run(&self, spec: Spec, cancel: CancellationToken) -> std::result::Result<(), RuntimeError> {
        self.resume(spec, cancel, 0).await
    }

    /// Run the pipeline starting at `start_stage`, skipping earlier
    /// stages entirely (they are assumed already complete).
    pub async fn resume(
        &self,
        spec: Spec,
        cancel: CancellationToken,
        start_stage: usize,
    ) -> std::result::Result<(), RuntimeError> {
        let stages = planner::plan(&spec)?;
        let spec = Arc::new(spec);
        let started_at = chrono::Utc::now().timestamp();
        let mut run_state = RuntimeState::new(spec.clone(), started_at);

        // Destroy must run with a fresh, never-cancelled token even if
        // the run itself was cancelled or setup failed.
        let result = self.run_inner(&spec, &stages, start_stage, cancel, &mut run_state).await;
        self.engine.destroy(&spec).await;
        result
    }

    async fn run_inner(
        &self,
        spec: &Arc<Spec>,
        stages: &[planner::Stage],
        start_stage: usize,
        cancel: CancellationToken,
        run_state: &mut RuntimeState,
    ) -> std::result::Result<(), RuntimeError> {
        self.hooks.before(run_state).await.map_err(RuntimeError::Run)?;

        self.engine
            .setup(spec, &cancel)
            .await
            .map_err(RuntimeError::Run)?;

        let mut run_error: Option<Error> = None;

        for stage in stages.iter().skip(start_stage) {
            if cancel.is_cancelled() {
                run_error = Some(Error::Cancelled);
                break;
            }

            let pipeline_failed = run_error.is_some();
            let outcomes = self
                .execute_stage(spec, stage, pipeline_failed, cancel.clone(), run_state)
                .await;

            for outcome in outcomes {
                if let Err(e) = outcome {
                    if run_error.is_none() {
                        run_error = Some(e);
                    }
                }
            }
        }

        *run_state = run_state.with_error(run_error.take().map(Arc::new));
        self.hooks.after(run_state).await.map_err(RuntimeError::Run)?;

        match &run_state.last_error {
            Some(e) => Err(RuntimeError::Run((**e).clone())),
            None => Ok(()),
        }
    }

    async fn execute_stage(
        &self,
        spec: &Arc<Spec>,
        stage: &planner::Stage,
        pipeline_failed: bool,
        cancel: CancellationToken,
        run_state: &RuntimeState,
    ) -> Vec<Result<()>> {
        let steps: Vec<Step> = stage
            .iter()
            .filter_map(|name| spec.find_step(name).cloned())
            .collect();

        let tasks = steps.into_iter().map(|step| {
            let spec = spec.clone();
            let cancel = cancel.clone();
            let run_state = run_state.with_step(&step);
            async move { self.execute_step(&spec, &step, pipeline_failed, cancel, &run_state).await }
        });

        futures::future::join_all(tasks).await
    }

    async fn execute_step(
        &self,
        spec: &Arc<Spec>,
        step: &Step,
        pipeline_failed: bool,
        cancel: CancellationToken,
        run_state: &RuntimeState,
    ) -> Result<()> {
        if !step.run_policy.should_run(pipeline_failed) {
            return Ok(());
        }

        match self.hooks.before_each(run_state, step).await {
            Ok(BeforeEachDecision::Skip) => return Ok(()),
            Ok(BeforeEachDecision::Proceed) => {}
            Err(e) => return Err(e),
        }

        let outcome = self.run_step_body(spec, step, cancel, run_state).await;

        let outcome_err = outcome.as_ref().err().cloned();
        let override_ = self.hooks.after_each(run_state, step, outcome_err).await;

        match override_ {
            // The hook took responsibility for the outcome: ignore_err
            // does not apply.
            Some(result) => result,
            None => match outcome {
                Ok(()) => Ok(()),
                Err(e) if step.ignore_err => {
                    warn!(step = %step.metadata.name, error = %e, "step failed, ignored by ignore_err");
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn run_step_body(
        &self,
        spec: &Arc<Spec>,
        step: &Step,
        cancel: CancellationToken,
        run_state: &RuntimeState,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.engine.create(spec, step, &cancel).await?;

        if let Some(fs) = &self.fs {
            snapshot::restore_all(self.engine.as_ref(), fs.as_ref(), spec, step, &cancel).await?;
        }

        self.engine.start(spec, step, &cancel).await?;

        let mut stream = self.engine.tail(spec, step, &cancel).await?;

        let masker = Masker::new(&step.secrets, &spec.secrets);
        let mut writer = LineWriter::new(masker);
        if let Some(cap) = self.log_cap {
            writer = writer.with_cap(cap);
        }

        let hooks = self.hooks.clone();
        let step_for_pump = step.clone();
        let run_state_for_pump = run_state.clone();
        let pump = async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes);
                        let line = writer.write(&text);
                        hooks.got_line(&run_state_for_pump, &step_for_pump, &line).await;
                    }
                    Err(e) => {
                        warn!(step = %step_for_pump.metadata.name, error = %e, "log stream error");
                        break;
                    }
                }
            }
            hooks
                .got_logs(&run_state_for_pump, &step_for_pump, writer.lines())
                .await;
        };
        let pump_handle = tokio::spawn(pump);

        if step.detach {
            // Sidecar/service step: do not wait, let the log pump run
            // in the background. It is reaped when destroy tears down
            // the step's container.
            info!(step = %step.metadata.name, "step detached, not waiting");
            return Ok(());
        }

        let wait = self.engine.wait(spec, step, &cancel).await;
        let _ = pump_handle.await;

        let state = wait?;

        let mut background_err: Option<Error> = None;

        if let Some(fs) = &self.fs {
            if let Err(e) =
                snapshot::backup_all(self.engine.as_ref(), fs.as_ref(), spec, step, &cancel).await
            {
                background_err.get_or_insert(e);
            }
        }

        let hooks = self.hooks.clone();
        let run_state_for_export = run_state.clone();
        let export_result = snapshot::export_all(
            self.engine.as_ref(),
            spec,
            step,
            &|info, data| {
                let hooks = hooks.clone();
                let run_state = run_state_for_export.clone();
                async move {
                    hooks.got_file(&run_state, &info, data).await;
                }
            },
            &cancel,
        )
        .await;
        if let Err(e) = export_result {
            background_err.get_or_insert(e);
        }

        derive_outcome(step, state, background_err)
    }
}

fn derive_outcome(step: &Step, state: State, background_err: Option<Error>) -> Result<()> {
    if state.oom_killed {
        return Err(Error::OomError {
            name: step.metadata.name.clone(),
            code: state.exit_code,
        });
    }
    if state.exit_code != 0 {
        return Err(Error::ExitError {
            name: step.metadata.name.clone(),
            code: state.exit_code,
        });
    }
    if let Some(e) = background_err {
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rex_core::engine::FileInfo;
    use rex_core::spec::{Metadata, RunPolicy};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn derive_outcome_oom_takes_precedence_over_exit() {
        let step = Step {
            metadata: rex_core::spec::Metadata {
                name: "build".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let state = State {
            exit_code: 137,
            exited: true,
            oom_killed: true,
        };
        let err = derive_outcome(&step, state, None).unwrap_err();
        assert!(matches!(err, Error::OomError { code: 137, .. }));
    }

    #[test]
    fn derive_outcome_nonzero_exit() {
        let step = Step {
            metadata: rex_core::spec::Metadata {
                name: "build".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let state = State {
            exit_code: 255,
            exited: true,
            oom_killed: false,
        };
        let err = derive_outcome(&step, state, None).unwrap_err();
        assert!(matches!(err, Error::ExitError { code: 255, .. }));
        assert_eq!(err.to_string(), "build : exit code 255");
    }

    #[test]
    fn derive_outcome_oom_message() {
        let step = Step {
            metadata: rex_core::spec::Metadata {
                name: "build".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let state = State {
            exit_code: 137,
            exited: true,
            oom_killed: true,
        };
        let err = derive_outcome(&step, state, None).unwrap_err();
        assert_eq!(err.to_string(), "build : received oom kill");
    }

    #[test]
    fn derive_outcome_success() {
        let step = Step::default();
        let state = State {
            exit_code: 0,
            exited: true,
            oom_killed: false,
        };
        assert!(derive_outcome(&step, state, None).is_ok());
    }

    #[derive(Clone)]
    enum TailScript {
        Empty,
        Err,
    }

    struct StepScript {
        create_err: bool,
        /// `None` means `wait` must not be called for this step
        /// (detached sidecars).
        wait: Option<State>,
        tail: TailScript,
    }

    impl Default for StepScript {
        fn default() -> Self {
            Self {
                create_err: false,
                wait: Some(State {
                    exit_code: 0,
                    exited: true,
                    oom_killed: false,
                }),
                tail: TailScript::Empty,
            }
        }
    }

    #[derive(Default)]
    struct CallLog {
        created: Vec<String>,
        started: Vec<String>,
        waited: Vec<String>,
        destroyed: usize,
    }

    /// A scripted `Engine` driving the scheduler through a fixed set of
    /// per-step outcomes, mirroring a mock-based engine double.
    struct MockEngine {
        steps: HashMap<String, StepScript>,
        calls: Mutex<CallLog>,
    }

    impl MockEngine {
        fn new(steps: HashMap<String, StepScript>) -> Self {
            Self {
                steps,
                calls: Mutex::new(CallLog::default()),
            }
        }

        fn calls(&self) -> std::sync::MutexGuard<'_, CallLog> {
            self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Engine for MockEngine {
        fn name(&self) -> &str {
            "mock"
        }

        async fn setup(&self, _spec: &Spec, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn create(&self, _spec: &Spec, step: &Step, _cancel: &CancellationToken) -> Result<()> {
            self.calls().created.push(step.metadata.name.clone());
            if self.steps[&step.metadata.name].create_err {
                return Err(Error::Engine("create failed".into()));
            }
            Ok(())
        }

        async fn start(&self, _spec: &Spec, step: &Step, _cancel: &CancellationToken) -> Result<()> {
            self.calls().started.push(step.metadata.name.clone());
            Ok(())
        }

        async fn wait(&self, _spec: &Spec, step: &Step, _cancel: &CancellationToken) -> Result<State> {
            self.calls().waited.push(step.metadata.name.clone());
            self.steps[&step.metadata.name]
                .wait
                .ok_or_else(|| Error::Engine("wait should not have been called".into()))
        }

        async fn tail(&self, _spec: &Spec, step: &Step, _cancel: &CancellationToken) -> Result<rex_core::engine::LogStream> {
            match self.steps[&step.metadata.name].tail {
                TailScript::Empty => Ok(Box::pin(futures::stream::empty())),
                TailScript::Err => Err(Error::Engine("tail failed".into())),
            }
        }

        async fn upload(
            &self,
            _spec: &Spec,
            _step: &Step,
            _target: &str,
            _data: bytes::Bytes,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn download(
            &self,
            _spec: &Spec,
            _step: &Step,
            _source: &str,
            _cancel: &CancellationToken,
        ) -> Result<(FileInfo, bytes::Bytes)> {
            Ok((FileInfo::default(), bytes::Bytes::new()))
        }

        async fn destroy(&self, _spec: &Spec) {
            self.calls().destroyed += 1;
        }
    }

    fn mock_step(name: &str, policy: RunPolicy, deps: &[&str]) -> Step {
        Step {
            metadata: Metadata {
                name: name.to_string(),
                ..Default::default()
            },
            image: "alpine".into(),
            run_policy: policy,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scenario_happy_path_single_step() {
        let mut steps = HashMap::new();
        steps.insert("step_0".to_string(), StepScript::default());
        let mock = Arc::new(MockEngine::new(steps));
        let engine: Arc<dyn Engine> = mock.clone();

        let spec = Spec {
            steps: vec![mock_step("step_0", RunPolicy::OnSuccess, &[])],
            ..Default::default()
        };
        let runtime = RuntimeBuilder::new(engine).build();

        let result = runtime.run(spec, CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(mock.calls().destroyed, 1);
    }

    #[tokio::test]
    async fn scenario_detached_sidecar_not_awaited() {
        let mut steps = HashMap::new();
        steps.insert(
            "db".to_string(),
            StepScript {
                wait: None,
                ..Default::default()
            },
        );
        steps.insert("test".to_string(), StepScript::default());
        let mock = Arc::new(MockEngine::new(steps));
        let engine: Arc<dyn Engine> = mock.clone();

        let mut db = mock_step("db", RunPolicy::OnSuccess, &[]);
        db.detach = true;
        let test_step = mock_step("test", RunPolicy::OnSuccess, &["db"]);

        let spec = Spec {
            steps: vec![db, test_step],
            ..Default::default()
        };
        let runtime = RuntimeBuilder::new(engine).build();

        let result = runtime.run(spec, CancellationToken::new()).await;
        assert!(result.is_ok());

        let calls = mock.calls();
        assert!(calls.waited.contains(&"test".to_string()));
        assert!(!calls.waited.contains(&"db".to_string()));
        assert_eq!(calls.started, vec!["db".to_string(), "test".to_string()]);
        assert_eq!(calls.destroyed, 1);
    }

    #[tokio::test]
    async fn scenario_tail_failure_propagates() {
        let mut steps = HashMap::new();
        steps.insert(
            "step_0".to_string(),
            StepScript {
                wait: None,
                tail: TailScript::Err,
                ..Default::default()
            },
        );
        let mock = Arc::new(MockEngine::new(steps));
        let engine: Arc<dyn Engine> = mock.clone();

        let spec = Spec {
            steps: vec![mock_step("step_0", RunPolicy::OnSuccess, &[])],
            ..Default::default()
        };
        let runtime = RuntimeBuilder::new(engine).build();

        let err = runtime.run(spec, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Run(Error::Engine(_))));
        assert!(mock.calls().waited.is_empty());
        assert_eq!(mock.calls().destroyed, 1);
    }

    #[tokio::test]
    async fn scenario_nonzero_exit_surfaces_exit_error() {
        let mut steps = HashMap::new();
        steps.insert(
            "step_0".to_string(),
            StepScript {
                wait: Some(State {
                    exit_code: 255,
                    exited: true,
                    oom_killed: false,
                }),
                ..Default::default()
            },
        );
        let mock = Arc::new(MockEngine::new(steps));
        let engine: Arc<dyn Engine> = mock.clone();

        let spec = Spec {
            steps: vec![mock_step("step_0", RunPolicy::OnSuccess, &[])],
            ..Default::default()
        };
        let runtime = RuntimeBuilder::new(engine).build();

        let err = runtime.run(spec, CancellationToken::new()).await.unwrap_err();
        match err {
            RuntimeError::Run(Error::ExitError { name, code }) => {
                assert_eq!(name, "step_0");
                assert_eq!(code, 255);
            }
            other => panic!("expected ExitError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_oom_takes_precedence_over_exit() {
        let mut steps = HashMap::new();
        steps.insert(
            "step_0".to_string(),
            StepScript {
                wait: Some(State {
                    exit_code: 137,
                    exited: true,
                    oom_killed: true,
                }),
                ..Default::default()
            },
        );
        let mock = Arc::new(MockEngine::new(steps));
        let engine: Arc<dyn Engine> = mock.clone();

        let spec = Spec {
            steps: vec![mock_step("step_0", RunPolicy::OnSuccess, &[])],
            ..Default::default()
        };
        let runtime = RuntimeBuilder::new(engine).build();

        let err = runtime.run(spec, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Run(Error::OomError { code: 137, .. })));
    }

    #[tokio::test]
    async fn scenario_cancellation_skips_stages_but_still_destroys() {
        let mut steps = HashMap::new();
        steps.insert(
            "step_0".to_string(),
            StepScript {
                wait: None,
                ..Default::default()
            },
        );
        let mock = Arc::new(MockEngine::new(steps));
        let engine: Arc<dyn Engine> = mock.clone();

        let spec = Spec {
            steps: vec![mock_step("step_0", RunPolicy::OnSuccess, &[])],
            ..Default::default()
        };
        let runtime = RuntimeBuilder::new(engine).build();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runtime.run(spec, cancel).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Run(Error::Cancelled)));

        let calls = mock.calls();
        assert!(calls.created.is_empty());
        assert_eq!(calls.destroyed, 1);
    }
}
