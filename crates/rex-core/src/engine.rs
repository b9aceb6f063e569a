//! The polymorphic backend contract the scheduler drives.

use crate::spec::{Spec, State, Step};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Metadata returned alongside downloaded file content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub mime: String,
    pub is_dir: bool,
}

/// A stream of raw log bytes from a running step's container.
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// A pluggable backend that the runtime scheduler drives one step at a
/// time. Implementations are independent: a local container-daemon
/// driver and a cluster-scheduler driver share no state.
///
/// `destroy` never returns an error: teardown failures are logged by
/// the implementation and never surfaced to the caller, so the
/// scheduler can guarantee cleanup runs without conflating it with
/// pipeline failure.
#[async_trait]
pub trait Engine: Send + Sync {
    /// A short, human-readable name for this backend (for logging).
    fn name(&self) -> &str;

    /// Create the run's environment: network/namespace, declared
    /// volumes, secrets, and file blobs, pull credentials.
    async fn setup(&self, spec: &Spec, cancel: &CancellationToken) -> Result<()>;

    /// Reserve the step's container, resolving its image per pull
    /// policy. Backends that conflate creation with starting may treat
    /// this as a no-op.
    async fn create(&self, spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<()>;

    /// Start the step's container running.
    async fn start(&self, spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<()>;

    /// Block until the step's container reaches a terminal state.
    /// Implementations must never return a `State` with `exited: false`;
    /// if the backend still reports the container running, re-inspect
    /// once and surface an engine error rather than return it.
    /// Cancellation must unblock this call.
    async fn wait(&self, spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<State>;

    /// Open a stream of the step's combined stdout/stderr bytes. The
    /// stream closes when the container exits.
    async fn tail(&self, spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<LogStream>;

    /// Write `data` into the step's container at `target`.
    async fn upload(
        &self,
        spec: &Spec,
        step: &Step,
        target: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Read `source` from the step's container.
    async fn download(
        &self,
        spec: &Spec,
        step: &Step,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<(FileInfo, Bytes)>;

    /// Best-effort teardown of every resource created by `setup` and
    /// step creation. Never errors; failures are logged internally.
    /// Always called with a fresh, non-cancelled token so teardown
    /// runs to completion regardless of how the run ended.
    async fn destroy(&self, spec: &Spec);
}

/// Races `fut` against `cancel`, returning `Error::Cancelled` if the
/// token fires first. Engine backends use this to make a single
/// in-flight call (a long `wait`, a slow `download`, ...) respond to
/// cancellation without threading it through every internal await.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}
