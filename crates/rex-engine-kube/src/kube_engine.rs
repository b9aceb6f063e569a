//! Cluster-scheduler `Engine` implementation skeleton.
//!
//! Translating a step into a concrete pod/job manifest for a specific
//! cluster API is an external collaborator's concern; this backend
//! establishes the connection and namespace but leaves manifest
//! construction to be filled in per cluster flavor.

use async_trait::async_trait;
use bytes::Bytes;
use kube::Client;
use rex_core::engine::{Engine, FileInfo, LogStream};
use rex_core::spec::{Spec, State, Step};
use rex_core::{Error, Result};
use tokio_util::sync::CancellationToken;

pub struct KubeEngine {
    client: Client,
    namespace: String,
}

impl KubeEngine {
    pub async fn new(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Engine(format!("failed to connect to cluster: {e}")))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Engine for KubeEngine {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn setup(&self, _spec: &Spec, _cancel: &CancellationToken) -> Result<()> {
        // Namespace and credential provisioning is cluster-specific
        // and left to the caller's cluster configuration.
        Ok(())
    }

    async fn create(&self, _spec: &Spec, _step: &Step, _cancel: &CancellationToken) -> Result<()> {
        todo!("translate a step into a pod/job manifest for the target cluster")
    }

    async fn start(&self, _spec: &Spec, _step: &Step, _cancel: &CancellationToken) -> Result<()> {
        todo!("cluster schedulers typically fold start into pod creation")
    }

    async fn wait(&self, _spec: &Spec, _step: &Step, _cancel: &CancellationToken) -> Result<State> {
        todo!("watch the pod/job until it reaches a terminal phase")
    }

    async fn tail(&self, _spec: &Spec, _step: &Step, _cancel: &CancellationToken) -> Result<LogStream> {
        todo!("stream pod logs")
    }

    async fn upload(
        &self,
        _spec: &Spec,
        _step: &Step,
        _target: &str,
        _data: Bytes,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        todo!("exec-based file copy into the pod")
    }

    async fn download(
        &self,
        _spec: &Spec,
        _step: &Step,
        _source: &str,
        _cancel: &CancellationToken,
    ) -> Result<(FileInfo, Bytes)> {
        todo!("exec-based file copy out of the pod")
    }

    async fn destroy(&self, _spec: &Spec) {
        // Best-effort: delete every job/pod this run created. Left
        // unimplemented pending the concrete manifest shape above.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn connects_to_default_cluster() {
        let engine = KubeEngine::new("default").await;
        assert!(engine.is_ok());
    }
}
