//! Local container-daemon `Engine` implementation, built on `bollard`.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use rex_core::engine::{Engine, FileInfo, LogStream, cancellable};
use rex_core::spec::{PullPolicy, Spec, State, Step};
use rex_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives pipeline steps against a local Docker-compatible daemon.
/// One container per step, named deterministically from the spec and
/// step identity so that repeated calls are idempotent.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Engine(format!("failed to connect to docker: {e}")))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn network_name(spec: &Spec) -> String {
        format!("rex-{}", spec.metadata.uid)
    }

    fn container_name(step: &Step) -> String {
        format!("rex-step-{}", step.metadata.uid)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => return Err(Error::Engine(format!("pull failed for {image}: {e}"))),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    async fn setup(&self, spec: &Spec, cancel: &CancellationToken) -> Result<()> {
        cancellable(cancel, async {
            if let Some(docker_config) = &spec.docker {
                for volume in &docker_config.volumes {
                    if let Some(empty_dir) = &volume.empty_dir {
                        if empty_dir.is_memory_backed() {
                            continue; // tmpfs volumes are created per-container, not up front.
                        }
                        self.docker
                            .create_volume(CreateVolumeOptions {
                                name: volume.metadata.name.clone(),
                                ..Default::default()
                            })
                            .await
                            .map_err(|e| Error::Engine(format!("volume create failed: {e}")))?;
                    }
                }
            }

            self.docker
                .create_network(CreateNetworkOptions {
                    name: Self::network_name(spec),
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Engine(format!("network create failed: {e}")))?;

            Ok(())
        })
        .await
    }

    async fn create(&self, spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<()> {
        cancellable(cancel, self.create_inner(spec, step)).await
    }

    async fn start(&self, _spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<()> {
        cancellable(cancel, async {
            let name = Self::container_name(step);
            self.docker
                .start_container(&name, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| Error::Engine(format!("start container failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn wait(&self, _spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<State> {
        cancellable(cancel, self.wait_inner(step)).await
    }

    async fn tail(&self, _spec: &Spec, step: &Step, cancel: &CancellationToken) -> Result<LogStream> {
        cancellable(cancel, self.tail_inner(step)).await
    }

    async fn upload(
        &self,
        _spec: &Spec,
        step: &Step,
        target: &str,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancellable(cancel, self.upload_inner(step, target, data)).await
    }

    async fn download(
        &self,
        _spec: &Spec,
        step: &Step,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<(FileInfo, Bytes)> {
        cancellable(cancel, self.download_inner(step, source)).await
    }

    async fn destroy(&self, spec: &Spec) {
        for step in &spec.steps {
            let name = Self::container_name(step);
            let _ = self.docker.kill_container::<String>(&name, None).await;
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = self.docker.remove_container(&name, Some(options)).await {
                warn!(container = %name, error = %e, "failed to remove container during destroy");
            }
        }

        if let Some(docker_config) = &spec.docker {
            for volume in &docker_config.volumes {
                if volume.empty_dir.as_ref().is_some_and(|v| !v.is_memory_backed()) {
                    let _ = self
                        .docker
                        .remove_volume(&volume.metadata.name, Some(RemoveVolumeOptions { force: true }))
                        .await;
                }
            }
        }

        let network_name = Self::network_name(spec);
        if let Err(e) = self.docker.remove_network(&network_name).await {
            warn!(network = %network_name, error = %e, "failed to remove network during destroy");
        }
    }
}

impl DockerEngine {
    async fn create_inner(&self, spec: &Spec, step: &Step) -> Result<()> {
        let name = Self::container_name(step);

        let env: Vec<String> = step
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(step.secrets.iter().filter_map(|reference| {
                spec.find_secret(&reference.name).map(|secret| {
                    let env_name = if reference.env.is_empty() {
                        reference.name.clone()
                    } else {
                        reference.env.clone()
                    };
                    format!("{env_name}={}", secret.data)
                })
            }))
            .collect();

        let binds: Vec<String> = step
            .volumes
            .iter()
            .map(|mount| format!("{}:{}", mount.name, mount.path))
            .collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            privileged: Some(step.privileged),
            network_mode: Some(Self::network_name(spec)),
            ..Default::default()
        };

        let cmd = if step.command.is_empty() && step.args.is_empty() {
            None
        } else {
            Some(step.command.iter().chain(step.args.iter()).cloned().collect())
        };

        let config = Config {
            image: Some(step.image.clone()),
            cmd,
            env: Some(env),
            working_dir: if step.working_dir.is_empty() {
                None
            } else {
                Some(step.working_dir.clone())
            },
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        if step.pull_policy == PullPolicy::Always {
            self.pull_image(&step.image).await?;
        }

        let create_options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let result = self
            .docker
            .create_container(Some(create_options.clone()), config.clone())
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_image_not_found(&e) && step.pull_policy != PullPolicy::Never => {
                // Recover from a missing image by pulling once, then retrying.
                info!(image = %step.image, "image not found, pulling and retrying create");
                self.pull_image(&step.image).await?;
                self.docker
                    .create_container(Some(create_options), config)
                    .await
                    .map_err(|e| Error::Engine(format!("create container failed: {e}")))?;
            }
            Err(e) => return Err(Error::Engine(format!("create container failed: {e}"))),
        }

        Ok(())
    }

    async fn wait_inner(&self, step: &Step) -> Result<State> {
        let name = Self::container_name(step);

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&name, Some(options));
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                warn!(step = %step.metadata.name, error = %e, "wait_container stream error");
            }
        }

        let inspect = self
            .docker
            .inspect_container(&name, None)
            .await
            .map_err(|e| Error::Engine(format!("inspect after wait failed: {e}")))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Engine("container has no state".to_string()))?;

        if state.running.unwrap_or(false) {
            // Backend reported not-running but a second look still
            // shows it running: surface an engine error rather than
            // invent a terminal state.
            return Err(Error::Engine(format!(
                "container {name} still running after wait"
            )));
        }

        Ok(State {
            exit_code: state.exit_code.unwrap_or(0) as i32,
            exited: true,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn tail_inner(&self, step: &Step) -> Result<LogStream> {
        let name = Self::container_name(step);
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let logs = self.docker.logs(&name, Some(options));
        let mapped = logs.map(|chunk| match chunk {
            Ok(LogOutput::StdOut { message })
            | Ok(LogOutput::StdErr { message })
            | Ok(LogOutput::Console { message })
            | Ok(LogOutput::StdIn { message }) => Ok(message),
            Err(e) => Err(Error::Engine(format!("log stream error: {e}"))),
        });
        Ok(Box::pin(mapped) as BoxStream<'static, Result<Bytes>>)
    }

    async fn upload_inner(&self, step: &Step, target: &str, data: Bytes) -> Result<()> {
        let name = Self::container_name(step);

        let (dir, file_name) = split_parent(target);
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, data.as_ref())
            .map_err(|e| Error::Engine(format!("tar build failed: {e}")))?;
        let archive = builder
            .into_inner()
            .map_err(|e| Error::Engine(format!("tar build failed: {e}")))?;

        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(&name, Some(options), archive.into())
            .await
            .map_err(|e| Error::Engine(format!("upload to container failed: {e}")))?;
        Ok(())
    }

    async fn download_inner(&self, step: &Step, source: &str) -> Result<(FileInfo, Bytes)> {
        let name = Self::container_name(step);
        let options = DownloadFromContainerOptions { path: source.to_string() };
        let mut stream = self.docker.download_from_container(&name, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Engine(format!("download failed: {e}")))?;
            archive.extend_from_slice(&chunk);
        }

        let mut tar = tar::Archive::new(archive.as_slice());
        let mut entries = tar
            .entries()
            .map_err(|e| Error::Engine(format!("tar read failed: {e}")))?;
        let mut entry = entries
            .next()
            .ok_or_else(|| Error::Engine(format!("no such path in container: {source}")))?
            .map_err(|e| Error::Engine(format!("tar entry read failed: {e}")))?;

        let header = entry.header().clone();
        let size = header.size().unwrap_or(0);
        let is_dir = header.entry_type().is_dir();
        let mtime = header.mtime().unwrap_or(0) as i64;
        let name_in_archive = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let mut buf = Vec::new();
        std::io::copy(&mut entry, &mut buf)
            .map_err(|e| Error::Engine(format!("tar entry copy failed: {e}")))?;

        Ok((
            FileInfo {
                name: name_in_archive,
                size,
                mtime,
                mime: String::new(),
                is_dir,
            },
            Bytes::from(buf),
        ))
    }
}

fn is_image_not_found(err: &bollard::errors::Error) -> bool {
    matches!(err, bollard::errors::Error::DockerResponseServerError { status_code: 404, .. })
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rex_core::spec::Metadata;

    #[test]
    fn container_name_is_deterministic() {
        let step = Step {
            metadata: Metadata {
                uid: "abc123".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(DockerEngine::container_name(&step), "rex-step-abc123");
    }

    #[test]
    fn split_parent_handles_root() {
        assert_eq!(split_parent("/app/out.txt"), ("/app", "out.txt"));
        assert_eq!(split_parent("/out.txt"), ("/", "out.txt"));
        assert_eq!(split_parent("out.txt"), (".", "out.txt"));
    }
}
