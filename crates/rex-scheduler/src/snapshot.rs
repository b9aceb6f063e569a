//! Artifact snapshot/restore: bridges a host filesystem and an
//! engine's per-step upload/download operations.

use crate::fs::FileSystem;
use bytes::Bytes;
use rex_core::engine::{Engine, FileInfo};
use rex_core::spec::{BackupEntry, ExportEntry, RestoreEntry, Spec, Step};
use rex_core::{Error, Result};
use tokio_util::sync::CancellationToken;

/// Restores every `Restore` entry for a step, serially, before `start`.
/// Each source is either an RFC 2397 `data:` URL (decoded inline) or a
/// path on the host filesystem.
pub async fn restore_all(
    engine: &dyn Engine,
    fs: &dyn FileSystem,
    spec: &Spec,
    step: &Step,
    cancel: &CancellationToken,
) -> Result<()> {
    for entry in &step.restore {
        restore_one(engine, fs, spec, step, entry, cancel).await?;
    }
    Ok(())
}

async fn restore_one(
    engine: &dyn Engine,
    fs: &dyn FileSystem,
    spec: &Spec,
    step: &Step,
    entry: &RestoreEntry,
    cancel: &CancellationToken,
) -> Result<()> {
    let data = if entry.source.starts_with("data:") {
        let url = data_url::DataUrl::process(&entry.source)
            .map_err(|e| Error::Engine(format!("invalid data url: {e:?}")))?;
        let (body, _fragment) = url
            .decode_to_vec()
            .map_err(|e| Error::Engine(format!("invalid data url body: {e:?}")))?;
        Bytes::from(body)
    } else {
        fs.open(&entry.source)
            .await
            .map_err(|e| Error::Engine(e.to_string()))?
    };
    engine.upload(spec, step, &entry.target, data, cancel).await
}

/// Backs up every `Backup` entry for a step concurrently, after `wait`.
/// All entries are awaited together; the first failure is returned
/// once every entry has resolved.
pub async fn backup_all(
    engine: &dyn Engine,
    fs: &dyn FileSystem,
    spec: &Spec,
    step: &Step,
    cancel: &CancellationToken,
) -> Result<()> {
    let tasks = step
        .backup
        .iter()
        .map(|entry| backup_one(engine, fs, spec, step, entry, cancel));
    futures::future::try_join_all(tasks).await?;
    Ok(())
}

async fn backup_one(
    engine: &dyn Engine,
    fs: &dyn FileSystem,
    spec: &Spec,
    step: &Step,
    entry: &BackupEntry,
    cancel: &CancellationToken,
) -> Result<()> {
    let (_info, data) = engine.download(spec, step, &entry.source, cancel).await?;
    fs.create(&entry.target, data)
        .await
        .map_err(|e| Error::Engine(e.to_string()))
}

/// Exports every `Export` entry for a step concurrently, after `wait`,
/// delivering each to the `got_file` hook via the supplied callback.
/// All entries are awaited together before this returns.
pub async fn export_all<F, Fut>(
    engine: &dyn Engine,
    spec: &Spec,
    step: &Step,
    deliver: &F,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: Fn(FileInfo, Bytes) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let tasks = step
        .export
        .iter()
        .map(|entry| export_one(engine, spec, step, entry, deliver, cancel));
    futures::future::try_join_all(tasks).await?;
    Ok(())
}

async fn export_one<F, Fut>(
    engine: &dyn Engine,
    spec: &Spec,
    step: &Step,
    entry: &ExportEntry,
    deliver: &F,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: Fn(FileInfo, Bytes) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (mut info, data) = engine.download(spec, step, &entry.path, cancel).await?;
    if !entry.mime.is_empty() {
        info.mime = entry.mime.clone();
    }
    deliver(info, data).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_prefix_detection() {
        assert!("data:text/plain;base64,aGVsbG8=".starts_with("data:"));
        assert!(!"/host/path/file.txt".starts_with("data:"));
    }
}
