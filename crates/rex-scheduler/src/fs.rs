//! Abstract host filesystem used to snapshot and restore step artifacts.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path escapes base directory: {0}")]
    PathEscape(String),
}

pub type FsResult<T> = Result<T, FsError>;

/// An abstract filesystem the runtime reads from (`Restore`) and
/// writes to (`Backup`). A reference base-directory implementation is
/// provided below; a chroot-confined adapter is an external wiring
/// concern.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn open(&self, path: &str) -> FsResult<Bytes>;
    async fn stat(&self, path: &str) -> FsResult<FileMeta>;
    async fn create(&self, path: &str, data: Bytes) -> FsResult<()>;
    async fn remove(&self, path: &str) -> FsResult<()>;
}

#[derive(Debug, Clone)]
pub struct FileMeta {
    pub size: u64,
    pub is_dir: bool,
}

/// Confines all paths beneath a base directory, creating parent
/// directories on write as the reference implementation does.
pub struct BaseDirFileSystem {
    base: PathBuf,
}

impl BaseDirFileSystem {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, path: &str) -> FsResult<PathBuf> {
        let joined = self.base.join(path.trim_start_matches('/'));
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.base) {
            return Err(FsError::PathEscape(path.to_string()));
        }
        Ok(normalized)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl FileSystem for BaseDirFileSystem {
    async fn open(&self, path: &str) -> FsResult<Bytes> {
        let full = self.resolve(path)?;
        let data = tokio::fs::read(full).await?;
        Ok(Bytes::from(data))
    }

    async fn stat(&self, path: &str) -> FsResult<FileMeta> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(full).await?;
        Ok(FileMeta {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    async fn create(&self, path: &str, data: Bytes) -> FsResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full, data).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(full).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_parent_dir_escape() {
        let fs = BaseDirFileSystem::new("/tmp/rex-base");
        let err = fs.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, FsError::PathEscape(_)));
    }

    #[test]
    fn resolve_accepts_nested_path() {
        let fs = BaseDirFileSystem::new("/tmp/rex-base");
        let resolved = fs.resolve("artifacts/out.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/rex-base/artifacts/out.txt"));
    }
}
