use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use thiserror::Error;

/// The temp area itself failed, as opposed to anything about the document.
/// Recovery stages propagate it instead of recording a failed attempt.
#[derive(Debug, Error)]
#[error("temp storage unavailable ({action} {path}): {source}")]
pub struct TempStorageError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// True when a temp storage fault appears anywhere in the error chain
pub fn is_storage_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<TempStorageError>())
}

/// Tracks every intermediate file written during one request and removes
/// them all on release. Dropping the manager releases as well, so an aborted
/// request still cleans up.
#[derive(Debug)]
pub struct TempResourceManager {
    dir: PathBuf,
    tracked: Vec<PathBuf>,
}

impl TempResourceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tracked: Vec::new(),
        }
    }

    /// Register an externally created path for cleanup
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.tracked.contains(&path) {
            self.tracked.push(path);
        }
    }

    /// Write bytes to a uniquely named file (timestamp + random suffix) and track it
    pub fn write(&mut self, label: &str, bytes: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| storage_error("creating", &self.dir, e))?;

        let prefix = format!("labrep-{}-{}-", label, chrono::Utc::now().format("%Y%m%d%H%M%S%3f"));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".pdf")
            .tempfile_in(&self.dir)
            .map_err(|e| storage_error("creating a file in", &self.dir, e))?;

        file.write_all(bytes)
            .map_err(|e| storage_error("writing", file.path(), e))?;

        let (_, path) = file
            .keep()
            .map_err(|e| storage_error("persisting", e.file.path(), e.error))?;

        self.track(path.clone());
        Ok(path)
    }

    /// Reserve a unique, tracked output path that does not exist yet
    pub fn reserve(&mut self, label: &str) -> Result<PathBuf> {
        let path = self.write(label, &[])?;
        std::fs::remove_file(&path).ok();
        Ok(path)
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove every tracked file. Idempotent; already-missing files are fine.
    pub fn release_all(&mut self) {
        for path in self.tracked.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed temp file {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }
    }
}

fn storage_error(action: &'static str, path: &Path, source: std::io::Error) -> TempStorageError {
    TempStorageError {
        action,
        path: path.to_path_buf(),
        source,
    }
}

impl Drop for TempResourceManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
