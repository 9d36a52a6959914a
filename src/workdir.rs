//! Job-private scratch directory.

use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, warn};

const WORKDIR_PREFIX: &str = "tubefetch-";

/// Owns one job's working directory and removes it exactly once, either via
/// [`WorkDir::cleanup`] or when dropped.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl WorkDir {
    /// Creates a fresh directory under `root`, or under the system temp dir
    /// when no root is configured.
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKDIR_PREFIX);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory on the blocking pool and waits for it.
    /// Failures are logged and otherwise ignored so they never replace the
    /// error that ended the job.
    pub async fn cleanup(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = self.path.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || remove_dir(&path, dir)).await {
            warn!(path = %self.path.display(), error = %err, "working directory removal task failed");
        }
    }
}

impl Drop for WorkDir {
    /// Inside a runtime the recursive delete is handed to the blocking pool
    /// so dropping a response body never stalls a worker thread.
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_dir(&path, dir));
            }
            Err(_) => remove_dir(&path, dir),
        }
    }
}

fn remove_dir(path: &Path, dir: TempDir) {
    match dir.close() {
        Ok(()) => debug!(path = %path.display(), "removed working directory"),
        Err(err) => warn!(
            path = %path.display(),
            error = %err,
            "failed to remove working directory"
        ),
    }
}
