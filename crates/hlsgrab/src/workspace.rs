use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// Per-run temporary directory.
///
/// Every path handed out by [`TempWorkspace::file`] is tracked and removed by
/// [`TempWorkspace::cleanup`]. Removal is best-effort: failures are logged and never
/// returned. If `cleanup` was never awaited the workspace falls back to a synchronous
/// removal on drop.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: PathBuf,
    tracked: Mutex<Vec<PathBuf>>,
    cleaned: bool,
}

impl TempWorkspace {
    pub async fn create(root: &Path) -> Result<Self> {
        let root = std::path::absolute(root)?;
        let dir = root.join(format!("hlsgrab-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "created temp workspace");
        Ok(Self {
            dir,
            tracked: Mutex::new(Vec::new()),
            cleaned: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path for `name` inside the workspace, registered for cleanup.
    pub fn file(&self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        self.tracked.lock().push(path.clone());
        path
    }

    /// Delete every tracked file, then the directory if it is empty.
    pub async fn cleanup(mut self) {
        let tracked = std::mem::take(&mut *self.tracked.lock());
        let mut removed = 0usize;
        for path in &tracked {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
            }
        }

        if let Err(e) = tokio::fs::remove_dir(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove temp directory");
        }
        debug!(dir = %self.dir.display(), removed, "temp workspace cleaned up");
        self.cleaned = true;
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        for path in self.tracked.get_mut().drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove temp file on drop")
                }
            }
        }
        if let Err(e) = std::fs::remove_dir(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove temp directory on drop");
        }
    }
}
