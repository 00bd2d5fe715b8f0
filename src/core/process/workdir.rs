use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::warn;

/// Private temporary directory holding everything a launched process writes.
/// Removed when dropped; failure to remove is logged, never raised.
#[derive(Debug)]
pub struct WorkDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl WorkDir {
    /// Create `<tmp>/<prefix>.XXXXXX`
    pub fn create(prefix: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}.", prefix))
            .tempdir()?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}
