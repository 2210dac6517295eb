//! Exclusively owned scratch directories
//!
//! Each submission gets one directory under the scratch root; each test case
//! gets a `tc-<n>-` directory inside it. Removal is best effort: failures are
//! retried a few times and then logged, never surfaced.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, warn};

const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Process-wide counter so concurrent jobs get distinguishable directory names
static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_scratch_id() -> u64 {
    SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    /// Fresh directory for one job (`<kind>-<n>-XXXXXX`)
    pub fn for_job(root: &Path, kind: &str) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Self::create_in(&root, &format!("{}-{}-", kind, next_scratch_id()))
    }

    /// Fresh directory for one test case inside a job directory
    pub fn for_case(parent: &Path, index: usize) -> io::Result<Self> {
        Self::create_in(parent, &format!("tc-{}-", index))
    }

    fn create_in(parent: &Path, prefix: &str) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create (if needed) and return a named subdirectory
    pub fn subdir(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.path.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Remove the directory, retrying transient failures. Never fails.
    pub async fn cleanup(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        let mut result = dir.close();
        for attempt in 1..CLEANUP_ATTEMPTS {
            match &result {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) => {
                    debug!(
                        "Cleanup attempt {} for {:?} failed: {}",
                        attempt, self.path, e
                    );
                    tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                    result = tokio::fs::remove_dir_all(&self.path).await;
                }
            }
        }

        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove scratch directory {:?}: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_and_case_dirs() {
        let root = tempfile::tempdir().unwrap();

        let job = ScratchDir::for_job(root.path(), "judge").unwrap();
        let other = ScratchDir::for_job(root.path(), "judge").unwrap();
        assert_ne!(job.path(), other.path());
        assert!(job
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("judge-"));

        let case = ScratchDir::for_case(job.path(), 3).unwrap();
        assert!(case.path().starts_with(job.path()));
        assert!(case
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tc-3-"));

        let build = job.subdir("build").unwrap();
        std::fs::write(build.join("main"), b"x").unwrap();

        let job_path = job.path().to_path_buf();
        case.cleanup().await;
        job.cleanup().await;
        other.cleanup().await;
        assert!(!job_path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_of_vanished_dir_is_silent() {
        let root = tempfile::tempdir().unwrap();
        let job = ScratchDir::for_job(root.path(), "exec").unwrap();
        std::fs::remove_dir_all(job.path()).unwrap();
        job.cleanup().await;
    }
}
