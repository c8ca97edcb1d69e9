//! Directory-based advisory lock guarding the shared state file.
//!
//! `create_dir` is the atomic test-and-set: it fails with `AlreadyExists`
//! while another process holds the lock, with no read-check-write window. A
//! lock directory whose mtime is older than the staleness threshold belongs
//! to a crashed process and is reclaimed instead of waited on.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire state lock at {}", .0.display())]
    Timeout(PathBuf),
    #[error("lock error: {0}")]
    Io(#[from] io::Error),
}

/// Tuning knobs, overridable in tests. The defaults bound acquisition to a
/// three-second window and treat a ten-second-old lock as abandoned.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub retry_interval: Duration,
    pub max_attempts: u32,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            max_attempts: 30,
            stale_after: Duration::from_secs(10),
        }
    }
}

/// A held lock. The directory is removed on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.path);
    }
}

pub async fn acquire(path: &Path) -> Result<LockGuard, LockError> {
    acquire_with(path, LockOptions::default()).await
}

pub async fn acquire_with(path: &Path, opts: LockOptions) -> Result<LockGuard, LockError> {
    let mut attempts = 0;
    loop {
        match std::fs::create_dir(path) {
            Ok(()) => {
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if is_stale(path, opts.stale_after) {
                    tracing::warn!("reclaiming stale lock at {}", path.display());
                    let _ = std::fs::remove_dir(path);
                    continue;
                }
                attempts += 1;
                if attempts >= opts.max_attempts {
                    return Err(LockError::Timeout(path.to_path_buf()));
                }
                tokio::time::sleep(opts.retry_interval).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_opts() -> LockOptions {
        LockOptions {
            retry_interval: Duration::from_millis(10),
            max_attempts: 3,
            stale_after: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn acquire_creates_and_drop_releases() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.json.lock");

        let guard = acquire(&lock_path).await.unwrap();
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.json.lock");

        let _held = acquire(&lock_path).await.unwrap();
        let result = acquire_with(&lock_path, fast_opts()).await;
        assert!(matches!(result, Err(LockError::Timeout(_))));
    }

    #[tokio::test]
    async fn acquire_succeeds_after_release() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.json.lock");

        drop(acquire(&lock_path).await.unwrap());
        let _again = acquire_with(&lock_path, fast_opts()).await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.json.lock");
        std::fs::create_dir(&lock_path).unwrap();

        let opts = LockOptions {
            retry_interval: Duration::from_millis(10),
            max_attempts: 5,
            stale_after: Duration::from_millis(50),
        };
        tokio::time::sleep(Duration::from_millis(120)).await;

        // The abandoned directory is older than the threshold: reclaimed.
        let guard = acquire_with(&lock_path, opts).await.unwrap();
        assert!(lock_path.exists());
        drop(guard);
    }

    #[tokio::test]
    async fn fresh_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("state.json.lock");
        std::fs::create_dir(&lock_path).unwrap();

        // Younger than the threshold: the acquirer must wait it out and fail.
        let result = acquire_with(&lock_path, fast_opts()).await;
        assert!(matches!(result, Err(LockError::Timeout(_))));
        assert!(lock_path.exists());
    }
}
