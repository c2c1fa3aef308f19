//! Time-windowed duplicate suppression.
//!
//! The marker file's mtime is the admission clock: a dispatch is admitted when
//! the marker is missing or older than the window, and admission refreshes the
//! mtime. The check-and-refresh runs under an exclusive `flock` on a sidecar
//! guard file so concurrent triggers cannot both observe a stale marker.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use kimi_common::fs::ensure_private_dir;
use kimi_common::now_utc;

use crate::layout::{LOCK_FILE, LOCK_GUARD_FILE};

#[derive(Debug, Clone)]
pub struct DedupLock {
    marker: PathBuf,
    guard: PathBuf,
    window: Duration,
}

impl DedupLock {
    pub fn new(state_dir: &Path, window: Duration) -> Self {
        Self {
            marker: state_dir.join(LOCK_FILE),
            guard: state_dir.join(LOCK_GUARD_FILE),
            window,
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `Ok(false)` when another dispatch was admitted within the window.
    pub fn admit(&self) -> Result<bool> {
        if let Some(parent) = self.marker.parent() {
            ensure_private_dir(parent)?;
        }
        let guard = self.lock_guard()?;
        let now = SystemTime::now();

        let admitted = match marker_mtime(&self.marker)? {
            Some(mtime) if self.is_fresh(mtime, now) => {
                debug!(marker = %self.marker.display(), "Dispatch marker still fresh");
                false
            }
            Some(_) | None => {
                self.touch()?;
                true
            }
        };

        let _ = guard.unlock();
        Ok(admitted)
    }

    /// Delete the marker. A missing marker is fine; other failures are logged.
    pub fn release(&self) {
        let guard = match self.lock_guard() {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Releasing dispatch marker without guard lock");
                None
            }
        };
        match fs::remove_file(&self.marker) {
            Ok(()) => debug!(marker = %self.marker.display(), "Dispatch marker released"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                marker = %self.marker.display(),
                error = %err,
                "Failed to remove dispatch marker"
            ),
        }
        if let Some(guard) = guard {
            let _ = guard.unlock();
        }
    }

    /// Release handle that removes the marker when dropped unless disarmed.
    pub fn release_on_drop(&self) -> LockRelease {
        LockRelease {
            lock: Some(self.clone()),
        }
    }

    /// A marker dated in the future (clock step) counts as fresh only while it
    /// is within one window of now.
    fn is_fresh(&self, mtime: SystemTime, now: SystemTime) -> bool {
        match now.duration_since(mtime) {
            Ok(age) => age < self.window,
            Err(ahead) => ahead.duration() < self.window,
        }
    }

    fn lock_guard(&self) -> Result<File> {
        let guard = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.guard)
            .with_context(|| format!("failed to open lock guard {}", self.guard.display()))?;
        guard
            .lock_exclusive()
            .with_context(|| format!("failed to lock {}", self.guard.display()))?;
        Ok(guard)
    }

    fn touch(&self) -> Result<()> {
        let mut file = File::create(&self.marker)
            .with_context(|| format!("failed to write {}", self.marker.display()))?;
        writeln!(file, "{} {}", std::process::id(), now_utc().to_rfc3339())
            .with_context(|| format!("failed to write {}", self.marker.display()))?;
        file.sync_all().ok();
        info!(marker = %self.marker.display(), "Dispatch admitted");
        Ok(())
    }
}

fn marker_mtime(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(
            meta.modified()
                .with_context(|| format!("no mtime for {}", path.display()))?,
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
    }
}

/// Releases the dedup marker exactly once: explicitly, or on drop.
#[derive(Debug)]
pub struct LockRelease {
    lock: Option<DedupLock>,
}

impl LockRelease {
    pub fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }

    /// Ownership of the marker moves to another process (detached worker).
    pub fn disarm(mut self) {
        self.lock = None;
    }
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    #[test]
    fn second_trigger_within_window_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DedupLock::new(temp_dir.path(), Duration::from_secs(5));

        assert!(lock.admit().unwrap());
        assert!(!lock.admit().unwrap());
        assert!(lock.marker_path().exists());
    }

    #[test]
    fn stale_marker_is_readmitted() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DedupLock::new(temp_dir.path(), Duration::from_secs(5));
        assert!(lock.admit().unwrap());

        set_mtime(
            lock.marker_path(),
            SystemTime::now() - Duration::from_secs(6),
        );
        assert!(lock.admit().unwrap());
        assert!(!lock.admit().unwrap());
    }

    #[test]
    fn future_marker_beyond_window_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DedupLock::new(temp_dir.path(), Duration::from_secs(5));
        assert!(lock.admit().unwrap());

        set_mtime(
            lock.marker_path(),
            SystemTime::now() + Duration::from_secs(3600),
        );
        assert!(lock.admit().unwrap());
    }

    #[test]
    fn release_reopens_admission() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DedupLock::new(temp_dir.path(), Duration::from_secs(60));
        assert!(lock.admit().unwrap());
        lock.release();
        lock.release();
        assert!(!lock.marker_path().exists());
        assert!(lock.admit().unwrap());
    }

    #[test]
    fn release_guard_runs_on_drop_unless_disarmed() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DedupLock::new(temp_dir.path(), Duration::from_secs(60));

        assert!(lock.admit().unwrap());
        {
            let _release = lock.release_on_drop();
        }
        assert!(!lock.marker_path().exists());

        assert!(lock.admit().unwrap());
        lock.release_on_drop().disarm();
        assert!(lock.marker_path().exists());
    }

    #[test]
    fn concurrent_triggers_admit_exactly_one() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = temp_dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = state_dir.clone();
                std::thread::spawn(move || {
                    DedupLock::new(&dir, Duration::from_secs(30))
                        .admit()
                        .unwrap()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn creates_missing_state_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let lock = DedupLock::new(&nested, Duration::from_secs(5));
        assert!(lock.admit().unwrap());
        assert!(nested.join(LOCK_FILE).exists());
    }
}
