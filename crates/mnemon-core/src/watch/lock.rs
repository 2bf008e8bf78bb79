//! Single-writer watcher lock
//!
//! One lock file per project under the data directory, keyed by a stable
//! hash of the absolute project path. A lock names the holding PID; locks
//! whose PID is no longer alive are stale and reclaimed on acquire.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{watcher_lock_path, watchers_dir};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Lock error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A live process already holds the lock
    #[error("Watcher lock held by pid {pid}")]
    AlreadyHeld { pid: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt lock file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Lock result type
pub type Result<T> = std::result::Result<T, LockError>;

// ============================================================================
// LOCK RECORD
// ============================================================================

/// On-disk lock record (JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherLock {
    pub pid: u32,
    pub project_path: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub indexed_files: u64,
}

/// Whether a PID names a live process
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes without delivering; EPERM still means alive
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ============================================================================
// LOCK HANDLE
// ============================================================================

/// A held watcher lock. Dropping does NOT release; call [`LockHandle::release`]
/// so crashes leave a reclaimable stale lock rather than silently losing it.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    record: WatcherLock,
}

impl LockHandle {
    /// Acquire the lock for a project. An existing lock with a dead PID is
    /// reclaimed; a live one refuses.
    pub fn acquire(project_path: &Path) -> Result<LockHandle> {
        let lock_path = watcher_lock_path(project_path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if lock_path.exists() {
            let raw = std::fs::read_to_string(&lock_path)?;
            match serde_json::from_str::<WatcherLock>(&raw) {
                Ok(existing) if pid_alive(existing.pid) => {
                    return Err(LockError::AlreadyHeld { pid: existing.pid });
                }
                Ok(existing) => {
                    tracing::info!(
                        pid = existing.pid,
                        path = %lock_path.display(),
                        "Reclaiming stale watcher lock"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %lock_path.display(), error = %e, "Overwriting corrupt lock file");
                }
            }
        }

        let now = Utc::now();
        let record = WatcherLock {
            pid: std::process::id(),
            project_path: project_path.to_string_lossy().to_string(),
            started_at: now,
            last_activity: now,
            indexed_files: 0,
        };
        let handle = LockHandle {
            path: lock_path,
            record,
        };
        handle.persist()?;
        Ok(handle)
    }

    fn persist(&self) -> Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.record)?)?;
        Ok(())
    }

    pub fn record(&self) -> &WatcherLock {
        &self.record
    }

    /// Record activity: bump the counter and refresh `last_activity`
    pub fn touch(&mut self, indexed_files: u64) -> Result<()> {
        self.record.indexed_files += indexed_files;
        self.record.last_activity = Utc::now();
        self.persist()
    }

    /// Release the lock by deleting its file
    pub fn release(self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// All locks held by live processes. Dead holders are filtered out.
pub fn list_active() -> Result<Vec<WatcherLock>> {
    let dir = watchers_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut locks = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(lock) = serde_json::from_str::<WatcherLock>(&raw) else {
            continue;
        };
        if pid_alive(lock.pid) {
            locks.push(lock);
        }
    }
    Ok(locks)
}

// ============================================================================
// TESTS
// ============================================================================
