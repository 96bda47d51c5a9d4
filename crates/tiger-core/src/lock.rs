//! Filesystem-backed mutual exclusion keyed by task id.
//!
//! The lock guards against two worker processes on the same host executing
//! one task at the same time; the in-database lease guards across hosts.
//! Both are required.
//!
//! Lock file: `<lock_dir>/<task_id>.lock` containing
//! `{task_id, pid, acquired_at}` as JSON. A lock whose recorded PID is no
//! longer alive is stale and may be reclaimed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors from runtime lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Lock directory could not be created.
    #[error("failed to create lock dir {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The lock file could not be created, read, or written.
    #[error("lock file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-disk contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockContents {
    pub task_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// An acquired runtime lock. Released on drop (best-effort unlink).
#[derive(Debug)]
pub struct RuntimeLock {
    path: PathBuf,
    // Held so the descriptor lives as long as the lock.
    _file: File,
}

impl RuntimeLock {
    /// Try to acquire the lock for a task.
    ///
    /// Returns `Ok(None)` when another live process holds it. A stale lock
    /// (recorded PID not alive, or unreadable contents) is removed and the
    /// acquisition retried once.
    pub fn acquire(lock_dir: &Path, task_id: Uuid) -> Result<Option<RuntimeLock>, LockError> {
        fs::create_dir_all(lock_dir).map_err(|source| LockError::CreateDir {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let path = lock_dir.join(format!("{task_id}.lock"));

        for attempt in 0..2 {
            match Self::try_create(&path, task_id) {
                Ok(lock) => return Ok(Some(lock)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt > 0 {
                        return Ok(None);
                    }
                    match read_lock_holder(&path) {
                        Some(contents) if pid_alive(contents.pid) => {
                            debug!(
                                task_id = %task_id,
                                holder_pid = contents.pid,
                                "lock held by live process"
                            );
                            return Ok(None);
                        }
                        holder => {
                            warn!(
                                task_id = %task_id,
                                holder_pid = holder.map(|c| c.pid),
                                "reclaiming stale lock file"
                            );
                            if let Err(source) = fs::remove_file(&path) {
                                if source.kind() != io::ErrorKind::NotFound {
                                    return Err(LockError::Io {
                                        path: path.clone(),
                                        source,
                                    });
                                }
                            }
                            // Retry the exclusive create.
                        }
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }

        Ok(None)
    }

    fn try_create(path: &Path, task_id: Uuid) -> io::Result<RuntimeLock> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        let contents = LockContents {
            task_id,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(json.as_bytes())?;
        file.flush()?;

        Ok(RuntimeLock {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock by unlinking its file. Best-effort; also happens
    /// on drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to unlink lock file");
            }
        }
    }
}

/// Read and parse a lock file. `None` when missing or malformed.
pub fn read_lock_holder(path: &Path) -> Option<LockContents> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Probe whether a PID is alive with a zero signal.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) succeeds when the process exists; EPERM also means it
    // exists but belongs to someone else.
    let ret = unsafe { libc::kill(pid as i32, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, assume the holder is alive and
    // let the operator clear the lock.
    true
}
