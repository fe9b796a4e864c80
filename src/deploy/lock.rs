// ABOUTME: Host-wide lock serializing commands that mutate deployments.
// ABOUTME: Uses atomic file creation with lock info stored as JSON in the state directory.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOCK_FILENAME: &str = "offspot-demo.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another operation is running: held by {holder} (pid {pid}) since {started_at}")]
    Held {
        holder: String,
        pid: u32,
        started_at: DateTime<Utc>,
    },

    #[error("lock file {} appeared while breaking a stale lock", .0.display())]
    Contended(PathBuf),

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize lock: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Information about who holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    /// Process ID of the lock holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub started_at: DateTime<Utc>,
    /// Command holding the lock.
    pub command: String,
}

impl LockInfo {
    /// Create new lock info for the current process.
    pub fn new(command: &str) -> Self {
        Self {
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            started_at: Utc::now(),
            command: command.to_string(),
        }
    }

    /// Check if this lock is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now() - self.started_at;
        age.to_std().is_ok_and(|age| age >= max_age)
    }
}

/// A held lock; the file is removed on drop.
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
    released: bool,
}

impl DeployLock {
    /// Acquire the lock in `state_dir`.
    ///
    /// An existing lock is broken when `force` is set, when it is older than
    /// `stale_after`, or when its content is unreadable. Otherwise acquisition
    /// fails with [`LockError::Held`].
    pub fn acquire(
        state_dir: &Path,
        command: &str,
        force: bool,
        stale_after: Duration,
    ) -> Result<Self, LockError> {
        std::fs::create_dir_all(state_dir).map_err(|source| LockError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;
        let path = state_dir.join(LOCK_FILENAME);
        let info = serde_json::to_string(&LockInfo::new(command))?;

        if Self::try_create(&path, &info)? {
            return Ok(Self {
                path,
                released: false,
            });
        }

        if !Self::should_break(&path, force, stale_after)? {
            // should_break only declines for a readable, live lock.
            let existing = Self::read(&path).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
            return match existing {
                Some(existing) => Err(LockError::Held {
                    holder: existing.holder,
                    pid: existing.pid,
                    started_at: existing.started_at,
                }),
                None => Err(LockError::Contended(path)),
            };
        }

        tracing::debug!("Removing stale/forced lock at {}", path.display());
        if let Err(source) = std::fs::remove_file(&path)
            && source.kind() != io::ErrorKind::NotFound
        {
            return Err(LockError::Io { path, source });
        }

        if !Self::try_create(&path, &info)? {
            return Err(LockError::Contended(path));
        }
        Ok(Self {
            path,
            released: false,
        })
    }

    /// Create the lock file only if it does not exist yet.
    fn try_create(path: &Path, info: &str) -> Result<bool, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(info.as_bytes())
                    .map_err(|source| LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn read(path: &Path) -> io::Result<Option<LockInfo>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content).ok())
    }

    /// Check if an existing lock should be broken (stale, forced, or corrupted).
    fn should_break(path: &Path, force: bool, stale_after: Duration) -> Result<bool, LockError> {
        let existing = match Self::read(path) {
            Ok(existing) => existing,
            // Released between our attempt and now.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match existing {
            None => {
                tracing::warn!("Lock info unreadable, breaking lock");
                Ok(true)
            }
            Some(lock) if force => {
                tracing::warn!(
                    "Breaking lock held by {} (pid {}) since {}",
                    lock.holder,
                    lock.pid,
                    lock.started_at
                );
                Ok(true)
            }
            Some(lock) if lock.is_stale(stale_after) => {
                tracing::warn!(
                    "Auto-breaking stale lock held by {} (pid {}) since {}",
                    lock.holder,
                    lock.pid,
                    lock.started_at
                );
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock, reporting failures instead of ignoring them.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        std::fs::remove_file(&self.path)
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
