//! Cross-process lock for lifecycle operations.
//!
//! The lock is a JSON file `{"lock_pid": .., "lock_holder": ..}` created with
//! `O_EXCL`. A lock whose process no longer exists is stale and is taken over.
//! [`LockGuard`] removes the file when dropped.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_SLEEP: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 12;

/// Holder strings used by the CLI.
pub const HOLDER_JOIN: &str = "elxr-pro join";
pub const HOLDER_LEAVE: &str = "elxr-pro leave";

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_pid: i32,
    pub lock_holder: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub sleep: Duration,
    pub max_retries: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            sleep: DEFAULT_SLEEP,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Outcome of one acquisition attempt.
enum Attempt {
    Acquired(LockGuard),
    Held(LockRecord),
    Stale,
}

/// Lock acquisition that retries while another live process holds the lock.
#[derive(Debug, Clone)]
pub struct RetryLock {
    path: PathBuf,
    holder: String,
    options: LockOptions,
}

impl RetryLock {
    pub fn new(path: impl Into<PathBuf>, holder: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            holder: holder.into(),
            options: LockOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    /// Acquire the lock, sleeping between attempts.
    ///
    /// Fails with [`Error::LockHeld`] once the retry budget is spent.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let mut retries = 0;
        loop {
            match self.try_acquire()? {
                Attempt::Acquired(guard) => return Ok(guard),
                Attempt::Stale => {}
                Attempt::Held(record) => {
                    if retries >= self.options.max_retries {
                        return Err(Error::LockHeld {
                            lock_request: self.holder.clone(),
                            lock_holder: record.lock_holder,
                            pid: record.lock_pid,
                        });
                    }
                    retries += 1;
                    tracing::debug!(
                        holder = %record.lock_holder,
                        pid = record.lock_pid,
                        "lock held, retry {retries}/{}",
                        self.options.max_retries
                    );
                    tokio::time::sleep(self.options.sleep).await;
                }
            }
        }
    }

    fn try_acquire(&self) -> Result<Attempt> {
        if let Some(dir) = self.path.parent() {
            DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        }
        let record = LockRecord {
            lock_pid: i32::try_from(std::process::id()).unwrap_or(i32::MAX),
            lock_holder: self.holder.clone(),
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.path)
        {
            Ok(mut file) => {
                let guard = LockGuard {
                    path: self.path.clone(),
                };
                file.write_all(serde_json::to_string(&record)?.as_bytes())?;
                tracing::debug!(holder = %self.holder, path = %self.path.display(), "lock acquired");
                Ok(Attempt::Acquired(guard))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => self.inspect_existing(),
            Err(e) => Err(e.into()),
        }
    }

    fn inspect_existing(&self) -> Result<Attempt> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            // Released between our open and read.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Stale),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            // Another process is between create and write.
            return Ok(Attempt::Held(LockRecord {
                lock_pid: 0,
                lock_holder: "unknown".to_string(),
            }));
        }
        let record: LockRecord =
            serde_json::from_str(&content).map_err(|_| Error::InvalidLockFile {
                path: self.path.clone(),
            })?;
        if record.lock_pid > 0 && !process_alive(record.lock_pid) {
            tracing::warn!(
                pid = record.lock_pid,
                holder = %record.lock_holder,
                "removing stale lock file {}",
                self.path.display()
            );
            remove_lock(&self.path)?;
            return Ok(Attempt::Stale);
        }
        Ok(Attempt::Held(record))
    }
}

fn process_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

fn remove_lock(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Held lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_lock(&self.path) {
            tracing::warn!("failed to remove lock file {}: {e}", self.path.display());
        } else {
            tracing::debug!("lock released: {}", self.path.display());
        }
    }
}
