//! Sentinel-file lock shared by every process writing one result table.
//!
//! The lock is the presence of a zero-byte file at `<table>.lock`. It is
//! acquired by atomic create-if-absent and released by deleting the file.
//! Contention is resolved by sleeping a randomized interval between
//! attempts, and acquisition fails with [`Error::LockTimeout`] once the
//! attempt budget is spent.
//!
//! A process killed while holding the sentinel leaves it on disk. By default
//! such orphans are never removed automatically; set
//! [`LockPolicy::stale_after`] to treat old sentinels as abandoned. Recovery
//! is serialized through a second sentinel, `<table>.lock.recover`, so two
//! processes that both saw the same orphan cannot each delete a sentinel and
//! both enter. A live holder whose sentinel outlives the threshold is
//! indistinguishable from a dead one; pick a threshold well above the
//! longest critical section.

use crate::{Error, Result};
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Default number of acquisition attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Retry and staleness settings for the sentinel lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter: Duration,
    stale_after: Option<Duration>,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(1000),
            stale_after: None,
        }
    }
}

impl LockPolicy {
    /// Create the default policy (10 attempts, 0.5s + up to 1s jitter).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of acquisition attempts (minimum 1).
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the fixed part of the back-off between attempts.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the upper bound of the random part of the back-off.
    #[must_use]
    pub const fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Treat sentinels older than `age` as orphaned and remove them.
    #[must_use]
    pub const fn stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    /// Configured attempt budget.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Configured staleness threshold, if any.
    #[must_use]
    pub const fn staleness(&self) -> Option<Duration> {
        self.stale_after
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay + Duration::from_millis(extra)
    }
}

/// Path of the sentinel guarding `table_path`.
#[must_use]
pub fn sentinel_path(table_path: &Path) -> PathBuf {
    let mut os = table_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Handle to the sentinel lock of one table file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    policy: LockPolicy,
}

impl FileLock {
    /// Create a lock handle for the table stored at `table_path`.
    #[must_use]
    pub fn new(table_path: &Path, policy: LockPolicy) -> Self {
        Self {
            path: sentinel_path(table_path),
            policy,
        }
    }

    /// Sentinel file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sentinel currently exists.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Acquire the lock, retrying with randomized back-off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] when every attempt found the sentinel
    /// present, or [`Error::Io`] for any other filesystem failure.
    pub fn acquire(&self) -> Result<LockGuard> {
        for attempt in 1..=self.policy.max_attempts {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(_) => {
                    debug!(path = %self.path.display(), attempt, "Lock acquired");
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.recover_stale()? {
                        continue;
                    }
                    if attempt < self.policy.max_attempts {
                        std::thread::sleep(self.policy.backoff());
                    }
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        warn!(
            path = %self.path.display(),
            attempts = self.policy.max_attempts,
            "Lock acquisition retries exhausted"
        );
        Err(Error::LockTimeout {
            path: self.path.clone(),
            attempts: self.policy.max_attempts,
        })
    }

    /// Wait until the sentinel is absent without creating it.
    ///
    /// Used for read-only refreshes that never mutate the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the sentinel stays present for
    /// every attempt.
    pub fn peek(&self) -> Result<()> {
        for attempt in 1..=self.policy.max_attempts {
            if !self.path.exists() || self.recover_stale()? {
                return Ok(());
            }
            if attempt < self.policy.max_attempts {
                std::thread::sleep(self.policy.backoff());
            }
        }
        Err(Error::LockTimeout {
            path: self.path.clone(),
            attempts: self.policy.max_attempts,
        })
    }

    /// Remove the sentinel if it is older than the staleness threshold.
    ///
    /// Returns `true` when the sentinel is gone and acquisition may be
    /// retried at once. Staleness is checked again while holding the
    /// recovery sentinel, so a fresh sentinel created by whoever recovered
    /// first is left alone.
    fn recover_stale(&self) -> Result<bool> {
        let Some(threshold) = self.policy.stale_after else {
            return Ok(false);
        };
        match file_age(&self.path)? {
            None => return Ok(true),
            Some(age) if age <= threshold => return Ok(false),
            Some(_) => {}
        }

        let recovery = recovery_path(&self.path);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&recovery)
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if file_age(&recovery)?.is_some_and(|age| age > threshold) {
                    warn!(path = %recovery.display(), "Removing orphaned recovery sentinel");
                    remove_if_present(&recovery)?;
                }
                return Ok(false);
            }
            Err(e) => return Err(Error::Io(e)),
        }
        let _recovering = LockGuard {
            path: recovery,
            released: false,
        };

        match file_age(&self.path)? {
            None => Ok(true),
            Some(age) if age <= threshold => Ok(false),
            Some(age) => {
                warn!(
                    path = %self.path.display(),
                    age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                    "Recovering stale lock sentinel"
                );
                remove_if_present(&self.path)?;
                Ok(true)
            }
        }
    }
}

fn recovery_path(sentinel: &Path) -> PathBuf {
    let mut os = sentinel.as_os_str().to_owned();
    os.push(".recover");
    PathBuf::from(os)
}

/// Time since `path` was last modified; `None` if it does not exist.
fn file_age(path: &Path) -> Result<Option<Duration>> {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => Ok(Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default(),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Held lock; the sentinel is deleted on [`LockGuard::release`] or drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Sentinel file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now. Releasing an already-removed sentinel is a no-op.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Lock released"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock sentinel");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}
