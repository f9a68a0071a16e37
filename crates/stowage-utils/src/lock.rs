//! Advisory `flock`-based locks guarding the commit section of a single package.
//!
//! One lock file per package lives under the lock directory of a storage root. The lock is
//! held only while a document is read, validated and renamed into place, so writers on
//! distinct packages never contend.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::{LockError, LockResult},
    fs::ensure_dir_exists,
};

/// How often a busy lock is retried.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive lock on one package, released when dropped.
pub struct FileLock {
    _file: nix::fcntl::Flock<File>,
    path: PathBuf,
}

impl FileLock {
    /// Lock file path for `name` inside `lock_dir`.
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced so scoped names such as
    /// `@scope/name` map to a flat file name.
    pub fn lock_path(lock_dir: &Path, name: &str) -> PathBuf {
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        lock_dir.join(format!("{sanitized}.lock"))
    }

    fn open(lock_dir: &Path, name: &str) -> LockResult<(PathBuf, File)> {
        ensure_dir_exists(lock_dir).map_err(|err| LockError::AcquireFailed(err.to_string()))?;
        let lock_path = Self::lock_path(lock_dir, name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        Ok((lock_path, file))
    }

    /// Try to acquire the lock without blocking.
    ///
    /// Returns `None` if another holder (in this or another process) owns it.
    pub fn try_acquire(lock_dir: &Path, name: &str) -> LockResult<Option<Self>> {
        let (path, file) = Self::open(lock_dir, name)?;

        match nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock) {
            Ok(file) => {
                Ok(Some(FileLock {
                    _file: file,
                    path,
                }))
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, err)) => {
                Err(LockError::AcquireFailed(format!(
                    "{}: {}",
                    path.display(),
                    err
                )))
            }
        }
    }

    /// Polls [`FileLock::try_acquire`] on the calling thread until `timeout` elapses.
    ///
    /// Returns `None` if the lock stayed busy for the whole wait.
    pub fn acquire_within(
        lock_dir: &Path,
        name: &str,
        timeout: Duration,
    ) -> LockResult<Option<Self>> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(lock_dir, name)? {
                return Ok(Some(lock));
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
