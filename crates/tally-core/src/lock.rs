//! Advisory run lock that keeps rollup runs against one database serialized.
//!
//! Two overlapping runs for the same category would race the id-set delete of
//! one run against the eligible-row read of the other, so callers hold a
//! [`RunLock`] for the whole hourly/daily invocation. The holder writes its
//! process id into the lock file; a caller that gives up reports it.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another process kept the lock past the caller's timeout.
    #[error("run lock {} still held after {waited:?}{holder}", .path.display())]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: Holder,
    },

    #[error("run lock file: {0}")]
    IoError(#[from] io::Error),
}

/// Process id found in a contended lock file, if it was readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder(pub Option<u32>);

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(pid) => write!(f, " (pid {pid})"),
            None => Ok(()),
        }
    }
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::StorageUnavailable,
        }
    }
}

/// Exclusive rollup lock; unlocked when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// `<db>.rollup.lock`, beside the database file.
    #[must_use]
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.file_name().unwrap_or_default().to_os_string();
        name.push(".rollup.lock");
        db_path.with_file_name(name)
    }

    /// Take the lock, retrying until `timeout` has passed.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when the lock stays held, [`LockError::IoError`]
    /// when the lock file cannot be opened or written.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        while file.try_lock_exclusive().is_err() {
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                    holder: Holder(read_holder(path)),
                });
            }
            thread::sleep(POLL);
        }

        file.set_len(0)?;
        file.rewind()?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        tracing::debug!(path = %path.display(), "took rollup run lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn release(self) {
        drop(self);
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}
