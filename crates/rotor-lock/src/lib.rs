//! Advisory file locks using `flock(2)` directly.
//!
//! The guard owns the `File` (and therefore the fd) and calls
//! `flock(fd, LOCK_UN)` on drop. Locks are per open file description, so two
//! opens of the same path in one process still exclude each other.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Who holds a lock, written into the lock file on acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDiagnostic {
    pub pid: u32,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub reason: String,
}

/// Returned (inside `anyhow::Error`) when another open file description
/// holds the lock.
#[derive(Debug, thiserror::Error)]
#[error("{}", describe_busy(.lock_path, .diagnostic.as_ref()))]
pub struct LockBusy {
    pub lock_path: PathBuf,
    pub diagnostic: Option<LockDiagnostic>,
}

fn describe_busy(lock_path: &Path, diagnostic: Option<&LockDiagnostic>) -> String {
    match diagnostic {
        Some(d) => format!(
            "Lock {} held by PID {} (holder: {}, reason: {}, acquired: {})",
            lock_path.display(),
            d.pid,
            d.holder,
            d.reason,
            d.acquired_at
        ),
        None => format!(
            "Lock {} is held (unable to read diagnostic info)",
            lock_path.display()
        ),
    }
}

/// Exclusive lock guard backed by `flock(2)`.
pub struct FileLock {
    file: File,
    lock_path: PathBuf,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` is a valid file descriptor owned by `self.file`.
        // A failed unlock is still released when the fd closes right after.
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
    }
}

impl FileLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Conventional lock location: `{dir}/locks/{name}.lock`.
pub fn lock_path_for(dir: &Path, name: &str) -> PathBuf {
    dir.join("locks").join(format!("{name}.lock"))
}

/// Try to take an exclusive lock without blocking.
///
/// On success the diagnostic (pid, holder, reason, time) is written into the
/// lock file. When the lock is held elsewhere the error wraps [`LockBusy`]
/// carrying the current holder's diagnostic if it can be read.
pub fn try_acquire(lock_path: &Path, holder: &str, reason: &str) -> Result<FileLock> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

    // SAFETY: `fd` comes from the `File` opened above; the return value is checked.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
            return Err(err)
                .with_context(|| format!("Failed to lock {}", lock_path.display()));
        }
        return Err(LockBusy {
            lock_path: lock_path.to_path_buf(),
            diagnostic: read_diagnostic(lock_path),
        }
        .into());
    }

    let mut lock = FileLock {
        file,
        lock_path: lock_path.to_path_buf(),
    };
    let diagnostic = LockDiagnostic {
        pid: std::process::id(),
        holder: holder.to_string(),
        acquired_at: Utc::now(),
        reason: reason.to_string(),
    };
    let json = serde_json::to_string(&diagnostic).context("Failed to serialize lock diagnostic")?;
    lock.file
        .set_len(0)
        .context("Failed to truncate lock file")?;
    lock.file
        .write_all(json.as_bytes())
        .context("Failed to write lock diagnostic")?;
    lock.file.flush().context("Failed to flush lock file")?;

    debug!(lock = %lock_path.display(), holder, reason, "Acquired file lock");
    Ok(lock)
}

/// Poll [`try_acquire`] until it succeeds or `timeout` elapses.
///
/// Used for short critical sections (state file read-modify-write), where a
/// bounded wait is preferable to an unbounded blocking `flock`.
pub fn acquire_with_timeout(
    lock_path: &Path,
    holder: &str,
    reason: &str,
    timeout: Duration,
) -> Result<FileLock> {
    let deadline = Instant::now() + timeout;
    loop {
        match try_acquire(lock_path, holder, reason) {
            Ok(lock) => return Ok(lock),
            Err(err) if err.downcast_ref::<LockBusy>().is_some() => {
                if Instant::now() >= deadline {
                    return Err(err.context(format!(
                        "Timed out after {} ms waiting for lock",
                        timeout.as_millis()
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read the last diagnostic written into a lock file, if any.
///
/// The file keeps its content after release, so this reports the most
/// recent holder rather than proving the lock is currently held.
pub fn read_diagnostic(lock_path: &Path) -> Option<LockDiagnostic> {
    let contents = fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&contents).ok()
}
