//! Cross-process lock over the page state file.
//!
//! Uses an OS advisory lock (`flock`/`LockFileEx` via `fd-lock`) on a sentinel
//! file. Acquisition is polled and bounded: when another holder keeps the lock
//! past the timeout we log a warning and proceed anyway. State writes are
//! small and contention is rare, so availability wins over strict exclusion.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fd_lock::RwLock;
use tracing::{debug, warn};

/// How a critical section was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The advisory lock was held for the whole section.
    Acquired,
    /// Contention outlasted the timeout; the section ran unguarded.
    TakenOver,
    /// The lock file could not be opened; the section ran unguarded.
    Unavailable,
}

/// Bounded, fail-open file lock.
#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl StateLock {
    /// Lock on `path`, polling every `poll_interval` for at most `timeout`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            poll_interval,
        }
    }

    /// Lock file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` while holding the lock. Blocks the calling thread, so call it
    /// from `spawn_blocking`. The lock is released when `f` returns.
    pub fn hold<T>(&self, f: impl FnOnce() -> T) -> (LockOutcome, T) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot open lock file, continuing unlocked");
                return (LockOutcome::Unavailable, f());
            }
        };

        let mut lock = RwLock::new(file);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match lock.try_write() {
                Ok(mut guard) => {
                    // Advisory content only; nobody relies on it.
                    let _ = guard.set_len(0);
                    let _ = write!(*guard, "{}", chrono::Utc::now().timestamp_millis());
                    debug!(attempts, "state lock acquired");
                    return (LockOutcome::Acquired, f());
                }
                Err(_) if started.elapsed() < self.timeout => {
                    thread::sleep(self.poll_interval);
                }
                Err(_) => break,
            }
        }

        warn!(
            path = %self.path.display(),
            attempts,
            waited_ms = started.elapsed().as_millis() as u64,
            "state lock acquisition timed out, taking over"
        );
        (LockOutcome::TakenOver, f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &Path, timeout_ms: u64) -> StateLock {
        StateLock::new(
            dir.join("browser_lock"),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn uncontended_lock_is_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 200);
        let (outcome, value) = lock.hold(|| 7);
        assert_eq!(outcome, LockOutcome::Acquired);
        assert_eq!(value, 7);

        // released on return, so a second hold succeeds immediately
        let (outcome, _) = lock.hold(|| ());
        assert_eq!(outcome, LockOutcome::Acquired);
    }

    #[test]
    fn contention_past_timeout_takes_over() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 50);

        let other = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock.path())
            .unwrap();
        let mut other = RwLock::new(other);
        let _held = other.write().unwrap();

        let started = Instant::now();
        let (outcome, ran) = lock.hold(|| true);
        assert_eq!(outcome, LockOutcome::TakenOver);
        assert!(ran);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
