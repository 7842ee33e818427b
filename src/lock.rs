//! Advisory file locking for the persisted stores.
//!
//! A lock on `foo.json` is a sentinel file `foo.json.lock` created with
//! exclusive-create semantics, holding the acquisition time as epoch millis.
//! Contending acquirers poll at a short interval; a sentinel older than the
//! staleness threshold is treated as abandoned by a crashed holder and
//! deleted on sight, and a holder that outlives the full wait deadline is
//! forcibly broken. The force-break is a documented race: a genuinely slow
//! (not crashed) holder can be preempted by a second writer. Keeping the
//! staleness threshold well above normal critical-section duration is what
//! makes the window tolerable; advisory file locks cannot close it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

/// Default interval between acquisition attempts while contended.
pub const DEFAULT_POLL: Duration = Duration::from_millis(50);
/// Default total wait before force-breaking the lock.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
/// Default age past which a sentinel counts as abandoned.
pub const DEFAULT_STALE: Duration = Duration::from_secs(30);

/// Acquires and releases sentinel-file locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    poll: Duration,
    deadline: Duration,
    stale: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self {
            poll: DEFAULT_POLL,
            deadline: DEFAULT_DEADLINE,
            stale: DEFAULT_STALE,
        }
    }
}

impl LockManager {
    pub const fn new(poll: Duration, deadline: Duration, stale: Duration) -> Self {
        Self {
            poll,
            deadline,
            stale,
        }
    }

    /// Acquire the lock guarding `resource`.
    ///
    /// Blocks (polling) until the sentinel can be created. Returns a guard
    /// that releases on drop; release is idempotent.
    pub fn acquire(&self, resource: &Path) -> std::io::Result<LockGuard> {
        let lock_path = sentinel_path(resource);
        let mut started = Instant::now();

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    write!(file, "{}", Utc::now().timestamp_millis())?;
                    return Ok(LockGuard {
                        lock_path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // First write into a fresh state dir.
                    if let Some(parent) = lock_path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.holder_is_stale(&lock_path) {
                        tracing::warn!(
                            lock = %lock_path.display(),
                            "breaking stale lock (holder presumed crashed)"
                        );
                        remove_sentinel(&lock_path)?;
                        continue;
                    }
                    if started.elapsed() >= self.deadline {
                        tracing::warn!(
                            lock = %lock_path.display(),
                            deadline_ms = u64::try_from(self.deadline.as_millis()).unwrap_or(u64::MAX),
                            "wait deadline exceeded, force-breaking lock"
                        );
                        remove_sentinel(&lock_path)?;
                        started = Instant::now();
                        continue;
                    }
                    thread::sleep(self.poll);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// True when the sentinel's embedded timestamp is older than the
    /// staleness threshold. An unreadable sentinel is not stale (it usually
    /// vanished under a racing release); an unparsable one is, since no
    /// live holder of this protocol writes anything but epoch millis.
    fn holder_is_stale(&self, lock_path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(lock_path) else {
            // Racing release between our create attempt and this read.
            return false;
        };
        let Ok(acquired_ms) = content.trim().parse::<i64>() else {
            return true;
        };
        let age_ms = Utc::now().timestamp_millis().saturating_sub(acquired_ms);
        age_ms >= 0 && u128::try_from(age_ms).is_ok_and(|ms| ms > self.stale.as_millis())
    }
}

/// Held lock; removing the sentinel releases it.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Release the lock. Safe to call more than once; releasing a lock that
    /// has already been broken by another process is not an error.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = remove_sentinel(&self.lock_path) {
            tracing::warn!(lock = %self.lock_path.display(), error = %e, "failed to release lock");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn sentinel_path(resource: &Path) -> PathBuf {
    let mut os = resource.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

fn remove_sentinel(lock_path: &Path) -> std::io::Result<()> {
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
