//! Lock helpers: poison-tolerant in-memory guards and an on-disk writer lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use super::error::{CacheError, CacheResult};

const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

fn recover<G>(
    result: LockResult<G>,
    target: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind,
                result = "poisoned_recovered",
                hint = "cached state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), target, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), target, op, "rwlock.write")
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), target, op, "mutex.lock")
}

/// Exclusive writer lock for one cache file, held as `<file>.lock`.
///
/// The lock file is created with `create_new`; a lock older than
/// `LOCK_STALE_AFTER` is assumed to belong to a crashed writer and is removed.
#[derive(Debug)]
pub(crate) struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub(crate) fn acquire(target: &Path) -> CacheResult<Self> {
        Self::acquire_with_timeout(target, LOCK_WAIT_TIMEOUT)
    }

    pub(crate) fn acquire_with_timeout(target: &Path, timeout: Duration) -> CacheResult<Self> {
        let path = lock_path(target);
        let started_at = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        debug!(
                            op = "lock::acquire",
                            result = "stale_removed",
                            path = %path.display(),
                            "Removing stale cache lock"
                        );
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started_at.elapsed() >= timeout {
                        return Err(CacheError::LockTimeout(path));
                    }
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(CacheError::io(path, err)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= LOCK_STALE_AFTER)
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn rwlock_recovers_from_poison() {
        let lock = RwLock::new(1_u32);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("first write");
            panic!("poison the lock");
        }));

        *rw_write(&lock, "test", "write") = 2;
        assert_eq!(*rw_read(&lock, "test", "read"), 2);
    }

    #[test]
    fn file_lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().expect("temp dir");
        let target = dir.path().join("bucket.json");

        let held = FileLock::acquire(&target).expect("first lock");
        let err = FileLock::acquire_with_timeout(&target, Duration::from_millis(30))
            .expect_err("second lock must time out");
        assert!(matches!(err, CacheError::LockTimeout(_)));

        drop(held);
        assert!(!lock_path(&target).exists());
        FileLock::acquire(&target).expect("lock after release");
    }
}
