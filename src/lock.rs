//! File locking for mutual exclusion between worker processes.
//!
//! Uses flock() for advisory locking on the vector index lock file.
//! Every index mutation acquires the lock with a bounded wait; searches
//! never take it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Poll interval while waiting for a contended lock
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Attempt to acquire an exclusive lock on the given lock file.
    /// Returns `Ok(FileLock)` if acquired, or a `WouldBlock` error if held
    /// by another process.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        Self::try_lock_exclusive(&file)?;

        Ok(FileLock { file })
    }

    /// Acquire an exclusive lock, polling until available or the timeout
    /// expires. Expiry surfaces as `ErrorKind::TimedOut`.
    pub fn acquire_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + timeout;

        loop {
            match Self::try_acquire(lock_path) {
                Ok(lock) => return Ok(lock),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "gave up waiting for lock after {}ms",
                                timeout.as_millis()
                            ),
                        ));
                    }
                    std::thread::sleep(ACQUIRE_POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "index is locked by another process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // On non-Unix platforms, we don't implement locking (yet)
        // This allows the code to compile but provides no protection
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}
