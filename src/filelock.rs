//! Advisory, cross-process exclusive lock over a path.
//!
//! Creates the backing file if missing and maps the one expected errno
//! (lock already held elsewhere) to a typed outcome instead of a
//! generic I/O error. Built on `nix::fcntl::flock`, which the kernel
//! releases when the last fd on the file closes — including when the
//! holding process crashes without a chance to unlock explicitly.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

/// A held advisory lock. Dropping it releases the lock; the lock file
/// itself is left on disk — its mere existence is never the signal,
/// only whether it's currently locked.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Blocks until the lock is acquired.
    pub fn acquire_blocking(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => return Ok(Self { file }),
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("flock {}", path.display()))
                }
            }
        }
    }

    /// Attempts to acquire the lock without blocking. Distinguishes
    /// "already held elsewhere" from any other I/O failure.
    pub fn try_acquire(path: &Path) -> Result<TryLockOutcome> {
        let file = Self::open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(TryLockOutcome::Acquired(Self { file })),
            Err(Errno::EWOULDBLOCK | Errno::EAGAIN) => Ok(TryLockOutcome::WouldBlock),
            Err(err) => Err(err).with_context(|| format!("flock {}", path.display())),
        }
    }

    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))
    }

    /// Probes whether advisory locking works at all on the filesystem
    /// backing `path`. A worker calls this once at startup so an
    /// unsupported shared filesystem fails fast with a clear diagnostic
    /// instead of silently racing other workers later.
    pub fn self_test(path: &Path) -> Result<()> {
        let lock = Self::acquire_blocking(path)?;
        drop(lock);
        Ok(())
    }
}

pub enum TryLockOutcome {
    Acquired(FileLock),
    WouldBlock,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_then_try_acquire_from_another_handle_would_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.lock");

        let _held = FileLock::acquire_blocking(&path).unwrap();
        match FileLock::try_acquire(&path).unwrap() {
            TryLockOutcome::WouldBlock => {}
            TryLockOutcome::Acquired(_) => panic!("should not have acquired a held lock"),
        }
    }

    #[test]
    fn lock_is_available_again_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.lock");

        {
            let _held = FileLock::acquire_blocking(&path).unwrap();
        }
        match FileLock::try_acquire(&path).unwrap() {
            TryLockOutcome::Acquired(_) => {}
            TryLockOutcome::WouldBlock => panic!("lock should have been released"),
        }
    }

    #[test]
    fn lock_file_is_not_removed_on_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.lock");
        {
            let _held = FileLock::acquire_blocking(&path).unwrap();
        }
        assert!(path.exists());
    }

    #[test]
    fn self_test_succeeds_on_a_normal_filesystem() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.lock");
        FileLock::self_test(&path).unwrap();
    }
}
