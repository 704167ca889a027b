//! Advisory lock file shared between processes.
//!
//! Backed by `flock(2)`: shared for readers, exclusive for the cache
//! sweeper. Kernel locks are per open file description, so one
//! [`FileLock`] instance additionally tracks its in-process state and
//! refuses lock upgrades instead of silently converting them. All
//! acquisition is non-blocking; a busy lock is an error the caller
//! handles (the cache simply skips its sweep).

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use nix::fcntl::{flock, FlockArg};

#[derive(Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Shared(usize),
    Exclusive,
}

pub struct FileLock {
    file: std::fs::File,
    state: Mutex<LockState>,
}

/// Releases one shared hold on drop; the kernel lock goes away with the
/// last one.
pub struct SharedLockGuard<'a> {
    lock: &'a FileLock,
}

/// Releases the exclusive lock on drop.
pub struct ExclusiveLockGuard<'a> {
    lock: &'a FileLock,
}

impl FileLock {
    /// Open (creating if needed) the lock file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|err| format_err!("unable to open lock file {:?} - {}", path.as_ref(), err))?;

        Ok(Self {
            file,
            state: Mutex::new(LockState::Unlocked),
        })
    }

    /// Take a shared hold. Multiple threads may hold it at once; other
    /// processes are kept from locking exclusively.
    pub fn try_shared(&self) -> Result<SharedLockGuard<'_>, Error> {
        let mut state = self.state.lock().unwrap();
        match *state {
            LockState::Exclusive => bail!("lock file is held exclusively by this process"),
            LockState::Shared(holders) => {
                *state = LockState::Shared(holders + 1);
            }
            LockState::Unlocked => {
                flock(self.file.as_raw_fd(), FlockArg::LockSharedNonblock)
                    .map_err(|err| format_err!("shared lock unavailable - {}", err))?;
                *state = LockState::Shared(1);
            }
        }
        Ok(SharedLockGuard { lock: self })
    }

    /// Take the exclusive lock. Fails while any other process or thread
    /// holds the file in any mode.
    pub fn try_exclusive(&self) -> Result<ExclusiveLockGuard<'_>, Error> {
        let mut state = self.state.lock().unwrap();
        if *state != LockState::Unlocked {
            bail!("lock file is already held by this process");
        }
        flock(self.file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|err| format_err!("exclusive lock unavailable - {}", err))?;
        *state = LockState::Exclusive;
        Ok(ExclusiveLockGuard { lock: self })
    }

    fn release_shared(&self) {
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            LockState::Shared(1) => {
                let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
                LockState::Unlocked
            }
            LockState::Shared(holders) => LockState::Shared(holders - 1),
            other => other, // cannot happen while a guard is alive
        };
    }

    fn release_exclusive(&self) {
        let mut state = self.state.lock().unwrap();
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        *state = LockState::Unlocked;
    }
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

impl Drop for ExclusiveLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_holds_stack_and_block_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::open(dir.path().join(".lock")).unwrap();

        let first = lock.try_shared().unwrap();
        let second = lock.try_shared().unwrap();

        // upgrades are refused, not converted
        assert!(lock.try_exclusive().is_err());

        drop(first);
        assert!(lock.try_exclusive().is_err());
        drop(second);

        let exclusive = lock.try_exclusive().unwrap();
        assert!(lock.try_shared().is_err());
        drop(exclusive);

        lock.try_shared().unwrap();
    }

    #[test]
    fn lock_file_is_created_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub");
        std::fs::create_dir(&path).unwrap();
        let _lock = FileLock::open(path.join(".lock")).unwrap();
        assert!(path.join(".lock").is_file());
    }
}
