//! File locking so only one process owns the persisted preset collection.
//!
//! Uses flock() for advisory locking on the base directory.
//! - Daemon: acquires exclusive lock on startup, holds for lifetime
//! - CLI: acquires exclusive lock for the duration of one command

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the base directory
const LOCK_FILE_NAME: &str = "llmparser.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Attempt to acquire an exclusive lock on the base directory.
    /// Fails with `WouldBlock` if another process holds it.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = open_lock_file(base_path)?;
        Self::try_lock_exclusive(&file)?;
        Ok(FileLock { file })
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
                    "preset collection is locked by another llmparser process (daemon or CLI)",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

fn open_lock_file(base_path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(base_path.join(LOCK_FILE_NAME))
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = FileLock::try_acquire(dir.path());
        assert!(first.is_ok(), "first lock should succeed");

        // flock locks belong to the open file description, so a second open conflicts
        let second = FileLock::try_acquire(dir.path());
        assert_eq!(
            second.err().map(|e| e.kind()),
            Some(io::ErrorKind::WouldBlock)
        );

        drop(first);

        let third = FileLock::try_acquire(dir.path());
        assert!(third.is_ok(), "lock should be free after release");
    }

    #[test]
    fn test_lock_file_created_in_base_path() {
        let dir = tempfile::tempdir().unwrap();

        let _lock = FileLock::try_acquire(dir.path()).unwrap();

        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }
}
