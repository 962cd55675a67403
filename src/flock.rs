//! Directory-exclusive open.
//!
//! Segment files are single-writer: two instances appending to the same
//! `<fid>.dat` set would interleave entries and tear the log. `Db::open`
//! therefore takes an advisory lock on a well-known file inside the
//! database directory and holds it until the instance drops; a second
//! open of the same directory fails immediately instead of blocking.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

const LOCK_FILE: &str = "emberdb.lock";

/// Holds the database directory's advisory lock for the lifetime of an
/// open instance. The holder's process ID is written into the lock file
/// so a stuck lock can be traced to its owner.
pub struct DirLock {
    file: File,
}

impl DirLock {
    /// Claims exclusive use of `dir`. Fails with the OS error when
    /// another instance already holds the directory.
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(LOCK_FILE))?;

        #[cfg(unix)]
        {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // The lock file itself stays behind; removing it would race a
        // concurrent opener that has already opened the same inode.
        #[cfg(unix)]
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_records_owner_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let _lock = DirLock::acquire(dir.path()).expect("Failed to acquire lock");

        let content = std::fs::read_to_string(dir.path().join(LOCK_FILE))
            .expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let _held = DirLock::acquire(dir.path()).expect("Failed to acquire lock");
        assert!(
            DirLock::acquire(dir.path()).is_err(),
            "a held directory must refuse a second instance"
        );
    }

    #[test]
    fn test_drop_releases_the_directory() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let _lock = DirLock::acquire(dir.path()).expect("Failed to acquire lock");
        }

        // The lock file survives the drop, but the directory is free again.
        assert!(dir.path().join(LOCK_FILE).exists());
        let _lock = DirLock::acquire(dir.path()).expect("Failed to reacquire after drop");
    }
}
