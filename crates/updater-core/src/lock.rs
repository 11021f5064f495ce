//! Cross-process update lock.
//!
//! Only the process holding `update.lock` may download or apply. The lock
//! is an advisory `flock` on Unix, released when the guard is dropped or
//! the process exits.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::UpdateError;

/// Held update lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct UpdateLock {
    path: PathBuf,
    _file: File,
}

impl UpdateLock {
    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// [`UpdateError::LockUnavailable`] if another process holds it, or an IO
    /// error if the lock file cannot be opened.
    pub fn acquire(path: &Path) -> Result<Self, UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !try_lock_exclusive(&file)? {
            debug!("Update lock {:?} is held elsewhere", path);
            return Err(UpdateError::LockUnavailable);
        }
        info!("Acquired update lock {:?}", path);
        Ok(Self { path: path.to_path_buf(), _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        debug!("Released update lock {:?}", self.path);
    }
}

/// Returns `Ok(false)` if another open file description holds the lock.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the duration
        // of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
