//! Exclusive directory lock so only one process serves a contact database.
//!
//! The lock is an advisory `flock` (Unix) or `LockFileEx` (Windows) on a
//! `LOCK` file inside the data directory. It is released when the handle
//! closes, including when the process dies.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the data directory.
pub const LOCK_FILE_NAME: &str = "LOCK";

/// Held exclusive lock on a data directory.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock without blocking.
    ///
    /// On success the holder's pid is written into the lock file so an
    /// operator can tell which process owns the directory.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another process holds the lock
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        try_lock(&file).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                IoError::new(
                    ErrorKind::WouldBlock,
                    format!("contact database {} is locked by another process", dir.display()),
                )
            } else {
                e
            }
        })?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the fd is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }

    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(IoError::new(ErrorKind::WouldBlock, err));
    }
    Err(err)
}

#[cfg(windows)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };

    if result == 0 {
        return Err(IoError::new(ErrorKind::WouldBlock, IoError::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "file locking not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_writes_pid_and_releases_on_drop() {
        let dir = tempdir().unwrap();

        {
            let lock = DirLock::acquire(dir.path()).unwrap();
            let body = std::fs::read_to_string(lock.path()).unwrap();
            assert_eq!(body.trim(), std::process::id().to_string());
        }

        assert!(DirLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn second_acquire_would_block() {
        let dir = tempdir().unwrap();
        let _held = DirLock::acquire(dir.path()).unwrap();

        let err = DirLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert!(err.to_string().contains("locked by another process"));
    }
}
