//! File-based locking for mutual exclusion across processes.
//!
//! The package database guards its creation path with an exclusive lock and
//! the stamp store serializes writers per stamp file. Locks are advisory
//! (`flock` on Unix, `LockFileEx` on Windows) and released on drop.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Diagnostic payload written into exclusively held lock files.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub pid: u32,
  pub started_at_unix: u64,
  pub operation: String,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("lock {lock_path} is held by another process: {operation} (PID {pid})")]
  Contention {
    operation: String,
    pid: u32,
    lock_path: PathBuf,
  },

  #[error("lock {lock_path} is held by another process")]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// An acquired file lock. Dropping it releases the lock.
pub struct FileLock {
  _file: File,
  path: PathBuf,
}

impl FileLock {
  /// Acquire, blocking until the lock is free.
  pub fn acquire(path: &Path, mode: LockMode, operation: &str) -> Result<Self, LockError> {
    Self::acquire_inner(path, mode, operation, true)
  }

  /// Acquire without blocking; reports the current holder on contention.
  pub fn try_acquire(path: &Path, mode: LockMode, operation: &str) -> Result<Self, LockError> {
    Self::acquire_inner(path, mode, operation, false)
  }

  fn acquire_inner(path: &Path, mode: LockMode, operation: &str, block: bool) -> Result<Self, LockError> {
    if let Some(parent) = path.parent()
      && !parent.exists()
    {
      std::fs::create_dir_all(parent).map_err(LockError::CreateDir)?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)
      .map_err(LockError::OpenFile)?;

    if let Err(err) = sys_lock(&file, mode, block) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(read_contention(path));
      }
      return Err(LockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      // Best effort: the metadata only feeds contention diagnostics.
      let metadata = LockMetadata {
        pid: std::process::id(),
        started_at_unix: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
        operation: operation.to_string(),
      };
      let _ = file.set_len(0);
      let _ = serde_json::to_writer(&file, &metadata);
    }

    Ok(FileLock {
      _file: file,
      path: path.to_path_buf(),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

fn read_contention(path: &Path) -> LockError {
  if let Ok(mut file) = File::open(path) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_ok()
      && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
    {
      return LockError::Contention {
        operation: metadata.operation,
        pid: metadata.pid,
        lock_path: path.to_path_buf(),
      };
    }
  }
  LockError::ContentionUnknown {
    lock_path: path.to_path_buf(),
  }
}

#[cfg(unix)]
fn sys_lock(file: &File, mode: LockMode, block: bool) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match (mode, block) {
    (LockMode::Shared, true) => FlockOperation::LockShared,
    (LockMode::Shared, false) => FlockOperation::NonBlockingLockShared,
    (LockMode::Exclusive, true) => FlockOperation::LockExclusive,
    (LockMode::Exclusive, false) => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn sys_lock(file: &File, mode: LockMode, block: bool) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let mut flags = match mode {
    LockMode::Shared => 0,
    LockMode::Exclusive => LOCKFILE_EXCLUSIVE_LOCK,
  };
  if !block {
    flags |= LOCKFILE_FAIL_IMMEDIATELY;
  }

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn acquire_and_release() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("db.lock");
    {
      let lock = FileLock::acquire(&path, LockMode::Exclusive, "install").unwrap();
      assert_eq!(lock.path(), path);
    }
    // Released on drop: a second exclusive acquisition succeeds.
    FileLock::try_acquire(&path, LockMode::Exclusive, "install").unwrap();
  }

  #[test]
  fn shared_locks_coexist() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("db.lock");
    let _a = FileLock::acquire(&path, LockMode::Shared, "read").unwrap();
    let _b = FileLock::try_acquire(&path, LockMode::Shared, "read").unwrap();
  }

  #[test]
  fn creates_missing_parent() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested").join("dir").join("x.lock");
    FileLock::acquire(&path, LockMode::Exclusive, "stamp").unwrap();
    assert!(path.exists());
  }
}
