//! The command-output stamp store.
//!
//! A stamp records a fingerprint of a command's input and output files (the
//! xor of their modification times). A command whose fingerprint matches
//! its stamp is up to date and skipped. The store is partitioned: the local
//! partition belongs to one build directory, the global one is shared
//! across builds of the same storage. Writers take a file lock per stamp.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::trace;

use forge_support::hash::{sha256_hex, shorten};
use forge_support::lock::{FileLock, LockMode};

use crate::command::{Command, CommandKind, CommandStorageKind};

const STAMP_NAME_LEN: usize = 16;

/// Partitioned stamp storage.
#[derive(Debug, Clone)]
pub struct StampStorage {
  local_dir: PathBuf,
  global_dir: PathBuf,
}

impl StampStorage {
  pub fn new(local_dir: PathBuf, global_dir: PathBuf) -> Self {
    Self { local_dir, global_dir }
  }

  fn partition(&self, kind: CommandStorageKind) -> Option<&Path> {
    match kind {
      CommandStorageKind::None => None,
      CommandStorageKind::Local => Some(&self.local_dir),
      CommandStorageKind::Global => Some(&self.global_dir),
    }
  }

  fn stamp_path(&self, cmd: &Command) -> Option<PathBuf> {
    let dir = self.partition(cmd.command_storage)?;
    Some(dir.join(format!("{}.stamp", command_key(cmd))))
  }

  /// True when the stamp matches the command's current file fingerprint.
  pub fn is_up_to_date(&self, cmd: &Command) -> bool {
    let Some(path) = self.stamp_path(cmd) else {
      return false;
    };
    let Some(current) = fingerprint(cmd) else {
      return false;
    };
    let up_to_date = fs::read_to_string(&path).is_ok_and(|stored| stored == current);
    trace!(command = %cmd.name, up_to_date, "stamp check");
    up_to_date
  }

  /// Record the command's fingerprint after a successful run.
  ///
  /// Missing input or output files simply leave no stamp; the command will
  /// run again next time.
  pub fn record(&self, cmd: &Command) -> std::io::Result<()> {
    let Some(path) = self.stamp_path(cmd) else {
      return Ok(());
    };
    let Some(current) = fingerprint(cmd) else {
      return Ok(());
    };
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    let _lock = FileLock::acquire(&path.with_extension("lock"), LockMode::Exclusive, "stamp")
      .map_err(std::io::Error::other)?;
    fs::write(&path, current)
  }
}

/// Stable identity of a command within the stamp store.
fn command_key(cmd: &Command) -> String {
  let mut key = cmd.name.clone();
  if let CommandKind::Execute { program, args, .. } = &cmd.kind {
    key.push('\n');
    key.push_str(program);
    for a in args {
      key.push('\n');
      key.push_str(a);
    }
  }
  for out in cmd.outputs() {
    key.push('\n');
    key.push_str(&out.to_string_lossy());
  }
  shorten(&sha256_hex(key.as_bytes()), STAMP_NAME_LEN)
}

/// Xor of the modification times of every declared file. `None` when any
/// file is missing.
fn fingerprint(cmd: &Command) -> Option<String> {
  let mut acc: u128 = 0;
  for path in cmd.inputs().iter().chain(cmd.outputs()) {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let nanos = mtime.duration_since(UNIX_EPOCH).ok()?.as_nanos();
    acc ^= nanos;
  }
  Some(format!("{acc:032x}"))
}
