//! Build commands.
//!
//! A command declares its input and output paths, its dependencies on other
//! commands, and how to run: spawning an external program or a builtin file
//! copy. Flags on the command steer plan construction (`maybe_unused`) and
//! output handling; the storage kind selects which stamp partition records
//! its up-to-date state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Set while a command is not known to be needed by any selected target.
pub const MU_TRUE: u8 = 0b01;
/// Never needed directly; kept alive for side outputs (e.g. IDE copies).
pub const MU_ALWAYS: u8 = 0b10;

/// Which stamp partition records a command's up-to-date state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStorageKind {
  /// Never cached; the command always runs.
  #[default]
  None,
  /// Build-local cache.
  Local,
  /// Storage-wide cache shared between builds.
  Global,
}

/// How a command produces its effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
  /// Spawn an external program.
  Execute {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
  },
  /// Builtin copy, used for IDE output mirroring.
  Copy { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Error)]
pub enum CommandError {
  #[error("command '{name}' failed with exit code {code:?}: {stderr}")]
  Failed {
    name: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("command '{name}' could not be spawned: {source}")]
  Spawn {
    name: String,
    #[source]
    source: io::Error,
  },

  #[error("copy '{name}' failed: {source}")]
  Copy {
    name: String,
    #[source]
    source: io::Error,
  },
}

/// A node of the execution plan.
pub struct Command {
  pub name: String,
  pub kind: CommandKind,
  inputs: BTreeSet<PathBuf>,
  outputs: BTreeSet<PathBuf>,
  dependencies: Mutex<Vec<Arc<Command>>>,
  maybe_unused: AtomicU8,
  show_output: AtomicBool,
  pub command_storage: CommandStorageKind,
}

impl fmt::Debug for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Command")
      .field("name", &self.name)
      .field("outputs", &self.outputs)
      .finish_non_exhaustive()
  }
}

impl Command {
  pub fn new(name: impl Into<String>, kind: CommandKind) -> Self {
    Command {
      name: name.into(),
      kind,
      inputs: BTreeSet::new(),
      outputs: BTreeSet::new(),
      dependencies: Mutex::new(Vec::new()),
      maybe_unused: AtomicU8::new(0),
      show_output: AtomicBool::new(false),
      command_storage: CommandStorageKind::None,
    }
  }

  /// Shorthand for a program invocation.
  pub fn program(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
    Command::new(
      name,
      CommandKind::Execute {
        program: program.into(),
        args,
        env: BTreeMap::new(),
        working_dir: None,
      },
    )
  }

  pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
    self.inputs.insert(path.into());
    self
  }

  pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
    self.outputs.insert(path.into());
    self
  }

  pub fn with_storage(mut self, storage: CommandStorageKind) -> Self {
    self.command_storage = storage;
    self
  }

  pub fn inputs(&self) -> &BTreeSet<PathBuf> {
    &self.inputs
  }

  pub fn outputs(&self) -> &BTreeSet<PathBuf> {
    &self.outputs
  }

  pub fn add_dependency(&self, dep: Arc<Command>) {
    self.dependencies.lock().unwrap().push(dep);
  }

  pub fn dependencies(&self) -> Vec<Arc<Command>> {
    self.dependencies.lock().unwrap().clone()
  }

  pub fn maybe_unused(&self) -> u8 {
    self.maybe_unused.load(Ordering::Relaxed)
  }

  pub fn set_maybe_unused(&self, flags: u8) {
    self.maybe_unused.store(flags, Ordering::Relaxed);
  }

  pub fn clear_maybe_unused(&self, flags: u8) {
    self.maybe_unused.fetch_and(!flags, Ordering::Relaxed);
  }

  pub fn show_output(&self) -> bool {
    self.show_output.load(Ordering::Relaxed)
  }

  pub fn set_show_output(&self, show: bool) {
    self.show_output.store(show, Ordering::Relaxed);
  }

  /// Run the command to completion on the calling thread.
  pub fn execute(&self) -> Result<(), CommandError> {
    trace!(command = %self.name, "executing");
    match &self.kind {
      CommandKind::Execute {
        program,
        args,
        env,
        working_dir,
      } => {
        let mut cmd = process::Command::new(program);
        cmd.args(args);
        for (k, v) in env {
          cmd.env(k, v);
        }
        if let Some(dir) = working_dir {
          cmd.current_dir(dir);
        }
        let output = cmd.output().map_err(|source| CommandError::Spawn {
          name: self.name.clone(),
          source,
        })?;
        if !output.status.success() {
          return Err(CommandError::Failed {
            name: self.name.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
          });
        }
        if self.show_output() && !output.stdout.is_empty() {
          debug!(command = %self.name, stdout = %String::from_utf8_lossy(&output.stdout), "command output");
        }
        Ok(())
      }
      CommandKind::Copy { from, to } => {
        let copy = || -> io::Result<()> {
          if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
          }
          fs::copy(from, to)?;
          Ok(())
        };
        copy().map_err(|source| CommandError::Copy {
          name: self.name.clone(),
          source,
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_set_and_clear() {
    let cmd = Command::program("c", "true", vec![]);
    cmd.set_maybe_unused(MU_TRUE | MU_ALWAYS);
    cmd.clear_maybe_unused(MU_TRUE);
    assert_eq!(cmd.maybe_unused(), MU_ALWAYS);
  }

  #[test]
  fn dependencies_accumulate() {
    let a = Arc::new(Command::program("a", "true", vec![]));
    let b = Command::program("b", "true", vec![]);
    b.add_dependency(a.clone());
    assert_eq!(b.dependencies().len(), 1);
    assert_eq!(b.dependencies()[0].name, "a");
  }

  #[test]
  #[cfg(unix)]
  fn execute_reports_exit_code() {
    let ok = Command::program("ok", "true", vec![]);
    assert!(ok.execute().is_ok());

    let bad = Command::program("bad", "false", vec![]);
    match bad.execute() {
      Err(CommandError::Failed { code, .. }) => assert_eq!(code, Some(1)),
      other => panic!("expected failure, got {other:?}"),
    }
  }

  #[test]
  fn copy_creates_parent_dirs() {
    let tmp = tempfile::tempdir().unwrap();
    let from = tmp.path().join("a.txt");
    std::fs::write(&from, "data").unwrap();
    let to = tmp.path().join("nested").join("b.txt");

    let cmd = Command::new(
      "copy: b.txt",
      CommandKind::Copy {
        from: from.clone(),
        to: to.clone(),
      },
    );
    cmd.execute().unwrap();
    assert_eq!(std::fs::read_to_string(to).unwrap(), "data");
  }
}
