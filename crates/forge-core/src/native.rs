//! Concrete targets for native artifacts.
//!
//! A native target owns its sources and dependency edges and prepares in
//! three lockstep passes: derive the per-configuration directories and
//! output file, materialize compile and link commands, then gate the link
//! on the commands of resolved dependencies (which all exist by then,
//! because the preparer finishes a pass across every target before the
//! next one starts). Tool drivers stay external; the compiler and archiver
//! programs come straight from the target settings.
//!
//! The prepare state lock is never held across a call into another
//! target, so concurrent passes over arbitrary target graphs cannot
//! deadlock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::trace;

use forge_builder::{Command, CommandStorageKind};
use forge_support::hash::{blake2b512_hex, shorten};
use forge_support::{PackageId, TargetSettings, UnresolvedPackage};

use crate::target::{Dependency, Target, TargetDependency, TargetError};

/// Artifact kind of a native target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
  StaticLibrary,
  SharedLibrary,
  Executable,
  HeaderOnly,
}

impl NativeKind {
  pub fn type_str(&self) -> &'static str {
    match self {
      NativeKind::StaticLibrary => "native_static_library",
      NativeKind::SharedLibrary => "native_shared_library",
      NativeKind::Executable => "native_executable",
      NativeKind::HeaderOnly => "header_only",
    }
  }
}

#[derive(Default)]
struct PrepareState {
  pass: u32,
  binary_dir: Option<PathBuf>,
  binary_private_dir: Option<PathBuf>,
  output_file: Option<PathBuf>,
  commands: Vec<Arc<Command>>,
}

/// A native library or executable target.
pub struct NativeTarget {
  package: PackageId,
  settings: TargetSettings,
  kind: NativeKind,
  root_dir: PathBuf,
  sources: Vec<PathBuf>,
  deps: Vec<Arc<TargetDependency>>,
  state: Mutex<PrepareState>,
}

impl NativeTarget {
  pub fn new(package: PackageId, settings: TargetSettings, kind: NativeKind, root_dir: impl Into<PathBuf>) -> Self {
    Self {
      package,
      settings,
      kind,
      root_dir: root_dir.into(),
      sources: Vec::new(),
      deps: Vec::new(),
      state: Mutex::new(PrepareState::default()),
    }
  }

  pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
    self.sources.push(path.into());
    self
  }

  pub fn with_dependency(mut self, unresolved: UnresolvedPackage, requested: TargetSettings) -> Self {
    self.deps.push(Arc::new(TargetDependency::new(unresolved, requested)));
    self
  }

  pub fn kind(&self) -> NativeKind {
    self.kind
  }

  /// `root / "t" / <config hash> / <short package hash>`.
  fn target_dir_short(&self, root: &Path) -> PathBuf {
    root
      .join("t")
      .join(self.settings.content_hash())
      .join(shorten(&blake2b512_hex(&self.package.to_string()), 6))
  }

  fn tool(&self, name: &str, default: &str) -> String {
    self
      .settings
      .get_map("native")
      .and_then(|m| m.get_str(name))
      .unwrap_or(default)
      .to_string()
  }

  fn output_file_name(&self) -> Option<String> {
    let stem = self.package.variable_name();
    match self.kind {
      NativeKind::StaticLibrary => Some(format!("lib{stem}.a")),
      NativeKind::SharedLibrary => Some(format!("lib{stem}.so")),
      NativeKind::Executable => Some(stem),
      NativeKind::HeaderOnly => None,
    }
  }

  fn first_pass(&self) -> Result<(), TargetError> {
    let mut base = self.target_dir_short(&self.root_dir);

    if self.is_dry_run() {
      // Dry runs never share a binary dir with the real build; theirs is
      // wiped on every configuration.
      let dry = self
        .root_dir
        .join("dry")
        .join(shorten(&blake2b512_hex(&base.to_string_lossy()), 6));
      let _ = std::fs::remove_dir_all(&dry);
      std::fs::create_dir_all(&dry).map_err(|source| TargetError::Io {
        target: self.package.to_string(),
        source,
      })?;
      base = dry;
    }

    let binary_private_dir = base.join("bdp");
    let binary_dir = base.join("bd");

    let mut state = self.state.lock().unwrap();
    state.output_file = self.output_file_name().map(|n| binary_dir.join(n));
    state.binary_dir = Some(binary_dir);
    state.binary_private_dir = Some(binary_private_dir);
    trace!(target = %self.package, "binary dirs derived");
    Ok(())
  }

  /// The link artifacts this target's dependencies export, derived from
  /// their interface settings (valid from the second pass on).
  fn dependency_outputs(&self) -> Result<Vec<PathBuf>, TargetError> {
    let mut outs = Vec::new();
    for dep in &self.deps {
      let Some(target) = dep.target() else {
        return Err(TargetError::DependencyNotResolved {
          target: self.package.to_string(),
          dependency: dep.unresolved_package().to_string(),
        });
      };
      let iface = target.interface_settings();
      if iface.str_is("header_only", "true") {
        continue;
      }
      if let Some(out) = iface.get_str("output_file") {
        outs.push(PathBuf::from(out));
      }
    }
    Ok(outs)
  }

  /// Second pass: materialize compile and link commands. Dependency output
  /// paths are known from their first pass; the commands producing them are
  /// wired in the third pass, once every target has finished this one.
  fn second_pass(&self) -> Result<(), TargetError> {
    if self.kind == NativeKind::HeaderOnly {
      return Ok(());
    }

    let (binary_dir, binary_private_dir, output_file) = {
      let state = self.state.lock().unwrap();
      (
        state.binary_dir.clone().unwrap_or_default(),
        state.binary_private_dir.clone().unwrap_or_default(),
        state.output_file.clone(),
      )
    };
    let cc = self.tool("c", "cc");

    let mut objects = Vec::new();
    let mut compile_cmds = Vec::new();
    for src in &self.sources {
      let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("src");
      let object = binary_private_dir.join(format!("{stem}.o"));
      let cmd = Command::program(
        format!("compile {} [{}]", src.display(), self.package.target_name()),
        cc.clone(),
        vec![
          "-c".to_string(),
          src.to_string_lossy().into_owned(),
          "-o".to_string(),
          object.to_string_lossy().into_owned(),
        ],
      )
      .with_input(src.clone())
      .with_output(object.clone())
      .with_storage(CommandStorageKind::Global);
      objects.push(object);
      compile_cmds.push(Arc::new(cmd));
    }

    let output = output_file.unwrap_or_else(|| binary_dir.join("out"));
    let mut object_args: Vec<String> = objects.iter().map(|o| o.to_string_lossy().into_owned()).collect();

    // Executables and shared libraries consume the link artifacts of their
    // dependencies.
    let mut link_inputs = objects.clone();
    if matches!(self.kind, NativeKind::Executable | NativeKind::SharedLibrary) {
      for dep_out in self.dependency_outputs()? {
        object_args.push(dep_out.to_string_lossy().into_owned());
        link_inputs.push(dep_out);
      }
    }

    let link = match self.kind {
      NativeKind::StaticLibrary => {
        let mut args = vec!["crs".to_string(), output.to_string_lossy().into_owned()];
        args.extend(object_args);
        Command::program(
          format!("archive {}", self.package.target_name()),
          self.tool("ar", "ar"),
          args,
        )
      }
      NativeKind::SharedLibrary => {
        let mut args = vec![
          "-shared".to_string(),
          "-o".to_string(),
          output.to_string_lossy().into_owned(),
        ];
        args.extend(object_args);
        Command::program(format!("link {}", self.package.target_name()), cc.clone(), args)
      }
      NativeKind::Executable => {
        let mut args = vec!["-o".to_string(), output.to_string_lossy().into_owned()];
        args.extend(object_args);
        Command::program(format!("link {}", self.package.target_name()), cc, args)
      }
      NativeKind::HeaderOnly => unreachable!("header-only targets have no link step"),
    };
    let mut link = link.with_output(output).with_storage(CommandStorageKind::Global);
    for input in link_inputs {
      link = link.with_input(input);
    }

    let link = Arc::new(link);
    for c in &compile_cmds {
      link.add_dependency(c.clone());
    }

    let mut commands = compile_cmds;
    commands.push(link);
    trace!(target = %self.package, commands = commands.len(), "commands materialized");
    self.state.lock().unwrap().commands = commands;
    Ok(())
  }

  /// Third pass: gate the link command on every dependency command that
  /// produces a consumed artifact. Those commands all exist by now because
  /// the preparer runs passes in lockstep across targets.
  fn third_pass(&self) -> Result<(), TargetError> {
    let link = self.state.lock().unwrap().commands.last().cloned();
    let Some(link) = link else {
      return Ok(());
    };
    for dep in &self.deps {
      let Some(target) = dep.target() else {
        return Err(TargetError::DependencyNotResolved {
          target: self.package.to_string(),
          dependency: dep.unresolved_package().to_string(),
        });
      };
      let iface = target.interface_settings();
      let Some(dep_out) = iface.get_str("output_file") else {
        continue;
      };
      let dep_out = PathBuf::from(dep_out);
      for c in target.commands() {
        if c.outputs().contains(&dep_out) {
          link.add_dependency(c.clone());
        }
      }
    }
    Ok(())
  }
}

impl Target for NativeTarget {
  fn package(&self) -> &PackageId {
    &self.package
  }

  fn settings(&self) -> &TargetSettings {
    &self.settings
  }

  fn interface_settings(&self) -> TargetSettings {
    let state = self.state.lock().unwrap();
    let mut s = TargetSettings::new();
    s.set("type", self.kind.type_str());
    s.set(
      "header_only",
      if self.kind == NativeKind::HeaderOnly { "true" } else { "false" },
    );
    if let Some(out) = &state.output_file {
      s.set("output_file", out.to_string_lossy().into_owned());
    }

    let mut link = TargetSettings::new();
    for dep in &self.deps {
      if let Some(target) = dep.target() {
        link.set(target.package().to_string(), dep.settings().clone());
      }
    }
    if !link.is_empty() {
      let mut dependencies = TargetSettings::new();
      dependencies.set("link", link);
      s.set("dependencies", dependencies);
    }
    s
  }

  fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
    self.deps.iter().map(|d| d.clone() as Arc<dyn Dependency>).collect()
  }

  fn commands(&self) -> Vec<Arc<Command>> {
    self.state.lock().unwrap().commands.clone()
  }

  fn prepare(&self) -> Result<bool, TargetError> {
    let pass = {
      let mut state = self.state.lock().unwrap();
      state.pass += 1;
      state.pass
    };
    match pass {
      1 => {
        self.first_pass()?;
        Ok(true)
      }
      2 => {
        self.second_pass()?;
        Ok(!self.deps.is_empty())
      }
      3 => {
        self.third_pass()?;
        Ok(false)
      }
      _ => Ok(false),
    }
  }
}
