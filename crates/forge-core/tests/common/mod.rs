//! Shared driver stubs for the pipeline tests.
//!
//! Real builds get their targets from manifest drivers; these tests script
//! them: `ScriptedInput` produces targets from a closure, and
//! `ScriptedEntryPoint` serves package-load requests the same way.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use forge_builder::Command;
use forge_core::{Context, EntryPoint, Input, InputError, Target, TargetError};
use forge_manager::PackagesDatabase;
use forge_support::hash::sha1_hex;
use forge_support::{LocalStorage, PackageId, PackagePath, TargetSettings};

pub type TargetFactory = dyn Fn(&Context, &TargetSettings) -> Vec<Arc<dyn Target>> + Send + Sync;

/// An input whose targets come from a closure.
pub struct ScriptedInput {
  name: String,
  factory: Box<TargetFactory>,
  entry_point: Option<Arc<dyn EntryPoint>>,
}

impl ScriptedInput {
  pub fn new<F>(name: &str, factory: F) -> Self
  where
    F: Fn(&Context, &TargetSettings) -> Vec<Arc<dyn Target>> + Send + Sync + 'static,
  {
    Self {
      name: name.to_string(),
      factory: Box::new(factory),
      entry_point: None,
    }
  }

  #[allow(dead_code)]
  pub fn with_entry_point(mut self, ep: Arc<dyn EntryPoint>) -> Self {
    self.entry_point = Some(ep);
    self
  }
}

impl Input for ScriptedInput {
  fn hash(&self) -> String {
    sha1_hex(&self.name)
  }

  fn load_targets(&self, ctx: &Context, settings: &[TargetSettings]) -> Result<Vec<Arc<dyn Target>>, InputError> {
    let mut out = Vec::new();
    for s in settings {
      out.extend((self.factory)(ctx, s));
    }
    Ok(out)
  }

  fn entry_point(&self) -> Option<Arc<dyn EntryPoint>> {
    self.entry_point.clone()
  }
}

/// An entry point whose targets come from a closure.
pub struct ScriptedEntryPoint {
  factory: Box<TargetFactory>,
}

impl ScriptedEntryPoint {
  pub fn new<F>(factory: F) -> Self
  where
    F: Fn(&Context, &TargetSettings) -> Vec<Arc<dyn Target>> + Send + Sync + 'static,
  {
    Self {
      factory: Box::new(factory),
    }
  }
}

impl EntryPoint for ScriptedEntryPoint {
  fn load_packages(
    &self,
    ctx: &Context,
    settings: &TargetSettings,
    _known: &BTreeSet<PackageId>,
    _prefix: &PackagePath,
  ) -> Result<Vec<Arc<dyn Target>>, InputError> {
    Ok((self.factory)(ctx, settings))
  }
}

/// A target with a fixed command list and no dependencies; enough to drive
/// the planner.
pub struct CommandTarget {
  package: PackageId,
  settings: TargetSettings,
  commands: Vec<Arc<Command>>,
}

impl CommandTarget {
  pub fn new(package: &str, settings: TargetSettings, commands: Vec<Arc<Command>>) -> Self {
    Self {
      package: package.parse().unwrap(),
      settings,
      commands,
    }
  }
}

impl Target for CommandTarget {
  fn package(&self) -> &PackageId {
    &self.package
  }

  fn settings(&self) -> &TargetSettings {
    &self.settings
  }

  fn interface_settings(&self) -> TargetSettings {
    TargetSettings::new()
  }

  fn dependencies(&self) -> Vec<Arc<dyn forge_core::Dependency>> {
    Vec::new()
  }

  fn commands(&self) -> Vec<Arc<Command>> {
    self.commands.clone()
  }

  fn prepare(&self) -> Result<bool, TargetError> {
    Ok(false)
  }
}

/// A context over an in-memory database and a temp storage root.
pub fn context(root: &Path) -> Arc<Context> {
  let db = Arc::new(PackagesDatabase::in_memory().unwrap());
  let storage = LocalStorage::under_root(&root.join("storage-root"));
  storage.init().unwrap();
  Arc::new(Context::new(storage, db))
}

/// Settings with the native toolchain stubbed out by `true`, so command
/// execution exits cleanly without a real compiler.
pub fn native_tool_settings(config: &str) -> TargetSettings {
  let mut native = TargetSettings::new();
  native.set("c", "true");
  native.set("ar", "true");

  let mut s = TargetSettings::new();
  s.set("config", config);
  s.set("native", native);
  s
}
