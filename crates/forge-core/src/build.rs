//! The build driver.
//!
//! A build advances through six states, one transition per [`Build::step`]:
//!
//! ```text
//! NotStarted -> InputsLoaded -> TargetsToBuildSet -> PackagesResolved
//!            -> PackagesLoaded -> Prepared -> Executed
//! ```
//!
//! A transition only commits its state change when its body succeeds; on
//! error the state is retained so the caller may retry. The one exception
//! is the explicit [`Build::override_state`] hook used when running a
//! persisted execution plan.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use forge_builder::plan::PLAN_EXTENSION;
use forge_builder::{
  Command, CommandKind, CommandStorageKind, DurationError, ExecuteError, ExecutionPlan, ExecutorConfig, PlanError,
  StampStorage, command, parse_time_limit,
};
use forge_manager::{DatabaseError, ResolveError};
use forge_support::hash::{blake2b512_hex, shorten};
use forge_support::{PackageId, TargetSettings, UnresolvedPackage};

use crate::context::Context;
use crate::input::{InputError, InputWithSettings};
use crate::target::{TargetError, TargetMap};

/// The build state machine. Transitions are strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildState {
  NotStarted,
  InputsLoaded,
  TargetsToBuildSet,
  PackagesResolved,
  PackagesLoaded,
  Prepared,
  Executed,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
  #[error("unexpected build state {actual:?}, expected {expected:?}")]
  UnexpectedState { expected: BuildState, actual: BuildState },

  #[error("{target}: no target loaded: {dependency}")]
  NoTargetLoaded { target: String, dependency: String },

  #[error("{target}: predefined target is not resolved: {dependency}")]
  PredefinedUnresolved { target: String, dependency: String },

  #[error("cannot load package {0}")]
  CannotLoadPackage(String),

  #[error("no entry point for {0}")]
  NoEntryPoint(PackageId),

  #[error("no targets were selected for building")]
  NoTargetsSelected,

  #[error("link dependency not found: {0}")]
  DependencyNotFound(String),

  #[error("no variant of {dependency} matches the requested settings")]
  DependencySettingsNotFound { dependency: String },

  #[error("invalid build setting {key}: '{value}'")]
  InvalidSetting { key: String, value: String },

  #[error(transparent)]
  Target(#[from] TargetError),

  #[error(transparent)]
  Input(#[from] InputError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Database(#[from] DatabaseError),

  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error(transparent)]
  Execute(#[from] ExecuteError),

  #[error(transparent)]
  Duration(#[from] DurationError),

  #[error("worker task failed: {0}")]
  Join(#[from] tokio::task::JoinError),

  #[error("build io error: {0}")]
  Io(#[from] io::Error),
}

/// One build: inputs in, executed command DAG out.
pub struct Build {
  ctx: Arc<Context>,
  build_dir: PathBuf,
  state: BuildState,
  inputs: Vec<InputWithSettings>,
  targets: TargetMap,
  targets_to_build: TargetMap,
  known_packages: BTreeSet<PackageId>,
  build_settings: TargetSettings,
  fast_path_files: BTreeSet<PathBuf>,
}

impl Build {
  pub fn new(ctx: Arc<Context>, build_dir: impl Into<PathBuf>) -> Self {
    Self {
      ctx,
      build_dir: build_dir.into(),
      state: BuildState::NotStarted,
      inputs: Vec::new(),
      targets: TargetMap::new(),
      targets_to_build: TargetMap::new(),
      known_packages: BTreeSet::new(),
      build_settings: TargetSettings::new(),
      fast_path_files: BTreeSet::new(),
    }
  }

  pub fn add_input(&mut self, input: InputWithSettings) {
    self.inputs.push(input);
  }

  pub fn set_settings(&mut self, settings: TargetSettings) {
    self.build_settings = settings;
  }

  pub fn state(&self) -> BuildState {
    self.state
  }

  pub fn context(&self) -> &Arc<Context> {
    &self.ctx
  }

  pub fn build_dir(&self) -> &PathBuf {
    &self.build_dir
  }

  pub fn targets(&self) -> &TargetMap {
    &self.targets
  }

  pub fn targets_to_build(&self) -> &TargetMap {
    &self.targets_to_build
  }

  pub fn known_packages(&self) -> &BTreeSet<PackageId> {
    &self.known_packages
  }

  pub fn add_known_package(&mut self, id: PackageId) {
    self.known_packages.insert(id);
  }

  /// Pre-select one loaded package for building. Without any selection,
  /// `set_targets_to_build` defaults to everything loaded.
  pub fn select_target(&mut self, id: &PackageId) -> bool {
    match self.targets.get(id) {
      Some(container) => {
        let container = container.clone();
        *self.targets_to_build.container_mut(id) = container;
        true
      }
      None => false,
    }
  }

  /// Force the state, bypassing transition checks. Only meant for loading
  /// a persisted plan; everything else goes through [`Build::step`].
  pub fn override_state(&mut self, state: BuildState) {
    trace!(from = ?self.state, to = ?state, "overriding build state");
    self.state = state;
  }

  fn expect_state(&self, expected: BuildState) -> Result<(), BuildError> {
    if self.state != expected {
      return Err(BuildError::UnexpectedState {
        expected,
        actual: self.state,
      });
    }
    Ok(())
  }

  /// Run the whole pipeline.
  pub async fn build(&mut self) -> Result<(), BuildError> {
    while self.step().await? {}
    Ok(())
  }

  /// Perform exactly one state transition. Returns `false` once executed.
  pub async fn step(&mut self) -> Result<bool, BuildError> {
    match self.state {
      BuildState::NotStarted => self.load_inputs()?,
      BuildState::InputsLoaded => self.set_targets_to_build()?,
      BuildState::TargetsToBuildSet => self.resolve_packages()?,
      BuildState::PackagesResolved => self.load_packages()?,
      BuildState::PackagesLoaded => self.prepare().await?,
      BuildState::Prepared => self.execute().await?,
      BuildState::Executed => return Ok(false),
    }
    Ok(true)
  }

  /// `NotStarted -> InputsLoaded`: load every input's targets and register
  /// their entry points.
  fn load_inputs(&mut self) -> Result<(), BuildError> {
    self.expect_state(BuildState::NotStarted)?;
    debug!(inputs = self.inputs.len(), "loading inputs");

    // Host-provided targets take part in dependency resolution.
    let predefined = self.ctx.predefined_targets();
    for (_, container) in predefined.iter() {
      for tgt in container.iter() {
        self.targets.insert_target(tgt.clone());
      }
    }

    let inputs = self.inputs.clone();
    for i in &inputs {
      let targets = i.input.load_targets(&self.ctx, &i.settings)?;
      for tgt in targets {
        if tgt.is_dry_run() {
          continue;
        }
        let pkg = tgt.package().clone();
        if let Some(ep) = i.input.entry_point() {
          self.ctx.set_entry_point(pkg.clone(), ep);
        }
        self.known_packages.insert(pkg);
        self.targets.insert_target(tgt);
      }
    }

    info!(targets = self.targets.len(), "inputs loaded");
    self.state = BuildState::InputsLoaded;
    Ok(())
  }

  /// `InputsLoaded -> TargetsToBuildSet`: default to everything loaded,
  /// minus the predefined packages.
  fn set_targets_to_build(&mut self) -> Result<(), BuildError> {
    self.expect_state(BuildState::InputsLoaded)?;

    if self.targets_to_build.is_empty() {
      self.targets_to_build = self.targets.clone();
    }
    for path in self.ctx.predefined_paths() {
      self.targets_to_build.remove_path(&path);
    }

    debug!(targets = self.targets_to_build.len(), "targets to build set");
    self.state = BuildState::TargetsToBuildSet;
    Ok(())
  }

  /// `TargetsToBuildSet -> PackagesResolved`: gather unresolved references
  /// from the loaded targets, install them and register their inputs.
  fn resolve_packages(&mut self) -> Result<(), BuildError> {
    self.expect_state(BuildState::TargetsToBuildSet)?;

    let mut unresolved: BTreeSet<UnresolvedPackage> = BTreeSet::new();

    // Package-id inputs also install themselves.
    for (pkg, container) in self.targets_to_build.iter() {
      if container.first().is_some() && pkg.path().is_absolute() && !pkg.path().is_location() {
        unresolved.insert(UnresolvedPackage::from(pkg));
      }
    }

    for (_, container) in self.targets.iter() {
      // Variants of one package share their dependency list; the first
      // speaks for all of them.
      let Some(tgt) = container.first() else { continue };
      for d in tgt.dependencies() {
        let u = d.unresolved_package();
        // Dependencies on targets from the same inputs are already loaded.
        if let Some(id) = u.to_package_id()
          && self.targets.contains(&id)
        {
          continue;
        }
        if self.ctx.predefined_contains_path(&u.path) {
          continue;
        }
        unresolved.insert(u.clone());
      }
    }

    debug!(count = unresolved.len(), "resolving packages");
    let installed = self.ctx.install(&unresolved)?;
    for id in installed.values() {
      self.known_packages.insert(id.clone());
      self.ctx.register_package_input(id)?;
    }

    info!(installed = installed.len(), "packages resolved");
    self.state = BuildState::PackagesResolved;
    Ok(())
  }

  /// `PackagesResolved -> PackagesLoaded`: the multi-configuration
  /// fixed-point load (see module docs of [`crate::target`]).
  fn load_packages(&mut self) -> Result<(), BuildError> {
    self.expect_state(BuildState::PackagesResolved)?;
    self.load_packages_impl()?;
    self.state = BuildState::PackagesLoaded;
    Ok(())
  }

  fn load_packages_impl(&mut self) -> Result<(), BuildError> {
    // Every known package gets a container, possibly empty, so dependency
    // lookups can distinguish "not yet loaded" from "no such package".
    for p in self.known_packages.clone() {
      self.targets.container_mut(&p);
    }

    let mut round = 0u32;
    loop {
      round += 1;
      trace!(round, "package load round");

      // Keyed by canonical settings so one load serves every dependency
      // requesting the same configuration.
      let mut pending: BTreeMap<String, (TargetSettings, PackageId)> = BTreeMap::new();

      for (_, container) in self.targets.iter() {
        for tgt in container.iter() {
          for d in tgt.dependencies() {
            if d.is_resolved() {
              continue;
            }

            let u = d.unresolved_package();
            let Some((found_id, found)) = self.targets.find_unresolved(u) else {
              return Err(BuildError::NoTargetLoaded {
                target: tgt.package().to_string(),
                dependency: u.to_string(),
              });
            };

            if let Some(variant) = found.find_suitable(d.settings()) {
              d.set_target(variant.clone());
              continue;
            }

            if self.ctx.predefined_contains_path(&u.path) {
              return Err(BuildError::PredefinedUnresolved {
                target: tgt.package().to_string(),
                dependency: u.to_string(),
              });
            }

            pending.insert(d.settings().to_canonical_string(), (d.settings().clone(), found_id.clone()));
          }
        }
      }

      if pending.is_empty() {
        break;
      }

      let mut loaded = false;
      for (_, (settings, id)) in pending {
        // Empty settings only ask for the dependency to exist.
        if settings.is_empty() {
          continue;
        }
        loaded = true;

        debug!(package = %id, "loading package variant");
        let ep = self.ctx.entry_point(&id).ok_or_else(|| BuildError::NoEntryPoint(id.clone()))?;
        let prefix = match self.ctx.database().get_package_data(&id) {
          Ok(data) => data.prefix.max(0) as usize,
          Err(DatabaseError::UnknownPackage(_)) => 0,
          Err(e) => return Err(e.into()),
        };
        let prefix_path = id.path().slice(0, prefix);

        let loaded_targets = ep.load_packages(&self.ctx, &settings, &self.known_packages, &prefix_path)?;

        let mut added = false;
        for tgt in &loaded_targets {
          if tgt.is_dry_run() {
            continue;
          }
          self.targets.insert_target(tgt.clone());
          added = true;
        }

        if self.targets.container_mut(&id).find_suitable(&settings).is_none() {
          let mut diag = format!("{id} with current settings\n{settings}\navailable targets:");
          for tgt in &loaded_targets {
            if tgt.is_dry_run() {
              continue;
            }
            diag.push('\n');
            diag.push_str(&tgt.settings().to_canonical_string());
          }
          if !added {
            diag = format!("no packages loaded {diag}");
          }
          return Err(BuildError::CannotLoadPackage(diag));
        }
      }

      if !loaded {
        break;
      }
    }

    info!(packages = self.targets.len(), "packages loaded");
    Ok(())
  }

  /// `PackagesLoaded -> Prepared`: parallel prepare passes until no target
  /// asks for another one.
  async fn prepare(&mut self) -> Result<(), BuildError> {
    self.expect_state(BuildState::PackagesLoaded)?;
    let mut pass = 0u32;
    loop {
      pass += 1;
      trace!(pass, "prepare pass");
      if !self.prepare_step().await? {
        break;
      }
    }
    info!(passes = pass, "targets prepared");
    self.state = BuildState::Prepared;
    Ok(())
  }

  /// One parallel pass over every loaded target. Errors are collected;
  /// the first one surfaces after all in-flight prepares finish.
  async fn prepare_step(&mut self) -> Result<bool, BuildError> {
    let mut joinset: JoinSet<Result<bool, TargetError>> = JoinSet::new();
    for (_, container) in self.targets.iter() {
      for tgt in container.iter() {
        let tgt = tgt.clone();
        joinset.spawn_blocking(move || tgt.prepare());
      }
    }

    let mut next_pass = false;
    let mut first_error = None;
    while let Some(res) = joinset.join_next().await {
      match res? {
        Ok(again) => next_pass |= again,
        Err(e) => {
          if first_error.is_none() {
            first_error = Some(e);
          }
        }
      }
    }
    if let Some(e) = first_error {
      return Err(e.into());
    }
    Ok(next_pass)
  }

  /// Gather the commands of the targets to build and of everything their
  /// interfaces link against, transitively.
  pub fn commands(&mut self) -> Result<Vec<Arc<Command>>, BuildError> {
    // Everything starts out possibly-unused; selected targets claim their
    // commands back below.
    for (_, container) in self.targets.iter() {
      for tgt in container.iter() {
        for c in tgt.commands() {
          c.set_maybe_unused(command::MU_TRUE);
        }
      }
    }

    if self.targets_to_build.is_empty() {
      return Err(BuildError::NoTargetsSelected);
    }

    // Static libraries do not pull their dependencies through link inputs,
    // so walk interface settings to find everything that must be built.
    let mut ttb = self.targets_to_build.clone();
    let initial: Vec<_> = self
      .targets_to_build
      .iter()
      .flat_map(|(_, c)| c.latest_variants())
      .collect();
    for tgt in initial {
      self.add_transitive_link_deps(&mut ttb, &tgt.interface_settings())?;
    }

    let show_output =
      self.build_settings.str_is("show_output", "true") || self.build_settings.str_is("write_output_to_file", "true");
    let copy_dir = self
      .build_settings
      .get_str("build_ide_copy_to_dir")
      .filter(|s| !s.is_empty())
      .map(PathBuf::from);

    let mut cmds: Vec<Arc<Command>> = Vec::new();
    let mut copy_files: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();

    let selected: Vec<_> = ttb.iter().flat_map(|(_, c)| c.latest_variants()).collect();
    for tgt in selected {
      for c in tgt.commands() {
        c.clear_maybe_unused(command::MU_TRUE);
        c.set_show_output(show_output);
        cmds.push(c);
      }

      if let Some(copy_dir) = &copy_dir {
        self.collect_output_files(&tgt.interface_settings(), copy_dir, &mut copy_files)?;
      } else {
        self.collect_fast_path_files(&tgt.interface_settings())?;
      }
    }

    for (from, to) in copy_files {
      let copy = Command::new(
        format!("copy: {}", to.display()),
        CommandKind::Copy {
          from: from.clone(),
          to: to.clone(),
        },
      )
      .with_input(from)
      .with_output(to)
      .with_storage(CommandStorageKind::Local);
      copy.set_maybe_unused(command::MU_ALWAYS);
      cmds.push(Arc::new(copy));
    }

    Ok(cmds)
  }

  fn interface_is_linkable(s: &TargetSettings) -> bool {
    if s.str_is("header_only", "true") {
      return false;
    }
    matches!(
      s.get_str("type"),
      Some("native_shared_library") | Some("native_static_library") | Some("native_executable")
    )
  }

  fn link_dependencies(s: &TargetSettings) -> Vec<(String, TargetSettings)> {
    let Some(link) = s.get_map("dependencies").and_then(|d| d.get_map("link")) else {
      return Vec::new();
    };
    link
      .iter()
      .filter_map(|(k, v)| v.as_map().map(|m| (k.clone(), m.clone())))
      .collect()
  }

  /// Walk `interface.dependencies.link` recursively, adding every library
  /// or executable that must also be built to `ttb`.
  fn add_transitive_link_deps(&self, ttb: &mut TargetMap, interface: &TargetSettings) -> Result<(), BuildError> {
    if !Self::interface_is_linkable(interface) {
      return Ok(());
    }
    for (key, requested) in Self::link_dependencies(interface) {
      let id: PackageId = key.parse().map_err(|_| BuildError::DependencyNotFound(key.clone()))?;
      let container = self.targets.get(&id).ok_or_else(|| BuildError::DependencyNotFound(key.clone()))?;
      let variant = container
        .find_suitable(&requested)
        .ok_or_else(|| BuildError::DependencySettingsNotFound { dependency: key.clone() })?;

      if ttb.container_mut(&id).find_equal(variant.settings()).is_some() {
        continue;
      }
      ttb.container_mut(&id).push(variant.clone());

      let iface = variant.interface_settings();
      self.add_transitive_link_deps(ttb, &iface)?;
    }
    Ok(())
  }

  /// Record native outputs for the IDE fast path and schedule shared
  /// library copies into `copy_dir`.
  fn collect_output_files(
    &mut self,
    interface: &TargetSettings,
    copy_dir: &PathBuf,
    copy_files: &mut BTreeMap<PathBuf, PathBuf>,
  ) -> Result<(), BuildError> {
    if !Self::interface_is_linkable(interface) {
      return Ok(());
    }

    if let Some(out) = interface.get_str("output_file") {
      let out = PathBuf::from(out);
      self.fast_path_files.insert(out.clone());

      if let Some(il) = interface.get_str("import_library") {
        self.fast_path_files.insert(PathBuf::from(il));
      }

      if interface.str_is("type", "native_shared_library") {
        let mut dest = copy_dir.clone();
        if let Some(od) = interface.get_str("output_dir") {
          dest = dest.join(od);
        }
        if let Some(name) = out.file_name() {
          dest = dest.join(name);
        }
        if dest != out {
          self.fast_path_files.insert(dest.clone());
          copy_files.insert(out, dest);
        }
      }
    }

    for (key, requested) in Self::link_dependencies(interface) {
      let id: PackageId = key.parse().map_err(|_| BuildError::DependencyNotFound(key.clone()))?;
      let container = self.targets.get(&id).ok_or_else(|| BuildError::DependencyNotFound(key.clone()))?;
      let variant = container
        .find_suitable(&requested)
        .ok_or_else(|| BuildError::DependencySettingsNotFound { dependency: key.clone() })?;
      self.collect_output_files(&variant.interface_settings(), copy_dir, copy_files)?;
    }
    Ok(())
  }

  /// Fast-path bookkeeping without an IDE copy dir.
  fn collect_fast_path_files(&mut self, interface: &TargetSettings) -> Result<(), BuildError> {
    if !Self::interface_is_linkable(interface) {
      return Ok(());
    }
    if let Some(out) = interface.get_str("output_file") {
      self.fast_path_files.insert(PathBuf::from(out));
    }
    if let Some(il) = interface.get_str("import_library") {
      self.fast_path_files.insert(PathBuf::from(il));
    }
    for (key, requested) in Self::link_dependencies(interface) {
      let id: PackageId = key.parse().map_err(|_| BuildError::DependencyNotFound(key.clone()))?;
      let container = self.targets.get(&id).ok_or_else(|| BuildError::DependencyNotFound(key.clone()))?;
      let variant = container
        .find_suitable(&requested)
        .ok_or_else(|| BuildError::DependencySettingsNotFound { dependency: key.clone() })?;
      self.collect_fast_path_files(&variant.interface_settings())?;
    }
    Ok(())
  }

  /// Build the execution plan, dumping cycle diagnostics on failure.
  pub fn execution_plan(&mut self) -> Result<ExecutionPlan, BuildError> {
    let cmds = self.commands()?;
    match ExecutionPlan::create(&cmds) {
      Ok(plan) => Ok(plan),
      Err(PlanError::CyclicDependencies(diag)) => {
        let dir = self.build_dir.join("misc").join("cyclic");
        diag.write_to(&dir)?;
        Err(PlanError::CyclicDependencies(diag).into())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// `Prepared -> Executed`: plan and run.
  async fn execute(&mut self) -> Result<(), BuildError> {
    let plan = self.execution_plan()?;
    self.execute_plan(&plan).await
  }

  /// Execute an already constructed plan. Settings (`skip_errors`,
  /// `time_limit`, `build_always`, `time_trace`, the IDE fast path) come
  /// from the build settings.
  pub async fn execute_plan(&mut self, plan: &ExecutionPlan) -> Result<(), BuildError> {
    self.expect_state(BuildState::Prepared)?;

    let mut cfg: ExecutorConfig = self.ctx.executor_config().clone();
    cfg.build_always |= self.build_settings.str_is("build_always", "true");
    if let Some(v) = self.build_settings.get_str("skip_errors") {
      cfg.skip_errors = v.parse().map_err(|_| BuildError::InvalidSetting {
        key: "skip_errors".to_string(),
        value: v.to_string(),
      })?;
    }
    if let Some(v) = self.build_settings.get_str("time_limit") {
      cfg.time_limit = Some(parse_time_limit(v)?);
    }
    cfg.stamps = Some(StampStorage::new(
      self.build_dir.join("cs"),
      self.ctx.storage().directories().storage_dir_etc.join("cs"),
    ));

    let report = plan.execute(&cfg).await?;

    if self.build_settings.str_is("time_trace", "true") {
      report.save_chrome_trace(&self.build_dir.join("misc").join("time_trace.json"))?;
    }

    if let Some(fast_path) = self.build_settings.get_str("build_ide_fast_path").filter(|s| !s.is_empty()) {
      let fast_path = PathBuf::from(fast_path);
      let mut listing = String::new();
      let mut mtime: u128 = 0;
      for f in &self.fast_path_files {
        listing.push_str(&f.to_string_lossy());
        listing.push('\n');
        if let Ok(meta) = std::fs::metadata(f)
          && let Ok(modified) = meta.modified()
          && let Ok(d) = modified.duration_since(UNIX_EPOCH)
        {
          mtime ^= d.as_nanos();
        }
      }
      if let Some(parent) = fast_path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::write(&fast_path, listing)?;
      let mut stamp = fast_path.into_os_string();
      stamp.push(".t");
      std::fs::write(PathBuf::from(stamp), mtime.to_string())?;
    }

    self.state = BuildState::Executed;
    Ok(())
  }

  /// Short hash over the input hashes; names the persisted plan.
  pub fn hash(&self) -> String {
    let mut s = String::new();
    for i in &self.inputs {
      s.push_str(&i.input.hash());
    }
    shorten(&blake2b512_hex(&s), 8)
  }

  pub fn execution_plan_path(&self) -> PathBuf {
    self.build_dir.join("ep").join(format!("{}.{PLAN_EXTENSION}", self.hash()))
  }

  /// Persist the current plan. Requires `Prepared`; the state is kept.
  pub fn save_execution_plan(&mut self) -> Result<PathBuf, BuildError> {
    self.expect_state(BuildState::Prepared)?;
    let path = self.execution_plan_path();
    let plan = self.execution_plan()?;
    plan.save(&path)?;
    info!(path = %path.display(), "execution plan saved");
    Ok(path)
  }

  /// Load and execute a previously saved plan.
  ///
  /// Requires `InputsLoaded` (the inputs decide which plan file to use).
  /// The state is overridden to `Prepared` for the run and always restored
  /// to `InputsLoaded` afterwards.
  pub async fn run_saved_execution_plan(&mut self) -> Result<(), BuildError> {
    self.expect_state(BuildState::InputsLoaded)?;

    let path = self.execution_plan_path();
    let plan = ExecutionPlan::load(&path)?;

    self.override_state(BuildState::Prepared);
    let result = self.execute_plan(&plan).await;
    self.override_state(BuildState::InputsLoaded);
    result
  }
}
