//! The build context.
//!
//! Everything a build shares with its collaborators lives here: the
//! content-addressed storage, the package database, the resolver, entry
//! points of registered inputs, predefined targets supplied by the host,
//! and the executor configuration. One context serves many builds.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use tracing::debug;

use forge_builder::ExecutorConfig;
use forge_manager::{Downloader, InstalledPackages, PackagesDatabase, ResolveError, Resolver};
use forge_support::{LocalStorage, PackageId, PackagePath, UnresolvedPackage};

use crate::input::{EntryPoint, Input, InputError, InputLoader};
use crate::target::{Target, TargetMap};

pub struct Context {
  storage: LocalStorage,
  db: Arc<PackagesDatabase>,
  resolver: Resolver,
  input_loader: Option<Arc<dyn InputLoader>>,
  entry_points: RwLock<BTreeMap<PackageId, Arc<dyn EntryPoint>>>,
  predefined: RwLock<TargetMap>,
  executor: ExecutorConfig,
}

impl Context {
  pub fn new(storage: LocalStorage, db: Arc<PackagesDatabase>) -> Self {
    let resolver = Resolver::new(db.clone(), storage.clone());
    Self {
      storage,
      db,
      resolver,
      input_loader: None,
      entry_points: RwLock::new(BTreeMap::new()),
      predefined: RwLock::new(TargetMap::new()),
      executor: ExecutorConfig::default(),
    }
  }

  pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
    self.resolver = Resolver::new(self.db.clone(), self.storage.clone()).with_downloader(downloader);
    self
  }

  pub fn with_input_loader(mut self, loader: Arc<dyn InputLoader>) -> Self {
    self.input_loader = Some(loader);
    self
  }

  pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
    self.executor = executor;
    self
  }

  pub fn storage(&self) -> &LocalStorage {
    &self.storage
  }

  pub fn database(&self) -> &Arc<PackagesDatabase> {
    &self.db
  }

  pub fn executor_config(&self) -> &ExecutorConfig {
    &self.executor
  }

  /// Resolve and materialize a set of unresolved references.
  pub fn install(&self, unresolved: &BTreeSet<UnresolvedPackage>) -> Result<InstalledPackages, ResolveError> {
    self.resolver.install(unresolved)
  }

  /// Register the entry point serving a package.
  pub fn set_entry_point(&self, id: PackageId, ep: Arc<dyn EntryPoint>) {
    self.entry_points.write().unwrap().insert(id, ep);
  }

  pub fn entry_point(&self, id: &PackageId) -> Option<Arc<dyn EntryPoint>> {
    self.entry_points.read().unwrap().get(id).cloned()
  }

  pub fn has_entry_point(&self, id: &PackageId) -> bool {
    self.entry_points.read().unwrap().contains_key(id)
  }

  /// Load the input of a freshly installed package through the driver layer
  /// and register its entry point.
  pub fn register_package_input(&self, id: &PackageId) -> Result<Option<Arc<dyn Input>>, InputError> {
    if self.has_entry_point(id) {
      return Ok(None);
    }
    let Some(loader) = &self.input_loader else {
      // Hosts that pre-register entry points need no driver layer.
      return Ok(None);
    };
    let data = self
      .db
      .get_package_data(id)
      .map_err(|e| InputError(format!("{id}: {e}")))?;
    let source_dir = match &data.sdir {
      Some(sdir) => sdir.clone(),
      None => self.storage.source_dir(id),
    };
    let input = loader.load_input(id, &data, &source_dir)?;
    if let Some(ep) = input.entry_point() {
      self.set_entry_point(id.clone(), ep);
    }
    debug!(package = %id, "registered package input");
    Ok(Some(input))
  }

  /// Host-provided targets (toolchains and the like). They resolve
  /// dependencies but are never built.
  pub fn add_predefined_target(&self, target: Arc<dyn Target>) {
    self.predefined.write().unwrap().insert_target(target);
  }

  pub fn predefined_contains_path(&self, path: &PackagePath) -> bool {
    self.predefined.read().unwrap().find_by_path(path).is_some()
  }

  pub fn predefined_paths(&self) -> Vec<PackagePath> {
    let map = self.predefined.read().unwrap();
    let mut paths: Vec<PackagePath> = map.iter().map(|(id, _)| id.path().clone()).collect();
    paths.dedup();
    paths
  }

  /// Copy the predefined targets into a build's target map so dependencies
  /// can resolve against them.
  pub fn predefined_targets(&self) -> TargetMap {
    self.predefined.read().unwrap().clone()
  }
}
