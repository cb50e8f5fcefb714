//! The polymorphic target model.
//!
//! A target is one variant of a package under one configuration. Targets of
//! the same package live together in a [`TargetContainer`]; the
//! [`TargetMap`] keys containers by package id and is owned by the build.
//! Dependencies hold only an unresolved reference plus a weak link to the
//! resolved target, so cyclic target graphs cannot leak.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use thiserror::Error;

use forge_builder::Command;
use forge_support::{PackageId, PackagePath, TargetSettings, UnresolvedPackage};

#[derive(Debug, Error)]
pub enum TargetError {
  #[error("{target}: dependency {dependency} is not resolved")]
  DependencyNotResolved { target: String, dependency: String },

  #[error("{target}: {source}")]
  Io {
    target: String,
    #[source]
    source: std::io::Error,
  },
}

/// One producible artifact plus its dependencies and commands.
pub trait Target: Send + Sync {
  /// Identity of the package this target builds.
  fn package(&self) -> &PackageId;

  /// The configuration this variant was loaded for.
  fn settings(&self) -> &TargetSettings;

  /// The read-only view exported to dependents after prepare: artifact
  /// type, output files and transitive link dependencies.
  fn interface_settings(&self) -> TargetSettings;

  fn dependencies(&self) -> Vec<Arc<dyn Dependency>>;

  /// Commands materialized by prepare.
  fn commands(&self) -> Vec<Arc<Command>>;

  /// One prepare pass. Returns `true` when the target wants another pass.
  fn prepare(&self) -> Result<bool, TargetError>;

  /// Dry-run targets are loaded for inspection only and never registered.
  fn is_dry_run(&self) -> bool {
    self.settings().str_is("dry-run", "true")
  }
}

/// A dependency edge of a target.
pub trait Dependency: Send + Sync {
  fn unresolved_package(&self) -> &UnresolvedPackage;

  /// The configuration requested from the dependency.
  fn settings(&self) -> &TargetSettings;

  fn is_resolved(&self) -> bool;

  /// Resolve to a concrete target. The reference is non-owning; the target
  /// must stay alive in the build's target map.
  fn set_target(&self, target: Arc<dyn Target>);

  fn target(&self) -> Option<Arc<dyn Target>>;
}

/// The standard [`Dependency`] implementation.
pub struct TargetDependency {
  unresolved: UnresolvedPackage,
  settings: TargetSettings,
  resolved: RwLock<Option<Weak<dyn Target>>>,
}

impl TargetDependency {
  pub fn new(unresolved: UnresolvedPackage, settings: TargetSettings) -> Self {
    Self {
      unresolved,
      settings,
      resolved: RwLock::new(None),
    }
  }
}

impl Dependency for TargetDependency {
  fn unresolved_package(&self) -> &UnresolvedPackage {
    &self.unresolved
  }

  fn settings(&self) -> &TargetSettings {
    &self.settings
  }

  fn is_resolved(&self) -> bool {
    self.resolved.read().unwrap().is_some()
  }

  fn set_target(&self, target: Arc<dyn Target>) {
    *self.resolved.write().unwrap() = Some(Arc::downgrade(&target));
  }

  fn target(&self) -> Option<Arc<dyn Target>> {
    self.resolved.read().unwrap().as_ref().and_then(Weak::upgrade)
  }
}

/// The target variants of a single package, in insertion order.
#[derive(Default, Clone)]
pub struct TargetContainer {
  targets: Vec<Arc<dyn Target>>,
}

impl TargetContainer {
  pub fn push(&mut self, target: Arc<dyn Target>) {
    self.targets.push(target);
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Target>> {
    self.targets.iter()
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }

  pub fn first(&self) -> Option<&Arc<dyn Target>> {
    self.targets.first()
  }

  /// First variant whose settings are a superset of `requested`.
  pub fn find_suitable(&self, requested: &TargetSettings) -> Option<&Arc<dyn Target>> {
    self.targets.iter().find(|t| requested.is_subset_of(t.settings()))
  }

  /// First variant with exactly these settings.
  pub fn find_equal(&self, settings: &TargetSettings) -> Option<&Arc<dyn Target>> {
    self.targets.iter().find(|t| t.settings() == settings)
  }

  /// The latest variant per distinct settings, insertion order deciding
  /// ties (last wins). A target loaded twice for the same settings keeps
  /// only its most recent command set.
  pub fn latest_variants(&self) -> Vec<Arc<dyn Target>> {
    let mut latest: BTreeMap<String, Arc<dyn Target>> = BTreeMap::new();
    for t in &self.targets {
      latest.insert(t.settings().to_canonical_string(), t.clone());
    }
    latest.into_values().collect()
  }
}

/// All loaded targets of a build, keyed by package id.
#[derive(Default, Clone)]
pub struct TargetMap {
  map: BTreeMap<PackageId, TargetContainer>,
}

impl TargetMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn get(&self, id: &PackageId) -> Option<&TargetContainer> {
    self.map.get(id)
  }

  pub fn contains(&self, id: &PackageId) -> bool {
    self.map.contains_key(id)
  }

  /// The container of `id`, created empty on first reference.
  pub fn container_mut(&mut self, id: &PackageId) -> &mut TargetContainer {
    self.map.entry(id.clone()).or_default()
  }

  pub fn insert_target(&mut self, target: Arc<dyn Target>) {
    self.container_mut(&target.package().clone()).push(target);
  }

  pub fn iter(&self) -> impl Iterator<Item = (&PackageId, &TargetContainer)> {
    self.map.iter()
  }

  /// First entry with this path, any version.
  pub fn find_by_path(&self, path: &PackagePath) -> Option<(&PackageId, &TargetContainer)> {
    self.map.iter().find(|(id, _)| id.path() == path)
  }

  /// Best entry satisfying an unresolved reference: the highest version of
  /// the path that the range accepts.
  pub fn find_unresolved(&self, unresolved: &UnresolvedPackage) -> Option<(&PackageId, &TargetContainer)> {
    self
      .map
      .iter()
      .filter(|(id, _)| id.path() == &unresolved.path && unresolved.range.contains(id.version()))
      .next_back()
  }

  pub fn remove_path(&mut self, path: &PackagePath) {
    self.map.retain(|id, _| id.path() != path);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct StubTarget {
    package: PackageId,
    settings: TargetSettings,
  }

  impl Target for StubTarget {
    fn package(&self) -> &PackageId {
      &self.package
    }

    fn settings(&self) -> &TargetSettings {
      &self.settings
    }

    fn interface_settings(&self) -> TargetSettings {
      TargetSettings::new()
    }

    fn dependencies(&self) -> Vec<Arc<dyn Dependency>> {
      Vec::new()
    }

    fn commands(&self) -> Vec<Arc<Command>> {
      Vec::new()
    }

    fn prepare(&self) -> Result<bool, TargetError> {
      Ok(false)
    }
  }

  fn stub(pkg: &str, pairs: &[(&str, &str)]) -> Arc<dyn Target> {
    let mut settings = TargetSettings::new();
    for (k, v) in pairs {
      settings.set(*k, *v);
    }
    Arc::new(StubTarget {
      package: pkg.parse().unwrap(),
      settings,
    })
  }

  #[test]
  fn find_suitable_matches_superset() {
    let mut c = TargetContainer::default();
    c.push(stub("org.a-1.0.0", &[("config", "release"), ("platform", "linux")]));

    let mut requested = TargetSettings::new();
    requested.set("config", "release");
    assert!(c.find_suitable(&requested).is_some());

    requested.set("config", "debug");
    assert!(c.find_suitable(&requested).is_none());
  }

  #[test]
  fn find_equal_is_exact() {
    let mut c = TargetContainer::default();
    c.push(stub("org.a-1.0.0", &[("config", "release"), ("platform", "linux")]));

    let mut requested = TargetSettings::new();
    requested.set("config", "release");
    assert!(c.find_equal(&requested).is_none());

    requested.set("platform", "linux");
    assert!(c.find_equal(&requested).is_some());
  }

  #[test]
  fn latest_variant_wins() {
    let mut c = TargetContainer::default();
    c.push(stub("org.a-1.0.0", &[("config", "release")]));
    let newer = stub("org.a-1.0.0", &[("config", "release")]);
    c.push(newer.clone());
    c.push(stub("org.a-1.0.0", &[("config", "debug")]));

    let latest = c.latest_variants();
    assert_eq!(latest.len(), 2);
    assert!(latest.iter().any(|t| Arc::ptr_eq(t, &newer)));
  }

  #[test]
  fn map_lookup_by_path_and_range() {
    let mut map = TargetMap::new();
    map.insert_target(stub("org.a-1.0.0", &[]));
    map.insert_target(stub("org.a-1.2.0", &[]));
    map.insert_target(stub("org.b-1.0.0", &[]));

    let (id, _) = map.find_by_path(&"org.a".parse().unwrap()).unwrap();
    assert_eq!(id.version().to_string(), "1.0.0");

    let unresolved = UnresolvedPackage::new("org.a".parse().unwrap(), "1.*".parse().unwrap());
    let (id, _) = map.find_unresolved(&unresolved).unwrap();
    assert_eq!(id.version().to_string(), "1.2.0");

    let miss = UnresolvedPackage::new("org.a".parse().unwrap(), "2.*".parse().unwrap());
    assert!(map.find_unresolved(&miss).is_none());
  }

  #[test]
  fn dependency_resolution_is_weak() {
    let dep = TargetDependency::new(
      UnresolvedPackage::new("org.a".parse().unwrap(), "*".parse().unwrap()),
      TargetSettings::new(),
    );
    assert!(!dep.is_resolved());

    let target = stub("org.a-1.0.0", &[]);
    dep.set_target(target.clone());
    assert!(dep.is_resolved());
    assert!(dep.target().is_some());

    drop(target);
    // The map owned the only strong reference; nothing leaks, the link just dies.
    assert!(dep.target().is_none());
  }

  #[test]
  fn remove_path_drops_all_versions() {
    let mut map = TargetMap::new();
    map.insert_target(stub("org.a-1.0.0", &[]));
    map.insert_target(stub("org.a-2.0.0", &[]));
    map.insert_target(stub("org.b-1.0.0", &[]));

    map.remove_path(&"org.a".parse().unwrap());
    assert_eq!(map.len(), 1);
  }
}
