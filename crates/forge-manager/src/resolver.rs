//! Resolution of unresolved package references into installed packages.
//!
//! The resolver consults the database for satisfying versions and, when a
//! resolved package has no materialized source tree yet, asks the external
//! downloader to produce one in content-addressed storage. Stamp files
//! record the hash a source tree was materialized from, so repeat installs
//! are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use forge_support::lock::{FileLock, LockMode};
use forge_support::{LocalStorage, PackageData, PackageId, UnresolvedPackage};

use crate::database::{DatabaseError, PackagesDatabase};

/// Mapping from requested reference to the package that satisfied it.
pub type InstalledPackages = BTreeMap<UnresolvedPackage, PackageId>;

/// Materializes package sources. Implementations live outside the core
/// (network fetchers, archive unpackers); tests plug in stubs.
pub trait Downloader: Send + Sync {
  fn download(&self, id: &PackageId, data: &PackageData, dest: &Path) -> Result<(), DownloadError>;
}

#[derive(Debug, Error)]
#[error("download of {package} failed: {message}")]
pub struct DownloadError {
  pub package: PackageId,
  pub message: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("could not resolve: {}", format_unresolved(.0))]
  Unresolved(Vec<UnresolvedPackage>),

  #[error(transparent)]
  Database(#[from] DatabaseError),

  #[error(transparent)]
  Download(#[from] DownloadError),

  #[error("storage error: {0}")]
  Io(#[from] io::Error),

  #[error(transparent)]
  Lock(#[from] forge_support::lock::LockError),
}

fn format_unresolved(pkgs: &[UnresolvedPackage]) -> String {
  pkgs.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

/// Turns unresolved references into concrete installed packages.
pub struct Resolver {
  db: Arc<PackagesDatabase>,
  storage: LocalStorage,
  downloader: Option<Arc<dyn Downloader>>,
}

impl Resolver {
  pub fn new(db: Arc<PackagesDatabase>, storage: LocalStorage) -> Self {
    Self {
      db,
      storage,
      downloader: None,
    }
  }

  pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
    self.downloader = Some(downloader);
    self
  }

  pub fn database(&self) -> &Arc<PackagesDatabase> {
    &self.db
  }

  pub fn storage(&self) -> &LocalStorage {
    &self.storage
  }

  /// Resolve every reference and materialize the results.
  ///
  /// # Errors
  ///
  /// `Unresolved` lists every reference the database could not satisfy;
  /// nothing is materialized in that case.
  pub fn install(&self, unresolved: &BTreeSet<UnresolvedPackage>) -> Result<InstalledPackages, ResolveError> {
    if unresolved.is_empty() {
      return Ok(InstalledPackages::new());
    }

    let (resolved, unmet) = self.db.resolve(unresolved)?;
    if !unmet.is_empty() {
      return Err(ResolveError::Unresolved(unmet.into_iter().collect()));
    }

    for id in resolved.values() {
      self.materialize(id)?;
    }

    info!(count = resolved.len(), "packages installed");
    Ok(resolved)
  }

  /// Ensure the source tree of `id` exists in storage.
  fn materialize(&self, id: &PackageId) -> Result<(), ResolveError> {
    let data = self.db.get_package_data(id)?;

    // Overridden packages build straight out of their development dir.
    if let Some(sdir) = &data.sdir {
      debug!(package = %id, sdir = %sdir.display(), "source dir overridden");
      return Ok(());
    }

    let stamp = self.storage.stamp_file(id);
    let source_dir = self.storage.source_dir(id);
    if source_dir.is_dir() && fs::read_to_string(&stamp).is_ok_and(|h| h == data.hash) {
      debug!(package = %id, "already materialized");
      return Ok(());
    }

    let Some(downloader) = &self.downloader else {
      // Entry points that synthesize their targets in memory need no
      // source tree; a missing one only matters once a target reads it.
      warn!(package = %id, "no downloader configured, sources not materialized");
      return Ok(());
    };

    let _lock = FileLock::acquire(&stamp.with_extension("lock"), LockMode::Exclusive, "materialize")?;
    fs::create_dir_all(&source_dir)?;
    downloader.download(id, &data, &source_dir)?;
    if let Some(parent) = stamp.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&stamp, &data.hash)?;
    info!(package = %id, "materialized sources");
    Ok(())
  }
}
