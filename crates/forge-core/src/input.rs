//! Build inputs and entry points.
//!
//! An input is an abstract source of targets (a manifest, a script, an
//! installed package); an entry point produces target variants on demand
//! for one configuration. Both are implemented outside the core: drivers
//! parse manifests into these traits, tests plug in synthetic ones.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use forge_support::{PackageData, PackageId, PackagePath, TargetSettings};

use crate::context::Context;
use crate::target::Target;

#[derive(Debug, Error)]
#[error("input error: {0}")]
pub struct InputError(pub String);

/// A source of targets.
pub trait Input: Send + Sync {
  /// Stable content hash of the input; build identities derive from it.
  fn hash(&self) -> String;

  /// Load this input's targets for each requested configuration.
  fn load_targets(&self, ctx: &Context, settings: &[TargetSettings]) -> Result<Vec<Arc<dyn Target>>, InputError>;

  /// The entry point able to load this input's packages on demand.
  fn entry_point(&self) -> Option<Arc<dyn EntryPoint>> {
    None
  }
}

/// Produces target variants of known packages for a given configuration.
pub trait EntryPoint: Send + Sync {
  fn load_packages(
    &self,
    ctx: &Context,
    settings: &TargetSettings,
    known: &BTreeSet<PackageId>,
    prefix: &PackagePath,
  ) -> Result<Vec<Arc<dyn Target>>, InputError>;
}

/// Turns an installed package into a build input. The driver layer supplies
/// this; resolved dependencies go through it to obtain their entry points.
pub trait InputLoader: Send + Sync {
  fn load_input(&self, id: &PackageId, data: &PackageData, source_dir: &Path) -> Result<Arc<dyn Input>, InputError>;
}

/// An input paired with the configurations it should be loaded under.
#[derive(Clone)]
pub struct InputWithSettings {
  pub input: Arc<dyn Input>,
  pub settings: Vec<TargetSettings>,
}

impl InputWithSettings {
  pub fn new(input: Arc<dyn Input>, settings: Vec<TargetSettings>) -> Self {
    Self { input, settings }
  }

  /// One configuration, the common case.
  pub fn single(input: Arc<dyn Input>, settings: TargetSettings) -> Self {
    Self {
      input,
      settings: vec![settings],
    }
  }
}
