//! Package identities and installed-package metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{sha1_hex, shorten};
use crate::path::PackagePath;
use crate::version::{Version, VersionRange};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
  #[error("invalid package id: '{0}'")]
  InvalidId(String),
}

/// A concrete package: a path pinned to one version.
///
/// The canonical string is `path-version`. The storage identity is the
/// truncated SHA-1 of `path/version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
  path: PackagePath,
  version: Version,
}

impl PackageId {
  pub fn new(path: PackagePath, version: Version) -> Self {
    Self { path, version }
  }

  pub fn path(&self) -> &PackagePath {
    &self.path
  }

  pub fn version(&self) -> &Version {
    &self.version
  }

  /// Stable eight-character storage identifier.
  pub fn storage_hash(&self) -> String {
    shorten(&sha1_hex(&format!("{}/{}", self.path, self.version)), 8)
  }

  /// Three-segment relative path derived from the storage hash:
  /// `h[0..2]/h[2..4]/h[4..]`.
  pub fn hash_path(&self) -> PathBuf {
    let h = self.storage_hash();
    PathBuf::from(&h[0..2]).join(&h[2..4]).join(&h[4..])
  }

  /// Human-facing target name: `path-version`, or just `path` for the
  /// wildcard version.
  pub fn target_name(&self) -> String {
    let v = self.version.to_any_version();
    if v == "*" {
      self.path.to_string()
    } else {
      format!("{}-{}", self.path, v)
    }
  }

  /// Identifier-safe name: dots become underscores.
  pub fn variable_name(&self) -> String {
    let v = self.version.to_any_version();
    let name = if v == "*" {
      format!("{}_", self.path)
    } else {
      format!("{}__{}", self.path, v)
    };
    name.replace('.', "_")
  }
}

impl fmt::Display for PackageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.path, self.version)
  }
}

impl FromStr for PackageId {
  type Err = PackageError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (path, version) = s.split_once('-').ok_or_else(|| PackageError::InvalidId(s.to_string()))?;
    let path = path.parse().map_err(|_| PackageError::InvalidId(s.to_string()))?;
    let version = version.parse().map_err(|_| PackageError::InvalidId(s.to_string()))?;
    Ok(PackageId { path, version })
  }
}

impl TryFrom<String> for PackageId {
  type Error = PackageError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<PackageId> for String {
  fn from(id: PackageId) -> String {
    id.to_string()
  }
}

/// A dependency reference that has not been pinned yet: a path plus the
/// range of acceptable versions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnresolvedPackage {
  pub path: PackagePath,
  pub range: VersionRange,
}

impl UnresolvedPackage {
  pub fn new(path: PackagePath, range: VersionRange) -> Self {
    Self { path, range }
  }

  /// When the range pins a single version the reference already names a
  /// concrete package.
  pub fn to_package_id(&self) -> Option<PackageId> {
    self.range.as_exact().map(|v| PackageId::new(self.path.clone(), v.clone()))
  }
}

impl From<&PackageId> for UnresolvedPackage {
  fn from(id: &PackageId) -> Self {
    UnresolvedPackage {
      path: id.path().clone(),
      range: VersionRange::exact(id.version().clone()),
    }
  }
}

impl fmt::Display for UnresolvedPackage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.path, self.range)
  }
}

/// Metadata stored for an installed package version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageData {
  /// Content hash of the package archive.
  pub hash: String,

  /// Reserved flag bits.
  pub flags: u64,

  /// Packages originating from the same input share a group number.
  pub group_number: i64,

  /// Number of leading path components that belong to the storage prefix.
  pub prefix: i32,

  /// Overriding source directory, when the package is developed locally
  /// instead of being materialized from storage.
  pub sdir: Option<PathBuf>,

  /// Declared dependencies of this version.
  pub dependencies: BTreeMap<PackagePath, VersionRange>,
}

impl PackageData {
  pub fn with_hash(hash: impl Into<String>) -> Self {
    PackageData {
      hash: hash.into(),
      prefix: 2,
      ..Default::default()
    }
  }

  pub fn source_dir(&self) -> Option<&Path> {
    self.sdir.as_deref()
  }
}
