//! Content-addressed storage layout.
//!
//! Every package maps to deterministic locations under three roots:
//!
//! ```text
//! <root>/storage/src/<hh>/<hh>/<rest>            # unpacked sources
//! <root>/storage/obj/<hh>/<hh>/<rest>/bld/<cfg>/ # per-config build dirs
//! <root>/etc/forge/stamps/packages/<hh>/<hh>/<rest>.stamp
//! ```
//!
//! `<hh>/<hh>/<rest>` is the hash path of the package id (fanout-by-two
//! sharding of the truncated SHA-1).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::package::PackageId;

const STAMPS_DIR: &str = "stamps";

/// The three storage roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directories {
  pub storage_dir_src: PathBuf,
  pub storage_dir_obj: PathBuf,
  pub storage_dir_etc: PathBuf,
}

impl Directories {
  /// Conventional layout under a single root directory.
  pub fn under_root(root: &Path) -> Self {
    Directories {
      storage_dir_src: root.join("storage").join("src"),
      storage_dir_obj: root.join("storage").join("obj"),
      storage_dir_etc: root.join("etc").join("forge"),
    }
  }
}

/// Path arithmetic over the content-addressed layout.
#[derive(Debug, Clone)]
pub struct LocalStorage {
  dirs: Directories,
}

impl LocalStorage {
  pub fn new(dirs: Directories) -> Self {
    Self { dirs }
  }

  pub fn under_root(root: &Path) -> Self {
    Self::new(Directories::under_root(root))
  }

  pub fn directories(&self) -> &Directories {
    &self.dirs
  }

  /// Create the storage roots on disk.
  pub fn init(&self) -> io::Result<()> {
    fs::create_dir_all(&self.dirs.storage_dir_src)?;
    fs::create_dir_all(&self.dirs.storage_dir_obj)?;
    fs::create_dir_all(self.dirs.storage_dir_etc.join(STAMPS_DIR).join("packages"))?;
    Ok(())
  }

  /// Where the unpacked sources of `id` live.
  pub fn source_dir(&self, id: &PackageId) -> PathBuf {
    self.dirs.storage_dir_src.join(id.hash_path())
  }

  /// The object (build) directory of `id`.
  pub fn object_dir(&self, id: &PackageId) -> PathBuf {
    self.dirs.storage_dir_obj.join(id.hash_path())
  }

  /// Per-configuration build directory under the object dir.
  pub fn build_dir(&self, id: &PackageId, config_hash: &str) -> PathBuf {
    self.object_dir(id).join("bld").join(config_hash)
  }

  /// The installation stamp file of `id`.
  pub fn stamp_file(&self, id: &PackageId) -> PathBuf {
    let hp = id.hash_path();
    let mut p = self.dirs.storage_dir_etc.join(STAMPS_DIR).join("packages");
    if let Some(parent) = hp.parent() {
      p = p.join(parent);
    }
    let file = hp.file_name().and_then(|f| f.to_str()).unwrap_or_default();
    p.join(format!("{file}.stamp"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn storage() -> LocalStorage {
    LocalStorage::under_root(Path::new("/forge"))
  }

  fn id() -> PackageId {
    "org.forge.demo.zlib-1.2.11".parse().unwrap()
  }

  #[test]
  fn source_and_object_dirs_share_hash_path() {
    let s = storage();
    let src = s.source_dir(&id());
    let obj = s.object_dir(&id());
    assert!(src.starts_with("/forge/storage/src"));
    assert!(obj.starts_with("/forge/storage/obj"));
    assert_eq!(
      src.strip_prefix("/forge/storage/src").unwrap(),
      obj.strip_prefix("/forge/storage/obj").unwrap(),
    );
  }

  #[test]
  fn build_dir_is_per_config() {
    let s = storage();
    let a = s.build_dir(&id(), "aaaaaaaa");
    let b = s.build_dir(&id(), "bbbbbbbb");
    assert_ne!(a, b);
    assert!(a.ends_with(PathBuf::from("bld").join("aaaaaaaa")));
  }

  #[test]
  fn stamp_file_mirrors_hash_path() {
    let s = storage();
    let stamp = s.stamp_file(&id());
    assert!(stamp.starts_with("/forge/etc/forge/stamps/packages"));
    let hp = id().hash_path();
    let tail = hp.file_name().unwrap().to_str().unwrap();
    assert_eq!(stamp.file_name().unwrap().to_str().unwrap(), format!("{tail}.stamp"));
  }

  #[test]
  fn init_creates_roots() {
    let tmp = tempfile::tempdir().unwrap();
    let s = LocalStorage::under_root(tmp.path());
    s.init().unwrap();
    assert!(s.directories().storage_dir_src.is_dir());
    assert!(s.directories().storage_dir_obj.is_dir());
    assert!(s.directories().storage_dir_etc.join("stamps").join("packages").is_dir());
  }
}
