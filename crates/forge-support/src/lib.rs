//! forge-support: leaf data model shared by every forge crate.
//!
//! This crate holds the types that identify and describe packages:
//! - `PackagePath`: hierarchical dotted package names
//! - `Version` / `VersionRange`: concrete versions and range predicates
//! - `PackageId` / `UnresolvedPackage` / `PackageData`: package identities and metadata
//! - `TargetSettings`: the recursive configuration mapping discriminating target variants
//! - `LocalStorage`: the content-addressed on-disk layout
//!
//! Nothing here touches the database or spawns work; the heavier crates
//! (`forge-manager`, `forge-builder`, `forge-core`) build on these types.

pub mod hash;
pub mod lock;
pub mod package;
pub mod path;
pub mod settings;
pub mod storage;
pub mod version;

pub use lock::{FileLock, LockMode};
pub use package::{PackageData, PackageId, UnresolvedPackage};
pub use path::PackagePath;
pub use settings::{SettingValue, TargetSettings};
pub use storage::{Directories, LocalStorage};
pub use version::{Version, VersionRange};
