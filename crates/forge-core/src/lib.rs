//! forge-core: the build orchestration pipeline.
//!
//! A [`build::Build`] drives one build through its six states: inputs are
//! loaded into targets, the set of targets to build is fixed, missing
//! packages are resolved and installed, every requested configuration of
//! every package is loaded to a fixed point, targets prepare their commands
//! in parallel passes, and the resulting command DAG executes on the worker
//! pool.
//!
//! The [`target`] module holds the polymorphic target model, [`native`] the
//! concrete native-artifact targets, [`input`] the traits through which
//! manifests and drivers (out of scope here) feed targets in, and
//! [`context`] the shared services threaded through a build.

pub mod build;
pub mod context;
pub mod input;
pub mod native;
pub mod target;

pub use build::{Build, BuildError, BuildState};
pub use context::Context;
pub use input::{EntryPoint, Input, InputError, InputLoader, InputWithSettings};
pub use native::{NativeKind, NativeTarget};
pub use target::{Dependency, Target, TargetContainer, TargetDependency, TargetError, TargetMap};
