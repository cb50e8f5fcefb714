//! forge-builder: the command layer of the build engine.
//!
//! Targets emit [`Command`]s; the [`ExecutionPlan`] orders them into a DAG
//! (with cycle diagnostics when that fails), persists to/from disk, and
//! executes with dependency gating on a bounded worker pool. The stamp
//! store skips commands whose inputs and outputs are unchanged.

pub mod command;
pub mod duration;
pub mod execute;
pub mod plan;
pub mod stamp;

pub use command::{Command, CommandError, CommandKind, CommandStorageKind};
pub use duration::{DurationError, parse_time_limit};
pub use execute::{ExecuteError, ExecutionReport, ExecutorConfig};
pub use plan::{CycleDiagnostics, ExecutionPlan, PlanError};
pub use stamp::StampStorage;
