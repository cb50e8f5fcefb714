//! Parallel plan execution.
//!
//! Ready commands (in-degree zero) are dispatched to a bounded worker pool;
//! when a command completes, its dependents' in-degrees drop and newly
//! ready commands are enqueued. A failed command poisons its transitive
//! dependents, which are skipped. Execution stops dispatching when the
//! error tolerance is exceeded or the time limit elapses; in-flight
//! commands always run to completion.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandError};
use crate::plan::ExecutionPlan;
use crate::stamp::StampStorage;

#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Command(#[from] CommandError),

  #[error("build aborted: {reason}")]
  Aborted { reason: String },

  #[error("worker task failed: {0}")]
  Join(#[from] tokio::task::JoinError),

  #[error("trace io error: {0}")]
  Io(#[from] io::Error),
}

/// Knobs of one execution run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  /// Worker pool width.
  pub jobs: usize,

  /// How many command failures to tolerate before dispatch stops.
  pub skip_errors: u64,

  /// Wall-clock budget for the whole plan.
  pub time_limit: Option<Duration>,

  /// Run commands even when their stamps say they are up to date.
  pub build_always: bool,

  /// Stamp store consulted for up-to-date checks.
  pub stamps: Option<StampStorage>,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      jobs: std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4),
      skip_errors: 0,
      time_limit: None,
      build_always: false,
      stamps: None,
    }
  }
}

/// Timing of one completed command, relative to execution start.
#[derive(Debug, Clone)]
pub struct CommandTiming {
  pub name: String,
  pub start: Duration,
  pub duration: Duration,
  pub up_to_date: bool,
}

/// What happened during a run.
#[derive(Debug, Default)]
pub struct ExecutionReport {
  /// Commands that actually ran.
  pub executed: usize,

  /// Commands skipped because their stamps matched.
  pub up_to_date: usize,

  /// Commands skipped because a transitive dependency failed.
  pub skipped_failed: Vec<String>,

  pub timings: Vec<CommandTiming>,
}

impl ExecutionReport {
  /// Write the timings as a Chrome trace (`chrome://tracing`) JSON file.
  pub fn save_chrome_trace(&self, path: &std::path::Path) -> io::Result<()> {
    #[derive(Serialize)]
    struct TraceEvent<'a> {
      name: &'a str,
      ph: &'static str,
      ts: u128,
      dur: u128,
      pid: u32,
      tid: u32,
    }

    let events: Vec<TraceEvent<'_>> = self
      .timings
      .iter()
      .map(|t| TraceEvent {
        name: &t.name,
        ph: "X",
        ts: t.start.as_micros(),
        dur: t.duration.as_micros(),
        pid: 1,
        tid: 1,
      })
      .collect();

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(file, &serde_json::json!({ "traceEvents": events })).map_err(io::Error::other)
  }
}

type WorkerResult = (usize, Result<bool, CommandError>, Duration, Duration);

fn spawn_worker(
  joinset: &mut JoinSet<WorkerResult>,
  idx: usize,
  cmd: Arc<Command>,
  semaphore: Arc<Semaphore>,
  config: &ExecutorConfig,
  started: Instant,
) {
  let stamps = config.stamps.clone();
  let build_always = config.build_always;
  joinset.spawn(async move {
    let _permit = semaphore.acquire_owned().await.expect("executor semaphore closed");
    let start = started.elapsed();
    let name = cmd.name.clone();
    let outcome = tokio::task::spawn_blocking(move || {
      if !build_always
        && let Some(stamps) = &stamps
        && stamps.is_up_to_date(&cmd)
      {
        return Ok(true);
      }
      cmd.execute()?;
      if let Some(stamps) = &stamps {
        // A failed stamp write only costs a rerun later.
        let _ = stamps.record(&cmd);
      }
      Ok(false)
    })
    .await
    .unwrap_or_else(|e| {
      Err(CommandError::Failed {
        name,
        code: None,
        stderr: format!("worker panicked: {e}"),
      })
    });
    (idx, outcome, start, started.elapsed())
  });
}

impl ExecutionPlan {
  /// Execute the plan under `config`.
  ///
  /// # Errors
  ///
  /// The first command failure is returned once the run winds down (no new
  /// commands are dispatched past the `skip_errors` tolerance). A time
  /// limit expiry surfaces as `Aborted` after in-flight commands finish.
  pub async fn execute(&self, config: &ExecutorConfig) -> Result<ExecutionReport, ExecuteError> {
    let n = self.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(from, to) in self.edges() {
      in_degree[to] += 1;
      dependents[from].push(to);
    }

    let semaphore = Arc::new(Semaphore::new(config.jobs.max(1)));
    let cancel = AtomicBool::new(false);
    let started = Instant::now();
    let deadline = config.time_limit.map(|d| tokio::time::Instant::now() + d);

    info!(commands = n, jobs = config.jobs, "executing plan");

    let mut joinset: JoinSet<WorkerResult> = JoinSet::new();
    let mut report = ExecutionReport::default();
    let mut poisoned = vec![false; n];
    let mut failures: u64 = 0;
    let mut first_error: Option<CommandError> = None;
    let mut timed_out = false;
    let mut inflight = 0usize;

    for idx in (0..n).filter(|&i| in_degree[i] == 0) {
      spawn_worker(&mut joinset, idx, self.commands()[idx].clone(), semaphore.clone(), config, started);
      inflight += 1;
    }

    while inflight > 0 {
      let joined = match deadline {
        Some(dl) if !cancel.load(Ordering::Relaxed) => match tokio::time::timeout_at(dl, joinset.join_next()).await {
          Ok(joined) => joined,
          Err(_) => {
            warn!("time limit elapsed, cancelling pending commands");
            cancel.store(true, Ordering::Relaxed);
            timed_out = true;
            continue;
          }
        },
        _ => joinset.join_next().await,
      };
      let Some(result) = joined else {
        break;
      };
      let (idx, outcome, start, end) = result?;
      inflight -= 1;

      let failed_here = outcome.is_err();
      match outcome {
        Ok(up_to_date) => {
          if up_to_date {
            report.up_to_date += 1;
          } else {
            report.executed += 1;
          }
          report.timings.push(CommandTiming {
            name: self.commands()[idx].name.clone(),
            start,
            duration: end.saturating_sub(start),
            up_to_date,
          });
        }
        Err(e) => {
          warn!(command = %self.commands()[idx].name, error = %e, "command failed");
          failures += 1;
          if first_error.is_none() {
            first_error = Some(e);
          }
          if failures > config.skip_errors {
            debug!(failures, tolerance = config.skip_errors, "error limit exceeded, stopping dispatch");
            cancel.store(true, Ordering::Relaxed);
          }
        }
      }

      // Release dependents; skipped nodes release theirs transitively.
      let mut queue: VecDeque<(usize, bool)> = VecDeque::new();
      queue.push_back((idx, failed_here));
      while let Some((done, done_failed)) = queue.pop_front() {
        for &next in &dependents[done] {
          in_degree[next] -= 1;
          if done_failed {
            poisoned[next] = true;
          }
          if in_degree[next] > 0 {
            continue;
          }
          if cancel.load(Ordering::Relaxed) {
            continue;
          }
          if poisoned[next] {
            report.skipped_failed.push(self.commands()[next].name.clone());
            queue.push_back((next, true));
          } else {
            spawn_worker(&mut joinset, next, self.commands()[next].clone(), semaphore.clone(), config, started);
            inflight += 1;
          }
        }
      }
    }

    if timed_out {
      return Err(ExecuteError::Aborted {
        reason: "time limit exceeded".to_string(),
      });
    }
    if let Some(e) = first_error {
      return Err(e.into());
    }

    info!(
      executed = report.executed,
      up_to_date = report.up_to_date,
      skipped = report.skipped_failed.len(),
      "plan executed"
    );
    Ok(report)
  }
}
