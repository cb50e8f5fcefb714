//! forge: command-line front end.
//!
//! The heavy lifting lives in the library crates; this binary wires up the
//! storage root and the package database and exposes the operations that
//! make sense without a manifest driver:
//! - `forge list [NAME]` / `forge versions PATH` - query the database
//! - `forge resolve PATH [RANGE]` - resolve a reference to a version
//! - `forge install PATH [RANGE]` - resolve and materialize packages
//! - `forge run-plan FILE` - execute a saved execution plan

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use forge_builder::{ExecutionPlan, ExecutorConfig, parse_time_limit};
use forge_manager::{PackagesDatabase, Resolver};
use forge_support::{LocalStorage, UnresolvedPackage};

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "A build engine and package manager for native software")]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Storage root (defaults to $FORGE_ROOT, then ./.forge)
  #[arg(long, global = true)]
  root: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// List known packages, optionally filtered by a name fragment
  List {
    name: Option<String>,
  },

  /// List the installed versions of a package
  Versions {
    path: String,
  },

  /// Resolve a reference against the database
  Resolve {
    path: String,

    #[arg(default_value = "*")]
    range: String,
  },

  /// Resolve and materialize packages into storage
  Install {
    path: String,

    #[arg(default_value = "*")]
    range: String,
  },

  /// Execute a saved execution plan file
  RunPlan {
    plan: PathBuf,

    /// Worker pool width
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Abort once this wall-clock budget is exhausted (e.g. "1h30m")
    #[arg(long)]
    time_limit: Option<String>,
  },
}

fn storage_root(cli: &Cli) -> PathBuf {
  if let Some(root) = &cli.root {
    return root.clone();
  }
  if let Ok(root) = std::env::var("FORGE_ROOT") {
    return PathBuf::from(root);
  }
  PathBuf::from(".forge")
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .init();

  let root = storage_root(&cli);
  let storage = LocalStorage::under_root(&root);
  storage.init().context("failed to initialize storage root")?;
  let db_path = storage.directories().storage_dir_etc.join("packages.db");
  let db = std::sync::Arc::new(PackagesDatabase::open(&db_path)?);

  match cli.command {
    Commands::List { name } => {
      let packages = db.matching_packages(name.as_deref().unwrap_or(""))?;
      if packages.is_empty() {
        println!("{}", style("no packages in database").yellow());
      }
      for p in packages {
        println!("{p}");
      }
    }

    Commands::Versions { path } => {
      let path = path.parse().map_err(|e| anyhow::anyhow!("invalid path: {e}"))?;
      for v in db.versions_for_package(&path)? {
        println!("{v}");
      }
    }

    Commands::Resolve { path, range } => {
      let reference = parse_reference(&path, &range)?;
      let refs: BTreeSet<_> = [reference.clone()].into();
      let (resolved, unresolved) = db.resolve(&refs)?;
      if let Some(id) = resolved.get(&reference) {
        println!("{} {id}", style("resolved").green());
      }
      if !unresolved.is_empty() {
        anyhow::bail!("could not resolve {reference}");
      }
    }

    Commands::Install { path, range } => {
      let reference = parse_reference(&path, &range)?;
      let resolver = Resolver::new(db, storage);
      let installed = resolver.install(&[reference].into())?;
      for (reference, id) in installed {
        println!("{} {reference} -> {id}", style("installed").green());
      }
    }

    Commands::RunPlan { plan, jobs, time_limit } => {
      let plan = ExecutionPlan::load(&plan)?;
      let mut cfg = ExecutorConfig::default();
      if let Some(jobs) = jobs {
        cfg.jobs = jobs;
      }
      if let Some(tl) = time_limit {
        cfg.time_limit = Some(parse_time_limit(&tl)?);
      }
      println!("{} {} commands", style("executing").green().bold(), plan.len());
      let report = plan.execute(&cfg).await?;
      println!(
        "{} ({} executed, {} up to date)",
        style("done").green().bold(),
        report.executed,
        report.up_to_date,
      );
    }
  }

  Ok(())
}

fn parse_reference(path: &str, range: &str) -> Result<UnresolvedPackage> {
  let path = path.parse().map_err(|e| anyhow::anyhow!("invalid path: {e}"))?;
  let range = range.parse().map_err(|e| anyhow::anyhow!("invalid range: {e}"))?;
  Ok(UnresolvedPackage::new(path, range))
}
