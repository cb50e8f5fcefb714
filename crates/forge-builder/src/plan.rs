//! Execution plans.
//!
//! A plan is the closure of a command set ordered topologically. Plan
//! construction validates that no two commands share an output file and
//! that the dependency graph is acyclic; on a cycle it reports the strongly
//! connected components so they can be dumped as graph files. Plans persist
//! to `.swb` files (magic header, format version, commands, edges).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::command::{Command, CommandKind, CommandStorageKind};

/// Magic header of persisted plans.
pub const PLAN_MAGIC: &[u8; 8] = b"FRGPLAN\0";
/// Current plan file format version.
pub const PLAN_VERSION: u32 = 1;
/// Extension of persisted plans.
pub const PLAN_EXTENSION: &str = "swb";

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("duplicate output file '{path}' produced by '{first}' and '{second}'")]
  DuplicateOutput {
    path: PathBuf,
    first: String,
    second: String,
  },

  #[error("cannot create execution plan because of cyclic dependencies")]
  CyclicDependencies(CycleDiagnostics),

  #[error("execution plan io error: {0}")]
  Io(#[from] io::Error),

  #[error("malformed execution plan file: {0}")]
  Format(String),

  #[error("execution plan encoding error: {0}")]
  Encode(#[from] bincode::Error),
}

/// What the planner learned about a cyclic graph before giving up.
#[derive(Debug, Clone)]
pub struct CycleDiagnostics {
  /// Strongly connected components of size > 1, by command name.
  pub sccs: Vec<Vec<String>>,
  /// Commands that still made it into a valid prefix of the order.
  pub processed: Vec<String>,
  /// Commands stuck in or behind a cycle.
  pub unprocessed: Vec<String>,
  /// Every dependency edge, by command name.
  pub edges: Vec<(String, String)>,
}

impl CycleDiagnostics {
  /// Write one graph description per cycle (`cycle_<i>`) plus dumps of the
  /// processed and unprocessed graph portions into `dir`.
  pub fn write_to(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    for (i, scc) in self.sccs.iter().enumerate() {
      let members: BTreeSet<&String> = scc.iter().collect();
      let mut graph = String::from("digraph g {\n");
      for name in scc {
        graph.push_str(&format!("  \"{name}\";\n"));
      }
      for (from, to) in &self.edges {
        if members.contains(from) && members.contains(to) {
          graph.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
      }
      graph.push_str("}\n");
      let path = dir.join(format!("cycle_{i}"));
      fs::write(&path, graph)?;
      written.push(path);
    }

    for (file, nodes) in [("processed", &self.processed), ("unprocessed", &self.unprocessed)] {
      let set: BTreeSet<&String> = nodes.iter().collect();
      let mut graph = String::from("digraph g {\n");
      for name in nodes {
        graph.push_str(&format!("  \"{name}\";\n"));
      }
      for (from, to) in &self.edges {
        if set.contains(from) && set.contains(to) {
          graph.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
      }
      graph.push_str("}\n");
      let path = dir.join(file);
      fs::write(&path, graph)?;
      written.push(path);
    }

    Ok(written)
  }
}

/// Serialized form of one command.
#[derive(Debug, Serialize, Deserialize)]
struct PlanCommand {
  name: String,
  kind: CommandKind,
  inputs: Vec<PathBuf>,
  outputs: Vec<PathBuf>,
  storage: CommandStorageKind,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanFile {
  commands: Vec<PlanCommand>,
  edges: Vec<(u32, u32)>,
}

/// A validated, topologically ordered command DAG.
pub struct ExecutionPlan {
  commands: Vec<Arc<Command>>,
  /// `(dependency, dependent)` pairs over `commands` indices.
  edges: Vec<(usize, usize)>,
}

impl ExecutionPlan {
  /// Build a plan from a command set.
  ///
  /// The set is closed over dependencies first; commands already present
  /// keep their insertion order, discovered dependencies append behind
  /// them. Ties in the topological order resolve by that order, so the
  /// result is deterministic for identical inputs.
  pub fn create(commands: &[Arc<Command>]) -> Result<Self, PlanError> {
    // Closure over dependencies, de-duplicated by identity.
    let mut index: HashMap<*const Command, usize> = HashMap::new();
    let mut all: Vec<Arc<Command>> = Vec::new();
    let mut queue: VecDeque<Arc<Command>> = commands.iter().cloned().collect();
    while let Some(cmd) = queue.pop_front() {
      let ptr = Arc::as_ptr(&cmd);
      if index.contains_key(&ptr) {
        continue;
      }
      index.insert(ptr, all.len());
      queue.extend(cmd.dependencies());
      all.push(cmd);
    }

    // No two commands may write the same file.
    let mut outputs: BTreeMap<&Path, usize> = BTreeMap::new();
    for (i, cmd) in all.iter().enumerate() {
      for out in cmd.outputs() {
        if let Some(&first) = outputs.get(out.as_path()) {
          return Err(PlanError::DuplicateOutput {
            path: out.clone(),
            first: all[first].name.clone(),
            second: cmd.name.clone(),
          });
        }
        outputs.insert(out.as_path(), i);
      }
    }

    // Dependency edges, de-duplicated.
    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    for (i, cmd) in all.iter().enumerate() {
      for dep in cmd.dependencies() {
        let from = index[&Arc::as_ptr(&dep)];
        edges.insert((from, i));
      }
    }

    // Kahn's algorithm; the ready set is ordered by insertion index.
    let mut in_degree = vec![0usize; all.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); all.len()];
    for &(from, to) in &edges {
      in_degree[to] += 1;
      dependents[from].push(to);
    }

    let mut ready: BTreeSet<usize> = (0..all.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(all.len());
    while let Some(&i) = ready.iter().next() {
      ready.remove(&i);
      order.push(i);
      for &dep in &dependents[i] {
        in_degree[dep] -= 1;
        if in_degree[dep] == 0 {
          ready.insert(dep);
        }
      }
    }

    if order.len() != all.len() {
      return Err(PlanError::CyclicDependencies(Self::diagnose(&all, &edges, &order)));
    }

    // Re-index into topological positions.
    let mut position = vec![0usize; all.len()];
    for (pos, &i) in order.iter().enumerate() {
      position[i] = pos;
    }
    let commands: Vec<Arc<Command>> = order.iter().map(|&i| all[i].clone()).collect();
    let edges: Vec<(usize, usize)> = edges.iter().map(|&(f, t)| (position[f], position[t])).collect();

    debug!(commands = commands.len(), edges = edges.len(), "execution plan created");
    Ok(ExecutionPlan { commands, edges })
  }

  fn diagnose(all: &[Arc<Command>], edges: &BTreeSet<(usize, usize)>, order: &[usize]) -> CycleDiagnostics {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<_> = (0..all.len()).map(|i| graph.add_node(i)).collect();
    for &(from, to) in edges {
      graph.add_edge(nodes[from], nodes[to], ());
    }

    let sccs: Vec<Vec<String>> = tarjan_scc(&graph)
      .into_iter()
      .filter(|scc| scc.len() > 1)
      .map(|scc| scc.into_iter().map(|n| all[graph[n]].name.clone()).collect())
      .collect();

    let processed_set: BTreeSet<usize> = order.iter().copied().collect();
    let processed = order.iter().map(|&i| all[i].name.clone()).collect();
    let unprocessed = (0..all.len())
      .filter(|i| !processed_set.contains(i))
      .map(|i| all[i].name.clone())
      .collect();
    let edges = edges
      .iter()
      .map(|&(f, t)| (all[f].name.clone(), all[t].name.clone()))
      .collect();

    CycleDiagnostics {
      sccs,
      processed,
      unprocessed,
      edges,
    }
  }

  /// Commands in topological order.
  pub fn commands(&self) -> &[Arc<Command>] {
    &self.commands
  }

  pub fn len(&self) -> usize {
    self.commands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.commands.is_empty()
  }

  /// `(dependency, dependent)` pairs over command indices.
  pub fn edges(&self) -> &[(usize, usize)] {
    &self.edges
  }

  /// Serialize the plan to `path`.
  pub fn save(&self, path: &Path) -> Result<(), PlanError> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }

    let file = PlanFile {
      commands: self
        .commands
        .iter()
        .map(|c| PlanCommand {
          name: c.name.clone(),
          kind: c.kind.clone(),
          inputs: c.inputs().iter().cloned().collect(),
          outputs: c.outputs().iter().cloned().collect(),
          storage: c.command_storage,
        })
        .collect(),
      edges: self.edges.iter().map(|&(f, t)| (f as u32, t as u32)).collect(),
    };

    let mut out = fs::File::create(path)?;
    out.write_all(PLAN_MAGIC)?;
    out.write_all(&PLAN_VERSION.to_le_bytes())?;
    bincode::serialize_into(&mut out, &file)?;
    debug!(path = %path.display(), commands = self.commands.len(), "execution plan saved");
    Ok(())
  }

  /// Load a plan previously written by [`ExecutionPlan::save`].
  pub fn load(path: &Path) -> Result<Self, PlanError> {
    let mut input = fs::File::open(path)?;

    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != PLAN_MAGIC {
      return Err(PlanError::Format("bad magic".to_string()));
    }
    let mut version = [0u8; 4];
    input.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != PLAN_VERSION {
      return Err(PlanError::Format(format!("unsupported plan version {version}")));
    }

    let file: PlanFile = bincode::deserialize_from(&mut input)?;

    let commands: Vec<Arc<Command>> = file
      .commands
      .into_iter()
      .map(|pc| {
        let mut cmd = Command::new(pc.name, pc.kind).with_storage(pc.storage);
        for i in pc.inputs {
          cmd = cmd.with_input(i);
        }
        for o in pc.outputs {
          cmd = cmd.with_output(o);
        }
        Arc::new(cmd)
      })
      .collect();

    let mut edges = Vec::with_capacity(file.edges.len());
    for (from, to) in file.edges {
      let (from, to) = (from as usize, to as usize);
      if from >= commands.len() || to >= commands.len() {
        return Err(PlanError::Format(format!("edge ({from}, {to}) out of range")));
      }
      commands[to].add_dependency(commands[from].clone());
      edges.push((from, to));
    }

    debug!(path = %path.display(), commands = commands.len(), "execution plan loaded");
    Ok(ExecutionPlan { commands, edges })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cmd(name: &str) -> Arc<Command> {
    Arc::new(Command::program(name, "true", vec![]))
  }

  fn chain(names: &[&str]) -> Vec<Arc<Command>> {
    let cmds: Vec<_> = names.iter().map(|n| cmd(n)).collect();
    for pair in cmds.windows(2) {
      pair[1].add_dependency(pair[0].clone());
    }
    cmds
  }

  #[test]
  fn orders_dependencies_first() {
    let cmds = chain(&["compile", "link"]);
    // Submit in reverse to prove ordering comes from edges.
    let plan = ExecutionPlan::create(&[cmds[1].clone(), cmds[0].clone()]).unwrap();
    let names: Vec<_> = plan.commands().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["compile", "link"]);
  }

  #[test]
  fn closes_over_dependencies() {
    let cmds = chain(&["a", "b", "c"]);
    // Only the tail is submitted; the rest is discovered.
    let plan = ExecutionPlan::create(std::slice::from_ref(&cmds[2])).unwrap();
    assert_eq!(plan.len(), 3);
  }

  #[test]
  fn order_is_deterministic_for_independent_commands() {
    let build = || vec![cmd("one"), cmd("two"), cmd("three")];
    let a = ExecutionPlan::create(&build()).unwrap();
    let names_a: Vec<_> = a.commands().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names_a, vec!["one", "two", "three"]);

    let b = ExecutionPlan::create(&build()).unwrap();
    let names_b: Vec<_> = b.commands().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names_a, names_b);
  }

  #[test]
  fn duplicate_outputs_are_rejected() {
    let a = Arc::new(Command::program("a", "true", vec![]).with_output("/tmp/same.o"));
    let b = Arc::new(Command::program("b", "true", vec![]).with_output("/tmp/same.o"));
    match ExecutionPlan::create(&[a, b]) {
      Err(PlanError::DuplicateOutput { path, first, second }) => {
        assert_eq!(path, PathBuf::from("/tmp/same.o"));
        assert_eq!((first.as_str(), second.as_str()), ("a", "b"));
      }
      other => panic!("expected DuplicateOutput, got {:?}", other.map(|p| p.len())),
    }
  }

  #[test]
  fn cycle_produces_scc_diagnostics() {
    let a = cmd("a");
    let b = cmd("b");
    let c = cmd("c");
    let d = cmd("standalone");
    a.add_dependency(c.clone());
    b.add_dependency(a.clone());
    c.add_dependency(b.clone());

    match ExecutionPlan::create(&[a, b, c, d]) {
      Err(PlanError::CyclicDependencies(diag)) => {
        assert_eq!(diag.sccs.len(), 1);
        assert_eq!(diag.sccs[0].len(), 3);
        assert_eq!(diag.processed, vec!["standalone"]);
        assert_eq!(diag.unprocessed.len(), 3);

        let tmp = tempfile::tempdir().unwrap();
        let files = diag.write_to(tmp.path()).unwrap();
        assert!(tmp.path().join("cycle_0").exists());
        assert!(tmp.path().join("processed").exists());
        assert!(tmp.path().join("unprocessed").exists());
        assert_eq!(files.len(), 3);

        let cycle = fs::read_to_string(tmp.path().join("cycle_0")).unwrap();
        assert!(cycle.contains("\"a\" -> \"b\""));
      }
      other => panic!("expected CyclicDependencies, got {:?}", other.map(|p| p.len())),
    }
  }

  #[test]
  fn save_load_preserves_order_and_edges() {
    let tmp = tempfile::tempdir().unwrap();
    let cmds = chain(&["compile a", "archive a", "link exe"]);
    let plan = ExecutionPlan::create(&cmds).unwrap();

    let path = tmp.path().join("build.swb");
    plan.save(&path).unwrap();

    let loaded = ExecutionPlan::load(&path).unwrap();
    let names: Vec<_> = loaded.commands().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["compile a", "archive a", "link exe"]);
    assert_eq!(loaded.edges(), plan.edges());
    assert_eq!(loaded.commands()[1].dependencies().len(), 1);
  }

  #[test]
  fn load_rejects_foreign_files() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("not-a-plan.swb");
    fs::write(&path, b"garbage that is long enough").unwrap();
    assert!(matches!(ExecutionPlan::load(&path), Err(PlanError::Format(_))));
  }
}
