//! End-to-end tests of the build pipeline: the state machine, the
//! multi-configuration loader, cycle diagnostics and plan persistence.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{CommandTarget, ScriptedEntryPoint, ScriptedInput, context, native_tool_settings};
use forge_builder::{Command, PlanError};
use forge_core::{Build, BuildError, BuildState, InputWithSettings, NativeKind, NativeTarget, Target};
use forge_support::{PackageData, PackageId, TargetSettings, UnresolvedPackage};

fn pkg(s: &str) -> PackageId {
  s.parse().unwrap()
}

fn static_lib_input(name: &str, package: &'static str, source: PathBuf, build_dir: PathBuf) -> Arc<ScriptedInput> {
  Arc::new(ScriptedInput::new(name, move |_ctx, s| {
    vec![Arc::new(
      NativeTarget::new(package.parse().unwrap(), s.clone(), NativeKind::StaticLibrary, build_dir.clone())
        .with_source(source.clone()),
    ) as Arc<dyn Target>]
  }))
}

async fn step_until(build: &mut Build, state: BuildState) {
  while build.state() != state {
    assert!(build.step().await.unwrap(), "pipeline finished before reaching {state:?}");
  }
}

#[tokio::test]
async fn trivial_single_package_build() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");
  let source = tmp.path().join("a.c");
  std::fs::write(&source, "int a(void) { return 1; }\n").unwrap();

  // Absolute package ids resolve against the database even when their
  // targets come straight from an input.
  ctx
    .database()
    .install_package(&pkg("com.foo.a-1.0.0"), &PackageData::with_hash("ah"))
    .unwrap();

  let mut build = Build::new(ctx, build_dir.clone());
  build.add_input(InputWithSettings::single(
    static_lib_input("x", "com.foo.a-1.0.0", source, build_dir),
    native_tool_settings("release"),
  ));

  step_until(&mut build, BuildState::Prepared).await;

  // Exactly one compile command and one archive command, in that order.
  let plan = build.execution_plan().unwrap();
  let names: Vec<_> = plan.commands().iter().map(|c| c.name.clone()).collect();
  assert_eq!(names.len(), 2);
  assert!(names[0].starts_with("compile"), "unexpected first command: {}", names[0]);
  assert!(names[1].starts_with("archive"), "unexpected second command: {}", names[1]);

  assert!(build.step().await.unwrap());
  assert_eq!(build.state(), BuildState::Executed);
  assert!(!build.step().await.unwrap());
}

#[tokio::test]
async fn selected_targets_limit_the_plan() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");
  let src_a = tmp.path().join("a.c");
  let src_b = tmp.path().join("b.c");
  std::fs::write(&src_a, "int a(void) { return 1; }\n").unwrap();
  std::fs::write(&src_b, "int b(void) { return 2; }\n").unwrap();

  let input = {
    let build_dir = build_dir.clone();
    Arc::new(ScriptedInput::new("two-libs", move |_ctx, s| {
      vec![
        Arc::new(
          NativeTarget::new("com.foo.a-1.0.0".parse().unwrap(), s.clone(), NativeKind::StaticLibrary, build_dir.clone())
            .with_source(src_a.clone()),
        ) as Arc<dyn Target>,
        Arc::new(
          NativeTarget::new("com.foo.b-1.0.0".parse().unwrap(), s.clone(), NativeKind::StaticLibrary, build_dir.clone())
            .with_source(src_b.clone()),
        ) as Arc<dyn Target>,
      ]
    }))
  };

  ctx
    .database()
    .install_package(&pkg("com.foo.a-1.0.0"), &PackageData::with_hash("ah"))
    .unwrap();

  let mut build = Build::new(ctx, build_dir);
  build.add_input(InputWithSettings::single(input, native_tool_settings("release")));

  assert!(build.step().await.unwrap());
  assert!(build.select_target(&pkg("com.foo.a-1.0.0")));
  assert!(!build.select_target(&pkg("com.gone-1.0.0")));

  step_until(&mut build, BuildState::Prepared).await;
  let plan = build.execution_plan().unwrap();
  let names: Vec<_> = plan.commands().iter().map(|c| c.name.clone()).collect();
  assert_eq!(names.len(), 2);
  assert!(names.iter().all(|n| n.contains("com.foo.a")), "plan included too much: {names:?}");
}

#[tokio::test]
async fn state_transitions_are_guarded() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let mut build = Build::new(ctx, tmp.path().join("build"));

  // Saving a plan requires Prepared.
  match build.save_execution_plan() {
    Err(BuildError::UnexpectedState { expected, actual }) => {
      assert_eq!(expected, BuildState::Prepared);
      assert_eq!(actual, BuildState::NotStarted);
    }
    other => panic!("expected UnexpectedState, got {other:?}"),
  }

  // Running a saved plan requires InputsLoaded.
  assert!(matches!(
    build.run_saved_execution_plan().await,
    Err(BuildError::UnexpectedState { .. })
  ));
  assert_eq!(build.state(), BuildState::NotStarted);
}

#[tokio::test]
async fn multi_configuration_load_creates_one_variant_per_settings() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");

  // The library is an installed package served by an entry point.
  let lib_id = pkg("com.foo.lib-1.0.0");
  ctx
    .database()
    .install_package(&lib_id, &PackageData::with_hash("libhash"))
    .unwrap();
  {
    let build_dir = build_dir.clone();
    let source = tmp.path().join("lib.c");
    std::fs::write(&source, "int l(void) { return 2; }\n").unwrap();
    ctx.set_entry_point(
      lib_id.clone(),
      Arc::new(ScriptedEntryPoint::new(move |_ctx, s| {
        vec![Arc::new(
          NativeTarget::new(
            "com.foo.lib-1.0.0".parse().unwrap(),
            s.clone(),
            NativeKind::StaticLibrary,
            build_dir.clone(),
          )
          .with_source(source.clone()),
        ) as Arc<dyn Target>]
      })),
    );
  }

  // Two executables request the library under different configurations.
  let exe_src = tmp.path().join("main.c");
  std::fs::write(&exe_src, "int main(void) { return 0; }\n").unwrap();
  let input = {
    let build_dir = build_dir.clone();
    let exe_src = exe_src.clone();
    Arc::new(ScriptedInput::new("exes", move |_ctx, s| {
      let exe = NativeTarget::new(
        "loc.build.exe-0.0.1".parse().unwrap(),
        s.clone(),
        NativeKind::Executable,
        build_dir.clone(),
      )
      .with_source(exe_src.clone())
      .with_dependency(
        UnresolvedPackage::new("com.foo.lib".parse().unwrap(), "1.*".parse().unwrap()),
        native_tool_settings("release"),
      );
      let test = NativeTarget::new(
        "loc.build.test-0.0.1".parse().unwrap(),
        s.clone(),
        NativeKind::Executable,
        build_dir.clone(),
      )
      .with_source(exe_src.clone())
      .with_dependency(
        UnresolvedPackage::new("com.foo.lib".parse().unwrap(), "1.*".parse().unwrap()),
        native_tool_settings("debug"),
      );
      vec![Arc::new(exe) as Arc<dyn Target>, Arc::new(test) as Arc<dyn Target>]
    }))
  };

  let mut build = Build::new(ctx, build_dir);
  build.add_input(InputWithSettings::single(input, native_tool_settings("release")));

  step_until(&mut build, BuildState::PackagesLoaded).await;

  // One library variant per requested configuration.
  let container = build.targets().get(&lib_id).unwrap();
  assert_eq!(container.len(), 2);

  // Every dependency of every loaded target is resolved.
  for (_, container) in build.targets().iter() {
    for tgt in container.iter() {
      for dep in tgt.dependencies() {
        assert!(dep.is_resolved(), "{}: unresolved {}", tgt.package(), dep.unresolved_package());
      }
    }
  }

  // The pipeline still runs to completion.
  build.build().await.unwrap();
  assert_eq!(build.state(), BuildState::Executed);
}

#[tokio::test]
async fn missing_dependency_is_a_load_error() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");
  let src = tmp.path().join("main.c");
  std::fs::write(&src, "int main(void) { return 0; }\n").unwrap();

  let input = {
    let build_dir = build_dir.clone();
    Arc::new(ScriptedInput::new("exe", move |_ctx, s| {
      vec![Arc::new(
        NativeTarget::new(
          "loc.build.exe-0.0.1".parse().unwrap(),
          s.clone(),
          NativeKind::Executable,
          build_dir.clone(),
        )
        .with_source(src.clone())
        .with_dependency(
          UnresolvedPackage::new("com.gone".parse().unwrap(), "1.*".parse().unwrap()),
          native_tool_settings("release"),
        ),
      ) as Arc<dyn Target>]
    }))
  };

  let mut build = Build::new(ctx, build_dir);
  build.add_input(InputWithSettings::single(input, native_tool_settings("release")));

  // The reference is not in the database: resolution fails and the state
  // sticks at the failed transition's precondition.
  let err = build.build().await.unwrap_err();
  assert!(matches!(err, BuildError::Resolve(_)), "got {err:?}");
  assert_eq!(build.state(), BuildState::TargetsToBuildSet);
}

#[tokio::test]
async fn predefined_targets_resolve_but_are_not_built() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");

  let toolchain = pkg("org.toolchain.cc-1.0.0");
  ctx.add_predefined_target(Arc::new(CommandTarget::new(
    "org.toolchain.cc-1.0.0",
    native_tool_settings("release"),
    Vec::new(),
  )));

  let src = tmp.path().join("main.c");
  std::fs::write(&src, "int main(void) { return 0; }\n").unwrap();
  let input = {
    let build_dir = build_dir.clone();
    Arc::new(ScriptedInput::new("exe", move |_ctx, s| {
      let mut requested = TargetSettings::new();
      requested.set("config", "release");
      vec![Arc::new(
        NativeTarget::new(
          "loc.build.exe-0.0.1".parse().unwrap(),
          s.clone(),
          NativeKind::Executable,
          build_dir.clone(),
        )
        .with_source(src.clone())
        .with_dependency(
          UnresolvedPackage::new("org.toolchain.cc".parse().unwrap(), "*".parse().unwrap()),
          requested,
        ),
      ) as Arc<dyn Target>]
    }))
  };

  let mut build = Build::new(ctx, build_dir);
  build.add_input(InputWithSettings::single(input, native_tool_settings("release")));

  step_until(&mut build, BuildState::PackagesLoaded).await;

  // Resolved against the predefined variant, but not selected for building.
  assert!(build.targets().get(&toolchain).is_some());
  assert!(build.targets_to_build().get(&toolchain).is_none());

  build.build().await.unwrap();
  assert_eq!(build.state(), BuildState::Executed);
}

#[tokio::test]
async fn unresolvable_predefined_settings_fail_loudly() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");

  ctx.add_predefined_target(Arc::new(CommandTarget::new(
    "org.toolchain.cc-1.0.0",
    native_tool_settings("release"),
    Vec::new(),
  )));

  let src = tmp.path().join("main.c");
  std::fs::write(&src, "int main(void) { return 0; }\n").unwrap();
  let input = {
    let build_dir = build_dir.clone();
    Arc::new(ScriptedInput::new("exe", move |_ctx, s| {
      let mut requested = TargetSettings::new();
      requested.set("config", "debug");
      vec![Arc::new(
        NativeTarget::new(
          "loc.build.exe-0.0.1".parse().unwrap(),
          s.clone(),
          NativeKind::Executable,
          build_dir.clone(),
        )
        .with_source(src.clone())
        .with_dependency(
          UnresolvedPackage::new("org.toolchain.cc".parse().unwrap(), "*".parse().unwrap()),
          requested,
        ),
      ) as Arc<dyn Target>]
    }))
  };

  let mut build = Build::new(ctx, build_dir);
  build.add_input(InputWithSettings::single(input, native_tool_settings("release")));

  let err = build.build().await.unwrap_err();
  assert!(matches!(err, BuildError::PredefinedUnresolved { .. }), "got {err:?}");
}

#[tokio::test]
async fn cyclic_commands_dump_scc_diagnostics() {
  let tmp = tempfile::tempdir().unwrap();
  let ctx = context(tmp.path());
  let build_dir = tmp.path().join("build");

  let a = Arc::new(Command::program("a", "true", vec![]));
  let b = Arc::new(Command::program("b", "true", vec![]));
  let c = Arc::new(Command::program("c", "true", vec![]));
  a.add_dependency(b.clone());
  b.add_dependency(c.clone());
  c.add_dependency(a.clone());

  let input = Arc::new(ScriptedInput::new("cyclic", move |_ctx, s| {
    vec![Arc::new(CommandTarget::new(
      "loc.build.cyclic-0.0.1",
      s.clone(),
      vec![a.clone(), b.clone(), c.clone()],
    )) as Arc<dyn Target>]
  }));

  let mut build = Build::new(ctx, build_dir.clone());
  build.add_input(InputWithSettings::single(input, native_tool_settings("release")));

  let err = build.build().await.unwrap_err();
  assert!(
    matches!(err, BuildError::Plan(PlanError::CyclicDependencies(_))),
    "got {err:?}"
  );
  // The failed transition keeps its precondition state.
  assert_eq!(build.state(), BuildState::Prepared);

  let cycle_file = build_dir.join("misc").join("cyclic").join("cycle_0");
  assert!(cycle_file.exists());
  let graph = std::fs::read_to_string(cycle_file).unwrap();
  for name in ["\"a\"", "\"b\"", "\"c\""] {
    assert!(graph.contains(name), "missing {name} in {graph}");
  }
}

#[tokio::test]
async fn saved_plan_roundtrips_and_restores_state() {
  let tmp = tempfile::tempdir().unwrap();
  let out_a = tmp.path().join("out-a");
  let out_b = tmp.path().join("out-b");
  let build_dir = tmp.path().join("build");

  let make_input = {
    let out_a = out_a.clone();
    let out_b = out_b.clone();
    move || {
      let out_a = out_a.clone();
      let out_b = out_b.clone();
      Arc::new(ScriptedInput::new("persist", move |_ctx, s| {
        let first = Arc::new(
          Command::program("touch a", "touch", vec![out_a.to_string_lossy().into_owned()]).with_output(out_a.clone()),
        );
        let second = Arc::new(
          Command::program("touch b", "touch", vec![out_b.to_string_lossy().into_owned()]).with_output(out_b.clone()),
        );
        second.add_dependency(first.clone());
        vec![Arc::new(CommandTarget::new(
          "loc.build.persist-0.0.1",
          s.clone(),
          vec![first, second],
        )) as Arc<dyn Target>]
      }))
    }
  };

  // First build: prepare, persist the plan, then execute live.
  let ctx = context(tmp.path());
  let mut first = Build::new(ctx.clone(), build_dir.clone());
  first.add_input(InputWithSettings::single(make_input(), native_tool_settings("release")));
  step_until(&mut first, BuildState::Prepared).await;
  let plan_path = first.save_execution_plan().unwrap();
  assert!(plan_path.exists());
  assert_eq!(plan_path.extension().unwrap(), "swb");
  first.build().await.unwrap();
  assert!(out_a.exists() && out_b.exists());

  // Wipe the outputs; the saved plan must reproduce them.
  std::fs::remove_file(&out_a).unwrap();
  std::fs::remove_file(&out_b).unwrap();

  // Fresh build object over the same inputs: load inputs, then run the
  // saved plan. The final state is the restore target.
  let mut second = Build::new(ctx, build_dir);
  second.add_input(InputWithSettings::single(make_input(), native_tool_settings("release")));
  assert!(second.step().await.unwrap());
  assert_eq!(second.state(), BuildState::InputsLoaded);

  second.run_saved_execution_plan().await.unwrap();
  assert_eq!(second.state(), BuildState::InputsLoaded);
  assert!(out_a.exists() && out_b.exists());
}
