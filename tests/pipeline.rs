//! Scenario coverage for the run loop: caching, dedup, failure isolation,
//! cancellation and the parallel runner.

use std::sync::{Arc, Mutex};

use karakuri::{
    Action, Artifact, CancelToken, Derive, Invalidation, MemoryStore, Outputs, ParamKind,
    ParameterError, Pipeline, PlanError, Registry, RunError, RunOptions, StoreError, StoreKey,
    TaskFailure,
};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, name: &str) {
    log.lock().unwrap().push(name.to_string());
}

fn count(log: &Log, name: &str) -> usize {
    log.lock().unwrap().iter().filter(|n| *n == name).count()
}

fn payload() -> Artifact {
    Artifact::from_bytes(vec![1u8])
}

/// fetch -> transform -> load, single int parameter threaded through.
fn chain(log: &Log) -> Registry<()> {
    let mut registry: Registry<()> = Registry::new();

    let recorder = log.clone();
    registry
        .task("fetch")
        .param("lookback", ParamKind::Int)
        .output("out")
        .run(move |_| {
            record(&recorder, "fetch");
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    let recorder = log.clone();
    registry
        .task("transform")
        .param("lookback", ParamKind::Int)
        .requires("fetch", Derive::inherit())
        .output("out")
        .run(move |ctx| {
            record(&recorder, "transform");
            let _ = ctx.load("fetch", "out")?;
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    let recorder = log.clone();
    registry
        .task("load")
        .param("lookback", ParamKind::Int)
        .requires("transform", Derive::inherit())
        .output("out")
        .run(move |ctx| {
            record(&recorder, "load");
            let _ = ctx.load("transform", "out")?;
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    registry
}

/// base feeding left and right, both feeding root.
fn diamond(log: &Log, fail_left: bool) -> Registry<()> {
    let mut registry: Registry<()> = Registry::new();

    let recorder = log.clone();
    registry
        .task("base")
        .param("lookback", ParamKind::Int)
        .output("out")
        .run(move |_| {
            record(&recorder, "base");
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    let recorder = log.clone();
    registry
        .task("left")
        .param("lookback", ParamKind::Int)
        .requires("base", Derive::inherit())
        .output("out")
        .run(move |_| {
            record(&recorder, "left");
            if fail_left {
                anyhow::bail!("synthetic failure");
            }
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    let recorder = log.clone();
    registry
        .task("right")
        .param("lookback", ParamKind::Int)
        .requires("base", Derive::inherit())
        .output("out")
        .run(move |_| {
            record(&recorder, "right");
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    let recorder = log.clone();
    registry
        .task("root")
        .param("lookback", ParamKind::Int)
        .requires("left", Derive::inherit())
        .requires("right", Derive::inherit())
        .output("out")
        .run(move |_| {
            record(&recorder, "root");
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();

    registry
}

#[test]
fn test_rerun_is_noop() {
    let log = Log::default();
    let pipeline = Pipeline::new(chain(&log), MemoryStore::new());
    let instance = pipeline.instance("load", [("lookback", 1.into())]).unwrap();

    let report = pipeline.run(&instance).unwrap();
    assert!(report.is_success());
    assert_eq!(report.executed().count(), 3);

    let report = pipeline.run(&instance).unwrap();
    assert!(report.is_success());
    assert_eq!(report.executed().count(), 0);
    assert_eq!(report.skipped().count(), 3);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn test_value_equal_parameters_share_the_cache() {
    let log = Log::default();
    let mut registry: Registry<()> = Registry::new();

    let recorder = log.clone();
    registry
        .task("screen")
        .param("lookback", ParamKind::Int)
        .param("symbols", ParamKind::list(ParamKind::Str))
        .output("out")
        .run(move |_| {
            record(&recorder, "screen");
            Ok(Outputs::one("out", Artifact::encode(&vec![0.5_f64])?))
        })
        .unwrap();

    let pipeline = Pipeline::new(registry, MemoryStore::new());

    let first = pipeline
        .instance(
            "screen",
            [("lookback", 1.into()), ("symbols", vec!["X", "Y"].into())],
        )
        .unwrap();
    pipeline.run(&first).unwrap();

    // Same values, different construction order: same instance.
    let second = pipeline
        .instance(
            "screen",
            [("symbols", vec!["X", "Y"].into()), ("lookback", 1.into())],
        )
        .unwrap();
    assert_eq!(first, second);

    let report = pipeline.run(&second).unwrap();
    assert_eq!(report.executed().count(), 0);
    assert_eq!(count(&log, "screen"), 1);

    let loaded: Vec<f64> = pipeline.output(&second, "out").unwrap().decode().unwrap();
    assert_eq!(loaded, vec![0.5]);
}

#[test]
fn test_diamond_builds_shared_upstream_once() {
    let log = Log::default();
    let pipeline = Pipeline::new(diamond(&log, false), MemoryStore::new());
    let instance = pipeline.instance("root", [("lookback", 1.into())]).unwrap();

    let report = pipeline.run(&instance).unwrap();
    assert!(report.is_success());
    assert_eq!(report.len(), 4);
    assert_eq!(report.executed().count(), 4);
    assert_eq!(count(&log, "base"), 1);
}

#[test]
fn test_failure_blocks_dependents_but_not_siblings() {
    let log = Log::default();
    let pipeline = Pipeline::new(diamond(&log, true), MemoryStore::new());
    let instance = pipeline.instance("root", [("lookback", 1.into())]).unwrap();

    let report = pipeline.run(&instance).unwrap();
    assert!(!report.is_success());

    // The sibling branch still ran.
    assert_eq!(count(&log, "right"), 1);
    assert_eq!(count(&log, "root"), 0);

    let (node, failure) = report.failures().next().unwrap();
    assert_eq!(node.kind, "left");
    assert!(matches!(failure, TaskFailure::Error(_)));

    match report.action_of(&instance) {
        Some(Action::Blocked { on }) => {
            assert_eq!(on.len(), 1);
            assert!(on[0].starts_with("left("));
        }
        other => panic!("expected blocked root, got {other:?}"),
    }

    // The failed node is still incomplete, so a later run retries it.
    let handle = pipeline.output(&instance, "out").unwrap();
    assert!(!handle.exists().unwrap());
}

#[test]
fn test_panic_is_a_node_failure() {
    let log = Log::default();
    let mut registry = diamond(&log, false);

    registry
        .task("volatile")
        .param("lookback", ParamKind::Int)
        .output("out")
        .run(|_| panic!("boom"))
        .unwrap();

    let pipeline = Pipeline::new(registry, MemoryStore::new());
    let instance = pipeline
        .instance("volatile", [("lookback", 1.into())])
        .unwrap();

    let report = pipeline.run(&instance).unwrap();
    let (_, failure) = report.failures().next().unwrap();
    match failure {
        TaskFailure::Panic(message) => assert!(message.contains("boom")),
        other => panic!("expected panic failure, got {other}"),
    }
}

#[test]
fn test_missing_declared_output_is_a_failure() {
    let mut registry: Registry<()> = Registry::new();
    registry
        .task("partial")
        .output("portfolio")
        .output("pnl")
        .run(|_| Ok(Outputs::one("portfolio", payload())))
        .unwrap();

    let pipeline = Pipeline::new(registry, MemoryStore::new());
    let instance = pipeline
        .instance("partial", std::iter::empty::<(&str, karakuri::ParamValue)>())
        .unwrap();

    let report = pipeline.run(&instance).unwrap();
    let (_, failure) = report.failures().next().unwrap();
    assert!(matches!(failure, TaskFailure::MissingOutput(name) if name == "pnl"));
}

#[test]
fn test_undeclared_output_is_a_failure() {
    let mut registry: Registry<()> = Registry::new();
    registry
        .task("chatty")
        .output("out")
        .run(|_| {
            let mut outputs = Outputs::one("out", payload());
            outputs.insert("extra", payload());
            Ok(outputs)
        })
        .unwrap();

    let pipeline = Pipeline::new(registry, MemoryStore::new());
    let instance = pipeline
        .instance("chatty", std::iter::empty::<(&str, karakuri::ParamValue)>())
        .unwrap();

    let report = pipeline.run(&instance).unwrap();
    let (_, failure) = report.failures().next().unwrap();
    assert!(matches!(failure, TaskFailure::UnexpectedOutput(name) if name == "extra"));
}

#[test]
fn test_cycle_aborts_before_any_execution() {
    let log = Log::default();
    let mut registry: Registry<()> = Registry::new();

    let recorder = log.clone();
    registry
        .task("a")
        .requires("b", Derive::inherit())
        .output("out")
        .run(move |_| {
            record(&recorder, "a");
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();
    registry
        .task("b")
        .requires("a", Derive::inherit())
        .output("out")
        .run(|_| Ok(Outputs::one("out", payload())))
        .unwrap();

    let pipeline = Pipeline::new(registry, MemoryStore::new());
    let instance = pipeline
        .instance("a", std::iter::empty::<(&str, karakuri::ParamValue)>())
        .unwrap();

    let result = pipeline.run(&instance);
    assert!(matches!(
        result,
        Err(RunError::Plan(PlanError::Cycle(_)))
    ));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_cancellation_stops_unstarted_nodes() {
    let mut registry: Registry<()> = Registry::new();
    let token = CancelToken::new();

    let trigger = token.clone();
    registry
        .task("fetch")
        .output("out")
        .run(move |_| {
            // Cancel mid-run: this contract finishes, nothing else starts.
            trigger.cancel();
            Ok(Outputs::one("out", payload()))
        })
        .unwrap();
    registry
        .task("transform")
        .requires("fetch", Derive::inherit())
        .output("out")
        .run(|_| Ok(Outputs::one("out", payload())))
        .unwrap();

    let pipeline = Pipeline::new(registry, MemoryStore::new());
    let instance = pipeline
        .instance("transform", std::iter::empty::<(&str, karakuri::ParamValue)>())
        .unwrap();

    let report = pipeline
        .run_with(&instance, RunOptions::default().cancel_token(token))
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.executed().count(), 1);
    assert!(matches!(
        report.action_of(&instance),
        Some(Action::Cancelled)
    ));
}

#[test]
fn test_cascade_rebuilds_downstream_of_stale() {
    let log = Log::default();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(chain(&log), store.clone());
    let instance = pipeline.instance("load", [("lookback", 1.into())]).unwrap();

    pipeline.run(&instance).unwrap();
    assert_eq!(log.lock().unwrap().len(), 3);

    let fetch = pipeline.instance("fetch", [("lookback", 1.into())]).unwrap();

    // Presence-only: dropping the upstream output re-runs just that node.
    assert!(store.remove(&StoreKey::new(&fetch, "out")));
    let report = pipeline.run(&instance).unwrap();
    assert_eq!(report.executed().count(), 1);
    assert_eq!(count(&log, "fetch"), 2);
    assert_eq!(count(&log, "load"), 1);

    // Cascade: staleness propagates to everything downstream, even though
    // the downstream outputs are still present in the store.
    assert!(store.remove(&StoreKey::new(&fetch, "out")));
    let plan = pipeline
        .preview_with(&instance, Invalidation::Cascade)
        .unwrap();
    assert_eq!(plan.stale().count(), 3);

    let report = pipeline
        .run_with(
            &instance,
            RunOptions::default().invalidation(Invalidation::Cascade),
        )
        .unwrap();
    assert_eq!(report.executed().count(), 3);
    assert_eq!(count(&log, "transform"), 2);
    assert_eq!(count(&log, "load"), 2);
}

#[test]
fn test_cascade_under_parallel_runner() {
    let log = Log::default();
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(chain(&log), store.clone());
    let instance = pipeline.instance("load", [("lookback", 1.into())]).unwrap();

    pipeline.run(&instance).unwrap();

    let fetch = pipeline.instance("fetch", [("lookback", 1.into())]).unwrap();
    assert!(store.remove(&StoreKey::new(&fetch, "out")));

    let report = pipeline
        .run_with(
            &instance,
            RunOptions::default()
                .workers(4)
                .invalidation(Invalidation::Cascade),
        )
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.executed().count(), 3);
    assert_eq!(count(&log, "load"), 2);
}

#[test]
fn test_preview_executes_nothing() {
    let log = Log::default();
    let pipeline = Pipeline::new(chain(&log), MemoryStore::new());
    let instance = pipeline.instance("load", [("lookback", 1.into())]).unwrap();

    let plan = pipeline.preview(&instance).unwrap();
    assert_eq!(plan.len(), 3);
    assert_eq!(plan.stale().count(), 3);
    assert!(!plan.is_noop());
    assert!(log.lock().unwrap().is_empty());

    pipeline.run(&instance).unwrap();
    let plan = pipeline.preview(&instance).unwrap();
    assert!(plan.is_noop());

    let mermaid = plan.to_mermaid();
    assert!(mermaid.starts_with("graph LR"));
}

#[test]
fn test_output_handle_independent_of_run() {
    let log = Log::default();
    let pipeline = Pipeline::new(chain(&log), MemoryStore::new());
    let instance = pipeline.instance("fetch", [("lookback", 1.into())]).unwrap();

    let handle = pipeline.output(&instance, "out").unwrap();
    assert!(!handle.exists().unwrap());
    assert!(matches!(handle.load(), Err(StoreError::NotFound(_))));

    pipeline.run(&instance).unwrap();
    assert!(handle.exists().unwrap());
    assert_eq!(handle.load().unwrap().bytes(), &[1]);

    let unknown = pipeline.output(&instance, "missing");
    assert!(matches!(
        unknown,
        Err(ParameterError::UnknownOutput { .. })
    ));
}

#[test]
fn test_parallel_runner_matches_sequential_semantics() {
    let log = Log::default();
    let pipeline = Pipeline::new(diamond(&log, false), MemoryStore::new());
    let instance = pipeline.instance("root", [("lookback", 1.into())]).unwrap();

    let options = || RunOptions::default().workers(4);

    let report = pipeline.run_with(&instance, options()).unwrap();
    assert!(report.is_success());
    assert_eq!(report.executed().count(), 4);
    assert_eq!(count(&log, "base"), 1);

    let report = pipeline.run_with(&instance, options()).unwrap();
    assert_eq!(report.executed().count(), 0);
    assert_eq!(report.skipped().count(), 4);
}

#[test]
fn test_parallel_failure_isolation() {
    let log = Log::default();
    let pipeline = Pipeline::new(diamond(&log, true), MemoryStore::new());
    let instance = pipeline.instance("root", [("lookback", 1.into())]).unwrap();

    let report = pipeline
        .run_with(&instance, RunOptions::default().workers(4))
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(count(&log, "right"), 1);
    assert_eq!(count(&log, "root"), 0);
    assert!(matches!(
        report.action_of(&instance),
        Some(Action::Blocked { .. })
    ));
}

#[test]
fn test_report_serializes() {
    let log = Log::default();
    let pipeline = Pipeline::new(chain(&log), MemoryStore::new());
    let instance = pipeline.instance("load", [("lookback", 1.into())]).unwrap();

    let report = pipeline.run(&instance).unwrap();
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

    let nodes = json["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[0]["kind"], "fetch");
    assert_eq!(nodes[0]["signature"], "lookback=1");
    assert_eq!(nodes[0]["action"]["action"], "executed");
}
