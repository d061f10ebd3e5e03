mod parallel;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::ArcStr;
use crate::error::{RunError, StoreError, TaskFailure};
use crate::graph::{Node, TaskGraph};
use crate::param::Signature;
use crate::report::{Action, NodeReport, Report};
use crate::store::{Store, StoreKey};
use crate::task::{DepHandle, Outputs, TaskContext};

/// The staleness policy of a run request.
///
/// `Presence` is the engine's contract: a node is stale exactly when one of
/// its declared outputs is missing from the store, regardless of what
/// upstream data looks like. `Cascade` is the opt-in strict mode: staleness
/// additionally propagates forward through direct dependencies within the
/// run request, so nothing is rebuilt on top of an output that is itself
/// being rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Invalidation {
    #[default]
    Presence,
    Cascade,
}

/// Cooperative cancellation for a run request.
///
/// Cancelling never preempts an in-flight run contract; it only prevents
/// further nodes from starting. Stale nodes that never started are reported
/// as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Options of a single run request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker threads; `1` means plain sequential topological execution.
    pub workers: usize,
    pub invalidation: Invalidation,
    pub cancel: CancelToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            invalidation: Invalidation::default(),
            cancel: CancelToken::new(),
        }
    }
}

impl RunOptions {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn invalidation(mut self, invalidation: Invalidation) -> Self {
        self.invalidation = invalidation;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// At-most-one in-flight execution per (kind, signature).
///
/// Concurrent run requests on the same pipeline may reach the same instance;
/// later arrivals wait here, then re-check completion instead of duplicating
/// the work.
pub(crate) struct GateTable {
    held: Mutex<HashSet<(ArcStr, Signature)>>,
    released: Condvar,
}

impl GateTable {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self, key: (ArcStr, Signature)) -> Gate<'_> {
        let mut held = self.held.lock().unwrap();
        while held.contains(&key) {
            held = self.released.wait(held).unwrap();
        }
        held.insert(key.clone());
        Gate { table: self, key }
    }
}

pub(crate) struct Gate<'a> {
    table: &'a GateTable,
    key: (ArcStr, Signature),
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.table.held.lock().unwrap().remove(&self.key);
        self.table.released.notify_all();
    }
}

/// Why a node is scheduled for execution, or not.
///
/// The distinction between `Missing` and `Propagated` matters at execution
/// time: `Missing` is settled by outputs appearing in the store (a
/// concurrent run request may finish the instance first), `Propagated` is
/// not, its outputs are present and must be rebuilt anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Staleness {
    /// All declared outputs are persisted; nothing to do.
    Fresh,
    /// At least one declared output is missing from the store.
    Missing,
    /// Complete, but a direct dependency is stale and the run request asked
    /// for [`Invalidation::Cascade`].
    Propagated,
}

impl Staleness {
    pub(crate) fn is_stale(self) -> bool {
        self != Staleness::Fresh
    }
}

/// Computes the stale set for a graph: per node, whether a run would execute
/// it and why. Walks the stable topological order so cascade propagation
/// only ever looks at already-decided dependencies.
pub(crate) fn plan_stale<G: Send + Sync>(
    graph: &TaskGraph<G>,
    store: &dyn Store,
    invalidation: Invalidation,
) -> Result<Vec<Staleness>, StoreError> {
    let mut stale = vec![Staleness::Fresh; graph.graph.node_count()];

    for &index in &graph.order {
        let node = &graph.graph[index];
        let upstream = invalidation == Invalidation::Cascade
            && node.deps.iter().any(|&(_, dep)| stale[dep.index()].is_stale());

        stale[index.index()] = if !is_complete(store, node)? {
            Staleness::Missing
        } else if upstream {
            Staleness::Propagated
        } else {
            Staleness::Fresh
        };
    }

    Ok(stale)
}

/// Runs the stale subset of a graph and assembles the report.
pub(crate) fn execute<G: Send + Sync>(
    graph: &TaskGraph<G>,
    store: &dyn Store,
    data: &G,
    gates: &GateTable,
    options: &RunOptions,
) -> Result<Report, RunError> {
    let started = Instant::now();

    let stale = plan_stale(graph, store, options.invalidation).map_err(RunError::Store)?;
    let total = stale.iter().filter(|stale| stale.is_stale()).count() as u64;

    let progress = tracing::span!(Level::INFO, "running_tasks");
    if total > 0 {
        progress.pb_set_length(total);
        progress.pb_set_style(&crate::utils::style_progress());
        progress.pb_set_message("Running tasks...");
    }
    let entered = progress.enter();

    let mut actions = if options.workers > 1 {
        parallel::run(graph, store, data, gates, &stale, options, &progress)?
    } else {
        run_sequential(graph, store, data, gates, &stale, options, &progress)
    };

    drop(entered);

    let mut nodes = Vec::with_capacity(graph.order.len());
    for &index in &graph.order {
        let node = &graph.graph[index];
        let action = actions[index.index()].take().unwrap();
        nodes.push(NodeReport::new(&node.instance, action));
    }

    Ok(Report::new(nodes, started.elapsed()))
}

fn run_sequential<G: Send + Sync>(
    graph: &TaskGraph<G>,
    store: &dyn Store,
    data: &G,
    gates: &GateTable,
    stale: &[Staleness],
    options: &RunOptions,
    progress: &tracing::Span,
) -> Vec<Option<Action>> {
    let mut actions: Vec<Option<Action>> =
        (0..graph.graph.node_count()).map(|_| None).collect();

    for &index in &graph.order {
        let action = if !stale[index.index()].is_stale() {
            Action::Skipped
        } else if options.cancel.is_cancelled() {
            progress.pb_inc(1);
            Action::Cancelled
        } else {
            let broken = broken_deps(graph, &actions, index);
            progress.pb_inc(1);
            if broken.is_empty() {
                execute_node(graph, index, store, data, gates, stale[index.index()])
            } else {
                let node = &graph.graph[index];
                tracing::warn!(task = %node.instance, "not run, upstream failed");
                Action::Blocked { on: broken }
            }
        };

        actions[index.index()] = Some(action);
    }

    actions
}

/// Display names of the direct dependencies that failed, were blocked, or
/// were cancelled.
fn broken_deps<G: Send + Sync>(
    graph: &TaskGraph<G>,
    actions: &[Option<Action>],
    index: NodeIndex,
) -> Vec<String> {
    graph.graph[index]
        .deps
        .iter()
        .filter(|&&(_, dep)| {
            matches!(
                actions[dep.index()],
                Some(Action::Failed { .. } | Action::Blocked { .. } | Action::Cancelled)
            )
        })
        .map(|&(_, dep)| graph.graph[dep].instance.to_string())
        .collect()
}

fn is_complete<G: Send + Sync>(store: &dyn Store, node: &Node<G>) -> Result<bool, StoreError> {
    for output in &node.kind.outputs {
        if !store.exists(&StoreKey::new(&node.instance, output))? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Executes one node whose dependencies are all settled and complete.
///
/// Failures never escape: run-contract errors, panics, contract/output
/// mismatches and store errors all come back as [`Action::Failed`].
fn execute_node<G: Send + Sync>(
    graph: &TaskGraph<G>,
    index: NodeIndex,
    store: &dyn Store,
    data: &G,
    gates: &GateTable,
    staleness: Staleness,
) -> Action {
    let node = &graph.graph[index];
    let _gate = gates.acquire(node.instance.gate_key());

    // A concurrent run request may have finished this instance while we
    // waited on the gate. Only output-driven staleness is settled by the
    // outputs being present; a propagated node executes regardless.
    if staleness == Staleness::Missing {
        match is_complete(store, node) {
            Ok(true) => return Action::Skipped,
            Ok(false) => {}
            Err(err) => {
                return Action::Failed {
                    failure: TaskFailure::Store(err),
                };
            }
        }
    }

    let mut deps = HashMap::new();
    for &(ref alias, dep_index) in &node.deps {
        let dep = &graph.graph[dep_index];
        deps.insert(
            alias.clone(),
            DepHandle {
                instance: dep.instance.clone(),
                outputs: dep.kind.outputs.clone(),
            },
        );
    }

    let span = tracing::span!(Level::INFO, "task", name = %node.instance.kind());
    span.pb_set_style(&crate::utils::style_task());
    span.pb_set_message(&format!("Running {}", node.instance));
    let _enter = span.enter();

    let started = Instant::now();

    // AssertUnwindSafe: a panicking contract only ever touched its own
    // context; the graph and the store stay consistent.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let context = TaskContext::new(node.instance.params(), data, store, &deps);
        (node.kind.run)(&context)
    }));
    let duration = started.elapsed();

    let outputs = match result {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(err)) => {
            tracing::warn!(task = %node.instance, error = %err, "task failed");
            return Action::Failed {
                failure: TaskFailure::Error(err),
            };
        }
        Err(panic) => {
            let message = panic_message(panic);
            tracing::warn!(task = %node.instance, panic = %message, "task panicked");
            return Action::Failed {
                failure: TaskFailure::Panic(message),
            };
        }
    };

    match persist(store, node, outputs) {
        Ok(()) => {
            tracing::debug!(task = %node.instance, ?duration, "task complete");
            Action::Executed { duration }
        }
        Err(failure) => Action::Failed { failure },
    }
}

/// Checks the produced outputs against the declared set, then persists them.
/// Nothing is saved unless the declared set matches exactly.
fn persist<G: Send + Sync>(
    store: &dyn Store,
    node: &Node<G>,
    mut outputs: Outputs,
) -> Result<(), TaskFailure> {
    let mut produced = Vec::with_capacity(node.kind.outputs.len());
    for name in &node.kind.outputs {
        match outputs.map.remove(name) {
            Some(artifact) => produced.push((name.clone(), artifact)),
            None => return Err(TaskFailure::MissingOutput(name.to_string())),
        }
    }
    if let Some((name, _)) = outputs.map.into_iter().next() {
        return Err(TaskFailure::UnexpectedOutput(name.to_string()));
    }

    for (name, artifact) in produced {
        store.save(&StoreKey::new(&node.instance, &name), &artifact)?;
    }

    Ok(())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        String::from("unknown payload")
    }
}
