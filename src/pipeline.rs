use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::core::ArcStr;
use crate::engine::{self, GateTable, Invalidation, RunOptions};
use crate::error::{ParameterError, RunError};
use crate::graph;
use crate::param::ParamValue;
use crate::report::{Plan, PlanNode, Report};
use crate::store::{Artifact, Store, StoreKey};
use crate::task::{Registry, TaskInstance};

/// A registry bound to a completion store: the run entry point.
///
/// The store is injected here, never ambient process state; everything a run
/// touches flows through this object. `G` is user data handed to every run
/// contract, the place to put data-source clients or configuration.
///
/// # Example
///
/// ```rust
/// use karakuri::{Artifact, MemoryStore, Outputs, ParamKind, Pipeline, Registry};
///
/// let mut registry: Registry<()> = Registry::new();
/// registry
///     .task("prices")
///     .param("symbol", ParamKind::Str)
///     .output("series")
///     .run(|ctx| {
///         let symbol = ctx.params.str("symbol")?.to_string();
///         Ok(Outputs::one("series", Artifact::encode(&vec![symbol])?))
///     })?;
///
/// let pipeline = Pipeline::new(registry, MemoryStore::new());
/// let instance = pipeline.instance("prices", [("symbol", "SPY".into())])?;
///
/// let report = pipeline.run(&instance)?;
/// assert_eq!(report.executed().count(), 1);
///
/// // Same parameters: already persisted, nothing runs.
/// let report = pipeline.run(&instance)?;
/// assert_eq!(report.executed().count(), 0);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Pipeline<G: Send + Sync = ()> {
    registry: Registry<G>,
    store: Arc<dyn Store>,
    data: G,
    gates: GateTable,
}

impl Pipeline<()> {
    pub fn new(registry: Registry<()>, store: impl Store + 'static) -> Self {
        Self::with_data(registry, store, ())
    }
}

impl<G: Send + Sync + 'static> Pipeline<G> {
    /// Builds a pipeline whose run contracts receive `data` as `ctx.data`.
    pub fn with_data(registry: Registry<G>, store: impl Store + 'static, data: G) -> Self {
        Self {
            registry,
            store: Arc::new(store),
            data,
            gates: GateTable::new(),
        }
    }

    pub fn registry(&self) -> &Registry<G> {
        &self.registry
    }

    /// Binds concrete parameter values to a registered kind; see
    /// [`Registry::instance`].
    pub fn instance<N, I>(&self, kind: &str, params: I) -> Result<TaskInstance, ParameterError>
    where
        N: Into<ArcStr>,
        I: IntoIterator<Item = (N, ParamValue)>,
    {
        self.registry.instance(kind, params)
    }

    /// Runs a task instance with default options: sequential, presence-only
    /// staleness.
    pub fn run(&self, root: &TaskInstance) -> Result<Report, RunError> {
        self.run_with(root, RunOptions::default())
    }

    /// Expands the dependency graph of `root`, executes the stale subset in
    /// topological order and returns the per-node report.
    ///
    /// Construction- and plan-time problems (unknown kinds, derivation
    /// failures, cycles) and store infrastructure failures surface as
    /// [`RunError`] before or during scheduling; run-contract failures never
    /// do, they are captured per node in the [`Report`].
    pub fn run_with(&self, root: &TaskInstance, options: RunOptions) -> Result<Report, RunError> {
        let graph = graph::expand(&self.registry, root)?;
        tracing::debug!(root = %root, nodes = graph.order.len(), "expanded task graph");

        let report = engine::execute(&graph, &self.store, &self.data, &self.gates, &options)?;

        tracing::info!(
            root = %root,
            executed = report.executed().count(),
            skipped = report.skipped().count(),
            failed = report.failures().count(),
            "run finished"
        );
        Ok(report)
    }

    /// Dry run: expands the graph and computes staleness, executing nothing.
    pub fn preview(&self, root: &TaskInstance) -> Result<Plan, RunError> {
        self.preview_with(root, Invalidation::default())
    }

    pub fn preview_with(
        &self,
        root: &TaskInstance,
        invalidation: Invalidation,
    ) -> Result<Plan, RunError> {
        let graph = graph::expand(&self.registry, root)?;
        let stale = engine::plan_stale(&graph, &self.store, invalidation)?;

        let positions: HashMap<NodeIndex, usize> = graph
            .order
            .iter()
            .enumerate()
            .map(|(position, &index)| (index, position))
            .collect();

        let nodes = graph
            .order
            .iter()
            .map(|&index| {
                let node = &graph.graph[index];
                PlanNode {
                    kind: node.instance.kind().to_string(),
                    signature: node.instance.signature().text().to_string(),
                    short: node.instance.signature().short(),
                    stale: stale[index.index()].is_stale(),
                }
            })
            .collect();

        let edges = graph
            .graph
            .raw_edges()
            .iter()
            .map(|edge| (positions[&edge.source()], positions[&edge.target()]))
            .collect();

        Ok(Plan::new(nodes, edges))
    }

    /// A handle on one persisted output of an instance, usable independently
    /// of `run` — for example to inspect the results of an earlier session.
    ///
    /// Fails if the instance's kind is not registered here or declares no
    /// such output; whether the output currently exists is the handle's
    /// business.
    pub fn output(
        &self,
        instance: &TaskInstance,
        output: &str,
    ) -> Result<OutputHandle, ParameterError> {
        let Some(kind) = self.registry.kind(instance.kind()) else {
            return Err(ParameterError::UnknownKind(instance.kind().to_string()));
        };
        if !kind.outputs.iter().any(|name| name.as_ref() == output) {
            return Err(ParameterError::UnknownOutput {
                kind: instance.kind().to_string(),
                output: output.to_string(),
            });
        }

        Ok(OutputHandle {
            key: StoreKey::new(instance, output),
            store: self.store.clone(),
        })
    }
}

/// A lazy handle on one (instance, output) pair in the completion store.
#[derive(Clone)]
pub struct OutputHandle {
    key: StoreKey,
    store: Arc<dyn Store>,
}

impl OutputHandle {
    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn exists(&self) -> Result<bool, crate::error::StoreError> {
        self.store.exists(&self.key)
    }

    pub fn load(&self) -> Result<Artifact, crate::error::StoreError> {
        self.store.load(&self.key)
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::error::StoreError> {
        self.load()?.decode()
    }
}

impl std::fmt::Debug for OutputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutputHandle({})", self.key)
    }
}
