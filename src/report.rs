use std::fmt;
use std::time::Duration;

use console::style;
use indicatif::HumanDuration;
use serde::{Serialize, Serializer};

use crate::error::TaskFailure;
use crate::task::TaskInstance;

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn failure_text<S: Serializer>(failure: &TaskFailure, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(failure)
}

/// What happened to one node during a run request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    /// All declared outputs were already persisted.
    Skipped,
    /// The run contract executed and every output was persisted.
    Executed {
        #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
        duration: Duration,
    },
    /// The run contract failed; dependents were not run.
    Failed {
        #[serde(serialize_with = "failure_text")]
        failure: TaskFailure,
    },
    /// Not run because an upstream dependency failed in this run.
    Blocked { on: Vec<String> },
    /// Stale but never started because the run was cancelled.
    Cancelled,
}

/// The outcome of one task instance within a [`Report`].
#[derive(Debug, Serialize)]
pub struct NodeReport {
    /// Task kind name.
    pub kind: String,
    /// Full canonical parameter signature.
    pub signature: String,
    /// Short signature hash, as used by file-backed stores.
    pub short: String,
    pub action: Action,
}

impl NodeReport {
    pub(crate) fn new(instance: &TaskInstance, action: Action) -> Self {
        Self {
            kind: instance.kind().to_string(),
            signature: instance.signature().text().to_string(),
            short: instance.signature().short(),
            action,
        }
    }

    pub fn matches(&self, instance: &TaskInstance) -> bool {
        self.kind == instance.kind() && self.signature == instance.signature().text()
    }
}

/// The structured record of one run request, in stable topological order.
///
/// Queryable for assertions, serializable for machine consumers, and
/// printable for humans.
#[derive(Debug, Serialize)]
pub struct Report {
    nodes: Vec<NodeReport>,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    elapsed: Duration,
}

impl Report {
    pub(crate) fn new(nodes: Vec<NodeReport>, elapsed: Duration) -> Self {
        Self { nodes, elapsed }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn executed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|node| matches!(node.action, Action::Executed { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|node| matches!(node.action, Action::Skipped))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&NodeReport, &TaskFailure)> {
        self.nodes.iter().filter_map(|node| match &node.action {
            Action::Failed { failure } => Some((node, failure)),
            _ => None,
        })
    }

    pub fn blocked(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes
            .iter()
            .filter(|node| matches!(node.action, Action::Blocked { .. }))
    }

    /// True when every node was either skipped or executed successfully.
    pub fn is_success(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| matches!(node.action, Action::Skipped | Action::Executed { .. }))
    }

    pub fn action_of(&self, instance: &TaskInstance) -> Option<&Action> {
        self.nodes
            .iter()
            .find(|node| node.matches(instance))
            .map(|node| &node.action)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut executed = 0;
        let mut skipped = 0;
        let mut failed = 0;

        for node in &self.nodes {
            let target = format!("{}({})", node.kind, node.signature);
            match &node.action {
                Action::Skipped => {
                    skipped += 1;
                    writeln!(f, "{} {target}", style("skip").blue())?;
                }
                Action::Executed { duration } => {
                    executed += 1;
                    writeln!(f, "{} {target}  {duration:.2?}", style("done").green())?;
                }
                Action::Failed { failure } => {
                    failed += 1;
                    writeln!(f, "{} {target}\n     {failure}", style("FAIL").red())?;
                }
                Action::Blocked { on } => {
                    failed += 1;
                    writeln!(
                        f,
                        "{} {target}  blocked on {}",
                        style("hold").yellow(),
                        on.join(", ")
                    )?;
                }
                Action::Cancelled => {
                    writeln!(f, "{} {target}", style("stop").yellow())?;
                }
            }
        }

        writeln!(
            f,
            "{executed} executed, {skipped} skipped, {failed} failed in {}",
            HumanDuration(self.elapsed)
        )
    }
}

/// One planned node of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlanNode {
    pub kind: String,
    pub signature: String,
    pub short: String,
    /// Whether a run issued now would execute this node.
    pub stale: bool,
}

/// The result of a dry run: the expanded DAG plus per-node staleness, in the
/// same stable topological order a run would use. Nothing has executed.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    nodes: Vec<PlanNode>,
    /// Edges as (dependency, dependent) positions into `nodes`.
    edges: Vec<(usize, usize)>,
}

impl Plan {
    pub(crate) fn new(nodes: Vec<PlanNode>, edges: Vec<(usize, usize)>) -> Self {
        Self { nodes, edges }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stale(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter().filter(|node| node.stale)
    }

    /// True when a run issued now would execute nothing.
    pub fn is_noop(&self) -> bool {
        self.nodes.iter().all(|node| !node.stale)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the planned DAG as a Mermaid diagram; stale nodes are marked
    /// red, cached nodes light blue.
    pub fn to_mermaid(&self) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for (i, node) in self.nodes.iter().enumerate() {
            let label = if node.signature.is_empty() {
                node.kind.clone()
            } else {
                format!("{}\\n{}", node.kind, node.short)
            };
            writeln!(f, "    {i}[\"{label}\"]").unwrap();
            let fill = if node.stale { "#F08080" } else { "#ADD8E6" };
            writeln!(f, "    style {i} fill:{fill}").unwrap();
        }

        for &(source, target) in &self.edges {
            writeln!(f, "    {source} --> {target}").unwrap();
        }

        f
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            let mark = if node.stale {
                style("run ").red()
            } else {
                style("keep").blue()
            };
            writeln!(f, "{mark} {}({})", node.kind, node.signature)?;
        }
        writeln!(
            f,
            "{} of {} to execute",
            self.stale().count(),
            self.nodes.len()
        )
    }
}
