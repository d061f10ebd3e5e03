use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::{Graph, NodeIndex};

use crate::core::ArcStr;
use crate::error::{CycleError, ParameterError, PlanError};
use crate::param;
use crate::task::{Derive, Registry, TaskInstance, TaskKind};

/// One resolved task instance in an expanded graph.
pub(crate) struct Node<G: Send + Sync> {
    pub(crate) instance: TaskInstance,
    pub(crate) kind: Arc<TaskKind<G>>,
    /// Direct dependencies in declaration order, by alias.
    pub(crate) deps: Vec<(ArcStr, NodeIndex)>,
}

/// The dependency DAG of one run request.
///
/// Edges point from a dependency to its dependent. `order` is the stable
/// topological order the scheduler consumes: dependencies always precede
/// dependents, ties broken by the declaration order of dependency specs.
pub(crate) struct TaskGraph<G: Send + Sync> {
    pub(crate) graph: Graph<Node<G>, ()>,
    pub(crate) order: Vec<NodeIndex>,
}

/// Expands a requested instance into its dependency graph.
///
/// Dependency parameters are derived from the parent's at build time, the
/// derived instances are validated against their kind's specs, and nodes are
/// deduplicated by (kind, signature) so diamonds collapse into one node.
/// A kind that transitively requires an instance equal to one already on the
/// expansion path fails with a [`CycleError`] before anything executes.
pub(crate) fn expand<G: Send + Sync + 'static>(
    registry: &Registry<G>,
    root: &TaskInstance,
) -> Result<TaskGraph<G>, PlanError> {
    let mut expander = Expander {
        registry,
        graph: Graph::new(),
        order: Vec::new(),
        resolved: HashMap::new(),
        path: Vec::new(),
    };

    expander.visit(root.clone())?;

    Ok(TaskGraph {
        graph: expander.graph,
        order: expander.order,
    })
}

struct Expander<'a, G: Send + Sync> {
    registry: &'a Registry<G>,
    graph: Graph<Node<G>, ()>,
    order: Vec<NodeIndex>,
    resolved: HashMap<TaskInstance, NodeIndex>,
    path: Vec<TaskInstance>,
}

impl<G: Send + Sync + 'static> Expander<'_, G> {
    fn visit(&mut self, instance: TaskInstance) -> Result<NodeIndex, PlanError> {
        if let Some(&index) = self.resolved.get(&instance) {
            return Ok(index);
        }

        if let Some(start) = self.path.iter().position(|seen| *seen == instance) {
            let mut path: Vec<String> = self.path[start..]
                .iter()
                .map(TaskInstance::to_string)
                .collect();
            path.push(instance.to_string());
            return Err(CycleError { path }.into());
        }

        let Some(kind) = self.registry.kind(instance.kind()).cloned() else {
            return Err(ParameterError::UnknownKind(instance.kind().to_string()).into());
        };

        self.path.push(instance.clone());

        let mut deps = Vec::with_capacity(kind.deps.len());
        for spec in &kind.deps {
            let dependency = self.derive(&instance, &spec.kind, &spec.alias, &spec.derive)?;
            let index = self.visit(dependency)?;
            deps.push((spec.alias.clone(), index));
        }

        self.path.pop();

        let dep_indices: Vec<NodeIndex> = deps.iter().map(|&(_, index)| index).collect();
        let index = self.graph.add_node(Node {
            instance: instance.clone(),
            kind,
            deps,
        });
        for dep in dep_indices {
            self.graph.add_edge(dep, index, ());
        }

        self.order.push(index);
        self.resolved.insert(instance, index);

        Ok(index)
    }

    fn derive(
        &self,
        parent: &TaskInstance,
        kind: &str,
        alias: &str,
        rule: &Derive,
    ) -> Result<TaskInstance, PlanError> {
        let Some(child) = self.registry.kind(kind) else {
            return Err(ParameterError::UnknownKind(kind.to_string()).into());
        };

        let derive_error = |cause: anyhow::Error| PlanError::Derive {
            kind: parent.kind().to_string(),
            alias: alias.to_string(),
            cause,
        };

        let raw = rule
            .apply(parent.params(), &child.params)
            .map_err(derive_error)?;
        let params =
            param::validate(&child.params, raw).map_err(|err| derive_error(err.into()))?;

        Ok(TaskInstance::new(child.name.clone(), params))
    }
}
