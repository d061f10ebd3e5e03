use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::channel;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::{GateTable, RunOptions, Staleness, broken_deps, execute_node};
use crate::error::RunError;
use crate::graph::TaskGraph;
use crate::report::Action;
use crate::store::Store;

/// Frontier scheduler over a dedicated worker pool.
///
/// Nodes whose dependencies are all settled run in parallel; results come
/// back over a channel to the coordinating loop, which settles the node and
/// unlocks its dependents. Skipped, blocked and cancelled nodes settle
/// inline without occupying a worker. Semantics are identical to the
/// sequential runner; only the interleaving differs.
pub(crate) fn run<G: Send + Sync>(
    graph: &TaskGraph<G>,
    store: &dyn Store,
    data: &G,
    gates: &GateTable,
    stale: &[Staleness],
    options: &RunOptions,
    progress: &tracing::Span,
) -> Result<Vec<Option<Action>>, RunError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers)
        .build()?;

    let total = graph.graph.node_count();
    let mut actions: Vec<Option<Action>> = (0..total).map(|_| None).collect();

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .order
        .iter()
        .map(|&index| {
            (
                index,
                graph
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let cancel = &options.cancel;

    pool.scope(|scope| {
        let (sender, receiver) = channel::<(NodeIndex, Action)>();

        let mut ready: VecDeque<NodeIndex> = graph
            .order
            .iter()
            .copied()
            .filter(|index| dependency_counts[index] == 0)
            .collect();
        let mut settled = 0;

        while settled < total {
            // Settle everything decidable without a worker, spawn the rest.
            while let Some(index) = ready.pop_front() {
                let immediate = if !stale[index.index()].is_stale() {
                    Some(Action::Skipped)
                } else if cancel.is_cancelled() {
                    progress.pb_inc(1);
                    Some(Action::Cancelled)
                } else {
                    let broken = broken_deps(graph, &actions, index);
                    if broken.is_empty() {
                        None
                    } else {
                        progress.pb_inc(1);
                        tracing::warn!(
                            task = %graph.graph[index].instance,
                            "not run, upstream failed"
                        );
                        Some(Action::Blocked { on: broken })
                    }
                };

                match immediate {
                    Some(action) => {
                        actions[index.index()] = Some(action);
                        settled += 1;
                        unlock(&dependents, &mut dependency_counts, &mut ready, index);
                    }
                    None => {
                        let sender = sender.clone();
                        let staleness = stale[index.index()];
                        scope.spawn(move |_| {
                            let action = execute_node(graph, index, store, data, gates, staleness);
                            sender.send((index, action)).unwrap();
                        });
                    }
                }
            }

            if settled == total {
                break;
            }

            // All remaining work is in flight; wait for one result.
            let (index, action) = receiver.recv().unwrap();
            progress.pb_inc(1);
            actions[index.index()] = Some(action);
            settled += 1;
            unlock(&dependents, &mut dependency_counts, &mut ready, index);
        }
    });

    Ok(actions)
}

fn unlock(
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    dependency_counts: &mut HashMap<NodeIndex, usize>,
    ready: &mut VecDeque<NodeIndex>,
    settled: NodeIndex,
) {
    let Some(dependents) = dependents.get(&settled) else {
        return;
    };
    for &dependent in dependents {
        let count = dependency_counts.get_mut(&dependent).unwrap();
        *count -= 1;
        if *count == 0 {
            ready.push_back(dependent);
        }
    }
}
