//! `ParallelManager` — fans a parallel block's body out into one virtual
//! copy per iteration (`virtual_id::generate`), gates each copy's readiness
//! against both its in-body predecessors and its real predecessors outside
//! the parallel, and aggregates per-iteration results once every iteration's
//! reachable nodes have executed. Spec: `spec.md` §4.4.
//!
//! Shares the reachability-BFS shape with `loop_manager`, parameterised by
//! iteration so concurrently in-flight iterations don't clobber each other's
//! `executed_blocks` entries — each iteration's nodes live under their own
//! virtual id.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value as JsonValue;

use crate::connection;
use crate::context::{ExecutionContext, ParallelBlockMapping, ParallelExecutionState};
use crate::model::{handle, BlockId, BlockKind, Parallel, WorkflowGraph};
use crate::virtual_id;

pub struct ParallelManager;

impl ParallelManager {
    /// Resolves the fan-out count from the parallel block's own `config`
    /// (`count`, or the length of a bound `distribution`/`items` array),
    /// falling back to the `Parallel` definition's precomputed
    /// `parallel_count`, and finally to a single iteration.
    pub fn resolve_count(parallel: &Parallel, block_config: &JsonValue) -> u32 {
        if let Some(items) = &parallel.distribution {
            if let Some(arr) = items.as_array() {
                return arr.len().max(1) as u32;
            }
        }
        if let Some(n) = block_config.get("count").and_then(|v| v.as_u64()) {
            return (n as u32).max(1);
        }
        if let Some(items) = block_config.get("items").and_then(|v| v.as_array()) {
            return items.len().max(1) as u32;
        }
        parallel.parallel_count.unwrap_or(1).max(1)
    }

    /// Scans for parallels whose block just executed but have no
    /// `parallel_executions` entry yet, resolves their count from the
    /// block's own `config`, and seeds their first-iteration activation.
    /// Called once per tick from the executor's commit phase, mirroring
    /// `LoopManager::process_loop_iterations`'s "already executed" gate.
    pub fn initialize_newly_executed(graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        let ids: Vec<String> = graph.parallels.keys().cloned().collect();
        for id in ids {
            if ctx.parallel_executions.contains_key(&id) {
                continue;
            }
            if !ctx.is_executed(&id) {
                continue;
            }
            let parallel = graph.parallels.get(&id).expect("id came from graph.parallels").clone();
            let config = graph.block(&id).map(|b| b.config.clone()).unwrap_or(JsonValue::Null);
            let count = Self::resolve_count(&parallel, &config);
            Self::initialize(&parallel, count, graph, ctx);
        }
    }

    /// First-touch initialization when the parallel block executes: resolves
    /// the count, registers the per-iteration virtual-id mapping for every
    /// body node, and seeds the entry nodes of each iteration into
    /// `active_execution_path` under their virtual id.
    pub fn initialize(parallel: &Parallel, count: u32, graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        if ctx.parallel_executions.contains_key(&parallel.id) {
            return;
        }
        ctx.parallel_executions.insert(
            parallel.id.clone(),
            ParallelExecutionState {
                parallel_count: count,
                current_iteration: 0,
                execution_results: Default::default(),
                completed_iterations: HashSet::new(),
            },
        );

        let entry_points = Self::entry_points(parallel, graph);
        for node in &parallel.nodes {
            for iter in 0..count {
                let vid = virtual_id::generate(node, &parallel.id, iter);
                ctx.parallel_block_mapping.insert(
                    vid.clone(),
                    ParallelBlockMapping {
                        original_block_id: node.clone(),
                        parallel_id: parallel.id.clone(),
                        iteration_index: iter,
                    },
                );
                if entry_points.contains(node) {
                    ctx.active_execution_path.insert(vid);
                }
            }
        }
    }

    /// Nodes with no predecessor inside the parallel's own body but at least
    /// one predecessor outside it (mirrors `loop_manager`'s entry-point
    /// detection, over the same kind of induced subgraph).
    fn entry_points(parallel: &Parallel, graph: &WorkflowGraph) -> HashSet<BlockId> {
        let node_set: HashSet<&BlockId> = parallel.nodes.iter().collect();
        parallel
            .nodes
            .iter()
            .filter(|n| {
                let has_internal_incoming = graph.incoming(n).any(|c| node_set.contains(&c.source));
                let has_external_incoming = graph.incoming(n).any(|c| !node_set.contains(&c.source));
                !has_internal_incoming && has_external_incoming
            })
            .cloned()
            .collect()
    }

    /// Whether the virtual block `vid` is ready to execute: every internal
    /// (in-body) predecessor is gated the normal connection way under the
    /// *same iteration's* virtual id; every external predecessor is gated
    /// under its plain (non-virtual) id, since blocks outside the parallel
    /// run once, not once per iteration.
    pub fn is_ready(vid: &str, graph: &WorkflowGraph, ctx: &ExecutionContext) -> bool {
        let Some(parts) = virtual_id::parse(vid) else {
            return false;
        };
        let Some(parallel) = graph.parallels.get(&parts.parallel_id) else {
            return false;
        };
        let node_set: HashSet<&BlockId> = parallel.nodes.iter().collect();

        graph.incoming(&parts.original_id).all(|conn| {
            let source_effective = if node_set.contains(&conn.source) {
                virtual_id::generate(&conn.source, &parts.parallel_id, parts.iteration_index)
            } else {
                conn.source.clone()
            };
            connection::dependency_met(conn, graph, ctx, &source_effective)
        })
    }

    /// After a layer settles: checks every non-completed parallel whose block
    /// has executed, aggregates any newly-finished iteration, and — once
    /// every iteration is in, completes the parallel and activates its
    /// `parallel-end-source` edges.
    pub fn process_parallel_completions(graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        let parallel_ids: Vec<String> = graph.parallels.keys().cloned().collect();
        for parallel_id in parallel_ids {
            if ctx.completed_loops.contains(&parallel_id) {
                continue;
            }
            if !ctx.is_executed(&parallel_id) {
                continue;
            }
            let parallel = graph.parallels.get(&parallel_id).expect("parallel id came from graph.parallels").clone();
            let Some(state) = ctx.parallel_executions.get(&parallel_id) else {
                continue;
            };
            let count = state.parallel_count;
            let already_done = state.completed_iterations.clone();

            for iter in 0..count {
                if already_done.contains(&iter) {
                    continue;
                }
                if Self::iteration_reachable_nodes_executed(&parallel, iter, graph, ctx) {
                    let output = Self::collect_iteration_output(&parallel, iter, graph, ctx);
                    Self::store_iteration_output(ctx, &parallel_id, iter, output);
                    ctx.parallel_executions
                        .get_mut(&parallel_id)
                        .expect("just checked above")
                        .completed_iterations
                        .insert(iter);
                }
            }

            let done = ctx.parallel_executions[&parallel_id].completed_iterations.len() as u32;
            if done >= count {
                Self::complete(&parallel, graph, ctx);
            }
        }
    }

    fn iteration_reachable_nodes_executed(parallel: &Parallel, iter: u32, graph: &WorkflowGraph, ctx: &ExecutionContext) -> bool {
        if parallel.nodes.is_empty() {
            return true;
        }
        let node_set: HashSet<&BlockId> = parallel.nodes.iter().collect();
        let mut dg: DiGraph<BlockId, ()> = DiGraph::new();
        let mut idx_of: HashMap<BlockId, NodeIndex> = HashMap::new();
        for n in &parallel.nodes {
            idx_of.insert(n.clone(), dg.add_node(n.clone()));
        }
        for conn in &graph.connections {
            if node_set.contains(&conn.source) && node_set.contains(&conn.target) {
                dg.add_edge(idx_of[&conn.source], idx_of[&conn.target], ());
            }
        }

        let entries = Self::entry_points(parallel, graph);
        let mut reached: HashSet<BlockId> = HashSet::new();
        let mut queue: VecDeque<BlockId> = entries.into_iter().collect();

        while let Some(node) = queue.pop_front() {
            if !reached.insert(node.clone()) {
                continue;
            }
            let vid = virtual_id::generate(&node, &parallel.id, iter);
            if !ctx.is_executed(&vid) {
                continue;
            }
            let has_error = ctx.state(&vid).map(|s| s.output.is_err()).unwrap_or(false);
            let is_router = graph.block(&node).map(|b| b.kind == BlockKind::Router).unwrap_or(false);

            for conn in graph.outgoing(&node) {
                if !node_set.contains(&conn.target) {
                    continue;
                }
                let follow = if conn.handle() == handle::ERROR {
                    has_error
                } else if let Some(selected) = conn.condition_id() {
                    ctx.decisions.condition.get(&vid).map(|c| c == selected).unwrap_or(false)
                } else if has_error {
                    false
                } else if is_router {
                    ctx.decisions.router.get(&vid).map(|t| t == &conn.target).unwrap_or(false)
                } else {
                    true
                };
                if follow {
                    queue.push_back(conn.target.clone());
                }
            }
        }

        reached.iter().all(|n| ctx.is_executed(&virtual_id::generate(n, &parallel.id, iter)))
    }

    /// Leaf nodes of the body (no internal outgoing edge) contribute their
    /// output to the iteration's aggregate; a single leaf's output is used
    /// verbatim, multiple leaves are merged into a `{blockId: output}` map.
    fn collect_iteration_output(parallel: &Parallel, iter: u32, graph: &WorkflowGraph, ctx: &ExecutionContext) -> JsonValue {
        let node_set: HashSet<&BlockId> = parallel.nodes.iter().collect();
        let leaves: Vec<&BlockId> = parallel
            .nodes
            .iter()
            .filter(|n| !graph.outgoing(n).any(|c| node_set.contains(&c.target)))
            .collect();

        let outputs: Vec<(BlockId, JsonValue)> = leaves
            .into_iter()
            .map(|n| {
                let vid = virtual_id::generate(n, &parallel.id, iter);
                let value = ctx.state(&vid).map(|s| s.output.as_json()).unwrap_or(JsonValue::Null);
                (n.clone(), value)
            })
            .collect();

        match outputs.len() {
            0 => JsonValue::Null,
            1 => outputs.into_iter().next().unwrap().1,
            _ => JsonValue::Object(outputs.into_iter().map(|(k, v)| (k, v)).collect()),
        }
    }

    pub fn store_iteration_output(ctx: &mut ExecutionContext, parallel_id: &str, iteration: u32, value: JsonValue) {
        if let Some(state) = ctx.parallel_executions.get_mut(parallel_id) {
            state.execution_results.insert(iteration, value);
            state.current_iteration = state.current_iteration.max(iteration + 1);
        }
    }

    fn complete(parallel: &Parallel, graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        let results: Vec<JsonValue> = ctx
            .parallel_executions
            .get(&parallel.id)
            .map(|s| s.execution_results.values().cloned().collect())
            .unwrap_or_default();

        let output = serde_json::json!({
            "parallelId": parallel.id,
            "count": ctx.parallel_executions.get(&parallel.id).map(|s| s.parallel_count).unwrap_or(0),
            "completed": true,
            "results": results,
        });

        ctx.block_states.insert(
            parallel.id.clone(),
            crate::model::BlockState {
                output: crate::model::BlockOutput::Ok(output),
                executed: true,
                execution_time_ms: 0,
            },
        );
        ctx.completed_loops.insert(parallel.id.clone());

        for conn in graph.outgoing(&parallel.id) {
            if conn.handle() == handle::PARALLEL_END {
                ctx.active_execution_path.insert(conn.target.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockOutput, BlockState, Connection};

    fn make_graph() -> WorkflowGraph {
        WorkflowGraph {
            blocks: vec![
                Block { id: "P".into(), kind: BlockKind::Parallel, enabled: true, config: serde_json::json!({"count": 2}), metadata: Default::default() },
                Block { id: "Body".into(), kind: BlockKind::Function, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
                Block { id: "After".into(), kind: BlockKind::Function, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
            ],
            connections: vec![
                Connection { source: "P".into(), target: "Body".into(), source_handle: Some(handle::PARALLEL_START.into()) },
                Connection { source: "P".into(), target: "After".into(), source_handle: Some(handle::PARALLEL_END.into()) },
            ],
            loops: Default::default(),
            parallels: [(
                "P".to_string(),
                Parallel { id: "P".into(), nodes: vec!["Body".into()], parallel_count: None, distribution: None },
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn fans_out_and_completes_after_every_iteration() {
        let graph = make_graph();
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        let parallel = graph.parallels.get("P").unwrap();
        let count = ParallelManager::resolve_count(parallel, &serde_json::json!({"count": 2}));
        assert_eq!(count, 2);

        ctx.mark_executed("P".into(), BlockState { output: BlockOutput::Ok(serde_json::json!({})), executed: true, execution_time_ms: 0 });
        ParallelManager::initialize(parallel, count, &graph, &mut ctx);

        assert!(ctx.active_execution_path.contains(&virtual_id::generate("Body", "P", 0)));
        assert!(ctx.active_execution_path.contains(&virtual_id::generate("Body", "P", 1)));

        for iter in 0..2 {
            let vid = virtual_id::generate("Body", "P", iter);
            assert!(ParallelManager::is_ready(&vid, &graph, &ctx));
            ctx.mark_executed(vid, BlockState { output: BlockOutput::Ok(serde_json::json!({"n": iter})), executed: true, execution_time_ms: 0 });
        }

        ParallelManager::process_parallel_completions(&graph, &mut ctx);
        assert!(ctx.completed_loops.contains("P"));
        assert!(ctx.active_execution_path.contains("After"));
    }
}
