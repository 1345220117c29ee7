//! `LoopManager` — detects when all reachable blocks in a loop have
//! executed, advances iterations, resets loop bodies, and emits the
//! aggregate output. Spec: `spec.md` §4.3.
//!
//! The reachability-aware completion check builds a `petgraph::DiGraph`
//! over the loop's node set, exactly the teacher's idiom in
//! `compiler/verifier.rs` (`petgraph::visit::Dfs` plus
//! `edges_directed(idx, Direction::Outgoing)`), generalized to a queue-based
//! BFS that honors router/condition decisions instead of a plain
//! reachability walk.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value as JsonValue;

use crate::context::ExecutionContext;
use crate::error::{Result, ValidationError, WorkflowError};
use crate::model::{handle, BlockId, Connection, Loop, LoopType, WorkflowGraph};

pub struct LoopManager;

impl LoopManager {
    /// Scans for loops whose block just executed but have no
    /// `loop_iterations` entry yet, and seeds iteration 1 (with, for
    /// `forEach`, the first frozen item) before the body ever runs.
    /// Without this, a loop's very first body execution would run with no
    /// current item and no iteration counter, pushing every subsequent item
    /// back by one and running the body once more than intended — mirrors
    /// `ParallelManager::initialize_newly_executed`'s "already executed, not
    /// yet initialized" gate.
    pub fn initialize_newly_executed(graph: &WorkflowGraph, ctx: &mut ExecutionContext) -> Result<()> {
        let loop_ids: Vec<String> = graph.loops.keys().cloned().collect();
        for loop_id in loop_ids {
            if ctx.completed_loops.contains(&loop_id) || ctx.loop_iterations.contains_key(&loop_id) {
                continue;
            }
            if !ctx.is_executed(&loop_id) {
                continue;
            }
            let loop_def = graph.loops.get(&loop_id).expect("loop id came from graph.loops");

            match loop_def.loop_type {
                LoopType::For if loop_def.iterations <= 0 => {
                    return Err(WorkflowError::Validation(ValidationError::InvalidLoopIterations {
                        loop_id: loop_def.id.clone(),
                        iterations: loop_def.iterations,
                    }))
                }
                LoopType::For => {}
                LoopType::ForEach => {
                    let items = Self::for_each_items(loop_def)?;
                    if let Some(first) = items.first() {
                        ctx.loop_current_item.insert(loop_id.clone(), first.clone());
                    }
                    ctx.loop_frozen_items.insert(loop_id.clone(), items);
                }
            }
            ctx.loop_iterations.insert(loop_id, 1);
        }
        Ok(())
    }

    pub fn process_loop_iterations(graph: &WorkflowGraph, ctx: &mut ExecutionContext) -> Result<()> {
        let loop_ids: Vec<String> = graph.loops.keys().cloned().collect();
        for loop_id in loop_ids {
            if ctx.completed_loops.contains(&loop_id) {
                continue;
            }
            let loop_def = graph.loops.get(&loop_id).expect("loop id came from graph.loops");
            if !ctx.is_executed(&loop_id) {
                continue;
            }

            if !Self::all_blocks_in_loop_executed(loop_def, graph, ctx) {
                continue;
            }

            let max_iterations = Self::max_iterations(loop_def, ctx)?;
            let current = *ctx.loop_iterations.get(&loop_id).unwrap_or(&0);

            if current >= max_iterations {
                Self::complete(loop_def, graph, ctx, max_iterations);
            } else {
                Self::advance(loop_def, ctx, current + 1, max_iterations);
            }
        }
        Ok(())
    }

    fn max_iterations(loop_def: &Loop, ctx: &ExecutionContext) -> Result<u32> {
        match loop_def.loop_type {
            LoopType::For => {
                if loop_def.iterations <= 0 {
                    return Err(WorkflowError::Validation(ValidationError::InvalidLoopIterations {
                        loop_id: loop_def.id.clone(),
                        iterations: loop_def.iterations,
                    }));
                }
                Ok(loop_def.iterations as u32)
            }
            LoopType::ForEach => {
                if let Some(items) = ctx.loop_frozen_items.get(&loop_def.id) {
                    return Ok(items.len() as u32);
                }
                let items = Self::for_each_items(loop_def)?;
                Ok(items.len() as u32)
            }
        }
    }

    /// Parses `forEachItems` (array, object, or JSON-encoded string) into a
    /// flat item list. Does not freeze into the context; callers that need
    /// the frozen collection should prefer `ctx.loop_frozen_items`.
    pub fn for_each_items(loop_def: &Loop) -> Result<Vec<JsonValue>> {
        let raw = loop_def
            .for_each_items
            .clone()
            .ok_or_else(|| WorkflowError::Validation(ValidationError::EmptyForEach(loop_def.id.clone())))?;

        let resolved = match raw {
            JsonValue::String(s) => serde_json::from_str(&s)
                .map_err(|e| WorkflowError::Internal(anyhow::anyhow!("invalid forEachItems JSON: {e}")))?,
            other => other,
        };

        let items: Vec<JsonValue> = match resolved {
            JsonValue::Array(items) => items,
            JsonValue::Object(map) => map.into_values().collect(),
            _ => {
                return Err(WorkflowError::Validation(ValidationError::EmptyForEach(
                    loop_def.id.clone(),
                )))
            }
        };

        if items.is_empty() {
            return Err(WorkflowError::Validation(ValidationError::EmptyForEach(
                loop_def.id.clone(),
            )));
        }
        Ok(items)
    }

    fn advance(loop_def: &Loop, ctx: &mut ExecutionContext, next_iteration: u32, max_iterations: u32) {
        if loop_def.loop_type == LoopType::ForEach && !ctx.loop_frozen_items.contains_key(&loop_def.id) {
            if let Ok(items) = Self::for_each_items(loop_def) {
                ctx.loop_frozen_items.insert(loop_def.id.clone(), items);
            }
        }
        if loop_def.loop_type == LoopType::ForEach {
            if let Some(items) = ctx.loop_frozen_items.get(&loop_def.id) {
                let idx = (next_iteration.saturating_sub(1)) as usize;
                if let Some(item) = items.get(idx) {
                    ctx.loop_current_item.insert(loop_def.id.clone(), item.clone());
                }
            }
        }
        let _ = max_iterations;
        ctx.loop_iterations.insert(loop_def.id.clone(), next_iteration);

        for node in &loop_def.nodes {
            ctx.reset_block(node);
        }
        ctx.reset_block(&loop_def.id);
        // `reset_block` just stripped the loop head out of
        // `active_execution_path` along with its executed state; without
        // putting it back, `compute_ready` would never offer it again and
        // the loop would stall after its first iteration.
        ctx.active_execution_path.insert(loop_def.id.clone());
    }

    fn complete(loop_def: &Loop, graph: &WorkflowGraph, ctx: &mut ExecutionContext, max_iterations: u32) {
        let results: Vec<JsonValue> = ctx
            .loop_execution_results
            .get(&loop_def.id)
            .map(|map| {
                let mut entries: Vec<(&String, &JsonValue)> = map.iter().collect();
                entries.sort_by_key(|(k, _)| {
                    k.strip_prefix("iteration_").and_then(|n| n.parse::<u32>().ok()).unwrap_or(0)
                });
                entries.into_iter().map(|(_, v)| v.clone()).collect()
            })
            .unwrap_or_default();

        let current = *ctx.loop_iterations.get(&loop_def.id).unwrap_or(&max_iterations);
        let output = serde_json::json!({
            "loopId": loop_def.id,
            "currentIteration": current.saturating_sub(1),
            "maxIterations": max_iterations,
            "loopType": match loop_def.loop_type { LoopType::For => "for", LoopType::ForEach => "forEach" },
            "completed": true,
            "results": results,
            "message": format!("loop '{}' completed after {} iteration(s)", loop_def.id, max_iterations),
        });

        ctx.block_states.insert(
            loop_def.id.clone(),
            crate::model::BlockState {
                output: crate::model::BlockOutput::Ok(output),
                executed: true,
                execution_time_ms: 0,
            },
        );
        ctx.completed_loops.insert(loop_def.id.clone());

        for conn in graph.outgoing(&loop_def.id) {
            if conn.handle() == handle::LOOP_END {
                ctx.active_execution_path.insert(conn.target.clone());
            }
        }
    }

    /// Appends a value to `executionResults["iteration_<i>"]`, promoting to
    /// an array if a value is already stored there.
    pub fn store_iteration_result(ctx: &mut ExecutionContext, loop_id: &str, iteration: u32, value: JsonValue) {
        let key = format!("iteration_{iteration}");
        let entry = ctx
            .loop_execution_results
            .entry(loop_id.to_string())
            .or_default()
            .entry(key)
            .or_insert(JsonValue::Null);

        *entry = match entry.take() {
            JsonValue::Null => value,
            JsonValue::Array(mut arr) => {
                arr.push(value);
                JsonValue::Array(arr)
            }
            existing => JsonValue::Array(vec![existing, value]),
        };
    }

    pub fn get_current_item<'a>(ctx: &'a ExecutionContext, loop_id: &str) -> Option<&'a JsonValue> {
        ctx.loop_current_item.get(loop_id)
    }

    /// An edge is a feedback path iff its source is a node of some loop and
    /// its target is that loop's own block.
    pub fn is_feedback_path(conn: &Connection, graph: &WorkflowGraph) -> bool {
        graph
            .loop_containing(&conn.source)
            .map(|l| l.id == conn.target)
            .unwrap_or(false)
    }

    fn all_blocks_in_loop_executed(loop_def: &Loop, graph: &WorkflowGraph, ctx: &ExecutionContext) -> bool {
        if loop_def.nodes.is_empty() {
            return true;
        }

        let node_set: HashSet<&BlockId> = loop_def.nodes.iter().collect();
        let mut dg: DiGraph<BlockId, ()> = DiGraph::new();
        let mut idx_of: HashMap<BlockId, NodeIndex> = HashMap::new();
        for n in &loop_def.nodes {
            let idx = dg.add_node(n.clone());
            idx_of.insert(n.clone(), idx);
        }
        for conn in &graph.connections {
            if node_set.contains(&conn.source) && node_set.contains(&conn.target) {
                dg.add_edge(idx_of[&conn.source], idx_of[&conn.target], ());
            }
        }

        let entry_points: Vec<BlockId> = loop_def
            .nodes
            .iter()
            .filter(|n| {
                let idx = idx_of[*n];
                let has_internal_incoming = dg.edges_directed(idx, Direction::Incoming).next().is_some();
                let has_external_incoming = graph.incoming(n).any(|c| !node_set.contains(&c.source));
                !has_internal_incoming && has_external_incoming
            })
            .cloned()
            .collect();

        let mut reached: HashSet<BlockId> = HashSet::new();
        let mut queue: VecDeque<BlockId> = entry_points.into_iter().collect();

        while let Some(node_id) = queue.pop_front() {
            if !reached.insert(node_id.clone()) {
                continue;
            }
            if !ctx.is_executed(&node_id) {
                continue;
            }

            let has_error = ctx.state(&node_id).map(|s| s.output.is_err()).unwrap_or(false);
            let is_router = graph.block(&node_id).map(|b| b.kind == crate::model::BlockKind::Router).unwrap_or(false);

            for conn in graph.outgoing(&node_id) {
                if !node_set.contains(&conn.target) {
                    continue;
                }
                let follow = if conn.handle() == handle::ERROR {
                    has_error
                } else if let Some(selected) = conn.condition_id() {
                    ctx.decisions.condition.get(&node_id).map(|c| c == selected).unwrap_or(false)
                } else if has_error {
                    false
                } else if is_router {
                    ctx.decisions.router.get(&node_id).map(|t| t == &conn.target).unwrap_or(false)
                } else {
                    true
                };
                if follow {
                    queue.push_back(conn.target.clone());
                }
            }
        }

        reached.iter().all(|n| ctx.is_executed(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockKind};

    fn make_graph() -> WorkflowGraph {
        WorkflowGraph {
            blocks: vec![
                Block { id: "L".into(), kind: BlockKind::Loop, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
                Block { id: "Body".into(), kind: BlockKind::Function, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
                Block { id: "After".into(), kind: BlockKind::Function, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
            ],
            connections: vec![
                Connection { source: "L".into(), target: "Body".into(), source_handle: Some(handle::LOOP_START.into()) },
                Connection { source: "L".into(), target: "After".into(), source_handle: Some(handle::LOOP_END.into()) },
            ],
            loops: [(
                "L".to_string(),
                Loop {
                    id: "L".into(),
                    nodes: vec!["Body".into()],
                    iterations: 3,
                    loop_type: LoopType::For,
                    for_each_items: None,
                },
            )]
            .into_iter()
            .collect(),
            parallels: Default::default(),
        }
    }

    fn mark(ctx: &mut ExecutionContext, id: &str) {
        ctx.mark_executed(
            id.into(),
            crate::model::BlockState {
                output: crate::model::BlockOutput::Ok(serde_json::json!({})),
                executed: true,
                execution_time_ms: 0,
            },
        );
    }

    #[test]
    fn for_loop_runs_to_completion() {
        let graph = make_graph();
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);

        // The loop block's first tick seeds iteration 1 before Body ever runs.
        mark(&mut ctx, "L");
        LoopManager::initialize_newly_executed(&graph, &mut ctx).unwrap();
        assert_eq!(ctx.loop_iterations.get("L"), Some(&1));

        let mut body_runs = 0;
        loop {
            mark(&mut ctx, "Body");
            body_runs += 1;
            LoopManager::process_loop_iterations(&graph, &mut ctx).unwrap();
            if ctx.completed_loops.contains("L") {
                break;
            }
            // The loop re-ticked for the next iteration; Body was reset.
            mark(&mut ctx, "L");
            LoopManager::initialize_newly_executed(&graph, &mut ctx).unwrap();
        }

        assert_eq!(body_runs, 3);
        assert!(ctx.active_execution_path.contains("After"));
    }
}
