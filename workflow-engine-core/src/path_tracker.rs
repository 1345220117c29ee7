//! `PathTracker` — maintains `active_execution_path` as a function of
//! routing/condition decisions. Spec: `spec.md` §4.2.

use std::collections::HashSet;

use crate::connection;
use crate::context::ExecutionContext;
use crate::model::{handle, BlockId, BlockKind, Connection, WorkflowGraph};
use crate::virtual_id;

pub struct PathTracker;

impl PathTracker {
    /// True if `block_id` is already active, or becomes active because some
    /// incoming connection's source is active, executed, and (for
    /// router/condition sources) matches the recorded decision.
    pub fn is_in_active_path(block_id: &str, graph: &WorkflowGraph, ctx: &ExecutionContext) -> bool {
        if ctx.active_execution_path.contains(block_id) {
            return true;
        }
        graph.incoming(block_id).any(|conn| {
            ctx.active_execution_path.contains(&conn.source)
                && ctx.is_executed(&conn.source)
                && connection::dependency_met(conn, graph, ctx, &conn.source)
        })
    }

    /// Processes every block that completed this tick, updating
    /// `active_execution_path` and recording router/condition decisions.
    pub fn update_execution_paths(
        executed_ids: &[String],
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
    ) {
        for effective_id in executed_ids {
            let original_id = virtual_id::extract_original_id(effective_id).to_string();
            let Some(block) = graph.block(&original_id) else {
                continue;
            };

            let has_error = ctx.state(effective_id).map(|s| s.output.is_err()).unwrap_or(false);
            if has_error {
                // A failed block's error edge fires regardless of its kind —
                // a router or condition that itself failed to resolve a
                // route never gets to record a routing decision.
                Self::activate_edges(effective_id, &original_id, graph, ctx, |c| {
                    c.handle() == handle::ERROR
                });
                continue;
            }

            match block.kind {
                BlockKind::Router => Self::handle_router(effective_id, &original_id, graph, ctx),
                BlockKind::Condition => {
                    Self::handle_condition(effective_id, &original_id, graph, ctx)
                }
                BlockKind::Loop => Self::activate_single_hop(
                    &original_id,
                    graph,
                    ctx,
                    handle::LOOP_START,
                ),
                // A parallel's own entry-node, per-iteration virtual-id
                // activation is seeded by `ParallelManager::initialize_newly_executed`
                // once its count is resolved, not here.
                BlockKind::Parallel => {}
                _ => Self::handle_regular(effective_id, &original_id, graph, ctx),
            }
        }
    }

    fn handle_router(effective_id: &str, original_id: &str, graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        let Some(state) = ctx.state(effective_id) else {
            return;
        };
        let crate::model::BlockOutput::Ok(json) = &state.output else {
            return;
        };
        let Some(chosen) = json
            .get("selectedPath")
            .and_then(|p| p.get("blockId"))
            .and_then(|v| v.as_str())
        else {
            return;
        };
        let chosen = chosen.to_string();

        ctx.decisions
            .router
            .entry(effective_id.to_string())
            .or_insert_with(|| chosen.clone());

        let _ = original_id;
        let mut visited = HashSet::new();
        Self::activate_downstream(&chosen, graph, ctx, &mut visited);
    }

    fn handle_condition(effective_id: &str, original_id: &str, graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        let Some(state) = ctx.state(effective_id) else {
            return;
        };
        let crate::model::BlockOutput::Ok(json) = &state.output else {
            return;
        };
        let Some(selected) = json
            .get("selectedConditionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
        else {
            return;
        };

        ctx.decisions
            .condition
            .entry(effective_id.to_string())
            .or_insert_with(|| selected.clone());

        let wanted_handle = format!("{}{}", handle::CONDITION_PREFIX, selected);
        let targets: Vec<BlockId> = graph
            .outgoing(original_id)
            .filter(|c| c.handle() == wanted_handle)
            .map(|c| c.target.clone())
            .collect();

        let mut visited = HashSet::new();
        for target in targets {
            Self::activate_downstream(&target, graph, ctx, &mut visited);
        }
    }

    /// A single-hop activation for loop/parallel-start edges: adds the
    /// matching targets, but does not recurse (the body blocks activate
    /// their own successors once they themselves execute).
    fn activate_single_hop(original_id: &str, graph: &WorkflowGraph, ctx: &mut ExecutionContext, wanted_handle: &str) {
        let targets: Vec<BlockId> = graph
            .outgoing(original_id)
            .filter(|c| c.handle() == wanted_handle)
            .map(|c| c.target.clone())
            .collect();
        for t in targets {
            ctx.active_execution_path.insert(t);
        }
    }

    fn handle_regular(effective_id: &str, original_id: &str, graph: &WorkflowGraph, ctx: &mut ExecutionContext) {
        // `has_error` is always false here: the caller already diverted
        // failed blocks to the error-edge path before dispatching by kind.
        Self::activate_edges(effective_id, original_id, graph, ctx, |c| connection::activates(c, false));
    }

    /// Activates every outgoing connection from `original_id` that `keep`
    /// selects, scoping the target to the current parallel iteration (or
    /// gating it on full parallel/loop completion) the same way regardless
    /// of whether the edge is a normal success edge or an error edge.
    fn activate_edges(
        effective_id: &str,
        original_id: &str,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        keep: impl Fn(&Connection) -> bool,
    ) {
        let parallel = graph.parallel_containing(original_id).cloned();
        let iteration = virtual_id::parse(effective_id).map(|p| p.iteration_index);

        let containing_loops: Vec<String> = graph
            .all_loops_containing(original_id)
            .into_iter()
            .map(|l| l.id.clone())
            .collect();

        let edges: Vec<Connection> = graph.outgoing(original_id).cloned().collect();
        for conn in edges {
            if !keep(&conn) {
                continue;
            }

            if let (Some(par), Some(iter)) = (&parallel, iteration) {
                if par.nodes.contains(&conn.target) {
                    // Internal edge: stay within the same iteration.
                    ctx.active_execution_path
                        .insert(virtual_id::generate(&conn.target, &par.id, iter));
                } else if ctx.completed_loops.contains(&par.id) {
                    // External edge: only activate once the whole parallel
                    // (every iteration) has completed.
                    ctx.active_execution_path.insert(conn.target.clone());
                }
                continue;
            }

            if !containing_loops.is_empty() {
                let target_in_loop = containing_loops
                    .iter()
                    .any(|lid| graph.loops.get(lid).map(|l| l.nodes.contains(&conn.target)).unwrap_or(false));
                if !target_in_loop {
                    // External edge: only activate once every containing loop
                    // has completed.
                    let all_completed = containing_loops
                        .iter()
                        .all(|lid| ctx.completed_loops.contains(lid));
                    if !all_completed {
                        continue;
                    }
                }
            }
            ctx.active_execution_path.insert(conn.target.clone());
        }
    }

    /// Recursively activates `target` and, if it is a plain regular block,
    /// its own regular-activation reachable successors — stopping at
    /// routing blocks (they record their own decision once executed) and
    /// flow-control blocks (their internal paths are self-managed).
    fn activate_downstream(
        target: &str,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        visited: &mut HashSet<BlockId>,
    ) {
        if !visited.insert(target.to_string()) {
            return;
        }
        ctx.active_execution_path.insert(target.to_string());

        let Some(block) = graph.block(target) else {
            return;
        };
        if block.kind.is_routing() || block.kind.is_flow_control() {
            return;
        }

        // The target hasn't executed yet, so we don't know its error state;
        // treat it as the non-error case for the purposes of this
        // speculative pre-activation (error edges only ever fire after the
        // block has actually executed and failed).
        let edges: Vec<Connection> = graph.outgoing(target).cloned().collect();
        for conn in edges {
            if connection::activates(&conn, false) {
                Self::activate_downstream(&conn.target, graph, ctx, visited);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockOutput, BlockState};

    fn block(id: &str, kind: BlockKind) -> Block {
        Block {
            id: id.to_string(),
            kind,
            enabled: true,
            config: serde_json::json!({}),
            metadata: Default::default(),
        }
    }

    #[test]
    fn router_activates_only_chosen_target() {
        let graph = WorkflowGraph {
            blocks: vec![
                block("r", BlockKind::Router),
                block("x", BlockKind::Function),
                block("y", BlockKind::Function),
            ],
            connections: vec![
                Connection { source: "r".into(), target: "x".into(), source_handle: None },
                Connection { source: "r".into(), target: "y".into(), source_handle: None },
            ],
            loops: Default::default(),
            parallels: Default::default(),
        };
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        ctx.mark_executed(
            "r".into(),
            BlockState {
                output: BlockOutput::Ok(serde_json::json!({"selectedPath": {"blockId": "x"}})),
                executed: true,
                execution_time_ms: 0,
            },
        );
        PathTracker::update_execution_paths(&["r".to_string()], &graph, &mut ctx);
        assert!(ctx.active_execution_path.contains("x"));
        assert!(!ctx.active_execution_path.contains("y"));
        assert_eq!(ctx.decisions.router.get("r").map(|s| s.as_str()), Some("x"));
    }

    #[test]
    fn router_does_not_recurse_into_flow_control_internals() {
        let graph = WorkflowGraph {
            blocks: vec![
                block("r", BlockKind::Router),
                block("lp", BlockKind::Loop),
                block("body", BlockKind::Function),
            ],
            connections: vec![
                Connection { source: "r".into(), target: "lp".into(), source_handle: None },
                Connection {
                    source: "lp".into(),
                    target: "body".into(),
                    source_handle: Some(handle::LOOP_START.into()),
                },
            ],
            loops: Default::default(),
            parallels: Default::default(),
        };
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        ctx.mark_executed(
            "r".into(),
            BlockState {
                output: BlockOutput::Ok(serde_json::json!({"selectedPath": {"blockId": "lp"}})),
                executed: true,
                execution_time_ms: 0,
            },
        );
        PathTracker::update_execution_paths(&["r".to_string()], &graph, &mut ctx);
        assert!(ctx.active_execution_path.contains("lp"));
        assert!(!ctx.active_execution_path.contains("body"));
    }
}
