//! Connection classification and the `checkDependencies` contract from
//! `spec.md` §4.1 ("Dependency check"). Shared by the executor's
//! ready-block selection and by `ParallelManager`'s per-iteration gating.

use crate::context::ExecutionContext;
use crate::model::{handle, BlockKind, Connection, WorkflowGraph};

/// Whether `conn`'s dependency is satisfied, given that `source_effective_id`
/// is the (possibly virtual-rewritten) id to read `conn.source`'s state
/// under.
///
/// Per `spec.md` §4.1: if the source block is not in `active_execution_path`
/// the dependency is considered met unconditionally (OR-style merges), so
/// that check runs first and short-circuits everything below it.
pub fn dependency_met(
    conn: &Connection,
    graph: &WorkflowGraph,
    ctx: &ExecutionContext,
    source_effective_id: &str,
) -> bool {
    if !ctx.active_execution_path.contains(&conn.source) {
        return true;
    }

    let handle = conn.handle();

    if handle == handle::ERROR {
        return ctx
            .state(source_effective_id)
            .map(|s| ctx.is_executed(source_effective_id) && s.output.is_err())
            .unwrap_or(false);
    }

    if let Some(selected_id) = conn.condition_id() {
        return match ctx.decisions.condition.get(source_effective_id) {
            Some(chosen) if chosen == selected_id => true,
            Some(_) => true, // a different clause fired: not applicable, doesn't block
            None => false,   // condition hasn't executed yet
        };
    }

    if handle == handle::LOOP_START || handle == handle::PARALLEL_START {
        return ctx.is_executed(source_effective_id);
    }

    if handle == handle::LOOP_END || handle == handle::PARALLEL_END {
        return ctx.completed_loops.contains(&conn.source);
    }

    // Default/"source" handle.
    if !ctx.is_executed(source_effective_id) {
        return false;
    }
    let Some(state) = ctx.state(source_effective_id) else {
        return false;
    };
    if state.output.is_err() {
        return false;
    }

    let source_is_router = graph
        .block(&conn.source)
        .map(|b| b.kind == BlockKind::Router)
        .unwrap_or(false);

    if source_is_router {
        return ctx.decisions.router.get(source_effective_id).map(|t| t == &conn.target) == Some(true);
    }

    true
}

/// Whether an outgoing connection from an already-executed regular block
/// should propagate activation to its target, applying error-edge
/// semantics. Used by `PathTracker::update_execution_paths`.
pub fn activates(conn: &Connection, source_has_error: bool) -> bool {
    let handle = conn.handle();
    if handle == handle::ERROR {
        source_has_error
    } else if handle == handle::LOOP_START
        || handle == handle::LOOP_END
        || handle == handle::PARALLEL_START
        || handle == handle::PARALLEL_END
        || conn.condition_id().is_some()
    {
        // Flow-control/routing handles are activated by their own
        // specialised logic, never by the generic regular-block rule.
        false
    } else {
        !source_has_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockKind};

    fn block(id: &str, kind: BlockKind) -> Block {
        Block {
            id: id.to_string(),
            kind,
            enabled: true,
            config: serde_json::json!({}),
            metadata: Default::default(),
        }
    }

    fn graph_with(blocks: Vec<Block>, connections: Vec<Connection>) -> WorkflowGraph {
        WorkflowGraph {
            blocks,
            connections,
            loops: Default::default(),
            parallels: Default::default(),
        }
    }

    #[test]
    fn unreached_source_never_blocks() {
        let graph = graph_with(
            vec![block("a", BlockKind::Function), block("b", BlockKind::Function)],
            vec![],
        );
        let conn = Connection {
            source: "a".into(),
            target: "b".into(),
            source_handle: None,
        };
        let ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        assert!(dependency_met(&conn, &graph, &ctx, "a"));
    }

    #[test]
    fn condition_with_different_selected_clause_is_not_applicable() {
        let graph = graph_with(
            vec![block("cond", BlockKind::Condition), block("p", BlockKind::Function)],
            vec![],
        );
        let conn = Connection {
            source: "cond".into(),
            target: "p".into(),
            source_handle: Some("condition-false".into()),
        };
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        ctx.active_execution_path.insert("cond".into());
        ctx.decisions.condition.insert("cond".into(), "true".into());
        assert!(dependency_met(&conn, &graph, &ctx, "cond"));
    }
}
