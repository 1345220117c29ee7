//! Built-in handlers. Each covers the minimum viable behaviour for its
//! block kind; callers needing a real LLM client, HTTP dispatch, or a
//! scripting engine register their own `Handler` ahead of these (the
//! registry is first-match-wins, see `handlers::HandlerRegistry::register`).

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Handler, HandlerOutput};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::model::{Block, BlockKind};

/// Trigger/starter blocks: the resolved input *is* the output — whatever the
/// caller passed to `Executor::execute` (or, for a child workflow, whatever
/// `inputMapping` produced).
pub struct TriggerHandler;

#[async_trait]
impl Handler for TriggerHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind.is_trigger() || block.kind == BlockKind::Starter || block.metadata.trigger_mode
    }

    async fn execute(&self, _block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        Ok(HandlerOutput::ok(resolved_input.clone()))
    }
}

/// Wait blocks request a pause; the executor reads `paused`/`reason`/
/// `payload` back off this output during its commit phase (handlers cannot
/// mutate `ExecutionContext` directly — see `spec.md` §5).
pub struct WaitHandler;

#[async_trait]
impl Handler for WaitHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Wait
    }

    async fn execute(&self, block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let reason = block
            .config
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("awaiting external input")
            .to_string();
        Ok(HandlerOutput::ok(serde_json::json!({
            "paused": true,
            "reason": reason,
            "payload": resolved_input,
        })))
    }
}

/// Router config: `{"routes": [{"blockId": "...", "when": <bool>}], "default": "..."}`.
/// `when` is evaluated by the caller's `InputResolver` before this handler
/// runs, so `resolved_input.routes[i].when` is already a concrete JSON
/// boolean by the time it gets here.
pub struct RouterHandler;

#[async_trait]
impl Handler for RouterHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Router
    }

    async fn execute(&self, block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let routes = resolved_input
            .get("routes")
            .or_else(|| block.config.get("routes"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let chosen = routes
            .iter()
            .find(|r| r.get("when").map(is_truthy).unwrap_or(true))
            .and_then(|r| r.get("blockId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| block.config.get("default").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .or_else(|| routes.first().and_then(|r| r.get("blockId")).and_then(|v| v.as_str()).map(|s| s.to_string()));

        match chosen {
            Some(block_id) => Ok(HandlerOutput::ok(serde_json::json!({ "selectedPath": { "blockId": block_id } }))),
            None => Ok(HandlerOutput::Output(crate::model::BlockOutput::Err {
                message: format!("router '{}' could not resolve a target route", block.id),
                status: 500,
            })),
        }
    }
}

/// Condition config: `{"conditions": [{"id": "...", "when": <bool>}], "default": "..."}`.
pub struct ConditionHandler;

#[async_trait]
impl Handler for ConditionHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Condition
    }

    async fn execute(&self, block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let conditions = resolved_input
            .get("conditions")
            .or_else(|| block.config.get("conditions"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let chosen = conditions
            .iter()
            .find(|c| c.get("when").map(is_truthy).unwrap_or(false))
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| block.config.get("default").and_then(|v| v.as_str()).map(|s| s.to_string()));

        match chosen {
            Some(id) => Ok(HandlerOutput::ok(serde_json::json!({ "selectedConditionId": id }))),
            None => Ok(HandlerOutput::Output(crate::model::BlockOutput::Err {
                message: format!("condition '{}' had no matching clause and no default", block.id),
                status: 500,
            })),
        }
    }
}

/// Evaluator config: `{"expression": "<dot.path>"}`, looked up against the
/// resolved input. Falls through to the whole input when no expression is
/// configured.
pub struct EvaluatorHandler;

#[async_trait]
impl Handler for EvaluatorHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Evaluator
    }

    async fn execute(&self, block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let Some(path) = block.config.get("expression").and_then(|v| v.as_str()) else {
            return Ok(HandlerOutput::ok(resolved_input.clone()));
        };
        let mut current = resolved_input;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(HandlerOutput::ok(JsonValue::Null)),
            }
        }
        Ok(HandlerOutput::ok(current.clone()))
    }
}

/// Agent blocks without a caller-registered LLM client echo their resolved
/// input back as a simulated response, honouring a streaming
/// `response_format` by teeing word-sized chunks. This keeps graphs that
/// reference `agent` blocks runnable and testable without a live provider.
pub struct AgentHandler;

#[async_trait]
impl Handler for AgentHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Agent
    }

    async fn execute(&self, block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let text = resolved_input
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| resolved_input.to_string());

        let streaming = block
            .metadata
            .response_format
            .as_ref()
            .and_then(|f| f.get("streaming"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if !streaming {
            return Ok(HandlerOutput::ok(serde_json::json!({ "response": text })));
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let words: Vec<String> = text.split_whitespace().map(|w| w.to_string()).collect();
        let result = tokio::spawn(async move {
            let mut full = String::new();
            for w in words {
                full.push_str(&w);
                full.push(' ');
                let _ = tx.send(w);
            }
            Ok(crate::model::BlockOutput::Ok(serde_json::json!({ "response": full.trim_end() })))
        });

        Ok(HandlerOutput::Streaming(super::StreamingExecution { chunks: rx, result }))
    }
}

/// API blocks without a caller-registered HTTP client echo their resolved
/// request description back, tagged so it's unmistakable no network call
/// was actually made.
pub struct ApiHandler;

#[async_trait]
impl Handler for ApiHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Api
    }

    async fn execute(&self, _block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        Ok(HandlerOutput::ok(serde_json::json!({
            "request": resolved_input,
            "note": "no HTTP client registered; register a Handler for BlockKind::Api to dispatch real requests",
        })))
    }
}

/// Function blocks without a caller-registered scripting engine pass their
/// resolved input through unchanged.
pub struct FunctionHandler;

#[async_trait]
impl Handler for FunctionHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Function
    }

    async fn execute(&self, _block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        Ok(HandlerOutput::ok(resolved_input.clone()))
    }
}

/// Response blocks format the workflow's terminal output; the executor
/// collects every reached `Response` block's output into the
/// `ExecutionResult` it returns.
pub struct ResponseHandler;

#[async_trait]
impl Handler for ResponseHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Response
    }

    async fn execute(&self, _block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        Ok(HandlerOutput::ok(resolved_input.clone()))
    }
}

/// The loop block's own per-tick output. All of the iteration bookkeeping
/// (counting, resetting, aggregating) happens in `LoopManager` during the
/// executor's commit phase — this handler only produces the block's visible
/// output for the current tick.
pub struct LoopTickHandler;

#[async_trait]
impl Handler for LoopTickHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Loop
    }

    async fn execute(&self, block: &Block, _resolved_input: &JsonValue, ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let iteration = ctx.loop_iterations.get(&block.id).copied().unwrap_or(0);
        Ok(HandlerOutput::ok(serde_json::json!({ "loopId": block.id, "currentIteration": iteration })))
    }
}

/// The parallel block's own per-tick output; see `LoopTickHandler`.
pub struct ParallelTickHandler;

#[async_trait]
impl Handler for ParallelTickHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Parallel
    }

    async fn execute(&self, block: &Block, _resolved_input: &JsonValue, ctx: &ExecutionContext) -> Result<HandlerOutput> {
        let count = ctx.parallel_executions.get(&block.id).map(|s| s.parallel_count).unwrap_or(0);
        Ok(HandlerOutput::ok(serde_json::json!({ "parallelId": block.id, "count": count })))
    }
}

/// Catch-all for `BlockKind::Generic` (or any kind no other built-in
/// claims): passes the resolved input through.
pub struct GenericHandler;

#[async_trait]
impl Handler for GenericHandler {
    fn can_handle(&self, _block: &Block) -> bool {
        true
    }

    async fn execute(&self, _block: &Block, resolved_input: &JsonValue, _ctx: &ExecutionContext) -> Result<HandlerOutput> {
        Ok(HandlerOutput::ok(resolved_input.clone()))
    }
}

fn is_truthy(v: &JsonValue) -> bool {
    match v {
        JsonValue::Bool(b) => *b,
        JsonValue::Null => false,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}
