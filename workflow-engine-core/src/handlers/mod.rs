//! The handler registry: `can_handle`/`execute` dispatch, first match wins.
//! Spec: `spec.md` §4.6.
//!
//! Grounded in the teacher's `ProcessStore` shape (one `#[async_trait]` per
//! concern) but playing the role of the teacher's opcode dispatch in
//! `vm.rs::tick_fiber` (a closed `match` over `Instr`) — here the "opcodes"
//! are block kinds, and the `match` is reopened into a registry so callers
//! can plug in their own handler for any kind, including ones this crate has
//! never heard of (`BlockKind::Generic`).

mod builtin;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::model::{Block, BlockOutput};

pub use builtin::{
    AgentHandler, ApiHandler, ConditionHandler, EvaluatorHandler, FunctionHandler, GenericHandler,
    LoopTickHandler, ParallelTickHandler, ResponseHandler, RouterHandler, TriggerHandler, WaitHandler,
};

/// A live streaming execution: a channel of text chunks teed to the
/// `Reporter` as they arrive, plus the task computing the final aggregated
/// output.
pub struct StreamingExecution {
    pub chunks: mpsc::UnboundedReceiver<String>,
    pub result: JoinHandle<Result<BlockOutput>>,
}

pub enum HandlerOutput {
    Output(BlockOutput),
    Streaming(StreamingExecution),
}

impl HandlerOutput {
    pub fn ok(value: JsonValue) -> Self {
        HandlerOutput::Output(BlockOutput::Ok(value))
    }
}

/// Projects a drained streaming block's output against its declared
/// `responseFormat`, the pluggable seam `spec.md` §9 calls out for
/// streaming-vs-non-streaming post-processing. Shaped like `Reporter`: one
/// narrow trait plus a default implementation a caller can override.
pub trait ResponseFormatter: Send + Sync {
    fn project(&self, output: BlockOutput, response_format: &JsonValue) -> BlockOutput;
}

/// JSON-parses the handler's drained text content and merges the parsed
/// fields into the output object, leaving whatever streaming metadata the
/// handler already attached (`tokens`, `toolCalls`, `providerTiming`,
/// `cost`) untouched. Output that isn't an object, or whose `response` text
/// doesn't parse as a JSON object, passes through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResponseFormatter;

impl ResponseFormatter for DefaultResponseFormatter {
    fn project(&self, output: BlockOutput, _response_format: &JsonValue) -> BlockOutput {
        let BlockOutput::Ok(JsonValue::Object(mut map)) = output else {
            return output;
        };
        let Some(JsonValue::String(text)) = map.get("response") else {
            return BlockOutput::Ok(JsonValue::Object(map));
        };
        if let Ok(JsonValue::Object(parsed)) = serde_json::from_str::<JsonValue>(text) {
            map.remove("response");
            map.extend(parsed);
        }
        BlockOutput::Ok(JsonValue::Object(map))
    }
}

/// One pluggable unit of block execution. `execute` receives `ctx` by shared
/// reference only — the executor runs a whole layer's handlers
/// concurrently and commits their results serially afterwards, so no
/// handler may mutate execution state directly (`spec.md` §5).
#[async_trait]
pub trait Handler: Send + Sync {
    fn can_handle(&self, block: &Block) -> bool;

    async fn execute(&self, block: &Block, resolved_input: &JsonValue, ctx: &ExecutionContext) -> Result<HandlerOutput>;
}

/// First-match-wins handler lookup. Handlers registered via `register` are
/// tried before the built-ins, so a caller can override any built-in kind
/// (including `Workflow`, which the executor special-cases before
/// consulting the registry at all — see `spec.md` §4.1.4).
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self { handlers: Vec::new() }
    }

    /// The registry the executor uses unless a caller builds its own: every
    /// built-in handler, ending in `GenericHandler` which accepts anything.
    pub fn with_builtins() -> Self {
        let mut reg = Self::empty();
        reg.append(Arc::new(TriggerHandler));
        reg.append(Arc::new(WaitHandler));
        reg.append(Arc::new(RouterHandler));
        reg.append(Arc::new(ConditionHandler));
        reg.append(Arc::new(EvaluatorHandler));
        reg.append(Arc::new(AgentHandler));
        reg.append(Arc::new(ApiHandler));
        reg.append(Arc::new(FunctionHandler));
        reg.append(Arc::new(ResponseHandler));
        reg.append(Arc::new(LoopTickHandler));
        reg.append(Arc::new(ParallelTickHandler));
        reg.append(Arc::new(GenericHandler));
        reg
    }

    /// Registers `handler` ahead of anything already present, so
    /// user-registered handlers always outrank built-ins.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(0, handler);
    }

    /// Appends `handler` behind anything already present. Used to build the
    /// built-in chain in priority order, ending with the generic fallback.
    fn append(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn find(&self, block: &Block) -> Option<&Arc<dyn Handler>> {
        self.handlers.iter().find(|h| h.can_handle(block))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
