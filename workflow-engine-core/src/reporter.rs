//! `Reporter` — the telemetry/UI-tracking seam called out in `spec.md` §9:
//! "in a systems-language implementation these belong behind a `Reporter`
//! interface the executor emits to, with a no-op reporter for headless runs".
//!
//! Shaped like the teacher's `ProcessStore` (`store.rs`): one `#[async_trait]`
//! trait with several narrow methods, a trivial in-memory/no-op
//! implementation standing in for what `MemoryStore` does for
//! `ProcessStore`. Every method has a no-op default body so implementors
//! override only the events they care about.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::model::BlockId;

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn on_execution_start(&self, _workflow_id: &str, _execution_id: &str) {}
    async fn on_block_start(&self, _execution_id: &str, _block_id: &BlockId) {}
    async fn on_block_finish(&self, _execution_id: &str, _block_id: &BlockId, _success: bool) {}
    async fn on_block_error(&self, _execution_id: &str, _block_id: &BlockId, _message: &str) {}
    /// Called once per chunk for a streaming handler, before the final
    /// aggregated output is committed (the "tee" in `spec.md` §4.1.2).
    async fn on_block_chunk(&self, _execution_id: &str, _block_id: &BlockId, _chunk: &str) {}
    async fn on_execution_complete(&self, _execution_id: &str, _output: &JsonValue) {}
    async fn on_cancelled(&self, _execution_id: &str) {}
    async fn on_paused(&self, _execution_id: &str, _block_id: Option<&BlockId>) {}
}

/// The reporter used when no caller-supplied `Reporter` is configured, and
/// unconditionally for nested (`is_child_execution`) runs — "Active-block UI
/// tracking is gated by `isChildExecution` to prevent nested runs from
/// stomping parent state" (`spec.md` §5).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {}
