//! `ExecutionContext` — the mutable state owned exclusively by one execution.
//!
//! Structurally this plays the role the teacher's `ProcessInstance` +
//! `ProcessStore` play together (instance state + per-instance maps), but
//! collapsed into a single in-memory struct since `spec.md` §1 explicitly
//! rules out durable/shared persistence: "a context is created at execute()
//! entry, owned exclusively by that execution... released when the
//! execution returns."

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::model::{BlockId, BlockLog, BlockOutput, BlockState, LoopId, ParallelId};

/// Router/condition routing decisions, keyed by the effective id of the
/// block that made the decision.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Decisions {
    /// effective id of router -> chosen target block id.
    pub router: BTreeMap<String, BlockId>,
    /// effective id of condition -> chosen condition clause id.
    pub condition: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelExecutionState {
    pub parallel_count: u32,
    pub current_iteration: u32,
    /// iteration index -> aggregated output for that iteration.
    pub execution_results: BTreeMap<u32, JsonValue>,
    /// Iterations whose reachable body nodes have all executed.
    pub completed_iterations: HashSet<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelBlockMapping {
    pub original_block_id: BlockId,
    pub parallel_id: ParallelId,
    pub iteration_index: u32,
}

/// Information a `wait` handler attaches when it requests a pause.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitBlockInfo {
    pub block_id: BlockId,
    pub reason: String,
    pub payload: JsonValue,
}

/// The mutable state of one execution. Not `Clone` in the executor's hot
/// path (it is moved into/out of pause boundaries by value), but derives
/// `Clone` for the `createFromPausedState` / test-fixture use cases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub block_states: BTreeMap<String, BlockState>,
    pub block_logs: Vec<BlockLog>,
    pub executed_blocks: HashSet<String>,
    pub active_execution_path: HashSet<BlockId>,
    pub decisions: Decisions,

    pub loop_iterations: BTreeMap<LoopId, u32>,
    /// Current item exposed to `InputResolver` for forEach loops.
    pub loop_current_item: BTreeMap<LoopId, JsonValue>,
    /// The frozen `forEachItems` collection, snapshotted on first iteration
    /// (the `<loopId>_items` key in `spec.md` §3).
    pub loop_frozen_items: BTreeMap<LoopId, Vec<JsonValue>>,
    /// Per-iteration aggregated results, `"iteration_<n>"` keyed, promoted to
    /// an array if `storeIterationResult` is called twice for the same key.
    pub loop_execution_results: BTreeMap<LoopId, BTreeMap<String, JsonValue>>,

    /// Loop AND parallel ids that have terminated (shared namespace, per
    /// `spec.md` §3).
    pub completed_loops: HashSet<String>,

    pub parallel_executions: BTreeMap<ParallelId, ParallelExecutionState>,
    pub parallel_block_mapping: BTreeMap<String, ParallelBlockMapping>,

    /// Set only while `execute_block` is running a virtual block.
    pub current_virtual_block_id: Option<String>,

    pub environment_variables: BTreeMap<String, JsonValue>,
    pub workflow_variables: BTreeMap<String, JsonValue>,

    pub selected_output_ids: Vec<BlockId>,
    pub is_deployed_context: bool,
    pub is_child_execution: bool,
    pub execution_id: Uuid,
    pub workspace_id: Option<String>,
    pub workflow_id: String,

    /// Set by the `wait` handler to request a pause after the current layer.
    pub should_pause_after_block: bool,
    pub wait_block_info: Option<WaitBlockInfo>,

    /// Nested-workflow depth, incremented once per `workflow` block
    /// invocation; enforced against the limit of 10 (`spec.md` §4.1.4).
    pub depth: u32,

    /// True once some block failed with nowhere for its `error` edge to
    /// send it. Lives on the context (not a local in the tick loop) so it
    /// survives a pause/`continueExecution` round trip and still counts
    /// against `ExecutionResult.success` once the run eventually finishes.
    pub had_unrouted_error: bool,

    /// Caller-supplied opaque extension bag (`spec.md` §6's
    /// `contextExtensions` constructor option). The engine stores and
    /// returns it but never reads from it itself.
    pub context_extensions: BTreeMap<String, JsonValue>,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        environment_variables: BTreeMap<String, JsonValue>,
        workflow_variables: BTreeMap<String, JsonValue>,
        is_deployed_context: bool,
    ) -> Self {
        Self {
            block_states: BTreeMap::new(),
            block_logs: Vec::new(),
            executed_blocks: HashSet::new(),
            active_execution_path: HashSet::new(),
            decisions: Decisions::default(),
            loop_iterations: BTreeMap::new(),
            loop_current_item: BTreeMap::new(),
            loop_frozen_items: BTreeMap::new(),
            loop_execution_results: BTreeMap::new(),
            completed_loops: HashSet::new(),
            parallel_executions: BTreeMap::new(),
            parallel_block_mapping: BTreeMap::new(),
            current_virtual_block_id: None,
            environment_variables,
            workflow_variables,
            selected_output_ids: Vec::new(),
            is_deployed_context,
            is_child_execution: false,
            execution_id: Uuid::now_v7(),
            workspace_id: None,
            workflow_id: workflow_id.into(),
            should_pause_after_block: false,
            wait_block_info: None,
            depth: 0,
            had_unrouted_error: false,
            context_extensions: BTreeMap::new(),
        }
    }

    /// The effective id used to key `block_states`/`executed_blocks` right
    /// now: the virtual id if executing inside a parallel iteration, else
    /// the plain block id. Callers that already know the effective id
    /// (`PathTracker`, `InputResolver`) should take it as a parameter
    /// instead of reading this — see `spec.md` §9's design note.
    pub fn effective_id(&self, block_id: &str) -> String {
        self.current_virtual_block_id
            .clone()
            .unwrap_or_else(|| block_id.to_string())
    }

    pub fn state(&self, effective_id: &str) -> Option<&BlockState> {
        self.block_states.get(effective_id)
    }

    pub fn is_executed(&self, effective_id: &str) -> bool {
        self.executed_blocks.contains(effective_id)
    }

    pub fn mark_executed(&mut self, effective_id: String, state: BlockState) {
        self.executed_blocks.insert(effective_id.clone());
        self.block_states.insert(effective_id, state);
    }

    /// Resets every entry associated with `block_id` across all the maps a
    /// loop-iteration reset must clear (`spec.md` §4.3 step 4). Operates on
    /// the plain id; virtual ids inside parallels are untouched by loop
    /// resets (loops and parallels do not nest their reset semantics).
    pub fn reset_block(&mut self, block_id: &str) {
        self.executed_blocks.remove(block_id);
        self.block_states.remove(block_id);
        self.active_execution_path.remove(block_id);
        self.decisions.router.remove(block_id);
        self.decisions.condition.remove(block_id);
    }
}
