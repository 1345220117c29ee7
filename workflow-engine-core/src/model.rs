//! The workflow graph data model: blocks, connections, loops, and parallels.
//!
//! This mirrors the teacher's separation of a closed IR enum (`IRNode` in
//! `compiler/ir.rs`) from a flat `Vec`-backed container, but keeps the graph
//! itself as plain vectors/maps rather than a `petgraph::DiGraph` — a
//! `DiGraph` view is built on demand wherever a component needs BFS or
//! reachability (`loop_manager`, `parallel_manager`), not carried as the
//! primary storage.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub type BlockId = String;
pub type LoopId = String;
pub type ParallelId = String;

/// The kind of a block. Closed over the kinds this engine knows how to
/// dispatch; `Generic` is the escape hatch for kinds consumed entirely by a
/// caller-registered handler (the spec's kind list is explicitly open-ended).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Starter,
    ApiTrigger,
    InputTrigger,
    ChatTrigger,
    Agent,
    Router,
    Condition,
    Function,
    Api,
    Evaluator,
    Response,
    Loop,
    Parallel,
    Wait,
    Workflow,
    #[serde(untagged)]
    Generic(String),
}

impl BlockKind {
    /// True for blocks that represent an entry point into the graph.
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            BlockKind::Starter
                | BlockKind::ApiTrigger
                | BlockKind::InputTrigger
                | BlockKind::ChatTrigger
        )
    }

    /// True for blocks whose internal path activation is self-managed
    /// (PathTracker must not recurse through these automatically).
    pub fn is_flow_control(&self) -> bool {
        matches!(self, BlockKind::Loop | BlockKind::Parallel)
    }

    pub fn is_routing(&self) -> bool {
        matches!(self, BlockKind::Router | BlockKind::Condition)
    }
}

/// One field of a trigger block's declared input schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// A node in the workflow graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub kind: BlockKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opaque handler configuration (e.g. agent prompt, router targets).
    #[serde(default)]
    pub config: JsonValue,
    #[serde(default)]
    pub metadata: BlockMetadata,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub name: Option<String>,
    /// Declared input schema for trigger blocks (§4.1 starting-block seeding).
    #[serde(default)]
    pub input_format: Vec<InputField>,
    /// A regular block with `trigger_mode = true` counts as a trigger for
    /// validation purposes even though its `kind` is not one of the trigger
    /// kinds (spec.md §4.1 Validation).
    #[serde(default)]
    pub trigger_mode: bool,
    /// Present on agent-ish blocks that may stream; read by the executor's
    /// streaming integration (§4.1.2).
    pub response_format: Option<JsonValue>,
}

/// Reserved source handle names. Anything else is a custom handle (e.g. a
/// router's or condition's dynamic target/clause handle).
pub mod handle {
    pub const SOURCE: &str = "source";
    pub const ERROR: &str = "error";
    pub const LOOP_START: &str = "loop-start-source";
    pub const LOOP_END: &str = "loop-end-source";
    pub const PARALLEL_START: &str = "parallel-start-source";
    pub const PARALLEL_END: &str = "parallel-end-source";
    pub const CONDITION_PREFIX: &str = "condition-";
}

/// A directed edge between two blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub source: BlockId,
    pub target: BlockId,
    /// `None` is equivalent to `Some("source")` (the unset/default handle).
    #[serde(default, rename = "sourceHandle")]
    pub source_handle: Option<String>,
}

impl Connection {
    /// The normalized handle, defaulting unset handles to `"source"`.
    pub fn handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(handle::SOURCE)
    }

    pub fn condition_id(&self) -> Option<&str> {
        self.handle().strip_prefix(handle::CONDITION_PREFIX)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopType {
    For,
    ForEach,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Loop {
    pub id: LoopId,
    pub nodes: Vec<BlockId>,
    pub iterations: i64,
    pub loop_type: LoopType,
    /// Array, object, or JSON-encoded string; required (non-empty) when
    /// `loop_type == ForEach`.
    #[serde(default)]
    pub for_each_items: Option<JsonValue>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Parallel {
    pub id: ParallelId,
    pub nodes: Vec<BlockId>,
    /// Resolved at runtime from `config.count` or a collection's length;
    /// `None` until the parallel block has executed once.
    #[serde(default)]
    pub parallel_count: Option<u32>,
    /// Optional pre-bound collection to distribute across iterations.
    #[serde(default)]
    pub distribution: Option<JsonValue>,
}

/// The immutable graph submitted to `Executor::new`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub blocks: Vec<Block>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub loops: BTreeMap<LoopId, Loop>,
    #[serde(default)]
    pub parallels: BTreeMap<ParallelId, Parallel>,
}

impl WorkflowGraph {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn outgoing<'a, 'b>(&'a self, id: &'b str) -> impl Iterator<Item = &'a Connection> + use<'a> {
        let id = id.to_owned();
        self.connections.iter().filter(move |c| c.source == id)
    }

    pub fn incoming<'a, 'b>(&'a self, id: &'b str) -> impl Iterator<Item = &'a Connection> + use<'a> {
        let id = id.to_owned();
        self.connections.iter().filter(move |c| c.target == id)
    }

    /// The starter/trigger block the executor should seed, if not overridden
    /// by an explicit `start_block_id`.
    pub fn find_starter(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| {
            b.enabled
                && (b.kind == BlockKind::Starter
                    || b.kind.is_trigger()
                    || b.metadata.trigger_mode)
        })
    }

    /// The loop containing `block_id`, if any.
    pub fn loop_containing(&self, block_id: &str) -> Option<&Loop> {
        self.loops.values().find(|l| l.nodes.iter().any(|n| n == block_id))
    }

    pub fn all_loops_containing<'a>(&'a self, block_id: &str) -> Vec<&'a Loop> {
        self.loops
            .values()
            .filter(|l| l.nodes.iter().any(|n| n == block_id))
            .collect()
    }

    pub fn parallel_containing(&self, block_id: &str) -> Option<&Parallel> {
        self.parallels
            .values()
            .find(|p| p.nodes.iter().any(|n| n == block_id))
    }
}

// ─── Block state ───────────────────────────────────────────────

/// The tagged result of running a block, per `spec.md` §9 — never sniffed
/// for the presence of an `error` field. Adjacently tagged rather than
/// internally tagged: an internal `status` tag would collide with `Err`'s
/// own `status` field, and can't represent an `Ok` payload that isn't a
/// JSON object.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum BlockOutput {
    Ok(JsonValue),
    Err { message: String, status: i64 },
}

impl BlockOutput {
    pub fn is_err(&self) -> bool {
        matches!(self, BlockOutput::Err { .. })
    }

    pub fn as_json(&self) -> JsonValue {
        match self {
            BlockOutput::Ok(v) => v.clone(),
            BlockOutput::Err { message, status } => {
                serde_json::json!({ "error": message, "status": status })
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockState {
    pub output: BlockOutput,
    pub executed: bool,
    pub execution_time_ms: u64,
}

/// One entry in the execution trace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockLog {
    pub block_id: BlockId,
    pub block_name: Option<String>,
    pub kind: BlockKind,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub duration_ms: u64,
    pub success: bool,
    pub input: JsonValue,
    pub output: JsonValue,
    pub error: Option<String>,
}
