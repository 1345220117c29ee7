//! Error taxonomy, per `spec.md` §7 and `SPEC_FULL.md` §7.
//!
//! Grounded in the pack's `ob-poc-agent-review/rust/src/error.rs` idiom: one
//! `thiserror`-derived enum per concern with `#[from]` conversions, rather
//! than the teacher core crate's single flat `anyhow::Error` — the spec's
//! error taxonomy (§7) is explicit enough to deserve typed variants the
//! caller can match on.

use thiserror::Error;

use crate::model::BlockId;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("start block '{0}' is disabled or does not exist")]
    InvalidStartBlock(BlockId),

    #[error("workflow has no enabled starter block and no trigger block")]
    NoEntryPoint,

    #[error("connection references unknown block '{0}'")]
    DanglingConnection(BlockId),

    #[error("loop '{loop_id}' has non-positive iterations ({iterations})")]
    InvalidLoopIterations { loop_id: String, iterations: i64 },

    #[error("forEach loop '{0}' requires a non-empty item collection")]
    EmptyForEach(String),

    #[error("loop '{loop_id}' references unknown block '{block_id}'")]
    LoopReferencesUnknownBlock { loop_id: String, block_id: BlockId },

    #[error("parallel '{parallel_id}' references unknown block '{block_id}'")]
    ParallelReferencesUnknownBlock {
        parallel_id: String,
        block_id: BlockId,
    },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("block '{block_id}' failed: {message}")]
    Handler {
        block_id: BlockId,
        message: String,
        status: i64,
    },

    #[error("execution exceeded {0} layer iterations (possible infinite loop)")]
    RunawayGuard(u32),

    #[error("nested workflow depth exceeded limit of {limit} at block '{block_id}'")]
    DepthExceeded { block_id: BlockId, limit: u32 },

    #[error("workflow '{workflow_id}' has no published deployment")]
    MissingDeployment { workflow_id: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("no handler registered that can handle block '{block_id}' (kind {kind})")]
    NoHandler { block_id: BlockId, kind: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
