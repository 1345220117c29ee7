//! A deterministic, layered scheduler for directed workflow graphs: routing,
//! loops, parallels, streaming, pause/resume, debug stepping, and nested
//! workflow execution. See `SPEC_FULL.md` at the workspace root.

pub mod connection;
pub mod context;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod input_resolver;
pub mod loop_manager;
pub mod model;
pub mod parallel_manager;
pub mod path_tracker;
pub mod reporter;
pub mod virtual_id;

pub use context::ExecutionContext;
pub use error::{Result, ValidationError, WorkflowError};
pub use executor::{DebugSession, ExecutionOutcome, ExecutionResult, Executor, ExecutorOptions, PausedExecution, WorkflowLoader};
pub use handlers::{DefaultResponseFormatter, Handler, HandlerOutput, HandlerRegistry, ResponseFormatter};
pub use model::{Block, BlockKind, BlockOutput, Connection, Loop, Parallel, WorkflowGraph};
pub use reporter::{NoopReporter, Reporter};
