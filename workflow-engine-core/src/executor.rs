//! The executor: seeds the starting block, runs the layered tick loop
//! (ready-block scan, concurrent dispatch, serial commit, path/loop/parallel
//! bookkeeping), and exposes cancellation, pause/resume (also used for
//! debug stepping), and nested (`workflow`-kind block) execution.
//! Spec: `spec.md` §4.1, §5.
//!
//! The concurrent-dispatch/serial-commit split is the teacher's own
//! fiber-tick discipline in `vm.rs::tick_fiber` generalized from "one fiber
//! per tick" to "one concurrent layer per tick": work is computed against a
//! read-only snapshot, then applied back serially, so nothing ever observes
//! a half-committed layer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::connection;
use crate::context::{ExecutionContext, WaitBlockInfo};
use crate::error::{Result, ValidationError, WorkflowError};
use crate::handlers::{DefaultResponseFormatter, Handler, HandlerOutput, HandlerRegistry, ResponseFormatter};
use crate::input_resolver::{InputResolver, TemplateResolver};
use crate::loop_manager::LoopManager;
use crate::model::{Block, BlockId, BlockKind, BlockLog, BlockOutput, BlockState, FieldType, InputField, WorkflowGraph};
use crate::parallel_manager::ParallelManager;
use crate::path_tracker::PathTracker;
use crate::reporter::{NoopReporter, Reporter};
use crate::virtual_id;

/// Fetches a child workflow graph by id for `workflow`-kind blocks
/// (`spec.md` §4.1.4). The default, `NullWorkflowLoader`, rejects every
/// lookup: nested execution is opt-in and requires a caller-supplied loader.
#[async_trait]
pub trait WorkflowLoader: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<WorkflowGraph>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorkflowLoader;

#[async_trait]
impl WorkflowLoader for NullWorkflowLoader {
    async fn load(&self, workflow_id: &str) -> Result<WorkflowGraph> {
        Err(WorkflowError::MissingDeployment {
            workflow_id: workflow_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Runaway guard: aborts with `WorkflowError::RunawayGuard` past this
    /// many layer ticks (`spec.md` §5).
    pub max_layer_iterations: u32,
    /// Nested `workflow` block recursion limit (`spec.md` §4.1.4).
    pub max_nested_depth: u32,
    /// When set, the executor pauses after every layer instead of only at
    /// `wait` blocks, reusing the pause/resume machinery for single-step
    /// debugging.
    pub step_mode: bool,
    pub is_deployed_context: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_layer_iterations: 500,
            max_nested_depth: 10,
            step_mode: false,
            is_deployed_context: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub success: bool,
    pub output: JsonValue,
    pub block_logs: Vec<BlockLog>,
    pub error: Option<String>,
}

/// A suspended execution: everything needed to resume it later, with no
/// backing store (`spec.md` §1 rules out durable persistence — the caller
/// owns this value for as long as the pause should last).
pub struct PausedExecution {
    pub context: ExecutionContext,
    pub wait_info: Option<WaitBlockInfo>,
    starter_id: BlockId,
    initial_input: JsonValue,
}

/// A debug-stepped execution paused *before* a layer runs, per `spec.md`
/// §4.1.3's "return the pending set and wait for `continueExecution`."
/// Unlike [`PausedExecution`], `pending_blocks` have not executed yet.
pub struct DebugSession {
    pub context: ExecutionContext,
    pub pending_blocks: Vec<BlockId>,
    starter_id: BlockId,
    initial_input: JsonValue,
}

pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    Paused(PausedExecution),
    DebugPaused(DebugSession),
}

pub struct Executor {
    workflow_id: String,
    graph: WorkflowGraph,
    registry: HandlerRegistry,
    resolver: Arc<dyn InputResolver>,
    reporter: Arc<dyn Reporter>,
    loader: Arc<dyn WorkflowLoader>,
    response_formatter: Arc<dyn ResponseFormatter>,
    options: ExecutorOptions,
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

struct ExecutedBlock {
    effective_id: BlockId,
    original_id: BlockId,
    block: Block,
    resolved_input: JsonValue,
    output: BlockOutput,
    duration_ms: u64,
}

impl Executor {
    /// `workflow_id` is the caller-assigned identifier from `spec.md` §6's
    /// `new Executor(options)` (`options.workflow`) — a stable, human-assigned
    /// string, not something this crate generates. It flows into telemetry
    /// and the nested-workflow loader's depth bookkeeping.
    pub fn new(graph: WorkflowGraph, workflow_id: impl Into<String>) -> Result<Self> {
        validate_graph(&graph)?;
        Ok(Self {
            workflow_id: workflow_id.into(),
            graph,
            registry: HandlerRegistry::with_builtins(),
            resolver: Arc::new(TemplateResolver),
            reporter: Arc::new(NoopReporter),
            loader: Arc::new(NullWorkflowLoader),
            response_formatter: Arc::new(DefaultResponseFormatter),
            options: ExecutorOptions::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    /// `spec.md` §6's `static createFromPausedState(workflow, context, env,
    /// input, vars, ext) → {executor, context}`: builds a fresh `Executor`
    /// bound to a previously-paused, caller-persisted `ExecutionContext`
    /// (optionally patched with new env/workflow variables and an extension
    /// bag) rather than one created fresh by `execute`.
    pub fn create_from_paused_state(
        graph: WorkflowGraph,
        workflow_id: impl Into<String>,
        mut context: ExecutionContext,
        environment_variables: BTreeMap<String, JsonValue>,
        workflow_variables: BTreeMap<String, JsonValue>,
        context_extensions: BTreeMap<String, JsonValue>,
    ) -> Result<(Self, ExecutionContext)> {
        let executor = Self::new(graph, workflow_id)?;
        context.environment_variables.extend(environment_variables);
        context.workflow_variables.extend(workflow_variables);
        context.context_extensions.extend(context_extensions);
        Ok((executor, context))
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn InputResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn WorkflowLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_response_formatter(mut self, response_formatter: Arc<dyn ResponseFormatter>) -> Self {
        self.response_formatter = response_formatter;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Requests a cooperative pause, checked at the top of each tick
    /// alongside `is_cancelled` (`spec.md` §4.1.3's `pause()`). Distinct
    /// from the pause a `wait` handler requests via
    /// `context.shouldPauseAfterBlock`: this one can suspend a run between
    /// *any* two layers, not just after a specific block kind.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clears the flag set by `pause()`. Has no effect on an execution that
    /// already returned `ExecutionOutcome::Paused` — resuming that requires
    /// `resume_from_context`.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn execute(&self, input: JsonValue, start_block_id: Option<&str>) -> Result<ExecutionOutcome> {
        self.execute_scoped(input, start_block_id, BTreeMap::new(), BTreeMap::new(), false, 0).await
    }

    /// Re-enters the layer loop from a persisted context, per `spec.md`
    /// §6's `resumeFromContext(workflowId, context)`. The caller is expected
    /// to have already patched whatever block state needed patching (e.g.
    /// a wait block's resolved output) directly on `context` before calling
    /// this — see `resume_wait` for the common wait-block case.
    pub async fn resume_from_context(&self, mut context: ExecutionContext) -> Result<ExecutionOutcome> {
        let starter_id = self
            .graph
            .find_starter()
            .map(|b| b.id.clone())
            .unwrap_or_default();
        context.should_pause_after_block = false;
        context.wait_block_info = None;
        self.run(context, starter_id, JsonValue::Null).await
    }

    /// Convenience wrapper over `resume_from_context` for the common case of
    /// resuming a `wait`-block pause: injects `resume_input` as that block's
    /// output before re-entering the loop (`spec.md` §4.1.3).
    pub async fn resume_wait(&self, mut paused: PausedExecution, resume_input: JsonValue) -> Result<ExecutionOutcome> {
        if let Some(info) = paused.wait_info.take() {
            paused.context.mark_executed(
                info.block_id.clone(),
                BlockState {
                    output: BlockOutput::Ok(resume_input),
                    executed: true,
                    execution_time_ms: 0,
                },
            );
        }
        paused.context.should_pause_after_block = false;
        paused.context.wait_block_info = None;
        self.run(paused.context, paused.starter_id, paused.initial_input).await
    }

    /// Executes exactly `session.pending_blocks` (the set a debug-stepped
    /// run returned via `ExecutionOutcome::DebugPaused`), then falls back
    /// into the ordinary layer loop — which, under `step_mode`, immediately
    /// re-pauses before the next layer. `spec.md` §4.1.3's
    /// `continueExecution(pendingBlocks, context)`: takes the whole
    /// `DebugSession` a caller is actually holding rather than its private
    /// fields, which they have no way to supply separately.
    pub async fn continue_execution(&self, session: DebugSession) -> Result<ExecutionOutcome> {
        let DebugSession { mut context, pending_blocks, starter_id, initial_input } = session;
        let exec_id = context.execution_id.to_string();
        self.execute_layer(&pending_blocks, &mut context, &exec_id).await?;

        if context.should_pause_after_block {
            let wait_info = context.wait_block_info.clone();
            self.reporter.on_paused(&exec_id, wait_info.as_ref().map(|w| &w.block_id)).await;
            return Ok(ExecutionOutcome::Paused(PausedExecution {
                context,
                wait_info,
                starter_id,
                initial_input,
            }));
        }

        self.run(context, starter_id, initial_input).await
    }

    async fn execute_scoped(
        &self,
        input: JsonValue,
        start_block_id: Option<&str>,
        environment_variables: BTreeMap<String, JsonValue>,
        workflow_variables: BTreeMap<String, JsonValue>,
        is_child: bool,
        depth: u32,
    ) -> Result<ExecutionOutcome> {
        let starter = match start_block_id {
            Some(id) => self
                .graph
                .block(id)
                .filter(|b| b.enabled)
                .ok_or_else(|| WorkflowError::Validation(ValidationError::InvalidStartBlock(id.to_string())))?,
            None => self
                .graph
                .find_starter()
                .ok_or(WorkflowError::Validation(ValidationError::NoEntryPoint))?,
        };
        let starter_id = starter.id.clone();

        let mut ctx = ExecutionContext::new(self.workflow_id.clone(), environment_variables, workflow_variables, self.options.is_deployed_context);
        ctx.is_child_execution = is_child;
        ctx.depth = depth;
        ctx.active_execution_path.insert(starter_id.clone());

        // The starting block is not executed by a handler (`spec.md` §4.1):
        // its `BlockState` is populated directly from `workflowInput`, then
        // its direct successors are activated exactly as `PathTracker` would
        // activate them for any other regular block that just executed.
        seed_starter(starter, input.clone(), &mut ctx);
        PathTracker::update_execution_paths(&[starter_id.clone()], &self.graph, &mut ctx);

        tracing::info!(workflow_id = %self.workflow_id, execution_id = %ctx.execution_id, "execution starting");
        self.reporter.on_execution_start(&ctx.workflow_id, &ctx.execution_id.to_string()).await;
        self.run(ctx, starter_id, input).await
    }

    async fn run(&self, mut ctx: ExecutionContext, starter_id: BlockId, initial_input: JsonValue) -> Result<ExecutionOutcome> {
        let exec_id = ctx.execution_id.to_string();
        let mut iterations: u32 = 0;

        loop {
            if self.is_cancelled() {
                tracing::warn!(execution_id = %exec_id, "execution cancelled");
                self.reporter.on_cancelled(&exec_id).await;
                return Err(WorkflowError::Cancelled);
            }
            if self.is_paused() {
                tracing::info!(execution_id = %exec_id, "execution paused by pause()");
                return Ok(ExecutionOutcome::Paused(PausedExecution {
                    context: ctx,
                    wait_info: None,
                    starter_id,
                    initial_input,
                }));
            }

            let ready = self.compute_ready(&ctx);
            if ready.is_empty() {
                break;
            }
            tracing::debug!(execution_id = %exec_id, ready_count = ready.len(), "layer ready");

            iterations += 1;
            if iterations > self.options.max_layer_iterations {
                tracing::error!(execution_id = %exec_id, limit = self.options.max_layer_iterations, "runaway guard tripped");
                return Err(WorkflowError::RunawayGuard(self.options.max_layer_iterations));
            }

            // Debug stepping pauses *before* a layer runs (`spec.md` §4.1.3),
            // handing the caller the exact set `continueExecution` will run.
            if self.options.step_mode {
                return Ok(ExecutionOutcome::DebugPaused(DebugSession {
                    context: ctx,
                    pending_blocks: ready,
                    starter_id,
                    initial_input,
                }));
            }

            self.execute_layer(&ready, &mut ctx, &exec_id).await?;

            if ctx.should_pause_after_block {
                let wait_info = ctx.wait_block_info.clone();
                self.reporter.on_paused(&exec_id, wait_info.as_ref().map(|w| &w.block_id)).await;
                return Ok(ExecutionOutcome::Paused(PausedExecution {
                    context: ctx,
                    wait_info,
                    starter_id,
                    initial_input,
                }));
            }
        }

        let output = self.collect_final_output(&ctx);
        let result = ExecutionResult {
            execution_id: ctx.execution_id,
            success: !ctx.had_unrouted_error,
            output: output.clone(),
            block_logs: ctx.block_logs.clone(),
            error: None,
        };
        tracing::info!(execution_id = %exec_id, success = result.success, "execution complete");
        self.reporter.on_execution_complete(&exec_id, &output).await;
        Ok(ExecutionOutcome::Completed(result))
    }

    /// Dispatches exactly `ready` concurrently, then commits their outcomes
    /// and runs the post-layer bookkeeping (path tracking, loop/parallel
    /// iteration processing). Shared by the ordinary tick loop and
    /// `continue_execution`'s single forced layer.
    async fn execute_layer(&self, ready: &[BlockId], ctx: &mut ExecutionContext, exec_id: &str) -> Result<()> {
        // Active-block UI tracking is gated on `is_child_execution` so a
        // nested workflow's ticks don't stomp the parent's active-block
        // indicator; execution-level and error events still fire.
        if !ctx.is_child_execution {
            for id in ready {
                tracing::debug!(execution_id = %exec_id, block_id = %id, "dispatching block");
                self.reporter.on_block_start(exec_id, id).await;
            }
        }

        let ctx_snapshot = Arc::new(ctx.clone());
        let mut tasks = Vec::with_capacity(ready.len());
        for effective_id in ready {
            let ctx_snapshot = ctx_snapshot.clone();
            let effective_id = effective_id.clone();
            tasks.push(async move { self.dispatch(effective_id, ctx_snapshot).await });
        }
        let outcomes = join_all(tasks).await;

        let mut executed_ids = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let executed = outcome?;
            let is_error = executed.output.is_err();
            if is_error {
                let has_error_route = self.graph.outgoing(&executed.original_id).any(|c| c.handle() == crate::model::handle::ERROR);
                if has_error_route {
                    tracing::warn!(execution_id = %exec_id, block_id = %executed.effective_id, "block failed, recovered via error handle");
                } else {
                    tracing::error!(execution_id = %exec_id, block_id = %executed.effective_id, "block failed with no error route");
                    ctx.had_unrouted_error = true;
                }
            }

            if !ctx.is_child_execution {
                self.reporter.on_block_finish(exec_id, &executed.effective_id, !is_error).await;
            }
            if let BlockOutput::Err { message, .. } = &executed.output {
                self.reporter.on_block_error(exec_id, &executed.effective_id, message).await;
            }

            if executed.block.kind == BlockKind::Wait {
                if let BlockOutput::Ok(v) = &executed.output {
                    if v.get("paused").and_then(|p| p.as_bool()).unwrap_or(false) {
                        ctx.should_pause_after_block = true;
                        ctx.wait_block_info = Some(WaitBlockInfo {
                            block_id: executed.effective_id.clone(),
                            reason: v.get("reason").and_then(|r| r.as_str()).unwrap_or_default().to_string(),
                            payload: v.get("payload").cloned().unwrap_or(JsonValue::Null),
                        });
                    }
                }
            }

            ctx.block_logs.push(BlockLog {
                block_id: executed.original_id.clone(),
                block_name: executed.block.metadata.name.clone(),
                kind: executed.block.kind.clone(),
                started_at_ms: 0,
                ended_at_ms: 0,
                duration_ms: executed.duration_ms,
                success: !is_error,
                input: executed.resolved_input.clone(),
                output: executed.output.as_json(),
                error: if let BlockOutput::Err { message, .. } = &executed.output { Some(message.clone()) } else { None },
            });
            // A loop-body block's output also feeds the loop's terminal
            // aggregate (`spec.md` §4.1.1 step 6 / §4.3): appended under
            // `iteration_<N-1>`, where N is the loop's current 1-based tick.
            if let Some(loop_def) = self.graph.loop_containing(&executed.original_id) {
                if !ctx.completed_loops.contains(&loop_def.id) {
                    let iteration = ctx.loop_iterations.get(&loop_def.id).copied().unwrap_or(1).saturating_sub(1);
                    LoopManager::store_iteration_result(ctx, &loop_def.id, iteration, executed.output.as_json());
                }
            }

            ctx.mark_executed(
                executed.effective_id.clone(),
                BlockState {
                    output: executed.output,
                    executed: true,
                    execution_time_ms: executed.duration_ms,
                },
            );
            executed_ids.push(executed.effective_id);
        }

        PathTracker::update_execution_paths(&executed_ids, &self.graph, ctx);
        LoopManager::initialize_newly_executed(&self.graph, ctx)?;
        LoopManager::process_loop_iterations(&self.graph, ctx)?;
        ParallelManager::initialize_newly_executed(&self.graph, ctx);
        ParallelManager::process_parallel_completions(&self.graph, ctx);
        Ok(())
    }

    /// Every real (non-virtual) block in the active path that hasn't
    /// executed and has every incoming connection's dependency met, plus
    /// every parallel-iteration virtual id in the same state gated by
    /// `ParallelManager::is_ready`.
    fn compute_ready(&self, ctx: &ExecutionContext) -> Vec<BlockId> {
        let mut ready = Vec::new();

        for block in &self.graph.blocks {
            if !block.enabled || ctx.is_executed(&block.id) || !ctx.active_execution_path.contains(&block.id) {
                continue;
            }
            let deps_met = self
                .graph
                .incoming(&block.id)
                .all(|c| connection::dependency_met(c, &self.graph, ctx, &c.source));
            if deps_met {
                ready.push(block.id.clone());
            }
        }

        for vid in ctx.parallel_block_mapping.keys() {
            if ctx.is_executed(vid) || !ctx.active_execution_path.contains(vid) {
                continue;
            }
            if ParallelManager::is_ready(vid, &self.graph, ctx) {
                ready.push(vid.clone());
            }
        }

        ready
    }

    async fn dispatch(&self, effective_id: BlockId, ctx: Arc<ExecutionContext>) -> Result<ExecutedBlock> {
        let original_id = virtual_id::extract_original_id(&effective_id).to_string();
        let block = self
            .graph
            .block(&original_id)
            .cloned()
            .expect("ready block id always resolves to a graph block");

        let started = std::time::Instant::now();

        if block.kind == BlockKind::Workflow {
            let output = self.execute_nested(&block, &effective_id, &ctx).await?;
            return Ok(ExecutedBlock {
                duration_ms: started.elapsed().as_millis() as u64,
                effective_id,
                original_id,
                block,
                resolved_input: JsonValue::Null,
                output,
            });
        }

        let resolved_input = self.resolver.resolve(&block.config, &effective_id, &self.graph, &ctx);

        let handler = self
            .registry
            .find(&block)
            .ok_or_else(|| WorkflowError::NoHandler {
                block_id: block.id.clone(),
                kind: format!("{:?}", block.kind),
            })?
            .clone();

        let output = self.run_handler(handler, &block, &resolved_input, &ctx, &effective_id).await?;

        Ok(ExecutedBlock {
            duration_ms: started.elapsed().as_millis() as u64,
            effective_id,
            original_id,
            block,
            resolved_input,
            output,
        })
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn Handler>,
        block: &Block,
        resolved_input: &JsonValue,
        ctx: &ExecutionContext,
        effective_id: &str,
    ) -> Result<BlockOutput> {
        let output = match handler.execute(block, resolved_input, ctx).await? {
            HandlerOutput::Output(output) => output,
            HandlerOutput::Streaming(mut streaming) => {
                let exec_id = ctx.execution_id.to_string();
                let block_id = effective_id.to_string();
                while let Some(chunk) = streaming.chunks.recv().await {
                    self.reporter.on_block_chunk(&exec_id, &block_id, &chunk).await;
                }
                streaming
                    .result
                    .await
                    .map_err(|e| WorkflowError::Internal(anyhow::anyhow!("streaming task panicked: {e}")))??
            }
        };

        // A declared `responseFormat` projects the drained stream's text
        // content into structured output (`spec.md` §4.1.2 / §9), whether or
        // not this particular handler actually streamed.
        Ok(match &block.metadata.response_format {
            Some(response_format) => self.response_formatter.project(output, response_format),
            None => output,
        })
    }

    async fn execute_nested(&self, block: &Block, effective_id: &str, ctx: &ExecutionContext) -> Result<BlockOutput> {
        let depth = ctx.depth + 1;
        if depth > self.options.max_nested_depth {
            return Err(WorkflowError::DepthExceeded {
                block_id: block.id.clone(),
                limit: self.options.max_nested_depth,
            });
        }

        let workflow_id = block
            .config
            .get("workflowId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WorkflowError::Internal(anyhow::anyhow!("workflow block '{}' has no workflowId", block.id)))?
            .to_string();

        // `inputMapping` takes precedence over a plain `input` field when
        // both are present (`spec.md` §9 open question, resolved in
        // DESIGN.md).
        let raw_mapping = block
            .config
            .get("inputMapping")
            .or_else(|| block.config.get("input"))
            .cloned()
            .unwrap_or(JsonValue::Null);
        let mapped_input = self.resolver.resolve(&raw_mapping, effective_id, &self.graph, ctx);

        // The child's human-readable name for trace-span renaming and error
        // wrapping (`spec.md` §4.1.4); falls back to the workflow id when a
        // block doesn't carry one.
        let child_name = block
            .config
            .get("workflowName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| workflow_id.clone());

        let child_graph = self.loader.load(&workflow_id).await?;
        let child = Executor {
            workflow_id: workflow_id.clone(),
            graph: child_graph,
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            reporter: self.reporter.clone(),
            loader: self.loader.clone(),
            response_formatter: self.response_formatter.clone(),
            options: self.options.clone(),
            cancelled: self.cancelled.clone(),
            // A nested run's pause flag is independent of the parent's: it
            // is never set (nested pause is unsupported, see below) and the
            // parent's own `pause()` is re-checked once control returns to
            // the parent's own tick loop, not inherited mid-child-run.
            paused: Arc::new(AtomicBool::new(false)),
        };

        let outcome = Box::pin(child.execute_scoped(mapped_input, None, BTreeMap::new(), BTreeMap::new(), true, depth)).await?;
        match outcome {
            ExecutionOutcome::Completed(result) => Ok(map_child_output_to_parent(&workflow_id, &child_name, result)),
            ExecutionOutcome::Paused(_) | ExecutionOutcome::DebugPaused(_) => Ok(BlockOutput::Err {
                message: format!("Error in child workflow \"{child_name}\": paused; nested pause/resume is not supported"),
                status: 500,
            }),
        }
    }

    fn collect_final_output(&self, ctx: &ExecutionContext) -> JsonValue {
        let mut responses: Vec<(BlockId, JsonValue)> = ctx
            .executed_blocks
            .iter()
            .filter_map(|id| {
                let original = virtual_id::extract_original_id(id);
                let block = self.graph.block(original)?;
                if block.kind != BlockKind::Response {
                    return None;
                }
                ctx.state(id).map(|s| (original.to_string(), s.output.as_json()))
            })
            .collect();
        responses.sort_by(|a, b| a.0.cmp(&b.0));

        match responses.len() {
            0 => JsonValue::Null,
            1 => responses.into_iter().next().unwrap().1,
            _ => JsonValue::Object(responses.into_iter().collect()),
        }
    }
}

/// `spec.md` §4.1.4/§8's `mapChildOutputToParent`: wraps a completed child
/// execution into the parent block's output, attaching the child's own
/// block-level trace (renamed with the child's name) and, on failure,
/// wrapping the message with the child's name for readability.
fn map_child_output_to_parent(workflow_id: &str, child_name: &str, result: ExecutionResult) -> BlockOutput {
    let spans = child_trace_spans(child_name, &result);
    if result.success {
        BlockOutput::Ok(serde_json::json!({
            "success": true,
            "result": result.output,
            "childWorkflowName": child_name,
            "childTraceSpans": spans,
        }))
    } else {
        let original = result.error.unwrap_or_else(|| format!("child workflow '{workflow_id}' failed"));
        BlockOutput::Err {
            message: format!("Error in child workflow \"{child_name}\": {original}"),
            status: 500,
        }
    }
}

fn child_trace_spans(child_name: &str, result: &ExecutionResult) -> Vec<JsonValue> {
    result
        .block_logs
        .iter()
        .map(|log| {
            let leaf = log.block_name.clone().unwrap_or_else(|| log.block_id.clone());
            serde_json::json!({
                "name": format!("{child_name}::{leaf}"),
                "blockId": log.block_id,
                "durationMs": log.duration_ms,
            })
        })
        .collect()
}

/// Populates the starting block's `BlockState` directly from
/// `workflow_input` instead of running it through a handler (`spec.md`
/// §4.1's starting-block seeding), and records it in `block_logs` so it
/// appears in the trace like any other executed block.
fn seed_starter(starter: &Block, workflow_input: JsonValue, ctx: &mut ExecutionContext) {
    let effective = if starter.metadata.input_format.is_empty() {
        workflow_input.clone()
    } else {
        build_structured_input(&starter.metadata.input_format, &workflow_input)
    };

    let mut output = match starter.kind {
        BlockKind::ApiTrigger | BlockKind::InputTrigger => spread_and_mirror(effective),
        BlockKind::ChatTrigger => chat_shape(&effective),
        _ => effective,
    };

    // `files` passes through untouched regardless of trigger kind, on top
    // of whatever shaping already happened above.
    if let Some(files) = workflow_input.get("files") {
        if let JsonValue::Object(ref mut map) = output {
            map.insert("files".to_string(), files.clone());
        }
    }

    ctx.block_logs.push(BlockLog {
        block_id: starter.id.clone(),
        block_name: starter.metadata.name.clone(),
        kind: starter.kind.clone(),
        started_at_ms: 0,
        ended_at_ms: 0,
        duration_ms: 0,
        success: true,
        input: workflow_input.clone(),
        output: output.clone(),
        error: None,
    });

    if let Some(files) = workflow_input.get("files") {
        ctx.block_logs.push(BlockLog {
            block_id: starter.id.clone(),
            block_name: starter.metadata.name.clone(),
            kind: starter.kind.clone(),
            started_at_ms: 0,
            ended_at_ms: 0,
            duration_ms: 0,
            success: true,
            input: files.clone(),
            output: files.clone(),
            error: None,
        });
    }

    ctx.mark_executed(starter.id.clone(), BlockState { output: BlockOutput::Ok(output), executed: true, execution_time_ms: 0 });
}

fn build_structured_input(fields: &[InputField], raw: &JsonValue) -> JsonValue {
    let mut out = serde_json::Map::with_capacity(fields.len());
    for field in fields {
        out.insert(field.name.clone(), coerce_field(&field.field_type, raw.get(&field.name)));
    }
    JsonValue::Object(out)
}

fn coerce_field(field_type: &FieldType, raw: Option<&JsonValue>) -> JsonValue {
    let Some(raw) = raw else {
        return JsonValue::Null;
    };
    match field_type {
        FieldType::String => match raw {
            JsonValue::String(s) => JsonValue::String(s.clone()),
            JsonValue::Null => JsonValue::Null,
            other => JsonValue::String(other.to_string()),
        },
        FieldType::Number => match raw {
            JsonValue::Number(n) => JsonValue::Number(n.clone()),
            JsonValue::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            _ => JsonValue::Null,
        },
        FieldType::Boolean => match raw {
            JsonValue::Bool(b) => JsonValue::Bool(*b),
            JsonValue::String(s) => JsonValue::Bool(s == "true"),
            other => JsonValue::Bool(is_truthy(other)),
        },
        FieldType::Object => match raw {
            v @ JsonValue::Object(_) => v.clone(),
            _ => JsonValue::Null,
        },
        FieldType::Array => match raw {
            v @ JsonValue::Array(_) => v.clone(),
            _ => JsonValue::Null,
        },
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

/// `api_trigger`/`input_trigger` shaping (`spec.md` §4.1): the object input
/// spread at root, mirrored whole under `input`.
fn spread_and_mirror(effective: JsonValue) -> JsonValue {
    match effective {
        JsonValue::Object(map) => {
            let mut out = map.clone();
            out.insert("input".to_string(), JsonValue::Object(map));
            JsonValue::Object(out)
        }
        other => serde_json::json!({ "input": other }),
    }
}

/// `chat_trigger` shaping: normalizes whatever shape `workflowInput` arrived
/// in into `{input, conversationId, files}`.
fn chat_shape(effective: &JsonValue) -> JsonValue {
    let chat_input = effective
        .get("input")
        .or_else(|| effective.get("message"))
        .cloned()
        .unwrap_or_else(|| effective.clone());
    serde_json::json!({
        "input": chat_input,
        "conversationId": effective.get("conversationId").cloned().unwrap_or(JsonValue::Null),
        "files": effective.get("files").cloned().unwrap_or_else(|| JsonValue::Array(Vec::new())),
    })
}

fn validate_graph(graph: &WorkflowGraph) -> Result<()> {
    for conn in &graph.connections {
        if graph.block(&conn.source).is_none() {
            return Err(WorkflowError::Validation(ValidationError::DanglingConnection(conn.source.clone())));
        }
        if graph.block(&conn.target).is_none() {
            return Err(WorkflowError::Validation(ValidationError::DanglingConnection(conn.target.clone())));
        }
    }

    for loop_def in graph.loops.values() {
        for node in &loop_def.nodes {
            if graph.block(node).is_none() {
                return Err(WorkflowError::Validation(ValidationError::LoopReferencesUnknownBlock {
                    loop_id: loop_def.id.clone(),
                    block_id: node.clone(),
                }));
            }
        }
        if loop_def.loop_type == crate::model::LoopType::For && loop_def.iterations <= 0 {
            return Err(WorkflowError::Validation(ValidationError::InvalidLoopIterations {
                loop_id: loop_def.id.clone(),
                iterations: loop_def.iterations,
            }));
        }
    }

    for parallel in graph.parallels.values() {
        for node in &parallel.nodes {
            if graph.block(node).is_none() {
                return Err(WorkflowError::Validation(ValidationError::ParallelReferencesUnknownBlock {
                    parallel_id: parallel.id.clone(),
                    block_id: node.clone(),
                }));
            }
        }
    }

    if graph.find_starter().is_none() {
        return Err(WorkflowError::Validation(ValidationError::NoEntryPoint));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockKind, Connection};

    fn simple_graph() -> WorkflowGraph {
        WorkflowGraph {
            blocks: vec![
                Block { id: "start".into(), kind: BlockKind::Starter, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
                Block { id: "resp".into(), kind: BlockKind::Response, enabled: true, config: serde_json::json!("<start.message>"), metadata: Default::default() },
            ],
            connections: vec![Connection { source: "start".into(), target: "resp".into(), source_handle: None }],
            loops: Default::default(),
            parallels: Default::default(),
        }
    }

    #[tokio::test]
    async fn runs_start_to_response() {
        let executor = Executor::new(simple_graph(), "simple").unwrap();
        let outcome = executor.execute(serde_json::json!({"message": "hi"}), None).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed(result) => {
                assert!(result.success);
                assert_eq!(result.output, serde_json::json!("hi"));
            }
            ExecutionOutcome::Paused(_) => panic!("did not expect a pause"),
            ExecutionOutcome::DebugPaused(_) => panic!("did not expect a debug pause"),
        }
    }

    #[tokio::test]
    async fn wait_block_pauses_and_resumes() {
        let graph = WorkflowGraph {
            blocks: vec![
                Block { id: "start".into(), kind: BlockKind::Starter, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
                Block { id: "w".into(), kind: BlockKind::Wait, enabled: true, config: serde_json::json!({"reason": "approval"}), metadata: Default::default() },
                Block { id: "resp".into(), kind: BlockKind::Response, enabled: true, config: serde_json::json!("<w.output>"), metadata: Default::default() },
            ],
            connections: vec![
                Connection { source: "start".into(), target: "w".into(), source_handle: None },
                Connection { source: "w".into(), target: "resp".into(), source_handle: None },
            ],
            loops: Default::default(),
            parallels: Default::default(),
        };
        let executor = Executor::new(graph, "wait-demo").unwrap();
        let outcome = executor.execute(serde_json::json!({}), None).await.unwrap();
        let paused = match outcome {
            ExecutionOutcome::Paused(p) => p,
            ExecutionOutcome::Completed(_) => panic!("expected a pause at the wait block"),
            ExecutionOutcome::DebugPaused(_) => panic!("did not expect a debug pause"),
        };
        assert_eq!(paused.wait_info.as_ref().unwrap().reason, "approval");

        let outcome = executor.resume_wait(paused, serde_json::json!({"approved": true})).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed(result) => assert_eq!(result.output, serde_json::json!({"approved": true})),
            ExecutionOutcome::Paused(_) => panic!("did not expect a second pause"),
            ExecutionOutcome::DebugPaused(_) => panic!("did not expect a debug pause"),
        }
    }

    #[tokio::test]
    async fn debug_stepping_advances_one_layer_at_a_time() {
        let executor = Executor::new(simple_graph(), "debug-demo")
            .unwrap()
            .with_options(ExecutorOptions { step_mode: true, ..ExecutorOptions::default() });
        let outcome = executor.execute(serde_json::json!({"message": "hi"}), None).await.unwrap();
        let session = match outcome {
            ExecutionOutcome::DebugPaused(session) => session,
            ExecutionOutcome::Completed(_) => panic!("expected a debug pause before the first layer"),
            ExecutionOutcome::Paused(_) => panic!("did not expect a wait pause"),
        };
        assert_eq!(session.pending_blocks, vec!["resp".to_string()]);

        let outcome = executor.continue_execution(session).await.unwrap();
        match outcome {
            ExecutionOutcome::Completed(result) => assert_eq!(result.output, serde_json::json!("hi")),
            ExecutionOutcome::Paused(_) => panic!("did not expect a wait pause"),
            ExecutionOutcome::DebugPaused(_) => panic!("expected completion after the only remaining layer"),
        }
    }

    #[test]
    fn successful_child_with_no_blocks_round_trips_with_empty_spans() {
        let result = ExecutionResult {
            execution_id: uuid::Uuid::new_v4(),
            success: true,
            output: serde_json::json!({"answer": 42}),
            error: None,
            block_logs: Vec::new(),
        };
        let output = map_child_output_to_parent("child-wf", "My Child", result);
        match output {
            BlockOutput::Ok(value) => assert_eq!(
                value,
                serde_json::json!({
                    "success": true,
                    "result": {"answer": 42},
                    "childWorkflowName": "My Child",
                    "childTraceSpans": [],
                })
            ),
            BlockOutput::Err { .. } => panic!("expected a successful mapping"),
        }
    }

    #[test]
    fn failed_child_wraps_message_with_child_name() {
        let result = ExecutionResult {
            execution_id: uuid::Uuid::new_v4(),
            success: false,
            output: JsonValue::Null,
            error: Some("boom".to_string()),
            block_logs: Vec::new(),
        };
        let output = map_child_output_to_parent("child-wf", "My Child", result);
        match output {
            BlockOutput::Err { message, .. } => {
                assert_eq!(message, "Error in child workflow \"My Child\": boom");
            }
            BlockOutput::Ok(_) => panic!("expected a failure mapping"),
        }
    }
}
