//! `InputResolver` — resolves a block's declared input expressions
//! (`<blockName.field>`, `<start.input>`, `<loopName.currentItem>`, ...)
//! against block outputs, workflow/environment variables, and loop/parallel
//! iteration context. Spec: `spec.md` §4.5.
//!
//! `spec.md` §4.5 states the contract rather than an implementation; this
//! follows the teacher's pattern of pairing a narrow trait with one
//! reference implementation (`Reporter`/`NoopReporter`), grounded in the
//! string-templating style of `vm.rs`'s `Value`-to-string coercions.

use serde_json::Value as JsonValue;

use crate::context::ExecutionContext;
use crate::model::{BlockId, WorkflowGraph};

/// Resolves template expressions embedded in a block's raw `config` against
/// an `ExecutionContext`. Implementations may add caching, custom
/// expression dialects, or host-specific variable sources; the default
/// (`TemplateResolver`) covers the `<a.b.c>` angle-bracket dialect from the
/// spec.
pub trait InputResolver: Send + Sync {
    /// Resolves every `<...>` reference inside `value`, recursively over
    /// objects/arrays, returning a new value with references substituted.
    /// `effective_id` is the (possibly virtual) id of the block being
    /// resolved for, used to scope `currentItem`/loop lookups when the block
    /// sits inside a loop or parallel iteration.
    fn resolve(&self, value: &JsonValue, effective_id: &str, graph: &WorkflowGraph, ctx: &ExecutionContext) -> JsonValue;
}

/// The reference `<a.b.c>` dialect: `<start.input>`, `<blockName.output>`,
/// `<blockName.someField>`, `<loopName.currentItem>`, `<loopName.index>`,
/// `<variables.x>`, `<environment.x>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateResolver;

impl InputResolver for TemplateResolver {
    fn resolve(&self, value: &JsonValue, effective_id: &str, graph: &WorkflowGraph, ctx: &ExecutionContext) -> JsonValue {
        match value {
            JsonValue::String(s) => self.resolve_string(s, effective_id, graph, ctx),
            JsonValue::Array(items) => JsonValue::Array(
                items.iter().map(|v| self.resolve(v, effective_id, graph, ctx)).collect(),
            ),
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v, effective_id, graph, ctx)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl TemplateResolver {
    /// If the whole string is a single `<...>` reference, returns the
    /// resolved JSON value directly (preserving type fidelity for
    /// object/array references). Otherwise substitutes every reference found
    /// inside the string with its stringified value.
    fn resolve_string(&self, s: &str, effective_id: &str, graph: &WorkflowGraph, ctx: &ExecutionContext) -> JsonValue {
        if let Some(path) = whole_reference(s) {
            return self
                .lookup(path, effective_id, graph, ctx)
                .unwrap_or(JsonValue::Null);
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find('<') {
            let Some(end_rel) = rest[start..].find('>') else {
                out.push_str(rest);
                rest = "";
                break;
            };
            let end = start + end_rel;
            out.push_str(&rest[..start]);
            let path = &rest[start + 1..end];
            let resolved = self.lookup(path, effective_id, graph, ctx);
            match resolved {
                Some(JsonValue::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
                None => out.push_str(&rest[start..=end]),
            }
            rest = &rest[end + 1..];
        }
        out.push_str(rest);
        JsonValue::String(out)
    }

    fn lookup(&self, path: &str, effective_id: &str, graph: &WorkflowGraph, ctx: &ExecutionContext) -> Option<JsonValue> {
        let mut parts = path.splitn(2, '.');
        let head = parts.next()?;
        let tail = parts.next();

        match head {
            "variables" | "workflowVariables" => tail.and_then(|field| ctx.workflow_variables.get(field).cloned()),
            "environment" | "environmentVariables" => {
                tail.and_then(|field| ctx.environment_variables.get(field).cloned())
            }
            "start" => {
                let source_id = graph.find_starter().map(|b| b.id.clone())?;
                self.field_of(&source_id, tail, effective_id, ctx)
            }
            _ => {
                if let Some(loop_def) = graph.loops.values().find(|l| matches_name(graph, &l.id, head)) {
                    // `currentItem`/`index` resolve against the live iteration
                    // context; anything else (a bare reference, `.output`, or
                    // a field of the completed aggregate) falls through to the
                    // loop block's own stored output, same as any other block.
                    return self
                        .loop_field(loop_def.id.as_str(), tail, ctx)
                        .or_else(|| self.field_of(&loop_def.id, tail, effective_id, ctx));
                }
                let block_name = resolve_block_name(graph, head)?;
                self.field_of(&block_name, tail, effective_id, ctx)
            }
        }
    }

    fn loop_field(&self, loop_id: &str, tail: Option<&str>, ctx: &ExecutionContext) -> Option<JsonValue> {
        match tail {
            Some("currentItem") => ctx.loop_current_item.get(loop_id).cloned(),
            Some("index") | Some("currentIteration") => ctx
                .loop_iterations
                .get(loop_id)
                .map(|i| JsonValue::from(i.saturating_sub(1))),
            _ => None,
        }
    }

    fn field_of(&self, block_id: &BlockId, tail: Option<&str>, effective_id: &str, ctx: &ExecutionContext) -> Option<JsonValue> {
        let scoped_id = scoped_effective_id(block_id, effective_id);
        let state = ctx.state(&scoped_id).or_else(|| ctx.state(block_id))?;
        let output = state.output.as_json();
        match tail {
            None | Some("output") => Some(output),
            Some(field) => dig(&output, field),
        }
    }
}

/// If the id the block is executing under is a virtual (parallel-iteration)
/// id and `block_id` is a sibling body node of the same parallel/iteration,
/// rewrite the lookup to that sibling's virtual id so loop/parallel bodies
/// reference each other's per-iteration outputs rather than a stale shared
/// one.
fn scoped_effective_id(block_id: &str, effective_id: &str) -> String {
    match crate::virtual_id::parse(effective_id) {
        Some(parts) => crate::virtual_id::generate(block_id, &parts.parallel_id, parts.iteration_index),
        None => block_id.to_string(),
    }
}

fn dig(value: &JsonValue, field: &str) -> Option<JsonValue> {
    let mut current = value;
    for segment in field.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn resolve_block_name(graph: &WorkflowGraph, name: &str) -> Option<BlockId> {
    graph
        .blocks
        .iter()
        .find(|b| b.metadata.name.as_deref() == Some(name) || b.id == name)
        .map(|b| b.id.clone())
}

fn matches_name(graph: &WorkflowGraph, loop_id: &str, name: &str) -> bool {
    loop_id == name
        || graph
            .block(loop_id)
            .and_then(|b| b.metadata.name.as_deref())
            .map(|n| n == name)
            .unwrap_or(false)
}

/// `s` is nothing but a single `<...>` reference with no surrounding text.
fn whole_reference(s: &str) -> Option<&str> {
    let s = s.trim();
    let inner = s.strip_prefix('<')?.strip_suffix('>')?;
    if inner.contains('<') || inner.contains('>') {
        return None;
    }
    Some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockKind, BlockOutput, BlockState, Connection};

    fn graph() -> WorkflowGraph {
        WorkflowGraph {
            blocks: vec![
                Block { id: "start".into(), kind: BlockKind::Starter, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
                Block { id: "fetch".into(), kind: BlockKind::Api, enabled: true, config: serde_json::json!({}), metadata: Default::default() },
            ],
            connections: vec![Connection { source: "start".into(), target: "fetch".into(), source_handle: None }],
            loops: Default::default(),
            parallels: Default::default(),
        }
    }

    #[test]
    fn whole_string_reference_preserves_type() {
        let g = graph();
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        ctx.mark_executed(
            "fetch".into(),
            BlockState { output: BlockOutput::Ok(serde_json::json!({"items": [1, 2, 3]})), executed: true, execution_time_ms: 0 },
        );
        let resolved = TemplateResolver.resolve(&serde_json::json!("<fetch.items>"), "anything", &g, &ctx);
        assert_eq!(resolved, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn inline_reference_is_stringified() {
        let g = graph();
        let mut ctx = ExecutionContext::new("wf", Default::default(), Default::default(), false);
        ctx.mark_executed(
            "fetch".into(),
            BlockState { output: BlockOutput::Ok(serde_json::json!({"name": "ada"})), executed: true, execution_time_ms: 0 },
        );
        let resolved = TemplateResolver.resolve(&serde_json::json!("hello <fetch.name>!"), "anything", &g, &ctx);
        assert_eq!(resolved, serde_json::json!("hello ada!"));
    }
}
