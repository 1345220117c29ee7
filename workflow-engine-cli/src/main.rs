use tracing_subscriber::EnvFilter;
use workflow_engine_core::model::WorkflowGraph;
use workflow_engine_core::{ExecutionOutcome, Executor, HandlerRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let graph_path = parse_graph_path();
    let input = parse_input();
    let workflow_id = parse_workflow_id(graph_path.as_deref());

    let graph = match graph_path {
        Some(path) => {
            tracing::info!(path = %path, "loading workflow graph");
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<WorkflowGraph>(&raw)?
        }
        None => {
            tracing::info!("no --graph given, running the bundled demo graph");
            demo_graph()
        }
    };

    let executor = Executor::new(graph, workflow_id)?.with_registry(HandlerRegistry::with_builtins());

    match executor.execute(input, None).await? {
        ExecutionOutcome::Completed(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        ExecutionOutcome::Paused(paused) => {
            tracing::info!(
                reason = paused.wait_info.as_ref().map(|w| w.reason.as_str()).unwrap_or("wait"),
                "execution paused; this one-shot CLI invocation cannot resume it"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "paused": true,
                    "wait_info": paused.wait_info,
                }))?
            );
        }
        ExecutionOutcome::DebugPaused(session) => {
            tracing::info!("execution paused in debug mode; this one-shot CLI invocation cannot continue it");
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "debug_paused": true,
                    "pending_blocks": session.pending_blocks,
                }))?
            );
        }
    }

    Ok(())
}

/// Derives a stable workflow id from `--graph`'s file stem, or `"cli-demo"`
/// when running the bundled demo graph.
fn parse_workflow_id(graph_path: Option<&str>) -> String {
    graph_path
        .and_then(|p| std::path::Path::new(p).file_stem())
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "cli-demo".to_string())
}

/// Parse the graph file path from a `--graph <path>` CLI arg, following the
/// same `--flag <value>` convention as `DATABASE_URL` parsing elsewhere in
/// this family of tools.
fn parse_graph_path() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|w| w[0] == "--graph")
        .map(|w| w[1].clone())
}

/// Parse the trigger input from a `--input <json>` CLI arg, defaulting to an
/// empty object when absent.
fn parse_input() -> serde_json::Value {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|w| w[0] == "--input")
        .and_then(|w| serde_json::from_str(&w[1]).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// A minimal graph demonstrating a router-driven branch, used when the
/// caller doesn't supply `--graph`.
fn demo_graph() -> WorkflowGraph {
    use workflow_engine_core::model::{handle, Block, BlockKind, BlockMetadata, Connection};

    let block = |id: &str, kind: BlockKind, config: serde_json::Value| Block {
        id: id.to_string(),
        kind,
        enabled: true,
        config,
        metadata: BlockMetadata::default(),
    };

    WorkflowGraph {
        blocks: vec![
            block("start", BlockKind::Starter, serde_json::json!({})),
            block(
                "route",
                BlockKind::Router,
                serde_json::json!({
                    "routes": [{"blockId": "greet", "when": true}],
                    "default": "greet",
                }),
            ),
            block("greet", BlockKind::Function, serde_json::json!({})),
            block("reply", BlockKind::Response, serde_json::json!("<greet.name> says hello")),
        ],
        connections: vec![
            Connection { source: "start".into(), target: "route".into(), source_handle: None },
            Connection { source: "route".into(), target: "greet".into(), source_handle: None },
            Connection { source: "greet".into(), target: "reply".into(), source_handle: None },
        ],
        loops: Default::default(),
        parallels: Default::default(),
    }
}
