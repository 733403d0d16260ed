// crates/flowcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ElementId, ExecutionEvent, FlowDocument, Msg, NodeEvent};
use flowruntime::{FlowEngine, FlowGraph, RuntimeConfig};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow file until enough output arrived or the timeout passed
    Run {
        /// Path to the flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// JSON array of `{"nid": "<node id>", "msg": {...}}` to inject after start
        #[arg(short, long)]
        injections: Option<PathBuf>,

        /// Runtime settings JSON (event buffer, context stores)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Stop after this many output messages
        #[arg(short, long)]
        count: Option<usize>,

        /// Stop after this many seconds
        #[arg(short, long, default_value_t = 5.0)]
        timeout: f64,

        /// Show engine events
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to the flow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create an example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flows.json")]
        output: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct Injection {
    nid: ElementId,
    msg: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            injections,
            settings,
            count,
            timeout,
            verbose,
        } => {
            let default_level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
                .init();

            run_flow(file, injections, settings, count, timeout, verbose).await?;
        }

        Commands::Validate { file } => {
            validate_flow(&file).await?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flow(&output)?;
        }
    }

    Ok(())
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

async fn run_flow(
    file: PathBuf,
    injections: Option<PathBuf>,
    settings: Option<PathBuf>,
    count: Option<usize>,
    timeout: f64,
    verbose: bool,
) -> Result<()> {
    println!("🚀 Loading flows from: {}", file.display());

    let config: RuntimeConfig = match &settings {
        Some(path) => serde_json::from_value(read_json(path)?).context("invalid settings")?,
        None => RuntimeConfig::default(),
    };
    let injections: Vec<Injection> = match &injections {
        Some(path) => serde_json::from_value(read_json(path)?).context("invalid injections")?,
        None => Vec::new(),
    };
    let timeout = Duration::try_from_secs_f64(timeout).context("timeout must be a non-negative number")?;

    let registry = flownodes::builtin_registry();
    let mut engine = FlowEngine::from_json(read_json(&file)?, &registry, config).await?;
    println!("📋 Nodes: {}", engine.node_ids().len());
    println!();

    let event_task = verbose.then(|| {
        let mut events = engine.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                print_event(&event);
            }
        })
    });

    let mut outputs = engine
        .take_outputs()
        .context("engine output already taken")?;
    engine.start().await?;

    for injection in injections {
        let msg = Msg::from_json(injection.msg).context("injected msg must be a JSON object")?;
        engine.inject(injection.nid, msg)?;
    }

    let received = outputs.collect(count.unwrap_or(usize::MAX), timeout).await;
    engine.stop().await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(task) = event_task {
        task.abort();
    }

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", engine.execution_id());
    println!("   Output messages: {}", received.len());
    for msg in &received {
        println!("{}", msg.to_json());
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::EngineStarted { nodes, .. } => {
            println!("▶️  Engine started with {} nodes", nodes);
        }
        ExecutionEvent::NodeStarted { node_id, node_type, .. } => {
            println!("  ⚡ Started node: {} ({})", node_id, node_type);
        }
        ExecutionEvent::MessageDelivered { from, port, to, .. } => {
            println!("  ➡️  {}[{}] -> {}", from, port, to);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
            NodeEvent::Data { value } => {
                println!("     📤 [{}] {}", node_id, serde_json::Value::from(value.clone()))
            }
        },
        ExecutionEvent::NodeClosed { node_id, .. } => {
            println!("  ⏹  Closed node: {}", node_id);
        }
        ExecutionEvent::EngineStopped { duration_ms, .. } => {
            println!("✨ Engine stopped after {}ms", duration_ms);
        }
    }
}

async fn validate_flow(file: &Path) -> Result<()> {
    println!("🔍 Validating flows: {}", file.display());

    let doc = FlowDocument::parse(read_json(file)?)?;
    let graph = FlowGraph::build(&doc)?;
    let registry = flownodes::builtin_registry();
    // Building instantiates every node, which checks its configuration
    FlowEngine::build(&doc, &registry, RuntimeConfig::default()).await?;

    println!("✅ Flows are valid:");
    println!("   Flows: {}", doc.flows.len());
    println!("   Groups: {}", doc.groups.len());
    println!("   Enabled nodes: {}", graph.len());
    if graph.is_cyclic() {
        println!("   ⚠️  Wiring contains a cycle");
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = flownodes::builtin_registry();

    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_flow(output: &Path) -> Result<()> {
    let flows = json!([
        {"id": "100", "type": "tab", "label": "Example"},
        {"id": "1", "type": "inject", "z": "100", "name": "Every second",
            "props": [{"p": "payload"}, {"p": "topic", "vt": "str"}],
            "payload": "", "payloadType": "date", "topic": "tick", "repeat": "1", "once": true,
            "wires": [["2"]]},
        {"id": "2", "type": "switch", "z": "100", "name": "Even seconds",
            "property": "payload", "propertyType": "msg",
            "rules": [{"t": "regex", "v": "[02468]\\d{3}$"}, {"t": "else"}],
            "checkall": "false", "wires": [["3"], []]},
        {"id": "3", "type": "change", "z": "100", "name": "Count",
            "rules": [{"t": "set", "p": "last", "pt": "flow", "to": "payload", "tot": "msg"}],
            "wires": [["4"]]},
        {"id": "4", "type": "debug", "z": "100", "name": "Show", "complete": "true"}
    ]);

    std::fs::write(output, serde_json::to_string_pretty(&flows)?)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {} --count 3", output.display());

    Ok(())
}
