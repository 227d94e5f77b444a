use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_core::act::ActStatus;
use tessera_core::config::AppConfig;
use tessera_core::event::ActEvent;
use tessera_core::stream::OutputChunk;
use tessera_core::types::{ActId, NodeId, WorkspaceId};
use tessera_engine::{ActOrchestrator, ActRequest, DryRunCapability, RunLogger};
use tessera_graph::{group_levels, Blueprint};
use tessera_store::{open_store, RunRegistry};

#[derive(Parser)]
#[command(name = "tessera", version, about = "Workflow graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tessera.toml", env = "TESSERA_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a blueprint and print its execution plan
    Plan {
        /// Blueprint JSON file
        file: PathBuf,
        /// Only plan the part reachable from this node (id or name)
        #[arg(long)]
        start: Option<String>,
    },
    /// Run a blueprint with the offline dry-run capability
    Run {
        /// Blueprint JSON file
        file: PathBuf,
        /// Only run the part reachable from this node (id or name)
        #[arg(long)]
        start: Option<String>,
        /// Caller billed for agent time (defaults to the blueprint owner)
        #[arg(long)]
        owner: Option<String>,
        /// Print generation output as it streams
        #[arg(long)]
        stream: bool,
    },
    /// List stored acts of a workspace, newest first
    Acts {
        /// Workspace id
        workspace: String,
    },
    /// Show a stored act and its generations
    Show {
        /// Act id
        act: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "tessera", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Plan { file, start } => {
            let blueprint = read_blueprint(&file)?;
            let steps = match start {
                Some(start) => {
                    let start = resolve_node(&blueprint, &start)?;
                    tessera_graph::plan_from(&blueprint, &start)?
                }
                None => tessera_graph::build_steps(&blueprint)?,
            };
            for (level, nodes) in group_levels(&steps).iter().enumerate() {
                let names: Vec<String> = nodes
                    .iter()
                    .map(|id| node_label(&blueprint, id))
                    .collect();
                println!("{:>3}  {}", level, names.join(", "));
            }
        }
        Commands::Run {
            file,
            start,
            owner,
            stream,
        } => {
            let blueprint = read_blueprint(&file)?;
            let registry = RunRegistry::new(open_store(&config)?);
            registry.save_blueprint(&blueprint).await?;

            let orchestrator = ActOrchestrator::builder(registry, Arc::new(DryRunCapability::new()))
                .config(&config)
                .build();

            let log_cancel = CancellationToken::new();
            let logger = config.log_dir().map(|dir| {
                let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
                RunLogger::new(dir, level).spawn(&orchestrator.events(), log_cancel.clone())
            });
            if stream {
                spawn_stream_printer(&orchestrator, &blueprint);
            }

            let mut request = ActRequest::new(
                blueprint.id.clone(),
                owner.unwrap_or_else(|| blueprint.owner_id.clone()),
            );
            if let Some(start) = start {
                request = request.starting_at(resolve_node(&blueprint, &start)?);
            }

            let act_id = orchestrator.start_act(request).await?;
            let act = tokio::select! {
                act = orchestrator.wait(&act_id) => act?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(act_id = %act_id, "Interrupted, cancelling act");
                    orchestrator.cancel_act(&act_id).await?;
                    orchestrator.wait(&act_id).await?
                }
            };

            log_cancel.cancel();
            if let Some(handle) = logger {
                handle.await.ok();
            }

            print_act(orchestrator.registry(), &act.id, Some(&blueprint)).await?;
            if act.status != ActStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Acts { workspace } => {
            let registry = RunRegistry::new(open_store(&config)?);
            let acts = registry
                .acts_for_workspace(&WorkspaceId::from(workspace))
                .await?;
            if acts.is_empty() {
                println!("No acts recorded.");
            }
            for act in acts {
                println!(
                    "{}  {:<11} {}  steps={} generations={} agent_time={}ms",
                    act.id,
                    act.status.as_str(),
                    act.started_at.format("%Y-%m-%d %H:%M:%S"),
                    act.step_count,
                    act.generation_count,
                    act.agent_time_ms,
                );
            }
        }
        Commands::Show { act } => {
            let registry = RunRegistry::new(open_store(&config)?);
            print_act(&registry, &ActId::from(act), None).await?;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn read_blueprint(path: &Path) -> anyhow::Result<Blueprint> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let blueprint = Blueprint::from_json(&json)?;
    info!(
        workspace_id = %blueprint.id,
        nodes = blueprint.node_count(),
        edges = blueprint.edge_count(),
        "Blueprint loaded"
    );
    Ok(blueprint)
}

/// Accept either a node id or a unique node name.
fn resolve_node(blueprint: &Blueprint, key: &str) -> anyhow::Result<NodeId> {
    let id = NodeId::from(key);
    if blueprint.node(&id).is_some() {
        return Ok(id);
    }
    let mut matches = blueprint.nodes().filter(|n| n.name == key);
    match (matches.next(), matches.next()) {
        (Some(node), None) => Ok(node.id.clone()),
        (Some(_), Some(_)) => anyhow::bail!("node name '{}' is ambiguous, use its id", key),
        (None, _) => anyhow::bail!("no node named '{}'", key),
    }
}

fn node_label(blueprint: &Blueprint, id: &NodeId) -> String {
    match blueprint.node(id) {
        Some(node) => format!("{} ({})", node.name, id),
        None => id.to_string(),
    }
}

/// Print every generation's deltas to stdout as they arrive.
fn spawn_stream_printer(orchestrator: &ActOrchestrator, blueprint: &Blueprint) {
    let mut rx = orchestrator.events().subscribe();
    let orchestrator = orchestrator.clone();
    let names: std::collections::HashMap<NodeId, String> = blueprint
        .nodes()
        .map(|n| (n.id.clone(), n.name.clone()))
        .collect();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let ActEvent::GenerationStarted {
                generation_id,
                node_id,
                ..
            } = event
            else {
                continue;
            };
            let Some(mut reader) = orchestrator.stream_output(&generation_id, 0) else {
                continue;
            };
            let name = names.get(&node_id).cloned().unwrap_or_else(|| node_id.to_string());
            tokio::spawn(async move {
                let mut text = String::new();
                while let Some(chunk) = reader.next().await {
                    match chunk {
                        OutputChunk::Delta { text: delta } => text.push_str(&delta),
                        OutputChunk::Retry { attempt } => {
                            text.clear();
                            println!("[{}] retrying (attempt {})", name, attempt);
                        }
                    }
                }
                let mut out = std::io::stdout().lock();
                writeln!(out, "[{}] {}", name, text).ok();
            });
        }
    });
}

async fn print_act(
    registry: &RunRegistry,
    act_id: &ActId,
    blueprint: Option<&Blueprint>,
) -> anyhow::Result<()> {
    let act = registry
        .get_act(act_id)
        .await?
        .with_context(|| format!("act {} not found", act_id))?;

    println!(
        "Act {}  status={}  agent_time={}ms",
        act.id, act.status, act.agent_time_ms
    );
    if let Some(err) = &act.error {
        let node = err.node_id.as_ref().map(|n| n.to_string()).unwrap_or_default();
        println!("  error at {}: {}", node, err.error);
    }

    for generation in registry.generations_for_act(&act.id).await? {
        let label = match blueprint {
            Some(bp) => node_label(bp, &generation.node_id),
            None => generation.node_id.to_string(),
        };
        let detail = match (&generation.output, &generation.error) {
            (_, Some(e)) => format!("error: {}", e),
            (Some(v), None) => serde_json::to_string(v)?,
            (None, None) => String::new(),
        };
        println!(
            "  {:<10} attempt={} {}ms  {}  {}",
            generation.status.as_str(),
            generation.attempt,
            generation.duration_ms(),
            label,
            detail
        );
    }
    Ok(())
}
