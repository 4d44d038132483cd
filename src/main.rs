use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stepgraph_core::config::AppConfig;
use stepgraph_core::event::EventBus;
use stepgraph_core::traits::RunStore;
use stepgraph_core::types::{Route, RunEvent, RunId};

use stepgraph_engine::{boxed, BoxedNode, FnNode, GraphExecutor, RunLogger};
use stepgraph_store::SqliteRunStore;

#[derive(Parser)]
#[command(name = "stepgraph", version, about = "Graph execution engine with persistent run history")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepgraph.toml")]
    config: PathBuf,

    /// Override the run history database path
    #[arg(long, env = "STEPGRAPH_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered graphs
    Graphs,
    /// List recent runs, newest first
    Runs {
        /// Only show runs of this graph
        #[arg(long)]
        graph: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show the recorded steps of one run
    Steps {
        /// Run ID
        run_id: String,
    },
    /// Run the built-in Start -> Middle -> End demo graph
    Demo {
        /// Input string for the start node
        #[arg(default_value = "a")]
        input: String,
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
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepgraph=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepgraph", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(&cli.config)?;
    if let Some(db) = &cli.db {
        config.store.path = db.display().to_string();
    }

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let db_path = config.store_path();
    let store = Arc::new(SqliteRunStore::open(&db_path)?);
    info!(path = %db_path.display(), "Run store ready");

    match cli.command {
        Commands::Graphs => list_graphs(store.as_ref()).await?,
        Commands::Runs { graph, limit } => list_runs(store.as_ref(), graph.as_deref(), limit).await?,
        Commands::Steps { run_id } => show_steps(store.as_ref(), &run_id).await?,
        Commands::Demo { input } => run_demo(&config, store, input).await?,
        Commands::Config | Commands::Completions { .. } => {
            unreachable!("handled before store open")
        }
    }

    Ok(())
}

async fn list_graphs(store: &dyn RunStore) -> anyhow::Result<()> {
    let graphs = store.list_graphs().await?;
    if graphs.is_empty() {
        println!("No graphs registered.");
        return Ok(());
    }
    println!("{:<6} NAME", "ID");
    for g in &graphs {
        println!("{:<6} {}", g.id.0, g.graph_name);
    }
    Ok(())
}

async fn list_runs(store: &dyn RunStore, graph: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let graph_id = match graph {
        Some(name) => match store.find_graph(name).await? {
            Some(g) => Some(g.id),
            None => {
                println!("Graph '{}' not found.", name);
                return Ok(());
            }
        },
        None => None,
    };

    let runs = store.list_runs(graph_id, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in &runs {
        println!(
            "{}  {:<16} {:>4} steps  {:<11} {}",
            run.run_id,
            truncate(&run.graph_name, 16),
            run.steps,
            run.state.to_string(),
            run.finished_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn show_steps(store: &dyn RunStore, run_id: &str) -> anyhow::Result<()> {
    let steps = store.load_steps(&RunId::from_string(run_id)).await?;
    if steps.is_empty() {
        println!("No steps recorded for run {}.", run_id);
        return Ok(());
    }
    for (i, step) in steps.iter().enumerate() {
        let status = if step.success { "ok" } else { "FAIL" };
        println!(
            "{:>3}. [{}] {} -> {}  {}",
            i + 1,
            status,
            step.node_type,
            step.routed,
            step.timestamp.format("%H:%M:%S%.3f"),
        );
        println!("     in:  {}", truncate(&step.input, 120));
        println!("     out: {}", truncate(&step.output, 120));
    }
    Ok(())
}

/// Append a fixed suffix to the input and route to `next`.
fn suffix_node(node_type: &str, suffix: &'static str, next: Option<&'static str>) -> BoxedNode {
    boxed(FnNode::new(
        node_type,
        move |s: String| async move { Ok(format!("{}{}", s, suffix)) },
        move |_| Route::from(next.map(String::from)),
    ))
}

async fn run_demo(config: &AppConfig, store: Arc<SqliteRunStore>, input: String) -> anyhow::Result<()> {
    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let cancel = CancellationToken::new();

    // Spawn RunLogger if logging is enabled
    let logger_handle = match (config.log_dir(), &config.log) {
        (Some(log_dir), Some(log_config)) => {
            let logger = RunLogger::new(log_dir, log_config.level);
            let log_bus = event_bus.clone();
            let log_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                logger.run(log_bus, "demo", log_cancel).await
            });
            // Don't start the run until the logger is listening
            while event_bus.subscriber_count() == 0 && !handle.is_finished() {
                tokio::task::yield_now().await;
            }
            info!("RunLogger started (level {})", log_config.level);
            Some(handle)
        }
        _ => None,
    };

    let nodes = vec![
        suffix_node("Start", "b", Some("Middle")),
        suffix_node("Middle", "c", Some("End")),
        suffix_node("End", "d", None),
    ];
    let executor = GraphExecutor::new("demo", nodes, store, "Start")
        .await?
        .with_config(config)
        .with_event_bus(event_bus.clone());

    // Spawn event printer
    let mut rx = event_bus.subscribe();
    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event {
                RunEvent::StepRecorded {
                    node_type,
                    routed,
                    success,
                    ..
                } => {
                    let status = if *success { "ok" } else { "FAIL" };
                    eprintln!("[{}: {}] -> {}", node_type, status, routed);
                }
                RunEvent::RetryScheduled {
                    node_type,
                    attempt,
                    backoff_ms,
                    error,
                    ..
                } => {
                    eprintln!(
                        "[{}: retry {} in {}ms] {}",
                        node_type,
                        attempt,
                        backoff_ms,
                        truncate(error, 200)
                    );
                }
                RunEvent::CapReached { max_steps, .. } => {
                    eprintln!("[cap reached after {} steps]", max_steps);
                }
                _ => {}
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    let result = executor.run_detailed(serde_json::Value::String(input)).await;

    // Errors raised outside node execution publish no terminal event
    if result.is_ok() {
        print_handle.await.ok();
    } else {
        print_handle.abort();
    }
    cancel.cancel();
    if let Some(handle) = logger_handle {
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }

    match result {
        Ok(report) => {
            println!("{}", report.output);
            eprintln!(
                "[{}: {} steps in {}ms, run {}]",
                report.state, report.steps, report.elapsed_ms, report.run_id
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Demo run failed");
            Err(e.into())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
