// crates/alphred-cli/src/main.rs
// ============================================================================
// Module: Alphred CLI Entry Point
// Description: Operator command line for workflow runs.
// Purpose: Plan, step, drive, inspect, and control runs against a local database.
// Dependencies: alphred-config, alphred-core, alphred-providers,
// alphred-store-sqlite, alphred-supervisor, clap, serde_json, tokio, tracing
// ============================================================================

//! ## Overview
//! The CLI wires the SQLite store, the scripted provider, and the background
//! execution manager together for local operation. `seed-demo` publishes a
//! small three-node workflow; `run` drives a materialized run through the
//! supervisor exactly the way a host service would.

#![allow(
    clippy::print_stdout,
    reason = "Operator CLI writes command results to stdout."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use alphred_config::AlphredConfig;
use alphred_config::ConfigError;
use alphred_core::ControlError;
use alphred_core::DecisionSignal;
use alphred_core::ExecutionOptions;
use alphred_core::ExecutorError;
use alphred_core::GuardExpression;
use alphred_core::NewPromptTemplate;
use alphred_core::NewTreeEdge;
use alphred_core::NewTreeNode;
use alphred_core::NodeRole;
use alphred_core::NodeType;
use alphred_core::PlanError;
use alphred_core::RouteOn;
use alphred_core::RunControlAction;
use alphred_core::RunId;
use alphred_core::StoreError;
use alphred_core::SystemClock;
use alphred_core::TreeDefinition;
use alphred_core::WorkflowExecutor;
use alphred_core::WorkflowStore;
use alphred_core::control_run;
use alphred_core::materialize_run;
use alphred_core::parse_guard_expression;
use alphred_providers::ProviderRegistry;
use alphred_providers::ScriptedPhase;
use alphred_providers::ScriptedProvider;
use alphred_store_sqlite::SqliteSessionFactory;
use alphred_store_sqlite::SqliteWorkflowStore;
use alphred_supervisor::BackgroundExecutionManager;
use alphred_supervisor::NoopWorktreeHooks;
use clap::Parser;
use clap::Subcommand;
use thiserror::Error;
use tracing::error;

// ============================================================================
// SECTION: CLI Definition
// ============================================================================

/// Alphred workflow orchestrator CLI.
#[derive(Debug, Parser)]
#[command(name = "alphred", version, about = "Durable agent-workflow orchestrator")]
struct Cli {
    /// Optional path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Command to run.
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Publish the built-in three-node demo workflow.
    SeedDemo {
        /// Tree key to publish under.
        #[arg(long, default_value = "demo")]
        tree_key: String,
    },
    /// Materialize a run from the latest published tree version.
    Plan {
        /// Tree key to materialize.
        #[arg(long)]
        tree_key: String,
    },
    /// Advance a run by exactly one node.
    Step {
        /// Run to advance.
        #[arg(long)]
        run_id: i64,
    },
    /// Drive a run to a settled point through the background manager.
    Run {
        /// Run to drive.
        #[arg(long)]
        run_id: i64,
    },
    /// Print a run's status, nodes, and latest routing decisions.
    Status {
        /// Run to inspect.
        #[arg(long)]
        run_id: i64,
    },
    /// Cancel a run.
    Cancel {
        /// Run to cancel.
        #[arg(long)]
        run_id: i64,
    },
    /// Pause a running run.
    Pause {
        /// Run to pause.
        #[arg(long)]
        run_id: i64,
    },
    /// Resume a paused run.
    Resume {
        /// Run to resume.
        #[arg(long)]
        run_id: i64,
    },
    /// Requeue a failed run's failed nodes and set it running.
    Retry {
        /// Run to retry.
        #[arg(long)]
        run_id: i64,
    },
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI errors.
///
/// # Invariants
/// - Variants are stable for exit-code mapping.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration failed to load.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Planner failed.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// Executor step failed.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    /// Control operation failed.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// Invalid command-line value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Output serialization failed.
    #[error("output serialization failed: {0}")]
    Output(String),
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// Process entry point.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(cli_error) => {
            error!(%cli_error, "command failed");
            ExitCode::FAILURE
        }
    }
}

/// Routes the parsed command.
async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = AlphredConfig::load(cli.config.as_deref())?;
    let cwd = std::env::current_dir()
        .map_err(|err| CliError::InvalidArgument(format!("cannot resolve cwd: {err}")))?;
    let store_config = config.store_config(&cwd);

    match cli.command {
        Command::SeedDemo {
            tree_key,
        } => {
            let store = SqliteWorkflowStore::open(&store_config)?;
            let version = seed_demo_tree(&store, &tree_key)?;
            println!("published tree {tree_key} version {version}");
            Ok(())
        }
        Command::Plan {
            tree_key,
        } => {
            let store = SqliteWorkflowStore::open(&store_config)?;
            let run_id = materialize_run(&store, &tree_key)?;
            println!("materialized run {run_id}");
            Ok(())
        }
        Command::Step {
            run_id,
        } => {
            let run_id = parse_run_id(run_id)?;
            let store = SqliteWorkflowStore::open(&store_config)?;
            let resolver = demo_resolver(&store, run_id)?;
            let executor = WorkflowExecutor::new(store, resolver, SystemClock);
            let options = ExecutionOptions::new(config.execution.default_provider.clone());
            let step = executor.execute_next_runnable_node(run_id, &options)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&step)
                    .map_err(|err| CliError::Output(err.to_string()))?
            );
            Ok(())
        }
        Command::Run {
            run_id,
        } => {
            let run_id = parse_run_id(run_id)?;
            let resolver = {
                let store = SqliteWorkflowStore::open(&store_config)?;
                demo_resolver(&store, run_id)?
            };
            let manager = BackgroundExecutionManager::new(
                SqliteSessionFactory::new(store_config.clone()),
                resolver,
                ExecutionOptions::new(config.execution.default_provider.clone()),
                config.execution.max_steps,
                Arc::new(NoopWorktreeHooks),
            );
            manager.ensure(run_id).await;
            while manager.has_background_execution(run_id).await {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            let store = SqliteWorkflowStore::open(&store_config)?;
            let run = store
                .load_run(run_id)?
                .ok_or_else(|| CliError::InvalidArgument(format!("run {run_id} not found")))?;
            println!("run {run_id} settled with status {}", run.status);
            Ok(())
        }
        Command::Status {
            run_id,
        } => {
            let run_id = parse_run_id(run_id)?;
            let store = SqliteWorkflowStore::open(&store_config)?;
            print_status(&store, run_id)
        }
        Command::Cancel {
            run_id,
        } => control(&store_config, run_id, RunControlAction::Cancel),
        Command::Pause {
            run_id,
        } => control(&store_config, run_id, RunControlAction::Pause),
        Command::Resume {
            run_id,
        } => control(&store_config, run_id, RunControlAction::Resume),
        Command::Retry {
            run_id,
        } => control(&store_config, run_id, RunControlAction::Retry),
    }
}

/// Parses a raw run id argument.
fn parse_run_id(raw: i64) -> Result<RunId, CliError> {
    RunId::from_raw(raw)
        .ok_or_else(|| CliError::InvalidArgument(format!("run id must be positive, got {raw}")))
}

/// Applies a control action and prints its result.
fn control(
    store_config: &alphred_store_sqlite::SqliteStoreConfig,
    run_id: i64,
    action: RunControlAction,
) -> Result<(), CliError> {
    let run_id = parse_run_id(run_id)?;
    let store = SqliteWorkflowStore::open(store_config)?;
    let result = control_run(&store, run_id, action)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).map_err(|err| CliError::Output(err.to_string()))?
    );
    Ok(())
}

/// Prints a run's state as JSON.
fn print_status(store: &SqliteWorkflowStore, run_id: RunId) -> Result<(), CliError> {
    let run = store
        .load_run(run_id)?
        .ok_or_else(|| CliError::InvalidArgument(format!("run {run_id} not found")))?;
    let nodes = store.load_run_nodes(run_id)?;
    let decisions = store.latest_routing_decisions(run_id)?;
    let status = serde_json::json!({
        "run": run,
        "nodes": nodes,
        "latest_decisions": decisions,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&status).map_err(|err| CliError::Output(err.to_string()))?
    );
    Ok(())
}

// ============================================================================
// SECTION: Demo Wiring
// ============================================================================

/// Builds a resolver whose scripted provider approves every node of the
/// run's tree a few times over (enough for demo loopbacks).
fn demo_resolver(store: &SqliteWorkflowStore, run_id: RunId) -> Result<ProviderRegistry, CliError> {
    let provider = ScriptedProvider::new();
    if let Some(run) = store.load_run(run_id)? {
        for node in store.load_tree_nodes(run.tree_id)? {
            for _ in 0 .. 4 {
                provider.push_phase(
                    node.node_key.clone(),
                    ScriptedPhase::success(
                        format!("{} report", node.node_key),
                        DecisionSignal::Approved,
                    ),
                );
            }
        }
    }
    let mut registry = ProviderRegistry::new();
    registry.register("scripted", Arc::new(provider));
    Ok(registry)
}

/// Publishes the built-in demo tree: design -> implement -> review with a
/// guarded loopback from review to implement.
fn seed_demo_tree(store: &SqliteWorkflowStore, tree_key: &str) -> Result<i64, CliError> {
    let guard: GuardExpression = parse_guard_expression(
        r#"{"field": "decision", "operator": "==", "value": "changes_requested"}"#,
    )
    .map_err(|err| CliError::InvalidArgument(err.to_string()))?;
    let definition = TreeDefinition {
        nodes: vec![
            demo_node("design", 0),
            demo_node("implement", 1),
            demo_node("review", 2),
        ],
        edges: vec![
            NewTreeEdge {
                source_node_key: "design".to_string(),
                target_node_key: "implement".to_string(),
                priority: 0,
                auto: true,
                guard_index: None,
                route_on: RouteOn::Success,
            },
            NewTreeEdge {
                source_node_key: "implement".to_string(),
                target_node_key: "review".to_string(),
                priority: 0,
                auto: true,
                guard_index: None,
                route_on: RouteOn::Success,
            },
            NewTreeEdge {
                source_node_key: "review".to_string(),
                target_node_key: "implement".to_string(),
                priority: 10,
                auto: false,
                guard_index: Some(0),
                route_on: RouteOn::Success,
            },
        ],
        guards: vec![guard],
        templates: vec![NewPromptTemplate {
            name: "phase".to_string(),
            content_type: Some("markdown".to_string()),
            body: "Execute the phase and report.".to_string(),
        }],
    };
    let tree = store.create_draft_tree(tree_key, "Demo workflow")?;
    store.save_draft_tree(tree.id, 0, &definition)?;
    Ok(store.publish_draft_tree(tree.id, 1)?)
}

/// Builds one demo agent node.
fn demo_node(node_key: &str, sequence_index: i64) -> NewTreeNode {
    NewTreeNode {
        node_key: node_key.to_string(),
        node_type: NodeType::Agent,
        node_role: NodeRole::Standard,
        provider: Some("scripted".to_string()),
        model: None,
        execution_permissions: None,
        template_index: Some(0),
        max_retries: 0,
        sequence_index,
    }
}
