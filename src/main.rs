//! csm - Collaborative State Machine runtime
//!
//! Loads a collaborative state machine description and runs its instances
//! to completion.

use clap::{Parser, Subcommand};
use csm_core::{
    CollaborativeStateMachine, CollaborativeStateMachineRaw, Context, GraphBuilder, InMemoryContext,
};
use csm_runtime::{Config, LocalEventHandler, Runtime};
use csm_storage::{DurableContext, VariableStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csm")]
#[command(about = "Runtime for collaborative state machines")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "CSM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collaborative state machine until all instances terminate
    Run {
        /// Machine description (JSON)
        #[arg(env = "CSM_MACHINE")]
        machine: PathBuf,

        /// Give up waiting after this many seconds (0 = wait forever)
        #[arg(short, long, default_value_t = 0)]
        timeout_secs: u64,
    },

    /// Build and validate a machine description without running it
    Validate {
        /// Machine description (JSON)
        machine: PathBuf,

        /// Reject states declaring two transitions for the same event
        #[arg(long)]
        strict: bool,
    },

    /// Write the effective configuration as YAML
    Config {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            machine,
            timeout_secs,
        } => run(&config, &machine, timeout_secs).await,
        Commands::Validate { machine, strict } => {
            let csm = load_machine(&machine, strict)?;
            println!(
                "{}: {} machines, {} persistent variables (checksum {})",
                csm.name,
                csm.machines.len(),
                csm.persistent.len(),
                csm.checksum
            );
            Ok(())
        }
        Commands::Config { output } => {
            match output {
                Some(path) => {
                    config.save(&path)?;
                    tracing::info!("Wrote configuration to {}", path.display());
                }
                None => print!("{}", serde_yaml::to_string(&config)?),
            }
            Ok(())
        }
    }
}

/// Loads configuration from `path` (or defaults), then applies env overrides.
fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            // An explicitly specified file must load
            let mut config = Config::from_file(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => {
            let config = Config::from_env();
            if let Err(e) = config.validate() {
                tracing::error!("Invalid configuration: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Ok(config)
        }
    }
}

fn load_machine(
    path: &Path,
    strict: bool,
) -> Result<CollaborativeStateMachine, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let raw: CollaborativeStateMachineRaw = serde_json::from_str(&content)?;
    let csm = GraphBuilder::new().strict(strict).build(raw)?;
    Ok(csm)
}

async fn run(
    config: &Config,
    machine: &Path,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let csm = load_machine(machine, false)?;

    tracing::info!("Starting csm runtime");
    tracing::info!("  Machine: {} ({})", csm.name, machine.display());
    tracing::info!("  Selection policy: {:?}", config.runtime.selection_policy);
    tracing::info!("  Timer threads: {}", config.timers.worker_threads);
    match config.runtime.deadline() {
        Some(deadline) => tracing::info!("  Instance deadline: {}ms", deadline.as_millis()),
        None => tracing::info!("  Instance deadline: none"),
    }

    // Persistent variables live in the durable store unless persistence is off
    let persistent: Arc<dyn Context> = if config.storage.enabled {
        tracing::info!("  Data directory: {}", config.storage.data_dir.display());
        let store = Arc::new(VariableStore::open(config.storage.store_config())?);
        Arc::new(DurableContext::new(store, csm.name.clone()))
    } else {
        tracing::info!("  Persistence: disabled");
        Arc::new(InMemoryContext::new())
    };

    let registry = config.service_registry();
    tracing::info!("  Services: {}", registry.service_types().join(", "));
    let selector = config.runtime.selection_policy.selector(registry);

    let event_handler = Arc::new(LocalEventHandler::new(config.runtime.event_channel_capacity));
    let runtime = Arc::new(Runtime::new(config, event_handler, persistent)?);

    let handles = runtime.new_instances(&csm, selector)?;
    for handle in &handles {
        tracing::info!("  Instance {}: {}", handle.id(), handle.graph_name());
    }

    // Spawn shutdown signal handler
    let shutdown_runtime = runtime.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping instances...");
        shutdown_runtime.shutdown();
    });

    let timeout = if timeout_secs == 0 {
        Duration::MAX
    } else {
        Duration::from_secs(timeout_secs)
    };
    if !runtime.wait_for_completion(timeout).await {
        tracing::warn!("Timed out after {}s, stopping instances", timeout_secs);
        runtime.shutdown();
        runtime.wait_for_completion(Duration::from_secs(5)).await;
    }

    for handle in &handles {
        tracing::info!(
            "  {} ({}) finished in state {}",
            handle.id(),
            handle.graph_name(),
            handle.active_state().as_deref().unwrap_or("<none>")
        );
    }

    tracing::info!("Runtime stopped");
    Ok(())
}
