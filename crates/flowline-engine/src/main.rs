//! Flowline - runs configured file ingestion flows

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowline_common::logging::{init_logging, LogConfig, LogLevel};
use flowline_engine::{ControllerRegistry, EngineConfig, FlowControllerService, FlowId, FlowsFile};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "flowline")]
#[command(author, version, about = "Checkpointed flow processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every flow in the flows file until Ctrl+C
    Run {
        /// Flows file (TOML)
        #[arg(short, long, default_value = "flows.toml", env = "FLOWLINE_FLOWS")]
        flows: PathBuf,
    },

    /// Print the registered flow and its file log as JSON
    Status {
        /// Flow code
        #[arg(short, long)]
        flow: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::with_level(log_level).merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = EngineConfig::from_env()?;

    match cli.command {
        Command::Run { flows } => run(config, flows).await,
        Command::Status { flow } => status(config, &flow).await,
    }
}

async fn run(config: EngineConfig, flows_path: PathBuf) -> Result<()> {
    let flows = FlowsFile::load(&flows_path)?;
    if flows.flows.is_empty() {
        anyhow::bail!("No flows defined in {}", flows_path.display());
    }

    let registry = ControllerRegistry::with_defaults();
    let repo = config.state_repository();

    // Resolve every controller before starting any of them
    let mut services = Vec::with_capacity(flows.flows.len());
    for definition in &flows.flows {
        let controller = registry
            .build(definition)
            .with_context(|| format!("Failed to configure flow '{}'", definition.code))?;
        let flow_config = definition.engine_config(&config);
        flow_config.validate()?;

        let flow = repo.ensure_flow(&definition.flow()).await?;
        info!(flow = %flow.id, name = %flow.name, registered = %flow.created_at, "Flow configured");
        services.push(Arc::new(FlowControllerService::new(
            controller,
            repo.clone(),
            &flow_config,
        )));
    }

    let mut handles = Vec::with_capacity(services.len());
    for service in services {
        info!(flow = %service.flow_code(), "Starting flow");
        handles.push(service.start()?);
    }

    info!(flows = handles.len(), base_dir = %config.base_dir.display(), "Flowline running");
    shutdown_signal().await;

    for handle in handles {
        handle.shutdown().await;
    }

    info!("Flowline stopped");
    Ok(())
}

async fn status(config: EngineConfig, flow: &str) -> Result<()> {
    let repo = config.state_repository();
    let descriptor = repo.load_flow(&FlowId::new(flow)).await?;
    let log = repo.load_file_log(flow).await?;
    let rendered = serde_json::to_string_pretty(&serde_json::json!({
        "flow": descriptor,
        "file_log": log,
    }))?;
    println!("{}", rendered);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
