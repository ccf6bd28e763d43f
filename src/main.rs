mod bus;
mod claims;
mod config;
mod deploy;
mod driver;
mod error;
mod firecracker_client;
mod handshake;
mod manager;
mod pool;
mod registry;
mod stop;
mod telemetry;
mod trigger;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::bus::{MessageBus, NatsBus};
use crate::config::NodeConfig;
use crate::driver::{FirecrackerDriver, RealFirecrackerDriver};
use crate::manager::MachineManager;
use crate::telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "machine-manager")]
#[command(about = "Per-node Firecracker microVM orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the node config, build the manager, and run until shutdown.
    Run {
        /// Path to the node's TOML config file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Validate a node config without starting the manager.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print pool/registry counts. Out of scope: no admin transport exists
    /// yet, so this always reports "not connected".
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate a config file, printing diagnostics.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Config {
            action: ConfigAction::Validate { config },
        } => {
            match NodeConfig::from_file(&config) {
                Ok(cfg) => {
                    println!("{} is valid.", config.display());
                    println!("  workload_types: {:?}", cfg.workload_types);
                    println!("  machine_pool_size: {}", cfg.machine_pool_size);
                }
                Err(err) => {
                    eprintln!("{} is invalid: {:#}", config.display(), err);
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            println!("Status: not connected (no admin transport configured)");
        }
    }

    Ok(())
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    init_tracing(config.otlp_endpoint.as_deref()).context("failed to initialize tracing")?;

    let bus: Arc<dyn MessageBus> = Arc::new(
        NatsBus::connect(&config.internal_bus_url)
            .await
            .with_context(|| format!("failed to connect to {}", config.internal_bus_url))?,
    );

    let socket_dir = config
        .firecracker_socket_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let kernel_path = std::env::var("FIRECRACKER_KERNEL")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/machine-manager/vmlinux"));
    let rootfs_path = std::env::var("FIRECRACKER_ROOTFS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/machine-manager/rootfs.ext4"));
    let driver: Arc<dyn FirecrackerDriver> =
        Arc::new(RealFirecrackerDriver::new(socket_dir, kernel_path, rootfs_path));

    let manager = MachineManager::new(config, bus, driver)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("invalid configuration")?;

    manager.start().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let cancel = manager.cancellation_token();
    tokio::select! {
        _ = cancel.cancelled() => {
            bail!("node shut down due to a fatal condition (see logs for the triggering event)");
        }
        _ = tokio::signal::ctrl_c() => {
            manager.shutdown().await;
        }
    }

    Ok(())
}
