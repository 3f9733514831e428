//! Command-line interface for the mesh-to-MQTT bridge.

mod shutdown;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshbridge_core::{BridgeConfig, BrokerClient, MeshDriver, MeshTransport};
use meshbridge_devices::{Bridge, MemoryMesh, MqttBroker};
use serde::Serialize;

/// Environment variable naming the config file.
const CONFIG_ENV: &str = "MESHBRIDGE_CONFIG";

/// Config file used when neither `--config` nor the environment names one.
const DEFAULT_CONFIG: &str = "meshbridge.toml";

/// Meshbridge - Expose mesh network values as MQTT topics.
#[derive(Parser, Debug)]
#[command(name = "meshbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until SIGINT/SIGTERM.
    Run {
        /// Config file path.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Stale reports the simulated mesh sends after each command.
        #[arg(long, default_value_t = 1)]
        stale_echoes: u32,
    },
    /// Validate a config file and print the device table.
    Check {
        /// Config file path.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    match args.command {
        Command::Run {
            config,
            stale_echoes,
        } => run_bridge(resolve_config_path(config), stale_echoes).await,
        Command::Check { config, json } => check_config(resolve_config_path(config), json),
    }
}

fn init_logging(verbose: bool) {
    // JSON logging for production/container environments
    let json_logging = std::env::var("MESHBRIDGE_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "meshbridge={0},meshbridge_core={0},meshbridge_devices={0},warn",
            default_level
        ))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

fn resolve_config_path(arg: Option<PathBuf>) -> PathBuf {
    arg.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

fn load_config(path: &Path) -> Result<BridgeConfig> {
    BridgeConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

/// Run the bridge.
async fn run_bridge(path: PathBuf, stale_echoes: u32) -> Result<()> {
    let config = load_config(&path)?;
    tracing::info!(
        "Loaded {} devices from {}",
        config.devices.len(),
        path.display()
    );

    let mesh: Arc<dyn MeshTransport> = match config.mesh.driver {
        MeshDriver::Simulated => {
            tracing::warn!(
                "Using the simulated mesh; controller {} is not opened",
                config.mesh.device
            );
            Arc::new(MemoryMesh::for_devices(&config.devices).with_stale_echoes(stale_echoes))
        }
    };
    let broker: Arc<dyn BrokerClient> = Arc::new(MqttBroker::new(config.broker.clone()));

    let mut bridge = Bridge::from_config(&config, mesh, broker)?;
    bridge.start().await.context("Failed to start bridge")?;

    bridge.run_until(shutdown::shutdown_signal()).await;
    shutdown::stop_bridge(
        &mut bridge,
        config.reconcile.shutdown_grace(),
        shutdown::shutdown_signal(),
    )
    .await;

    Ok(())
}

#[derive(Serialize)]
struct CheckReport<'a> {
    subscription: String,
    devices: &'a [meshbridge_core::DeviceEntry],
}

/// Validate a config file.
fn check_config(path: PathBuf, json: bool) -> Result<()> {
    let config = load_config(&path)?;
    let report = CheckReport {
        subscription: config.subscription(),
        devices: &config.devices,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Config OK: {}", path.display());
    println!("Subscription: {}\n", report.subscription);
    println!("{:<20} {:<20} TOPIC", "ADDRESS", "NAME");
    for device in report.devices {
        println!(
            "{:<20} {:<20} {}",
            device.address.to_string(),
            device.name,
            device.topic
        );
    }

    Ok(())
}
