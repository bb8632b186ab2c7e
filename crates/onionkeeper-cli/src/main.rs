#![deny(unsafe_code)]

//! onionkeeper CLI: run the daemon in the foreground and inspect its options.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onionkeeper_config::AppConfig;
use onionkeeper_core::options::{as_assignment, render};
use onionkeeper_core::protocol::Command;
use onionkeeper_core::build_info::{self, BuildInfo};
use onionkeeper_core::{BridgeMode, IpCapability, Orchestrator};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// onionkeeper: supervise an anonymity-network daemon over its control port.
#[derive(Parser)]
#[command(name = "onionkeeper", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "onionkeeper.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and keep it running until Ctrl-C.
    Start {
        /// Bridge mode: none, builtin, custom or alternate.
        #[arg(long)]
        bridges: Option<BridgeMode>,

        /// Reachable IP families: unknown, ipv4, ipv6 or dual.
        #[arg(long)]
        ip: Option<IpCapability>,

        /// List circuits once the daemon is ready.
        #[arg(long)]
        circuits: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the options the daemon would be given.
    Options {
        #[arg(long)]
        bridges: Option<BridgeMode>,

        #[arg(long, default_value = "unknown")]
        ip: IpCapability,

        /// Print the live SETCONF command instead of the launch arguments.
        #[arg(long)]
        live: bool,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Show build information.
    Version {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Start {
            bridges,
            ip,
            circuits,
            json,
        } => cmd_start(config, bridges, ip, circuits, json).await?,
        Commands::Options { bridges, ip, live } => cmd_options(config, bridges, ip, live),
        Commands::Config { show } => cmd_config(&config, &cli.config, show)?,
        Commands::Version { json } => cmd_version(json)?,
    }

    Ok(())
}

async fn cmd_start(
    config: AppConfig,
    bridges: Option<BridgeMode>,
    ip: Option<IpCapability>,
    circuits: bool,
    json: bool,
) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config);
    let mode = bridges.unwrap_or_else(|| orchestrator.bridge_mode());
    if let Some(ip) = ip {
        orchestrator.set_ip_capability(ip);
    }
    info!(%mode, ip = %orchestrator.ip_capability(), "Starting daemon");

    let start = orchestrator.start(mode, |progress| info!(progress, "Bootstrapping"));
    let addresses = tokio::select! {
        result = start => result.context("daemon failed to start")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during startup");
            orchestrator.stop().await;
            return Ok(());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&addresses)?);
    } else {
        println!("SOCKS proxy: {}", addresses.socks);
        println!("DNS resolver: {}", addresses.dns);
    }

    if circuits {
        let list = orchestrator.list_circuits().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&list)?);
        } else {
            for circuit in &list {
                println!(
                    "{:>6}  {:<9} {:<16} {}",
                    circuit.id,
                    circuit.status,
                    circuit.purpose.as_deref().unwrap_or("-"),
                    circuit.path.join(",")
                );
            }
        }
    }

    info!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    orchestrator.stop().await;
    Ok(())
}

fn cmd_options(config: AppConfig, bridges: Option<BridgeMode>, ip: IpCapability, live: bool) {
    for line in render_options(config, bridges, ip, live) {
        println!("{line}");
    }
}

/// Launch arguments one `--Key value` pair per line, or the single `SETCONF`
/// line a live session would receive.
fn render_options(
    config: AppConfig,
    bridges: Option<BridgeMode>,
    ip: IpCapability,
    live: bool,
) -> Vec<String> {
    let orchestrator = Orchestrator::from_config(config);
    let mode = bridges.unwrap_or_else(|| orchestrator.bridge_mode());
    if live {
        let options = orchestrator.live_options(mode, ip);
        let line = Command::SetConf(render(&options, as_assignment)).encode();
        vec![line.trim_end().to_string()]
    } else {
        orchestrator
            .daemon_args(mode, ip)
            .chunks(2)
            .map(|pair| pair.join(" "))
            .collect()
    }
}

fn cmd_version(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&BuildInfo::current())?);
    } else {
        println!("onionkeeper {}", build_info::version_string());
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, config_path: &Path, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load the config at `path`, falling back to defaults if it does not exist.
/// The flag reports whether the file was found.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}
