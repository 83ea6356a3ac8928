use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use closbgp::bgp::transport::SessionMode;
use closbgp::config::{Config, Resolved};
use closbgp::daemon::Coordinator;
use closbgp::error::ClosError;
use closbgp::rib::{connected_rib, select_best, RibHandle};

const DEFAULT_CONFIG_PATH: &str = "/etc/closbgp/closbgp.toml";

#[derive(Parser)]
#[command(name = "closbgp")]
#[command(version)]
#[command(about = "closbgp - a minimal BGP speaker for Clos fabrics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the BGP daemon
    Daemon {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Session role for peers that do not set `mode`
        #[arg(long, value_enum)]
        mode: Option<SessionMode>,
    },
    /// Validate a config file and print what it resolves to
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { config, mode } => run_daemon(&config, mode),
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load(path: &Path, mode: Option<SessionMode>) -> Result<(Config, Resolved), ClosError> {
    let config = Config::from_file(path)?;
    let resolved = config.resolve(mode)?;
    Ok((config, resolved))
}

fn run_daemon(config_path: &Path, mode: Option<SessionMode>) -> ExitCode {
    // RUST_LOG overrides; defaults to info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let (config, resolved) = match load(config_path, mode) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run_daemon_async(config, resolved) {
        error!("Daemon error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_daemon_async(config: Config, resolved: Resolved) -> Result<(), ClosError> {
    info!("closbgp starting...");
    info!(asn = config.asn, "ASN: {}", config.asn);
    info!(router_id = %config.router_id, "Router ID: {}", config.router_id);
    info!(peers = resolved.peers.len(), "Peers: {}", resolved.peers.len());
    info!(
        hold_time = config.hold_time,
        keepalive = config.hold_time / 3,
        connect_retry = config.connect_retry_time,
        "Timers: hold={} keepalive={} connect_retry={}",
        config.hold_time,
        config.hold_time / 3,
        config.connect_retry_time
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let shutdown = CancellationToken::new();
    let coordinator = Coordinator::from_config(&config, &resolved, shutdown.clone());
    let rib = coordinator.rib().clone();
    let mut coordinator_task = tokio::spawn(coordinator.run());

    loop {
        tokio::select! {
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sighup.recv() => dump_loc_rib(&rib).await,
            result = &mut coordinator_task => {
                result.map_err(|e| std::io::Error::other(e.to_string()))?;
                return Ok(());
            }
        }
    }

    info!("Received shutdown signal, stopping BGP sessions...");
    shutdown.cancel();
    coordinator_task
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    info!("Shutdown complete");
    Ok(())
}

async fn dump_loc_rib(rib: &RibHandle) {
    match rib.snapshot().await {
        Ok(loc_rib) => {
            info!(routes = loc_rib.len(), "Local RIB has {} routes", loc_rib.len());
            for (prefix, best) in loc_rib.iter() {
                info!(prefix = %prefix, source = %best.source, "{} {}", prefix, best.entry);
            }
        }
        Err(e) => error!(error = %e, "Failed to read Local RIB: {}", e),
    }
}

fn check_config(config_path: &Path) -> ExitCode {
    let (config, resolved) = match load(config_path, None) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let identity = &resolved.identity;
    println!("AS{} router-id {}", identity.asn, identity.router_id);
    println!(
        "hold-time {}s, connect-retry {}s, strict-open {}",
        config.hold_time, config.connect_retry_time, config.strict_open
    );

    println!();
    println!("{:<12} {:<18} {:<16} {:<8} REMOTE-AS", "PEER", "LOCAL", "REMOTE", "MODE");
    for peer in &resolved.peers {
        println!(
            "{:<12} {:<18} {:<16} {:<8} {}",
            peer.interface,
            format!("{}/{}", peer.local_addr, peer.network.prefix_len()),
            peer.remote_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string()),
            format!("{:?}", peer.mode).to_lowercase(),
            peer.remote_asn.map(|a| a.to_string()).unwrap_or_else(|| "any".to_string()),
        );
    }
    for failure in &resolved.failures {
        println!("skipped: {}", failure);
    }

    println!();
    let connected = connected_rib(identity.asn, &identity.connected);
    for (prefix, best) in select_best(&connected, &Default::default()) {
        println!("{:<20} {}", prefix.to_string(), best.entry);
    }

    ExitCode::SUCCESS
}
