//! Rail Tunnel Client
//!
//! A CLI tool for exposing a local HTTP service through a Rail Tunnel relay.
//!
//! The client keeps one WebSocket control connection open to the relay. The
//! relay pushes public HTTP requests down that connection; the client replays
//! them against the local service and sends the responses back, reconnecting
//! on its own whenever the connection drops.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use crossterm::style::Stylize;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod error;
mod protocol;

use client::{create_event_channel, ConsoleReporter, Session, WsConnector};
use config::{Config, TunnelConfig, DEFAULT_LOCAL_HOST};

/// How long shutdown waits for the relay to acknowledge the close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "rail-tunnel")]
#[command(author, version, about = "🚇 Rail Tunnel - expose a local service to the internet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a tunnel to expose a local service to the internet
    Tunnel(TunnelArgs),

    /// Show system information
    Info,

    /// Save default settings, or show them when no option is given
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
struct TunnelArgs {
    /// Local port to tunnel (e.g. 3000, 8080)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Rail Tunnel server URL (e.g. https://my-tunnel.railway.app)
    #[arg(short, long, env = "RAIL_TUNNEL_REMOTE")]
    remote: Option<String>,

    /// Local host to forward to
    #[arg(short = 'H', long)]
    host: Option<String>,
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Default Rail Tunnel server URL
    #[arg(short, long)]
    remote: Option<String>,

    /// Default local host to forward to
    #[arg(short = 'H', long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Tunnel(args)) => run_tunnel(args).await,
        Some(Commands::Info) => {
            run_info();
            Ok(())
        }
        Some(Commands::Config(args)) => run_config(args),
        None => {
            Cli::command().print_help()?;
            println!();
            println!("Examples:");
            println!("  $ rail-tunnel tunnel --port 3000 --remote https://my-app.railway.app");
            println!("  $ rail-tunnel tunnel --port 8080 --remote https://my-api.railway.app");
            println!("  $ rail-tunnel config --remote https://my-app.railway.app");
            println!("  $ rail-tunnel info");
            println!();
            println!("Note: Each relay deployment handles one tunnel. Deploy multiple times for multiple tunnels.");
            Ok(())
        }
    }
}

async fn run_tunnel(args: TunnelArgs) -> Result<()> {
    let config = Config::load().unwrap_or_default();

    // Resolve relay from CLI > env > config > error
    let remote = args.remote.or(config.relay.url).ok_or_else(|| {
        anyhow::anyhow!(
            "Relay URL required. Use --remote, set RAIL_TUNNEL_REMOTE, \n\
             or run 'rail-tunnel config --remote <url>'"
        )
    })?;
    let host = args
        .host
        .or(config.local.host)
        .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string());

    println!("{}", "Rail Tunnel".cyan());
    println!(
        "{}",
        format!("Tunneling {}:{} -> Rail Tunnel", host, args.port).grey()
    );

    let tunnel_config = TunnelConfig::new(&host, args.port, &remote)?;

    let (events_tx, events_rx) = create_event_channel();
    let reporter = tokio::spawn(ConsoleReporter::new(events_rx).run());

    let session = Session::new(tunnel_config, WsConnector, Some(events_tx))?;

    if let Err(e) = session.start().await {
        session.close();
        drop(session);
        flush_reporter(reporter).await;
        return Err(e).context("Failed to start tunnel");
    }

    if let Some(info) = session.connection_info() {
        info!("Forwarding {} -> {}", info.public_url, info.local_url);
    }

    shutdown_signal().await;

    session.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, session.closed())
        .await
        .is_err()
    {
        warn!(
            "Tunnel did not close within {:?} (state: {:?})",
            SHUTDOWN_GRACE,
            session.state()
        );
    }
    drop(session);
    flush_reporter(reporter).await;

    Ok(())
}

/// Let the reporter print what is still queued. In-flight forwards may keep
/// the channel open, so this is bounded.
async fn flush_reporter(reporter: JoinHandle<()>) {
    let _ = tokio::time::timeout(Duration::from_millis(250), reporter).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
            println!("{}", " Shutting down tunnel...".yellow());
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

fn run_info() {
    println!("{}", "Rail Tunnel CLI Info".cyan());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);
    println!("{}", "CLI is working!".green());
}

fn run_config(args: ConfigArgs) -> Result<()> {
    let path = Config::config_path()?;
    let mut config = Config::load()?;

    if args.remote.is_none() && args.host.is_none() {
        println!("Config file: {}", path.display());
        println!(
            "Relay URL:   {}",
            config.relay.url.as_deref().unwrap_or("(not set)")
        );
        println!(
            "Local host:  {}",
            config.local.host.as_deref().unwrap_or(DEFAULT_LOCAL_HOST)
        );
        return Ok(());
    }

    if let Some(remote) = args.remote {
        // Validate before saving; the port is irrelevant here.
        TunnelConfig::new(DEFAULT_LOCAL_HOST, 1, &remote)?;
        config.relay.url = Some(remote);
    }
    if let Some(host) = args.host {
        config.local.host = Some(host);
    }
    config.save()?;

    println!("Config saved to {}", path.display());
    Ok(())
}

fn init_logging(verbose: bool) {
    // The reporter owns user-facing output; logs only surface problems
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
