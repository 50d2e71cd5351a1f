// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - CLI Client
// Command-line interface for setting up and opening BTP tunnels

mod config;
mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use btp_tunnel_common::TunnelEvent;
use btp_tunnel_core::{Connection, CredentialPrompt, SetupSession};

use prompt::TerminalPrompt;

#[derive(Parser)]
#[command(name = "btp-tunnel")]
#[command(about = "SSH tunnel to on-premise systems through the BTP connectivity proxy", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/btp-tunnel/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Choose account, helper app and destination; produce connection data
    Setup {
        /// Write the connection data here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// BTP login email
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Open the tunnel from stored connection data and keep it open until Ctrl+C
    Open {
        /// Connection data file written by `setup`
        #[arg(short, long)]
        data: PathBuf,

        /// Do not verify the gateway host key
        #[arg(long)]
        insecure_skip_host_key: bool,

        /// Store the refreshed token back into the data file on exit
        #[arg(long)]
        update: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "btp_tunnel=info,btp_tunnel_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup { output, email } => {
            run_setup(cli.config.as_deref(), output, email).await?;
        }
        Commands::Open {
            data,
            insecure_skip_host_key,
            update,
        } => {
            open_tunnel(cli.config.as_deref(), &data, insecure_skip_host_key, update).await?;
        }
        Commands::Config => {
            let config = config::load(cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_setup(config_path: Option<&Path>, output: Option<PathBuf>, email: Option<String>) -> Result<()> {
    let config = config::load(config_path)?;
    println!("{}", "BTP tunnel setup".bold().green());

    let login = prompt::ask_login(email)?;
    let prompt = Arc::new(TerminalPrompt::new());
    let session = SetupSession::new(config, prompt.clone())?.with_relogin(prompt.clone());

    let data = match session.run(&login).await {
        Ok(data) => data,
        Err(e) => {
            prompt.abandon();
            return Err(e).context("Setup failed");
        }
    };
    prompt.finish("✓ Setup complete");

    match output {
        Some(path) => {
            config::write_reconnection_data(&path, &data)?;
            println!(
                "Connection data written to {}. Open the tunnel with: {}",
                path.display(),
                format!("btp-tunnel open --data {}", path.display()).yellow()
            );
        }
        None => println!("{}", data.to_json()?),
    }
    Ok(())
}

async fn open_tunnel(
    config_path: Option<&Path>,
    data_path: &Path,
    insecure_skip_host_key: bool,
    update: bool,
) -> Result<()> {
    let mut config = config::load(config_path)?;
    if insecure_skip_host_key {
        config.tunnel.verify_host_key = false;
    }
    let data = config::read_reconnection_data(data_path)?;

    let prompt: Arc<dyn CredentialPrompt> = Arc::new(TerminalPrompt::new());
    let connection = Connection::new(config, data, Some(prompt))?;
    let events = connection.tunnels().subscribe();
    let reporter = tokio::spawn(report_events(events));

    println!("Opening tunnel...");
    let handle = connection.open().await.context("Failed to open tunnel")?;

    println!();
    println!("{}", "✓ Tunnel open".green().bold());
    for addr in handle.local_addrs() {
        println!("  Listening on {}", addr.to_string().cyan());
    }
    println!();
    println!("Press Ctrl+C to close the tunnel");

    let mut state = handle.watch_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            println!();
            info!("Ctrl+C received, closing tunnel");
        }
        _ = state.wait_for(|s| !s.is_listening()) => {
            warn!("Tunnel stopped: {}", handle.state());
        }
    }

    connection.close().await.context("Failed to close tunnel")?;
    reporter.abort();
    println!("{}", "✓ Tunnel closed".green().bold());

    if update {
        config::write_reconnection_data(data_path, &connection.reconnection_data())?;
        println!("Connection data updated in {}", data_path.display());
    }
    Ok(())
}

async fn report_events(mut events: broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::ConnectionOpened { peer, remote, .. }) => {
                debug!("Connection from {} relayed to {}", peer, remote);
            }
            Ok(TunnelEvent::ConnectionRejected { peer, reason, .. }) => {
                println!("{}", format!("Connection from {} rejected: {}", peer, reason).yellow());
            }
            Ok(TunnelEvent::StateChanged { state, .. }) => {
                debug!("Tunnel state: {}", state);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("Missed {} tunnel events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
