// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Chorus Peer Node
//!
//! Entry point for the `chorus-node` binary. Parses CLI arguments,
//! initializes logging, binds the operator console and the UDP peer
//! socket, and runs the node until SIGINT/SIGTERM.
//!
//! Startup sequence:
//!
//! 1. Parse CLI args
//! 2. Initialize logging
//! 3. Bind the console listener (its port travels in every announcement)
//! 4. Bind the UDP peer socket
//! 5. Spawn the console adapter and the node loop
//! 6. Await a shutdown signal, then drain through the watch channel

mod cli;
mod console;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

use chorus_protocol::fault::FaultStyle;
use chorus_protocol::node::{NodeConfig, PeerNode};

use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::ChorusNodeCli::parse();

    let filter = format!(
        "chorus_node={level},chorus_protocol={level}",
        level = cli.log_level
    );
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init_logging(&filter, format);

    // Console first: its port is advertised in every gossip announcement,
    // so it has to exist before the node says hello to the seeds.
    let console_listener = TcpListener::bind(("0.0.0.0", cli.console_port.unwrap_or(0)))
        .await
        .context("failed to bind console listener")?;
    let console_port = console_listener
        .local_addr()
        .context("console listener has no local address")?
        .port();

    let config = NodeConfig {
        udp_port: cli.port,
        advertise_host: cli.host.clone(),
        name: cli.name.clone(),
        cli_port: console_port,
        fault_style: if cli.sentinel_faults {
            FaultStyle::Sentinel
        } else {
            FaultStyle::Decoy
        },
        ..NodeConfig::default()
    };
    let (node, handle) = PeerNode::bind(config)
        .await
        .context("failed to bind UDP peer socket")?;

    tracing::info!(
        udp = %node.local_addr(),
        console = console_port,
        name = %cli.name,
        "starting chorus-node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let console_task = tokio::spawn(console::serve(
        console_listener,
        handle.clone(),
        shutdown_rx.clone(),
    ));
    let node_task = tokio::spawn(node.run(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("shutdown signal received, closing sockets");

    let _ = shutdown_tx.send(true);
    let _ = node_task.await;
    console_task.abort();

    tracing::info!("chorus-node stopped");
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
