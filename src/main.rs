// Heartbeat registry - main entry point
// Listens for client heartbeats and periodically reconciles client liveness with the store
// Copyright (C) 2026
// Licensed under AGPL v3

use std::sync::Arc;

use clap::Parser;
use heartbeat_registry::config::Config;
use heartbeat_registry::net::listener::TcpServer;
use heartbeat_registry::net::prober::TcpProber;
use heartbeat_registry::reconciler::Reconciler;
use heartbeat_registry::registry::Registry;
use heartbeat_registry::store::SqliteStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command-line arguments (and environment)
    let config = Config::parse();

    init_logging(config.verbose);

    // Everything below is validated before serving; any error aborts startup
    let listen_addr = config.listen_addr().map_err(|e| {
        error!("SERVER_IP and SERVER_PORT must describe a valid listen address: {}", e);
        e
    })?;
    let interval = config.poll_interval()?;
    let probe_timeout = config.probe_timeout()?;
    let store = Arc::new(SqliteStore::open(&config.db_path)?);

    let codec = config.codec.build();
    info!("Starting heartbeat registry on {} (codec: {})", listen_addr, codec.name());

    let registry = Arc::new(Registry::new());
    let prober = Arc::new(TcpProber::new(codec.clone(), probe_timeout));

    let mut server = TcpServer::start(listen_addr, registry.clone(), codec).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(registry.clone(), store, prober, interval);
    let reconciler_task = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    info!("Server ready on {}", server.addr());

    // Wait for shutdown signal (Ctrl+C)
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal (Ctrl+C)"),
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    server.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_task.await {
        error!("Reconciler task failed: {}", e);
    }

    info!(
        "Server stopped. Registered clients: {}, connections in flight: {}",
        registry.len().await,
        server.active_connections()
    );
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
