//! Billing Sync Server
//!
//! Stripe webhook ingestion and subscription administration over HTTP.

use std::net::IpAddr;

use anyhow::Context;
use billing_sync::app::{build_router, Stores};
use billing_sync::config::ServiceConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Billing Sync Server
#[derive(Parser, Debug)]
#[command(name = "billing-sync")]
#[command(version)]
#[command(about = "Stripe webhook reconciliation and subscription administration")]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to (overrides BIND_ADDR)
    #[arg(short = 'H', long)]
    host: Option<IpAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ServiceConfig::from_env().context("loading configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.bind_addr = host;
    }

    let stores = Stores::open(&config).await.context("opening store")?;
    let app = build_router(&config, stores).context("building service")?;

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(%addr, version = billing_sync::VERSION, "Billing sync server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("Billing sync server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
