use anyhow::{Context, Result};
use clap::Parser;
use tandem_server::config::{Cli, ServerConfig};
use tandem_server::telemetry::Telemetry;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(listen_addr = %config.listen_addr, "starting tandem-server");

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    tandem_server::run(
        config,
        listener,
        Some(telemetry.metrics_handle()),
        shutdown_signal(),
    )
    .await
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
