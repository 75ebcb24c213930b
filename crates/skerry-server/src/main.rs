//! skerry-server entry point.
//!
//! Loads configuration from the environment, fences (or purges) sandboxes
//! left behind by a previous run, serves the HTTP API and tears every
//! sandbox down on Ctrl-C.

use skerry_server::{http, ServerConfig, SkerryServer};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("skerry_server=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting skerry server");

    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // warn-only so a partially provisioned dev host can still start
    config.validate_warn();

    let server = SkerryServer::new(config.clone())?;

    if let Err(e) = server.recover_orphans().await {
        tracing::error!(error = %e, "Orphan recovery failed");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_server = server.clone();
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_server, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    let _ = http_handle.await;

    if let Err(e) = server.shutdown().await {
        tracing::error!(error = %e, "Error during sandbox cleanup");
    } else {
        tracing::info!("All sandboxes cleaned up");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}
