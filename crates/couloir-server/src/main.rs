use tracing::info;
use tracing_subscriber::EnvFilter;

use couloir_server::{spawn_relay, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,couloir_server=debug")),
        )
        .init();

    info!("Starting Couloir signaling relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");

    let (addr, relay) = spawn_relay(config).await?;
    info!(%addr, "relay running");

    tokio::select! {
        result = relay => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay task failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
