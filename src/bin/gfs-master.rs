use std::sync::Arc;

use gfs::common::{serve, Lifecycle, TcpTransport};
use gfs::config::Config;
use gfs::core::SystemClock;
use gfs::master::MasterServer;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Usage: gfs-master [listen-address]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gfs=info")))
        .init();

    let listen = std::env::args().nth(1).unwrap_or_else(|| "0.0.0.0:7000".to_string());
    let config = Config::from_env()?;

    let master = Arc::new(MasterServer::new(config, Arc::new(TcpTransport), Arc::new(SystemClock)));
    let listener = TcpListener::bind(&listen).await?;
    info!("master listening on {listen}");

    let lifecycle = Lifecycle::new();
    tokio::spawn(master.clone().run(lifecycle.clone()));

    let shutdown = lifecycle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
        }
        shutdown.shutdown();
    });

    serve(listener, master, lifecycle).await?;
    Ok(())
}
