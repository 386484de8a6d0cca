use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use gfs::chunk::ChunkStore;
use gfs::chunkserver::Chunkserver;
use gfs::common::{serve, Lifecycle, TcpTransport};
use gfs::config::Config;
use gfs::core::SystemClock;
use gfs::placement::{EnvPlacement, Placement};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Usage: gfs-chunkserver <listen-address> <storage-dir> [master-address]
///
/// Without a master address, it is read from `<GFS_USER>_MASTER_SERVICE_HOST`
/// and `<GFS_USER>_MASTER_SERVICE_PORT`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gfs=info")))
        .init();

    let mut args = std::env::args().skip(1);
    let listen = args.next().context("missing listen address")?;
    let storage_dir = PathBuf::from(args.next().context("missing storage directory")?);
    let master = match args.next() {
        Some(master) => master,
        None => {
            let user = std::env::var("GFS_USER").unwrap_or_else(|_| "student".to_string());
            EnvPlacement::new(&user).master_address()?
        }
    };

    let config = Config::from_env()?;
    let storage = ChunkStore::open(storage_dir, config.chunk_size)?;
    let chunkserver = Arc::new(Chunkserver::new(
        listen.clone(),
        master.clone(),
        config,
        storage,
        Arc::new(TcpTransport),
        Arc::new(SystemClock),
    ));

    let listener = TcpListener::bind(&listen).await?;
    info!("chunkserver {listen} serving, master @ {master}");

    if let Err(e) = chunkserver.register().await {
        warn!("initial registration failed, will retry: {e}");
    }

    let lifecycle = Lifecycle::new();
    tokio::spawn(chunkserver.clone().run(lifecycle.clone()));

    let shutdown = lifecycle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
        }
        shutdown.shutdown();
    });

    serve(listener, chunkserver, lifecycle).await?;
    Ok(())
}
