use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gfs::client::Client;
use gfs::common::{Backoff, TcpTransport};
use gfs::config::Config;
use gfs::placement::{wait_for_servers, wait_for_workers, EnvPlacement, Placement};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Usage: gfs-client <user> <workers>
///
/// Waits for `<workers>` chunkservers to be scheduled and registered, then
/// appends to and reads back a file.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gfs=info")))
        .init();

    let mut args = std::env::args().skip(1);
    let user = args.next().context("missing user")?;
    let workers: usize = args.next().context("missing worker count")?.parse().context("worker count")?;

    let placement = EnvPlacement::new(&user);
    let master = placement.master_address()?;
    info!("client for {user}, master @ {master}, {workers} workers");

    let poll = || Backoff::new(Duration::from_millis(50), Duration::from_secs(1), 60);
    for worker in wait_for_workers(&placement, "worker", workers, poll()).await? {
        info!(" - {worker}");
    }

    let config = Config::from_env()?;
    let client = Client::new(format!("{user}-client"), master, config, Arc::new(TcpTransport));
    for server in wait_for_servers(&client, workers, poll()).await? {
        info!(" - {server}");
    }

    let file = format!("/{user}/hello");
    client.create_file(&file).await?;
    let (index, hello) = client.append(&file, b"hello").await?;
    let (_, world) = client.append(&file, b"world").await?;
    let read = client.read_chunk(&file, index, hello, world + 5).await?;
    info!("{file}: {}", String::from_utf8_lossy(&read));
    Ok(())
}
