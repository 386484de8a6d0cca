use std::path::PathBuf;
use std::sync::Arc;

use byte_unit::Byte;
use gfs::chunk::ChunkStore;
use gfs::chunkserver::Chunkserver;
use gfs::client::Client;
use gfs::common::{Lifecycle, NetworkShim};
use gfs::config::Config;
use gfs::core::SystemClock;
use gfs::master::MasterServer;
use gfs::placement::wait_for_servers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gfs=info")),
        )
        .init();

    let network = Arc::new(NetworkShim::new());
    let clock = Arc::new(SystemClock);
    let lifecycle = Lifecycle::new();
    let config = Config { chunk_size: 1024, ..Config::default() };

    // Setup master.
    println!("Creating master.\n");
    let master = Arc::new(MasterServer::new(config.clone(), network.clone(), clock.clone()));
    network.add_master("master", master.clone());
    tokio::spawn(master.clone().run(lifecycle.clone()));

    // Setup client.
    println!("Creating client.\n");
    let client = Client::new("demo", "master".into(), config.clone(), network.clone());

    // Setup chunkserver 1-N.
    let n_chunkservers = 3;
    for i in 0..n_chunkservers {
        println!("Creating chunkserver {i}.\n");
        // data path is relative ./data/chunkserver-{i}
        let storage_dir = PathBuf::from(format!("./data/chunkserver-{i}"));
        let storage = ChunkStore::open(storage_dir, config.chunk_size)?;
        let address = format!("chunkserver-{i}");
        let chunkserver = Arc::new(Chunkserver::new(
            address.clone(),
            "master".into(),
            config.clone(),
            storage,
            network.clone(),
            clock.clone(),
        ));
        network.add_chunkserver(&address, chunkserver.clone());

        // Registers on its first heartbeat tick.
        tokio::spawn(chunkserver.run(lifecycle.clone()));
    }

    // Poll until the master has seen every chunkserver.
    let backoff = gfs::common::Backoff::new(config.client_backoff(), config.heartbeat_interval(), 20);
    let servers = wait_for_servers(&client, n_chunkservers, backoff).await?;
    println!("chunkservers: {servers:?}\n");

    // Chunks left over from an earlier run belong to no file, so registration reclaims them.
    client.create_file("/files/x").await?;
    let (_, x_hello) = client.append("/files/x", b"hello").await?;
    let (_, x_world) = client.append("/files/x", b"world").await?;

    client.create_file("/files/y").await?;
    client.append("/files/y", b"world").await?;
    client.append("/files/y", b"hello").await?;

    println!("ls /files/");
    client.ls("/files/").await?.iter().for_each(|x| println!("{x}"));

    let x = client.read_chunk("/files/x", 0, x_hello, x_world + 5).await?;
    println!("/files/x: {}", String::from_utf8_lossy(&x));
    let y = client.read_chunk("/files/y", 0, 0, 10).await?;
    println!("/files/y: {}", String::from_utf8_lossy(&y));

    // Snapshot, then keep writing to the original.
    client.snapshot_file("/files/x", "/files/x.bak").await?;
    client.write_chunk("/files/x", 0, 0, b"HELLO").await?;
    let x = client.read_chunk("/files/x", 0, 0, 10).await?;
    let backup = client.read_chunk("/files/x.bak", 0, 0, 10).await?;
    println!("/files/x: {}, /files/x.bak: {}", String::from_utf8_lossy(&x), String::from_utf8_lossy(&backup));

    println!("ls_tree /");
    client.ls_tree("/").await?.iter().for_each(|x| println!("{x}"));
    println!("chunk size: {:#}", Byte::from_u64(config.chunk_size));
    println!("largest append: {:#}", Byte::from_u64(config.max_append()));

    lifecycle.shutdown();
    Ok(())
}
