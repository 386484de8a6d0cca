//! How the master, chunkservers and clients reach each other.
//!
//! Every node implements [`Service`] for its request/reply pair. Callers go
//! through a [`Transport`]: either the in-process [`NetworkShim`], which
//! hands requests straight to registered services, or [`TcpTransport`],
//! which speaks one JSON document per line to a [`serve`] loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::rpc::{ChunkserverReply, ChunkserverRequest, MasterReply, MasterRequest};
use crate::core::{GfsError, Result};

#[async_trait]
pub trait Service: Send + Sync + 'static {
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Reply: Serialize + DeserializeOwned + Send + 'static;

    async fn handle(&self, request: Self::Request) -> Result<Self::Reply>;
}

pub type MasterService = dyn Service<Request = MasterRequest, Reply = MasterReply>;
pub type ChunkserverService = dyn Service<Request = ChunkserverRequest, Reply = ChunkserverReply>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call_master(&self, addr: &str, request: MasterRequest) -> Result<MasterReply>;

    async fn call_chunkserver(
        &self,
        addr: &str,
        request: ChunkserverRequest,
    ) -> Result<ChunkserverReply>;
}

/// In-process network. Nodes are registered by address; disconnected
/// addresses fail every call with `Unreachable`.
#[derive(Default)]
pub struct NetworkShim {
    masters: RwLock<HashMap<String, Arc<MasterService>>>,
    chunkservers: RwLock<HashMap<String, Arc<ChunkserverService>>>,
    down: RwLock<HashSet<String>>,
}

impl NetworkShim {
    pub fn new() -> NetworkShim {
        NetworkShim::default()
    }

    pub fn add_master(&self, addr: &str, master: Arc<MasterService>) {
        write(&self.masters).insert(addr.to_string(), master);
    }

    pub fn add_chunkserver(&self, addr: &str, chunkserver: Arc<ChunkserverService>) {
        write(&self.chunkservers).insert(addr.to_string(), chunkserver);
    }

    /// Simulate a crash or partition of `addr`.
    pub fn disconnect(&self, addr: &str) {
        write(&self.down).insert(addr.to_string());
    }

    pub fn reconnect(&self, addr: &str) {
        write(&self.down).remove(addr);
    }

    fn check_up(&self, addr: &str) -> Result<()> {
        let down = self.down.read().unwrap_or_else(|e| e.into_inner());
        if down.contains(addr) {
            return Err(GfsError::Unreachable(format!("{addr} is disconnected")));
        }
        Ok(())
    }
}

/// Lock a mutex, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Transport for NetworkShim {
    async fn call_master(&self, addr: &str, request: MasterRequest) -> Result<MasterReply> {
        self.check_up(addr)?;
        let node = self.masters.read().unwrap_or_else(|e| e.into_inner()).get(addr).cloned();
        match node {
            Some(master) => master.handle(request).await,
            None => Err(GfsError::Unreachable(format!("no master at {addr}"))),
        }
    }

    async fn call_chunkserver(
        &self,
        addr: &str,
        request: ChunkserverRequest,
    ) -> Result<ChunkserverReply> {
        self.check_up(addr)?;
        let node = self.chunkservers.read().unwrap_or_else(|e| e.into_inner()).get(addr).cloned();
        match node {
            Some(chunkserver) => chunkserver.handle(request).await,
            None => Err(GfsError::Unreachable(format!("no chunkserver at {addr}"))),
        }
    }
}

/// JSON-lines over TCP, one connection per call.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    async fn call<Req: Serialize, Rep: DeserializeOwned>(&self, addr: &str, request: &Req) -> Result<Rep> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GfsError::Unreachable(format!("connect {addr}: {e}")))?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        write_half.write_all(&line).await?;
        write_half.shutdown().await?;

        let mut reply = String::new();
        let n = BufReader::new(read_half).read_line(&mut reply).await?;
        if n == 0 {
            return Err(GfsError::Unreachable(format!("{addr} closed the connection")));
        }
        let reply: std::result::Result<Rep, GfsError> = serde_json::from_str(&reply)?;
        reply
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call_master(&self, addr: &str, request: MasterRequest) -> Result<MasterReply> {
        self.call(addr, &request).await
    }

    async fn call_chunkserver(
        &self,
        addr: &str,
        request: ChunkserverRequest,
    ) -> Result<ChunkserverReply> {
        self.call(addr, &request).await
    }
}

/// Accept connections on `listener` and dispatch each request line to `service`
/// until `lifecycle` starts draining.
pub async fn serve<S: Service>(listener: TcpListener, service: Arc<S>, lifecycle: Lifecycle) -> Result<()> {
    let local = listener.local_addr()?;
    let mut state = lifecycle.subscribe();
    lifecycle.set(State::Serving);
    info!("serving on {local}");

    while !lifecycle.is_draining() {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept on {local} failed: {e}");
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service).await {
                        debug!("connection from {peer} ended: {e}");
                    }
                });
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() >= State::Draining {
                    break;
                }
            }
        }
    }

    lifecycle.set(State::Stopped);
    info!("stopped serving on {local}");
    Ok(())
}

async fn handle_connection<S: Service>(stream: TcpStream, service: Arc<S>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match serde_json::from_str::<S::Request>(&line) {
            Ok(request) => service.handle(request).await,
            Err(e) => Err(GfsError::from(e)),
        };
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        write_half.write_all(&out).await?;
    }
    Ok(())
}

/// Exponential backoff with jitter and a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    attempts_left: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max_delay: Duration, attempts: usize) -> Backoff {
        Backoff { delay: initial, max_delay, attempts_left: attempts.max(1) }
    }

    /// Use up one attempt. Returns `false` once the budget is spent.
    pub fn attempt(&mut self) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        true
    }

    /// Sleep before the next attempt, doubling the delay up to the cap.
    pub async fn wait(&mut self) {
        let jitter = Duration::from_millis(rand::random::<u64>() % 25);
        tokio::time::sleep(self.delay + jitter).await;
        self.delay = (self.delay * 2).min(self.max_delay);
    }
}

/// Run state of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Shared run/shutdown state machine. Background loops watch it and exit
/// once it reaches `Draining`.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<State>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        let (tx, _rx) = watch::channel(State::Starting);
        Lifecycle { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> State {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.tx.subscribe()
    }

    /// States only move forward.
    pub fn set(&self, next: State) {
        self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    pub fn shutdown(&self) {
        self.set(State::Draining);
    }

    pub fn is_draining(&self) -> bool {
        self.state() >= State::Draining
    }

    /// Resolves once shutdown has been requested.
    pub async fn draining(&self) {
        let mut rx = self.subscribe();
        while *rx.borrow() < State::Draining {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        type Request = ChunkserverRequest;
        type Reply = ChunkserverReply;

        async fn handle(&self, request: ChunkserverRequest) -> Result<ChunkserverReply> {
            match request {
                ChunkserverRequest::Push { data, .. } => Ok(ChunkserverReply::Data(data)),
                ChunkserverRequest::Heartbeat => Ok(ChunkserverReply::Done),
                _ => Err(GfsError::UnknownChunk(0)),
            }
        }
    }

    #[tokio::test]
    async fn shim_disconnect_and_reconnect() {
        let network = NetworkShim::new();
        network.add_chunkserver("cs-0", Arc::new(Echo));

        network.call_chunkserver("cs-0", ChunkserverRequest::Heartbeat).await.unwrap();
        network.disconnect("cs-0");
        let err = network.call_chunkserver("cs-0", ChunkserverRequest::Heartbeat).await.unwrap_err();
        assert!(matches!(err, GfsError::Unreachable(_)));
        network.reconnect("cs-0");
        network.call_chunkserver("cs-0", ChunkserverRequest::Heartbeat).await.unwrap();

        let err = network.call_chunkserver("cs-9", ChunkserverRequest::Heartbeat).await.unwrap_err();
        assert!(matches!(err, GfsError::Unreachable(_)));
    }

    #[tokio::test]
    async fn tcp_round_trip_carries_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let lifecycle = Lifecycle::new();
        let server = tokio::spawn(serve(listener, Arc::new(Echo), lifecycle.clone()));

        let transport = TcpTransport;
        let push = ChunkserverRequest::Push { data: b"abc".to_vec(), ident: 1, forward_to: vec![] };
        let reply = transport.call_chunkserver(&addr, push).await.unwrap();
        assert_eq!(reply.into_data().unwrap(), b"abc");

        let read = ChunkserverRequest::Read { chunk: crate::core::Chunk::new(0, 0), start: 0, end: 1 };
        let err = transport.call_chunkserver(&addr, read).await.unwrap_err();
        assert_eq!(err, GfsError::UnknownChunk(0));

        lifecycle.shutdown();
        server.await.unwrap().unwrap();
        assert!(lifecycle.is_draining());
    }

    #[tokio::test]
    async fn backoff_budget_is_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 3);
        let mut tries = 0;
        while backoff.attempt() {
            tries += 1;
            backoff.wait().await;
        }
        assert_eq!(tries, 3);
        assert_eq!(backoff.delay, Duration::from_millis(40));
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let lifecycle = Lifecycle::new();
        lifecycle.set(State::Serving);
        lifecycle.set(State::Starting);
        assert_eq!(lifecycle.state(), State::Serving);
        lifecycle.shutdown();
        lifecycle.set(State::Stopped);
        assert_eq!(lifecycle.state(), State::Stopped);
    }
}
