//! A chunkserver: holds chunk replicas, buffers pushed data, and when it
//! holds a chunk's lease, orders mutations and forwards them to secondaries.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::chunk::ChunkStore;
use crate::common::{lock, Lifecycle, Service, Transport};
use crate::config::Config;
use crate::core::rpc::{ChunkserverReply, ChunkserverRequest, MasterRequest};
use crate::core::{Address, Chunk, ChunkHandle, Clock, DataIdent, GfsError, Result};
use crate::lease::{HeldLeases, PrimaryRecord};

pub mod buffer;

use buffer::PushBuffer;

pub struct Chunkserver {
    /// Our own address, as registered with the master.
    pub id: Address,
    master: Address,
    config: Config,
    network: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,

    /// The storage for the chunkserver.
    storage: Mutex<ChunkStore>,

    /// Pushed data awaiting a mutation.
    push_buffer: Mutex<PushBuffer>,

    leases: Mutex<HeldLeases>,
    primaries: Mutex<PrimaryRecord>,

    /// Serializes mutations per chunk, from choosing the offset through secondary fan-out.
    chunk_locks: DashMap<ChunkHandle, Arc<tokio::sync::Mutex<()>>>,
}

impl Chunkserver {
    pub fn new(
        id: Address,
        master: Address,
        config: Config,
        storage: ChunkStore,
        network: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Chunkserver {
        let push_buffer = PushBuffer::new(config.push_buffer_capacity, config.push_buffer_ttl_ms);
        Chunkserver {
            id,
            master,
            config,
            network,
            clock,
            storage: Mutex::new(storage),
            push_buffer: Mutex::new(push_buffer),
            leases: Mutex::new(HeldLeases::default()),
            primaries: Mutex::new(PrimaryRecord::default()),
            chunk_locks: DashMap::new(),
        }
    }

    /// Keep re-registering with the master and sweeping the push buffer until shutdown.
    pub async fn run(self: Arc<Self>, lifecycle: Lifecycle) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        let mut gc = tokio::time::interval(self.config.gc_interval());

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.register().await {
                        warn!("{}: register with master {} failed: {e}", self.id, self.master);
                    }
                }
                _ = gc.tick() => {
                    self.collect_garbage();
                }
                _ = lifecycle.draining() => break,
            }
        }
        info!("{}: background tasks stopped", self.id);
    }

    /// Report our chunks to the master, drop whatever it says is garbage, and
    /// learn the primaries of chunks we serve as a secondary.
    pub async fn register(&self) -> Result<()> {
        let chunks = lock(&self.storage).inventory();
        let reply = self
            .network
            .call_master(&self.master, MasterRequest::Register { address: self.id.clone(), chunks })
            .await?
            .into_registered()?;

        if !reply.garbage.is_empty() {
            info!("{}: deleting {} garbage chunks {:?}", self.id, reply.garbage.len(), reply.garbage);
        }
        for handle in reply.garbage {
            lock(&self.storage).delete(handle)?;
            lock(&self.leases).revoke(handle);
            lock(&self.primaries).forget(handle);
            self.chunk_locks.remove(&handle);
        }
        for (chunk, primary) in reply.primaries {
            if lock(&self.storage).version(chunk.handle) == Some(chunk.version) {
                debug!("{}: {primary} is primary for {chunk}", self.id);
                lock(&self.primaries).record(chunk, primary);
            }
        }
        Ok(())
    }

    pub fn collect_garbage(&self) {
        let now = self.clock.now_ms();
        let (dropped, buffered) = {
            let mut buffer = lock(&self.push_buffer);
            (buffer.collect_garbage(now), buffer.len())
        };
        let expired = lock(&self.leases).forget_expired(now);
        if dropped > 0 || expired > 0 {
            debug!("{}: dropped {dropped} idle pushes ({buffered} left), {expired} expired leases", self.id);
        }
    }

    /// Whether pushed data for `ident` is buffered here.
    pub fn has_pushed(&self, ident: DataIdent) -> bool {
        lock(&self.push_buffer).contains(ident)
    }

    pub fn pushed(&self, ident: DataIdent) -> Option<Vec<u8>> {
        lock(&self.push_buffer).peek(ident)
    }

    pub fn inventory(&self) -> Vec<Chunk> {
        lock(&self.storage).inventory()
    }

    fn chunk_lock(&self, handle: ChunkHandle) -> Arc<tokio::sync::Mutex<()>> {
        self.chunk_locks.entry(handle).or_default().clone()
    }

    fn take_pushed(&self, ident: DataIdent) -> Result<Vec<u8>> {
        lock(&self.push_buffer).take(ident).ok_or(GfsError::UnknownData(ident))
    }

    pub fn read(&self, chunk: Chunk, start: u64, end: u64) -> Result<Vec<u8>> {
        lock(&self.storage).read(chunk, start, end)
    }

    /// Store pushed data, then pass it down the chain. Only acknowledged once
    /// every server further down holds it too.
    pub async fn push(&self, data: Vec<u8>, ident: DataIdent, forward_to: Vec<Address>) -> Result<()> {
        let now = self.clock.now_ms();
        lock(&self.push_buffer).put(ident, data.clone(), now);

        let Some((next, rest)) = forward_to.split_first() else {
            return Ok(());
        };
        let forward = ChunkserverRequest::Push { data, ident, forward_to: rest.to_vec() };
        match self.network.call_chunkserver(next, forward).await {
            Ok(reply) => reply.into_done(),
            Err(e) => {
                warn!("{}: forwarding push {ident:#x} to {next} failed: {e}", self.id);
                Err(GfsError::Unreachable(format!("push chain broken at {next}: {e}")))
            }
        }
    }

    pub async fn write(&self, chunk: Chunk, offset: u64, ident: DataIdent) -> Result<()> {
        self.mutate_as_primary(chunk, Some(offset), ident).await.map(|_| ())
    }

    pub async fn append(&self, chunk: Chunk, ident: DataIdent) -> Result<u64> {
        self.mutate_as_primary(chunk, None, ident).await
    }

    /// Order one mutation, apply it here, then have every secondary apply it at
    /// the same offset before replying. `offset` is `None` for record append.
    async fn mutate_as_primary(&self, chunk: Chunk, offset: Option<u64>, ident: DataIdent) -> Result<u64> {
        let chunk_lock = self.chunk_lock(chunk.handle);
        let _ordered = chunk_lock.lock().await;

        let secondaries = lock(&self.leases).check(chunk, self.clock.now_ms())?.secondaries.clone();
        let data = self.take_pushed(ident)?;

        let offset = {
            let mut storage = lock(&self.storage);
            match offset {
                Some(offset) => {
                    storage.write_at(chunk, offset, &data)?;
                    offset
                }
                None => storage.append(chunk, &data)?,
            }
        };
        debug!("{}: applied {} bytes to {chunk} at {offset}", self.id, data.len());

        let mut failed = Vec::new();
        for secondary in &secondaries {
            let mutate = ChunkserverRequest::Mutate { chunk, offset, data: ident, from: self.id.clone() };
            let result = self.network.call_chunkserver(secondary, mutate).await.and_then(|r| r.into_done());
            if let Err(e) = result {
                warn!("{}: secondary {secondary} failed to apply {chunk} at {offset}: {e}", self.id);
                failed.push(format!("{secondary}: {e}"));
            }
        }

        if !failed.is_empty() {
            return Err(GfsError::Replication { handle: chunk.handle, reason: failed.join("; ") });
        }
        Ok(offset)
    }

    /// Apply a mutation ordered by the primary.
    pub async fn mutate(&self, chunk: Chunk, offset: u64, ident: DataIdent, from: &str) -> Result<()> {
        lock(&self.primaries).check(chunk, from)?;

        let chunk_lock = self.chunk_lock(chunk.handle);
        let _ordered = chunk_lock.lock().await;

        match lock(&self.storage).version(chunk.handle) {
            Some(version) if version == chunk.version => {}
            Some(version) => {
                return Err(GfsError::stale(
                    chunk.handle,
                    format!("mutate for version {}, stored {version}", chunk.version),
                ))
            }
            None => return Err(GfsError::UnknownChunk(chunk.handle)),
        }
        let data = self.take_pushed(ident)?;
        lock(&self.storage).write_at(chunk, offset, &data)
    }

    pub fn grant_lease(&self, chunk: Chunk, expires_ms: u64, secondaries: Vec<Address>) -> Result<()> {
        lock(&self.storage).set_version(chunk)?;
        lock(&self.primaries).record(chunk, self.id.clone());
        lock(&self.leases).grant(chunk, expires_ms, secondaries);
        info!("{}: primary for {chunk} until {expires_ms}", self.id);
        Ok(())
    }

    pub fn revoke_lease(&self, chunk: Chunk) {
        if lock(&self.leases).revoke(chunk.handle).is_some() {
            info!("{}: lease on chunk {} revoked", self.id, chunk.handle);
        }
    }

    pub fn set_version(&self, chunk: Chunk, primary: Address) -> Result<()> {
        lock(&self.storage).set_version(chunk)?;
        // A new version starts a new lease term; any lease we held is over.
        if primary != self.id {
            lock(&self.leases).revoke(chunk.handle);
        }
        lock(&self.primaries).record(chunk, primary);
        Ok(())
    }
}

#[async_trait]
impl Service for Chunkserver {
    type Request = ChunkserverRequest;
    type Reply = ChunkserverReply;

    async fn handle(&self, request: ChunkserverRequest) -> Result<ChunkserverReply> {
        match request {
            ChunkserverRequest::Read { chunk, start, end } => {
                self.read(chunk, start, end).map(ChunkserverReply::Data)
            }
            ChunkserverRequest::Write { chunk, offset, data } => {
                self.write(chunk, offset, data).await?;
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::Append { chunk, data } => {
                let offset = self.append(chunk, data).await?;
                Ok(ChunkserverReply::Appended { offset })
            }
            ChunkserverRequest::Push { data, ident, forward_to } => {
                self.push(data, ident, forward_to).await?;
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::Mutate { chunk, offset, data, from } => {
                self.mutate(chunk, offset, data, &from).await?;
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::GrantLease { chunk, expires_ms, secondaries } => {
                self.grant_lease(chunk, expires_ms, secondaries)?;
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::RevokeLease { chunk } => {
                self.revoke_lease(chunk);
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::Heartbeat => Ok(ChunkserverReply::Done),
            ChunkserverRequest::CreateChunk { chunk } => {
                lock(&self.storage).create(chunk)?;
                debug!("{}: created {chunk}", self.id);
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::SetVersion { chunk, primary } => {
                self.set_version(chunk, primary)?;
                Ok(ChunkserverReply::Done)
            }
            ChunkserverRequest::CopyChunk { src, dst } => {
                lock(&self.storage).copy(src, dst)?;
                debug!("{}: copied {src} to {dst}", self.id);
                Ok(ChunkserverReply::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NetworkShim;
    use crate::core::ManualClock;

    const START: u64 = 1_000_000;

    struct Fixture {
        network: Arc<NetworkShim>,
        clock: ManualClock,
        servers: Vec<Arc<Chunkserver>>,
    }

    fn fixture(n: usize) -> Fixture {
        let network = Arc::new(NetworkShim::new());
        let clock = ManualClock::new(START);
        let config = Config { chunk_size: 64, ..Config::default() };
        let servers = (0..n)
            .map(|i| {
                let cs = Arc::new(Chunkserver::new(
                    format!("cs-{i}"),
                    "master".into(),
                    config.clone(),
                    ChunkStore::in_memory(config.chunk_size),
                    network.clone(),
                    Arc::new(clock.clone()),
                ));
                network.add_chunkserver(&cs.id, cs.clone());
                cs
            })
            .collect();
        Fixture { network, clock, servers }
    }

    /// Chunk 1 at version 1 on every server, `cs-0` primary until START + 10s.
    fn lease_chunk(f: &Fixture) -> Chunk {
        let chunk = Chunk::new(1, 1);
        for cs in &f.servers {
            cs.handle_create(Chunk::new(1, 0));
            cs.set_version(chunk, "cs-0".into()).unwrap();
        }
        let secondaries = f.servers[1..].iter().map(|cs| cs.id.clone()).collect();
        f.servers[0].grant_lease(chunk, START + 10_000, secondaries).unwrap();
        chunk
    }

    impl Chunkserver {
        fn handle_create(&self, chunk: Chunk) {
            lock(&self.storage).create(chunk).unwrap();
        }
    }

    fn chain(f: &Fixture) -> Vec<Address> {
        f.servers[1..].iter().map(|cs| cs.id.clone()).collect()
    }

    #[tokio::test]
    async fn push_travels_the_whole_chain() {
        let f = fixture(3);
        f.servers[0].push(b"payload".to_vec(), 42, chain(&f)).await.unwrap();

        for cs in &f.servers {
            assert_eq!(cs.pushed(42).unwrap(), b"payload");
        }
    }

    #[tokio::test]
    async fn broken_chain_leaves_the_prefix_populated() {
        let f = fixture(4);
        f.network.disconnect("cs-2");

        let err = f.servers[0].push(b"payload".to_vec(), 42, chain(&f)).await.unwrap_err();
        assert!(matches!(err, GfsError::Unreachable(_)));
        assert!(f.servers[0].has_pushed(42));
        assert!(f.servers[1].has_pushed(42));
        assert!(!f.servers[2].has_pushed(42));
        assert!(!f.servers[3].has_pushed(42));
    }

    #[tokio::test]
    async fn serial_appends_converge_on_every_replica() {
        let f = fixture(3);
        let chunk = lease_chunk(&f);

        for (ident, record) in [(1, "hello"), (2, "world"), (3, "!")] {
            f.servers[0].push(record.as_bytes().to_vec(), ident, chain(&f)).await.unwrap();
            f.servers[0].append(chunk, ident).await.unwrap();
        }

        for cs in &f.servers {
            assert_eq!(cs.read(chunk, 0, 11).unwrap(), b"helloworld!");
        }
    }

    #[tokio::test]
    async fn concurrent_appends_get_one_order_everywhere() {
        let f = fixture(3);
        let chunk = lease_chunk(&f);

        for ident in 0..8u64 {
            f.servers[0].push(vec![b'a' + ident as u8; 4], ident, chain(&f)).await.unwrap();
        }
        let mut tasks = Vec::new();
        for ident in 0..8u64 {
            let primary = f.servers[0].clone();
            tasks.push(tokio::spawn(async move { primary.append(chunk, ident).await }));
        }
        let mut offsets = Vec::new();
        for task in tasks {
            offsets.push(task.await.unwrap().unwrap());
        }
        offsets.sort();
        assert_eq!(offsets, (0..8).map(|i| i * 4).collect::<Vec<u64>>());

        let primary = f.servers[0].read(chunk, 0, 32).unwrap();
        for cs in &f.servers[1..] {
            assert_eq!(cs.read(chunk, 0, 32).unwrap(), primary);
        }
    }

    #[tokio::test]
    async fn primary_only_operations_need_an_unexpired_lease() {
        let f = fixture(2);
        let chunk = lease_chunk(&f);

        f.servers[1].push(b"x".to_vec(), 9, vec![]).await.unwrap();
        let err = f.servers[1].append(chunk, 9).await.unwrap_err();
        assert!(matches!(err, GfsError::StaleLease { .. }));

        f.servers[0].push(b"x".to_vec(), 9, vec!["cs-1".into()]).await.unwrap();
        f.clock.advance(std::time::Duration::from_secs(10));
        let err = f.servers[0].write(chunk, 0, 9).await.unwrap_err();
        assert!(matches!(err, GfsError::StaleLease { .. }));
        assert_eq!(f.servers[0].read(chunk, 0, 0).unwrap(), b"");
    }

    #[tokio::test]
    async fn revoke_stops_the_primary() {
        let f = fixture(2);
        let chunk = lease_chunk(&f);
        f.servers[0].revoke_lease(chunk);

        f.servers[0].push(b"x".to_vec(), 9, chain(&f)).await.unwrap();
        assert!(matches!(f.servers[0].append(chunk, 9).await, Err(GfsError::StaleLease { .. })));
    }

    #[tokio::test]
    async fn stale_version_mutate_is_rejected_without_touching_bytes() {
        let f = fixture(2);
        let chunk = lease_chunk(&f);
        f.servers[0].push(b"good".to_vec(), 1, chain(&f)).await.unwrap();
        f.servers[0].append(chunk, 1).await.unwrap();

        f.servers[1].push(b"evil".to_vec(), 2, vec![]).await.unwrap();
        let old = Chunk::new(1, 0);
        let err = f.servers[1].mutate(old, 0, 2, "cs-0").await.unwrap_err();
        assert!(matches!(err, GfsError::StaleLease { .. }));
        let err = f.servers[1].mutate(chunk, 0, 2, "cs-9").await.unwrap_err();
        assert!(matches!(err, GfsError::StaleLease { .. }));
        assert_eq!(f.servers[1].read(chunk, 0, 4).unwrap(), b"good");
    }

    #[tokio::test]
    async fn failed_secondary_is_reported_as_partial_failure() {
        let f = fixture(3);
        let chunk = lease_chunk(&f);
        f.servers[0].push(b"data".to_vec(), 5, chain(&f)).await.unwrap();
        f.network.disconnect("cs-2");

        let err = f.servers[0].append(chunk, 5).await.unwrap_err();
        assert!(matches!(err, GfsError::Replication { handle: 1, .. }));
        // The primary and the reachable secondary advanced anyway.
        assert_eq!(f.servers[0].read(chunk, 0, 4).unwrap(), b"data");
        assert_eq!(f.servers[1].read(chunk, 0, 4).unwrap(), b"data");
        assert_eq!(f.servers[2].read(chunk, 0, 0).unwrap(), b"");
    }

    #[tokio::test]
    async fn mutation_without_pushed_data_fails() {
        let f = fixture(1);
        let chunk = lease_chunk(&f);
        let err = f.servers[0].append(chunk, 77).await.unwrap_err();
        assert_eq!(err, GfsError::UnknownData(77));
    }

    #[tokio::test]
    async fn idle_pushes_are_collected() {
        let f = fixture(1);
        f.servers[0].push(b"abandoned".to_vec(), 3, vec![]).await.unwrap();
        f.clock.advance(std::time::Duration::from_millis(Config::default().push_buffer_ttl_ms + 1));
        f.servers[0].collect_garbage();
        assert!(!f.servers[0].has_pushed(3));
    }
}
