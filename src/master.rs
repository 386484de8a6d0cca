//! The master: owns the namespace, allocates chunk handles, tracks replicas
//! and live chunkservers, and hands out primary leases.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::common::{lock, Lifecycle, Service, Transport};
use crate::config::Config;
use crate::core::rpc::{
    ChunkserverRequest, FileInfo, LocateReply, MasterReply, MasterRequest, RegisterReply,
};
use crate::core::{Address, Chunk, ChunkHandle, Clock, GfsError, Result};
use crate::lease::{Lease, LeaseTable};

pub mod namespace;

use namespace::{File, Namespace};

#[derive(Debug, Clone)]
pub struct ChunkserverInfo {
    pub last_seen_ms: u64,
    /// Inventory from the latest registration.
    pub chunks: Vec<Chunk>,
}

struct ChunkInfo {
    version: u64,
    /// Replicas at `version`, in the order they were assigned.
    replicas: Vec<Address>,
    /// Number of files referencing this chunk. Above one means shared by a snapshot.
    refs: usize,
}

struct MasterState {
    namespace: Namespace,
    chunks: HashMap<ChunkHandle, ChunkInfo>,
    leases: LeaseTable,
    // Chunk counter.
    chunk_counter: u64,
}

pub struct MasterServer {
    config: Config,
    network: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,

    state: Mutex<MasterState>,

    // Ephemeral state.
    chunkservers: DashMap<Address, ChunkserverInfo>,

    /// Serializes lease grants, copy-on-write splits and snapshots per chunk.
    chunk_locks: DashMap<ChunkHandle, Arc<tokio::sync::Mutex<()>>>,
}

impl MasterServer {
    pub fn new(config: Config, network: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> MasterServer {
        let state = MasterState {
            namespace: Namespace::default(),
            chunks: HashMap::new(),
            leases: LeaseTable::new(config.clock_skew_ms),
            chunk_counter: 0,
        };
        MasterServer {
            config,
            network,
            clock,
            state: Mutex::new(state),
            chunkservers: DashMap::new(),
            chunk_locks: DashMap::new(),
        }
    }

    /// Probe chunkservers every heartbeat interval until shutdown.
    pub async fn run(self: Arc<Self>, lifecycle: Lifecycle) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.check_liveness().await;
                    self.collect_garbage();
                }
                _ = lifecycle.draining() => break,
            }
        }
        info!("master background tasks stopped");
    }

    fn chunk_lock(&self, handle: ChunkHandle) -> Arc<tokio::sync::Mutex<()>> {
        self.chunk_locks.entry(handle).or_default().clone()
    }

    async fn lock_chunk(&self, handle: ChunkHandle) -> OwnedMutexGuard<()> {
        self.chunk_lock(handle).lock_owned().await
    }

    /// A chunk is busy while a grant, split or allocation is rewriting its replicas.
    fn chunk_busy(&self, handle: ChunkHandle) -> bool {
        self.chunk_locks.get(&handle).map(|l| l.try_lock().is_err()).unwrap_or(false)
    }

    fn fresh(&self, info: &ChunkserverInfo, now_ms: u64) -> bool {
        now_ms.saturating_sub(info.last_seen_ms) <= self.config.liveness_timeout_ms
    }

    fn is_live(&self, addr: &str, now_ms: u64) -> bool {
        self.chunkservers.get(addr).map(|info| self.fresh(&info, now_ms)).unwrap_or(false)
    }

    //
    // Chunkserver API's.
    //

    /// Add or refresh a chunkserver and reconcile the chunks it claims.
    ///
    /// The latest inventory wins: the server is dropped from the replicas of
    /// any chunk it no longer reports. Handles no file references are garbage,
    /// and so is a copy held by a server that is not among the chunk's replicas.
    pub fn register(&self, address: Address, chunks: Vec<Chunk>) -> RegisterReply {
        let now = self.clock.now_ms();
        let previous = self
            .chunkservers
            .insert(address.clone(), ChunkserverInfo { last_seen_ms: now, chunks: chunks.clone() });
        let reported: HashSet<ChunkHandle> = chunks.iter().map(|c| c.handle).collect();
        let forgotten: HashSet<ChunkHandle> = match &previous {
            None => {
                info!("new chunkserver {address} with {} chunks", chunks.len());
                HashSet::new()
            }
            Some(previous) => previous.chunks.iter().map(|c| c.handle).filter(|h| !reported.contains(h)).collect(),
        };

        let mut reply = RegisterReply::default();
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        for (handle, info) in state.chunks.iter_mut() {
            if reported.contains(handle) || self.chunk_busy(*handle) || !info.replicas.contains(&address) {
                continue;
            }
            if forgotten.contains(handle) {
                info!("{address} no longer holds chunk {handle}");
            } else {
                debug!("{address} does not report chunk {handle}");
            }
            info.replicas.retain(|r| r != &address);
        }

        for chunk in chunks {
            state.chunk_counter = state.chunk_counter.max(chunk.handle + 1);
            if self.chunk_busy(chunk.handle) {
                continue;
            }

            match state.chunks.get_mut(&chunk.handle) {
                None => {
                    debug!("{address} holds unreferenced {chunk}");
                    reply.garbage.push(chunk.handle);
                }
                Some(info) if chunk.version == info.version => {
                    if !info.replicas.contains(&address) {
                        // Dropped earlier, so it may have missed mutations at this version.
                        info!("{address} holds {chunk} but is not a replica of record");
                        reply.garbage.push(chunk.handle);
                        continue;
                    }
                    // A restarted secondary has to learn the primary again.
                    if let Some(lease) = state.leases.active(chunk.handle, now) {
                        if lease.holder != address && lease.version == chunk.version {
                            reply.primaries.push((chunk, lease.holder.clone()));
                        }
                    }
                }
                Some(info) if chunk.version > info.version => {
                    warn!("{address} holds {chunk}, newer than known version {}", info.version);
                    info.version = chunk.version;
                    info.replicas = vec![address.clone()];
                }
                Some(info) => {
                    info!("{address} holds stale {chunk} (current {})", info.version);
                    info.replicas.retain(|r| r != &address);
                    reply.garbage.push(chunk.handle);
                }
            }
        }

        reply
    }

    /// Live chunkservers, sorted.
    pub fn servers(&self) -> Vec<Address> {
        let now = self.clock.now_ms();
        let mut servers: Vec<Address> = self
            .chunkservers
            .iter()
            .filter(|entry| self.fresh(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();
        servers.sort();
        servers
    }

    /// Heartbeat every known chunkserver and evict the ones silent past the liveness timeout.
    pub async fn check_liveness(&self) {
        let addrs: Vec<Address> = self.chunkservers.iter().map(|e| e.key().clone()).collect();
        for addr in addrs {
            match self.network.call_chunkserver(&addr, ChunkserverRequest::Heartbeat).await {
                Ok(_) => {
                    if let Some(mut info) = self.chunkservers.get_mut(&addr) {
                        info.last_seen_ms = self.clock.now_ms();
                    }
                }
                Err(e) => debug!("heartbeat to {addr} failed: {e}"),
            }
        }

        let now = self.clock.now_ms();
        let timeout = self.config.liveness_timeout_ms;
        self.chunkservers.retain(|addr, info| {
            let alive = now.saturating_sub(info.last_seen_ms) <= timeout;
            if !alive {
                warn!("evicting chunkserver {addr}, silent since {}", info.last_seen_ms);
            }
            alive
        });
    }

    /// Forget lapsed leases and the locks of chunks that are gone.
    pub fn collect_garbage(&self) {
        let now = self.clock.now_ms();
        let mut state = lock(&self.state);
        let leases = state.leases.forget_lapsed(now);
        let before = self.chunk_locks.len();
        // A lock someone still holds a reference to stays.
        self.chunk_locks
            .retain(|handle, chunk_lock| state.chunks.contains_key(handle) || Arc::strong_count(chunk_lock) > 1);
        let locks = before - self.chunk_locks.len();
        drop(state);

        if locks > 0 || leases > 0 {
            debug!("forgot {locks} chunk locks and {leases} lapsed leases");
        }
    }

    //
    // Namespace API's.
    //

    pub async fn create(&self, file: &str) -> Result<()> {
        if lock(&self.state).namespace.contains(file) {
            return Err(GfsError::AlreadyExists(file.to_string()));
        }

        let (handle, _guard) = self.allocate_chunk().await?;
        let mut state = lock(&self.state);
        if let Err(e) = state.namespace.insert(file, File { chunks: vec![handle] }) {
            discard_chunk(&mut state, handle);
            return Err(e);
        }
        if let Some(info) = state.chunks.get_mut(&handle) {
            info.refs += 1;
        }
        info!("created {file} with chunk {handle}");
        Ok(())
    }

    /// Append a fresh chunk to `file` and return its index.
    pub async fn add_chunk(&self, file: &str) -> Result<u64> {
        lock(&self.state).namespace.get(file)?;

        let (handle, _guard) = self.allocate_chunk().await?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let index = match state.namespace.get_mut(file) {
            Ok(entry) => {
                entry.chunks.push(handle);
                entry.chunks.len() as u64 - 1
            }
            Err(e) => {
                discard_chunk(state, handle);
                return Err(e);
            }
        };
        if let Some(info) = state.chunks.get_mut(&handle) {
            info.refs += 1;
        }
        info!("{file} grew to chunk {index} ({handle})");
        Ok(index)
    }

    /// Allocate a new handle and create it, empty, on up to `replication` live servers.
    /// The returned guard keeps registrations from touching the chunk until it is linked.
    async fn allocate_chunk(&self) -> Result<(ChunkHandle, OwnedMutexGuard<()>)> {
        let mut candidates = self.servers();
        if candidates.is_empty() {
            return Err(GfsError::Unavailable("no live chunkservers".into()));
        }
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.config.replication.max(1));

        let handle = {
            let mut state = lock(&self.state);
            let handle = state.chunk_counter;
            state.chunk_counter += 1;
            handle
        };
        let guard = self.lock_chunk(handle).await;

        let chunk = Chunk::new(handle, 0);
        let mut replicas = Vec::new();
        for addr in candidates {
            match self.network.call_chunkserver(&addr, ChunkserverRequest::CreateChunk { chunk }).await {
                Ok(_) => replicas.push(addr),
                Err(e) => warn!("creating {chunk} on {addr} failed: {e}"),
            }
        }
        if replicas.is_empty() {
            return Err(GfsError::Unavailable(format!("no chunkserver accepted chunk {handle}")));
        }

        debug!("allocated {chunk} on {replicas:?}");
        lock(&self.state).chunks.insert(handle, ChunkInfo { version: 0, replicas, refs: 0 });
        Ok((handle, guard))
    }

    /// Remove `file` from the namespace. Its chunks are reclaimed lazily by chunkservers.
    pub async fn delete(&self, file: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut revoke = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let removed = state.namespace.remove(file)?;
            for handle in removed.chunks {
                let Some(info) = state.chunks.get_mut(&handle) else {
                    continue;
                };
                info.refs = info.refs.saturating_sub(1);
                if info.refs > 0 {
                    continue;
                }
                let version = info.version;
                state.chunks.remove(&handle);
                if let Some(lease) = state.leases.active(handle, now) {
                    revoke.push((Chunk::new(handle, version), lease.holder.clone()));
                }
            }
        }
        info!("deleted {file}");

        for (chunk, holder) in revoke {
            self.revoke(chunk, &holder).await.ok();
        }
        Ok(())
    }

    /// Share every chunk of `file` with a new file `into`, copy-on-write.
    pub async fn snapshot(&self, file: &str, into: &str) -> Result<()> {
        let mut handles = {
            let state = lock(&self.state);
            if state.namespace.contains(into) {
                return Err(GfsError::AlreadyExists(into.to_string()));
            }
            state.namespace.get(file)?.chunks.clone()
        };
        handles.sort();
        handles.dedup();

        // Hold every source chunk so no lease is granted mid-snapshot.
        let mut guards = Vec::with_capacity(handles.len());
        for handle in &handles {
            guards.push(self.lock_chunk(*handle).await);
        }

        for handle in &handles {
            self.revoke_for_snapshot(*handle).await?;
        }

        let mut state = lock(&self.state);
        let chunks = state.namespace.get(file)?.chunks.clone();
        state.namespace.insert(into, File { chunks: chunks.clone() })?;
        for handle in chunks {
            if let Some(info) = state.chunks.get_mut(&handle) {
                info.refs += 1;
            }
        }
        info!("snapshot {file} into {into}");
        Ok(())
    }

    /// Make sure nobody can act as primary for `handle`.
    async fn revoke_for_snapshot(&self, handle: ChunkHandle) -> Result<()> {
        let now = self.clock.now_ms();
        let outstanding = {
            let state = lock(&self.state);
            match state.leases.get(handle) {
                Some(lease) if !state.leases.can_grant(handle, now) => {
                    Some((Chunk::new(handle, lease.version), lease.holder.clone()))
                }
                _ => None,
            }
        };
        let Some((chunk, holder)) = outstanding else {
            return Ok(());
        };

        self.revoke(chunk, &holder).await.map_err(|e| {
            GfsError::Unavailable(format!("cannot revoke lease on chunk {handle} from {holder}: {e}"))
        })
    }

    async fn revoke(&self, chunk: Chunk, holder: &str) -> Result<()> {
        match self.network.call_chunkserver(holder, ChunkserverRequest::RevokeLease { chunk }).await {
            Ok(_) => {
                lock(&self.state).leases.revoked(chunk.handle);
                info!("revoked lease on chunk {} from {holder}", chunk.handle);
                Ok(())
            }
            Err(e) => {
                warn!("revoking lease on chunk {} from {holder} failed: {e}", chunk.handle);
                Err(e)
            }
        }
    }

    //
    // Client API's.
    //

    /// Resolve `file`'s chunk `index` to its replicas and current primary,
    /// granting a lease when none is outstanding.
    pub async fn locate(&self, file: &str, index: u64) -> Result<LocateReply> {
        let (handle, _guard) = self.lock_located(file, index).await?;
        let (handle, _split_guard) = self.split_if_shared(file, index, handle).await?;

        let now = self.clock.now_ms();
        let (version, live, active) = {
            let state = lock(&self.state);
            let info = state.chunks.get(&handle).ok_or(GfsError::UnknownChunk(handle))?;
            let live: Vec<Address> = info.replicas.iter().filter(|r| self.is_live(r, now)).cloned().collect();
            let active = state.leases.active(handle, now).cloned();
            (info.version, live, active)
        };
        if live.is_empty() {
            return Err(GfsError::Unavailable(format!("no live replica of chunk {handle}")));
        }

        let can_grant = lock(&self.state).leases.can_grant(handle, now);
        let (chunk, primary) = match active {
            Some(lease) if lease.version == version && live.contains(&lease.holder) => {
                let chunk = Chunk::new(handle, version);
                self.maybe_extend(chunk, &lease, &live).await;
                (chunk, Some(lease.holder))
            }
            // The holder is gone, or never confirmed the grant, but may still think it is primary.
            Some(_) => (Chunk::new(handle, version), None),
            None if can_grant => self.grant(Chunk::new(handle, version), &live).await,
            None => (Chunk::new(handle, version), None),
        };

        let servers: Vec<Address> = {
            let state = lock(&self.state);
            let now = self.clock.now_ms();
            state
                .chunks
                .get(&handle)
                .map(|info| info.replicas.iter().filter(|r| self.is_live(r, now)).cloned().collect())
                .unwrap_or_default()
        };
        let mut push_order: Vec<Address> = primary.iter().cloned().collect();
        push_order.extend(servers.iter().filter(|s| Some(*s) != primary.as_ref()).cloned());

        Ok(LocateReply { chunk, primary, servers, push_order })
    }

    /// Lock the chunk at `file[index]`, retrying if a split swapped the handle meanwhile.
    async fn lock_located(&self, file: &str, index: u64) -> Result<(ChunkHandle, OwnedMutexGuard<()>)> {
        loop {
            let handle = lock(&self.state).namespace.chunk(file, index)?;
            let guard = self.lock_chunk(handle).await;
            if lock(&self.state).namespace.chunk(file, index)? == handle {
                return Ok((handle, guard));
            }
        }
    }

    /// Give `file[index]` a private copy of a chunk it shares with a snapshot.
    /// Replicas copy the bytes locally; the other file keeps the original handle.
    async fn split_if_shared(
        &self,
        file: &str,
        index: u64,
        handle: ChunkHandle,
    ) -> Result<(ChunkHandle, Option<OwnedMutexGuard<()>>)> {
        let now = self.clock.now_ms();
        let (src, live, new_handle) = {
            let mut state = lock(&self.state);
            let info = state.chunks.get(&handle).ok_or(GfsError::UnknownChunk(handle))?;
            if info.refs <= 1 {
                return Ok((handle, None));
            }
            let src = Chunk::new(handle, info.version);
            let live: Vec<Address> = info.replicas.iter().filter(|r| self.is_live(r, now)).cloned().collect();
            if live.is_empty() {
                return Err(GfsError::Unavailable(format!("no live replica of chunk {handle} to copy")));
            }
            let new_handle = state.chunk_counter;
            state.chunk_counter += 1;
            (src, live, new_handle)
        };
        let new_guard = self.lock_chunk(new_handle).await;

        let dst = Chunk::new(new_handle, src.version);
        let mut replicas = Vec::new();
        for addr in live {
            match self.network.call_chunkserver(&addr, ChunkserverRequest::CopyChunk { src, dst }).await {
                Ok(_) => replicas.push(addr),
                Err(e) => warn!("copying {src} to {dst} on {addr} failed: {e}"),
            }
        }
        if replicas.is_empty() {
            return Err(GfsError::Unavailable(format!("no replica could copy chunk {handle}")));
        }

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let entry = state.namespace.get_mut(file)?;
        match entry.chunks.get_mut(index as usize) {
            Some(slot) if *slot == handle => *slot = new_handle,
            _ => {
                return Err(GfsError::NotFound(format!("{file} chunk {index} moved during copy")));
            }
        }
        if let Some(info) = state.chunks.get_mut(&handle) {
            info.refs -= 1;
        }
        state.chunks.insert(new_handle, ChunkInfo { version: dst.version, replicas, refs: 1 });
        info!("{file} chunk {index}: copy-on-write {src} -> {dst}");
        Ok((new_handle, Some(new_guard)))
    }

    /// Bump the version and make the first live replica primary.
    /// Returns the new chunk and the primary, or no primary if the grant did not land.
    /// With no replica acknowledging the new version, the chunk keeps its old one.
    async fn grant(&self, current: Chunk, live: &[Address]) -> (Chunk, Option<Address>) {
        let next = current.bumped();
        let holder = live[0].clone();

        let mut secondaries = Vec::new();
        for addr in &live[1..] {
            let request = ChunkserverRequest::SetVersion { chunk: next, primary: holder.clone() };
            match self.network.call_chunkserver(addr, request).await {
                Ok(_) => secondaries.push(addr.clone()),
                Err(e) => warn!("{addr} missed version bump to {next}: {e}"),
            }
        }

        let now = self.clock.now_ms();
        let expires_ms = now + self.config.lease_duration_ms;
        let request =
            ChunkserverRequest::GrantLease { chunk: next, expires_ms, secondaries: secondaries.clone() };
        let granted = self.network.call_chunkserver(&holder, request).await;

        let mut state = lock(&self.state);
        // Even an unacknowledged grant may have reached the holder, so it is
        // recorded either way and nobody else is granted until it runs out.
        let lease = Lease { holder: holder.clone(), version: next.version, expires_ms };
        if let Err(e) = state.leases.grant(next.handle, lease, now) {
            warn!("lease bookkeeping for {next} refused: {e}");
        }
        let acknowledged = granted.is_ok() || !secondaries.is_empty();
        if let Some(info) = state.chunks.get_mut(&next.handle).filter(|_| acknowledged) {
            info.version = next.version;
            info.replicas = match granted {
                Ok(_) => std::iter::once(holder.clone()).chain(secondaries).collect(),
                Err(_) => secondaries,
            };
        }

        match granted {
            Ok(_) => {
                info!("granted lease on {next} to {holder} until {expires_ms}");
                (next, Some(holder))
            }
            Err(e) if acknowledged => {
                warn!("granting lease on {next} to {holder} failed: {e}");
                (next, None)
            }
            Err(e) => {
                warn!("granting lease on {next} to {holder} failed and no replica took the new version: {e}");
                (current, None)
            }
        }
    }

    /// Renew the holder's lease once less than half of it remains.
    async fn maybe_extend(&self, chunk: Chunk, lease: &Lease, live: &[Address]) {
        let now = self.clock.now_ms();
        if lease.expires_ms.saturating_sub(now) >= self.config.lease_duration_ms / 2 {
            return;
        }
        let secondaries: Vec<Address> = live.iter().filter(|a| **a != lease.holder).cloned().collect();
        let expires_ms = now + self.config.lease_duration_ms;
        // Recorded before sending: the holder may apply an extension whose reply is lost.
        if let Err(e) = lock(&self.state).leases.extend(chunk.handle, &lease.holder, expires_ms, now) {
            warn!("extending lease on {chunk}: {e}");
            return;
        }
        let request = ChunkserverRequest::GrantLease { chunk, expires_ms, secondaries };
        match self.network.call_chunkserver(&lease.holder, request).await {
            Ok(_) => debug!("extended lease on {chunk} for {} until {expires_ms}", lease.holder),
            Err(e) => warn!("extending lease on {chunk} at {} failed: {e}", lease.holder),
        }
    }

    pub fn stat(&self, file: &str) -> Result<FileInfo> {
        let state = lock(&self.state);
        let chunks = state.namespace.get(file)?.chunks.len() as u64;
        Ok(FileInfo { chunks })
    }

    /// List the files in a directory.
    pub fn ls(&self, path: &str) -> Vec<String> {
        lock(&self.state).namespace.ls(path)
    }

    /// List the file tree for a path prefix (akin to `tree`).
    pub fn ls_tree(&self, path: &str) -> Vec<String> {
        lock(&self.state).namespace.ls_tree(path)
    }
}

// Replicas of the dropped handle are reported as garbage on their next registration.
fn discard_chunk(state: &mut MasterState, handle: ChunkHandle) {
    state.chunks.remove(&handle);
}

#[async_trait]
impl Service for MasterServer {
    type Request = MasterRequest;
    type Reply = MasterReply;

    async fn handle(&self, request: MasterRequest) -> Result<MasterReply> {
        match request {
            MasterRequest::Register { address, chunks } => {
                Ok(MasterReply::Registered(self.register(address, chunks)))
            }
            MasterRequest::Servers => Ok(MasterReply::Servers(self.servers())),
            MasterRequest::Locate { file, index } => self.locate(&file, index).await.map(MasterReply::Located),
            MasterRequest::Create { file } => self.create(&file).await.map(|_| MasterReply::Done),
            MasterRequest::Delete { file } => self.delete(&file).await.map(|_| MasterReply::Done),
            MasterRequest::Snapshot { file, into } => {
                self.snapshot(&file, &into).await.map(|_| MasterReply::Done)
            }
            MasterRequest::AddChunk { file } => self.add_chunk(&file).await.map(MasterReply::ChunkIndex),
            MasterRequest::Stat { file } => self.stat(&file).map(MasterReply::Stat),
            MasterRequest::List { prefix } => Ok(MasterReply::Files(self.ls(&prefix))),
            MasterRequest::ListTree { prefix } => Ok(MasterReply::Files(self.ls_tree(&prefix))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NetworkShim;
    use crate::core::ManualClock;

    fn master() -> MasterServer {
        MasterServer::new(Config::default(), Arc::new(NetworkShim::new()), Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn locks_of_missing_chunks_are_forgotten() {
        let master = master();
        master.chunk_lock(5);
        let held = master.chunk_lock(6);
        lock(&master.state).chunks.insert(7, ChunkInfo { version: 1, replicas: vec!["cs-0".into()], refs: 1 });
        master.chunk_lock(7);

        master.collect_garbage();
        assert!(!master.chunk_locks.contains_key(&5));
        assert!(master.chunk_locks.contains_key(&6));
        assert!(master.chunk_locks.contains_key(&7));

        drop(held);
        master.collect_garbage();
        assert!(!master.chunk_locks.contains_key(&6));
    }

    #[test]
    fn unreported_chunks_leave_the_replica_set() {
        let master = master();
        lock(&master.state)
            .chunks
            .insert(3, ChunkInfo { version: 2, replicas: vec!["cs-0".into(), "cs-1".into()], refs: 1 });

        let reply = master.register("cs-0".into(), vec![Chunk::new(3, 2)]);
        assert!(reply.garbage.is_empty());
        master.register("cs-0".into(), Vec::new());
        assert_eq!(lock(&master.state).chunks[&3].replicas, vec!["cs-1".to_string()]);

        // Coming back with the same version does not make it a replica again.
        let reply = master.register("cs-0".into(), vec![Chunk::new(3, 2)]);
        assert_eq!(reply.garbage, vec![3]);
        assert_eq!(lock(&master.state).chunks[&3].replicas, vec!["cs-1".to_string()]);
    }
}
