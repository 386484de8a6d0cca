//! Client library: namespace passthroughs plus the read and write pipelines.
//!
//! Writes locate the chunk, push the bytes once along the master's push
//! order, then ask the primary to apply them. Anything the master or a
//! replica reports as retryable sends the client back to locate, so data is
//! always re-pushed on retry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::common::{Backoff, Transport};
use crate::config::Config;
use crate::core::rpc::{ChunkserverRequest, FileInfo, LocateReply, MasterReply, MasterRequest};
use crate::core::{data_ident, Address, DataIdent, GfsError, Result};

pub struct Client {
    id: String,
    master: Address,
    config: Config,
    network: Arc<dyn Transport>,
    /// Sequence number mixed into every data ident this client pushes.
    seq: AtomicU64,
}

impl Client {
    pub fn new(id: impl Into<String>, master: Address, config: Config, network: Arc<dyn Transport>) -> Client {
        Client { id: id.into(), master, config, network, seq: AtomicU64::new(0) }
    }

    async fn call_master(&self, request: MasterRequest) -> Result<MasterReply> {
        self.network.call_master(&self.master, request).await
    }

    pub async fn create_file(&self, file: &str) -> Result<()> {
        self.call_master(MasterRequest::Create { file: file.to_string() }).await?.into_done()
    }

    pub async fn delete_file(&self, file: &str) -> Result<()> {
        self.call_master(MasterRequest::Delete { file: file.to_string() }).await?.into_done()
    }

    pub async fn snapshot_file(&self, file: &str, into: &str) -> Result<()> {
        let request = MasterRequest::Snapshot { file: file.to_string(), into: into.to_string() };
        self.call_master(request).await?.into_done()
    }

    pub async fn stat(&self, file: &str) -> Result<FileInfo> {
        self.call_master(MasterRequest::Stat { file: file.to_string() }).await?.into_stat()
    }

    /// Live chunkservers, as the master sees them.
    pub async fn servers(&self) -> Result<Vec<Address>> {
        self.call_master(MasterRequest::Servers).await?.into_servers()
    }

    /// List the files in a directory.
    pub async fn ls(&self, path: &str) -> Result<Vec<String>> {
        self.call_master(MasterRequest::List { prefix: path.to_string() }).await?.into_files()
    }

    /// List the file tree for a path prefix (akin to `tree`).
    pub async fn ls_tree(&self, path: &str) -> Result<Vec<String>> {
        self.call_master(MasterRequest::ListTree { prefix: path.to_string() }).await?.into_files()
    }

    pub async fn locate(&self, file: &str, index: u64) -> Result<LocateReply> {
        let request = MasterRequest::Locate { file: file.to_string(), index };
        self.call_master(request).await?.into_located()
    }

    async fn add_chunk(&self, file: &str) -> Result<u64> {
        self.call_master(MasterRequest::AddChunk { file: file.to_string() }).await?.into_chunk_index()
    }

    /// Read `start..end` of a chunk from any replica.
    pub async fn read_chunk(&self, file: &str, index: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        self.with_retries("read", || self.read_once(file, index, start, end)).await
    }

    /// Overwrite bytes at `offset` of a chunk.
    pub async fn write_chunk(&self, file: &str, index: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.with_retries("write", || self.mutate_once(file, index, Some(offset), data)).await.map(|_| ())
    }

    /// Atomically append a record to a chunk and return the offset the primary chose.
    ///
    /// A retried append may leave the record more than once in the chunk.
    pub async fn append_chunk(&self, file: &str, index: u64, data: &[u8]) -> Result<u64> {
        self.with_retries("append", || self.mutate_once(file, index, None, data)).await
    }

    /// Record append to the end of the file, moving on to a new chunk when the
    /// last one is full. Returns the chunk index and offset of the record.
    pub async fn append(&self, file: &str, data: &[u8]) -> Result<(u64, u64)> {
        let limit = self.config.max_append();
        if data.len() as u64 > limit {
            return Err(GfsError::AppendTooLarge { len: data.len() as u64, limit });
        }

        let mut index = self.stat(file).await?.chunks.saturating_sub(1);
        let mut budget = self.backoff();
        while budget.attempt() {
            match self.append_chunk(file, index, data).await {
                Ok(offset) => return Ok((index, offset)),
                Err(GfsError::ChunkFull { .. }) => {
                    // Another writer may already have started the next chunk.
                    let last = self.stat(file).await?.chunks.saturating_sub(1);
                    index = if last > index { last } else { self.add_chunk(file).await? };
                    debug!("{}: {file} full, appending to chunk {index}", self.id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(GfsError::Timeout(format!("append to {file} kept finding full chunks")))
    }

    fn backoff(&self) -> Backoff {
        let initial = self.config.client_backoff();
        Backoff::new(initial, initial * 16, self.config.client_max_attempts)
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff();
        let mut last_err = None;
        while backoff.attempt() {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!("{}: {what} failed, retrying: {e}", self.id);
                    last_err = Some(e);
                    backoff.wait().await;
                }
                Err(e) => return Err(e),
            }
        }
        let err = last_err.unwrap_or_else(|| GfsError::Timeout(format!("{what} never attempted")));
        warn!("{}: {what} gave up: {err}", self.id);
        Err(err)
    }

    async fn read_once(&self, file: &str, index: u64, start: u64, end: u64) -> Result<Vec<u8>> {
        let located = self.locate(file, index).await?;

        // Prefer the primary, then fall back to the other replicas.
        let mut replicas: Vec<&Address> = located.primary.iter().collect();
        replicas.extend(located.servers.iter().filter(|s| Some(*s) != located.primary.as_ref()));

        let mut last_err = GfsError::Unavailable(format!("no replica of {file} chunk {index}"));
        for replica in replicas {
            let request = ChunkserverRequest::Read { chunk: located.chunk, start, end };
            match self.network.call_chunkserver(replica, request).await.and_then(|r| r.into_data()) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => {
                    debug!("{}: read from {replica} failed: {e}", self.id);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// One pass of the write pipeline. `offset` is `None` for record append.
    async fn mutate_once(&self, file: &str, index: u64, offset: Option<u64>, data: &[u8]) -> Result<u64> {
        let located = self.locate(file, index).await?;
        let primary = located
            .primary
            .clone()
            .ok_or_else(|| GfsError::Unavailable(format!("{file} chunk {index} has no primary yet")))?;

        let ident = self.push(&located, data).await?;

        let chunk = located.chunk;
        let request = match offset {
            Some(offset) => ChunkserverRequest::Write { chunk, offset, data: ident },
            None => ChunkserverRequest::Append { chunk, data: ident },
        };
        let reply = self.network.call_chunkserver(&primary, request).await?;
        match offset {
            Some(offset) => reply.into_done().map(|_| offset),
            None => reply.into_offset(),
        }
    }

    /// Push `data` to the head of the push order, which forwards it down the rest.
    async fn push(&self, located: &LocateReply, data: &[u8]) -> Result<DataIdent> {
        let ident = data_ident(&self.id, self.seq.fetch_add(1, Ordering::Relaxed), data);
        let (head, rest) = located
            .push_order
            .split_first()
            .ok_or_else(|| GfsError::Unavailable(format!("no replicas to push chunk {} to", located.chunk)))?;

        let request = ChunkserverRequest::Push { data: data.to_vec(), ident, forward_to: rest.to_vec() };
        self.network.call_chunkserver(head, request).await?.into_done()?;
        Ok(ident)
    }
}
