//! Request and reply messages for the master and chunkserver RPC surfaces.

use serde::{Deserialize, Serialize};

use super::common::{Address, Chunk, ChunkHandle, DataIdent};
use super::error::{GfsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterRequest {
    Register { address: Address, chunks: Vec<Chunk> },
    Servers,
    Locate { file: String, index: u64 },
    Create { file: String },
    Delete { file: String },
    Snapshot { file: String, into: String },
    AddChunk { file: String },
    Stat { file: String },
    List { prefix: String },
    ListTree { prefix: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterReply {
    Done,
    Registered(RegisterReply),
    Servers(Vec<Address>),
    Located(LocateReply),
    ChunkIndex(u64),
    Stat(FileInfo),
    Files(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Number of chunks in the file.
    pub chunks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    /// Handles the chunkserver holds that no live file references, or that are stale.
    pub garbage: Vec<ChunkHandle>,
    /// Current primaries of chunks the chunkserver holds as a secondary.
    pub primaries: Vec<(Chunk, Address)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateReply {
    pub chunk: Chunk,
    /// Current lease holder. `None` while a lease held by a dead server runs out.
    pub primary: Option<Address>,
    /// Live replicas of the chunk.
    pub servers: Vec<Address>,
    /// Order to push data in: `Push` goes to `push_order[0]` with the rest as `forward_to`.
    pub push_order: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkserverRequest {
    Read { chunk: Chunk, start: u64, end: u64 },
    Write { chunk: Chunk, offset: u64, data: DataIdent },
    Append { chunk: Chunk, data: DataIdent },
    Push { data: Vec<u8>, ident: DataIdent, forward_to: Vec<Address> },
    Mutate { chunk: Chunk, offset: u64, data: DataIdent, from: Address },
    GrantLease { chunk: Chunk, expires_ms: u64, secondaries: Vec<Address> },
    RevokeLease { chunk: Chunk },
    Heartbeat,
    CreateChunk { chunk: Chunk },
    SetVersion { chunk: Chunk, primary: Address },
    CopyChunk { src: Chunk, dst: Chunk },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkserverReply {
    Done,
    Data(Vec<u8>),
    Appended { offset: u64 },
}

fn unexpected(reply: impl std::fmt::Debug) -> GfsError {
    GfsError::Codec(format!("unexpected reply {reply:?}"))
}

impl MasterReply {
    pub fn into_done(self) -> Result<()> {
        match self {
            MasterReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_registered(self) -> Result<RegisterReply> {
        match self {
            MasterReply::Registered(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_servers(self) -> Result<Vec<Address>> {
        match self {
            MasterReply::Servers(servers) => Ok(servers),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_located(self) -> Result<LocateReply> {
        match self {
            MasterReply::Located(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_chunk_index(self) -> Result<u64> {
        match self {
            MasterReply::ChunkIndex(index) => Ok(index),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_stat(self) -> Result<FileInfo> {
        match self {
            MasterReply::Stat(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_files(self) -> Result<Vec<String>> {
        match self {
            MasterReply::Files(files) => Ok(files),
            other => Err(unexpected(other)),
        }
    }
}

impl ChunkserverReply {
    pub fn into_done(self) -> Result<()> {
        match self {
            ChunkserverReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_data(self) -> Result<Vec<u8>> {
        match self {
            ChunkserverReply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub fn into_offset(self) -> Result<u64> {
        match self {
            ChunkserverReply::Appended { offset } => Ok(offset),
            other => Err(unexpected(other)),
        }
    }
}
