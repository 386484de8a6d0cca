use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::common::{ChunkHandle, DataIdent};

pub type Result<T, E = GfsError> = std::result::Result<T, E>;

/// Every failure the master, chunkservers or client can report.
///
/// Errors cross the wire inside RPC replies, so every variant carries only
/// serializable data.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GfsError {
    /// Namespace entry or chunk index absent.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// No live replica, or no lease can be granted yet.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// Caller is not the current primary, or the chunk version does not match.
    #[error("stale lease on chunk {handle}: {reason}")]
    StaleLease { handle: ChunkHandle, reason: String },
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("chunk {handle} full: {len} + {requested} bytes exceeds {capacity}")]
    ChunkFull { handle: ChunkHandle, len: u64, requested: u64, capacity: u64 },
    #[error("range {start}..{end} out of bounds for chunk {handle} of length {len}")]
    OutOfRange { handle: ChunkHandle, start: u64, end: u64, len: u64 },
    #[error("unknown chunk {0}")]
    UnknownChunk(ChunkHandle),
    /// Pushed data was never received or has been garbage-collected.
    #[error("no pushed data for ident {0:#x}")]
    UnknownData(DataIdent),
    /// The primary applied a mutation but at least one secondary did not.
    #[error("replication of chunk {handle} failed: {reason}")]
    Replication { handle: ChunkHandle, reason: String },
    #[error("record of {len} bytes exceeds append limit of {limit}")]
    AppendTooLarge { len: u64, limit: u64 },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("codec error: {0}")]
    Codec(String),
    /// Local disk failure on a chunkserver.
    #[error("storage error: {0}")]
    Storage(String),
}

impl GfsError {
    pub fn stale(handle: ChunkHandle, reason: impl Into<String>) -> GfsError {
        GfsError::StaleLease { handle, reason: reason.into() }
    }

    /// Whether a client can recover by locating the chunk again and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GfsError::StaleLease { .. }
                | GfsError::Unreachable(_)
                | GfsError::Unavailable(_)
                | GfsError::UnknownChunk(_)
                | GfsError::UnknownData(_)
                | GfsError::Replication { .. }
        )
    }
}

impl From<std::io::Error> for GfsError {
    fn from(err: std::io::Error) -> Self {
        GfsError::Unreachable(err.to_string())
    }
}

impl From<serde_json::Error> for GfsError {
    fn from(err: serde_json::Error) -> Self {
        GfsError::Codec(err.to_string())
    }
}
