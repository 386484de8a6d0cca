use serde::{Deserialize, Serialize};
use sha2::Digest;

/// Reference to a chunk. Allocated only by the master, never reused.
pub type ChunkHandle = u64;

/// Ephemeral identifier for bytes pushed to a chunkserver ahead of a mutation.
pub type DataIdent = u64;

/// Network address of a chunkserver or the master (`host:port`).
pub type Address = String;

/// Identity and version of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub handle: ChunkHandle,
    pub version: u64,
}

impl Chunk {
    pub fn new(handle: ChunkHandle, version: u64) -> Chunk {
        Chunk { handle, version }
    }

    /// The same chunk one version later.
    pub fn bumped(&self) -> Chunk {
        Chunk { handle: self.handle, version: self.version + 1 }
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}v{}", self.handle, self.version)
    }
}

/// Derive a data ident from who pushed it, a per-client sequence number and the payload.
/// Two clients pushing identical bytes still get distinct idents.
pub fn data_ident(client_id: &str, seq: u64, data: &[u8]) -> DataIdent {
    let mut hasher = sha2::Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(seq.to_le_bytes());
    hasher.update(data);
    let digest = hasher.finalize();
    let mut ident = [0u8; 8];
    ident.copy_from_slice(&digest[..8]);
    DataIdent::from_le_bytes(ident)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ident_depends_on_sequence() {
        let a = data_ident("client-0", 1, b"hello");
        let b = data_ident("client-0", 2, b"hello");
        assert_ne!(a, b);
        assert_eq!(a, data_ident("client-0", 1, b"hello"));
    }

    #[test]
    fn chunk_display() {
        assert_eq!(Chunk::new(7, 2).to_string(), "ch7v2");
        assert_eq!(Chunk::new(7, 2).bumped(), Chunk::new(7, 3));
    }
}
