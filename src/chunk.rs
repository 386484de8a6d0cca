//! Chunk bytes held by one chunkserver.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Chunk, ChunkHandle, GfsError, Result};

pub struct StoredChunk {
    pub version: u64,
    pub data: Vec<u8>,
    pub checksum: u32,
}

/// Sidecar written next to each chunk file.
#[derive(Serialize, Deserialize)]
struct ChunkMeta {
    version: u64,
    checksum: u32,
}

pub struct ChunkStore {
    // The path to the chunkserver storage directory, if chunks are persisted.
    storage_dir: Option<PathBuf>,

    chunks: HashMap<ChunkHandle, StoredChunk>,

    /// Capacity of every chunk in bytes.
    chunk_size: u64,
}

fn storage_err(path: &Path, e: std::io::Error) -> GfsError {
    GfsError::Storage(format!("{}: {e}", path.display()))
}

impl ChunkStore {
    pub fn in_memory(chunk_size: u64) -> ChunkStore {
        ChunkStore { storage_dir: None, chunks: HashMap::new(), chunk_size }
    }

    /// Open a directory-backed store, loading every chunk whose checksum still matches.
    pub fn open(storage_dir: PathBuf, chunk_size: u64) -> Result<ChunkStore> {
        // If directory does not exist, create it.
        if !storage_dir.exists() {
            std::fs::create_dir_all(&storage_dir).map_err(|e| storage_err(&storage_dir, e))?;
        }

        let mut chunks = HashMap::new();

        let files = std::fs::read_dir(&storage_dir).map_err(|e| storage_err(&storage_dir, e))?;
        for file in files {
            let file = file.map_err(|e| storage_err(&storage_dir, e))?;
            let name = file.file_name();
            let Some(handle) = name.to_str().and_then(parse_chunk_file_name) else {
                continue;
            };

            match load_chunk(&file.path()) {
                Ok(chunk) => {
                    debug!("loaded chunk {handle} v{} ({} bytes)", chunk.version, chunk.data.len());
                    chunks.insert(handle, chunk);
                }
                Err(e) => warn!("skipping chunk {handle}: {e}"),
            }
        }

        info!("opened chunk store at {} with {} chunks", storage_dir.display(), chunks.len());
        Ok(ChunkStore { storage_dir: Some(storage_dir), chunks, chunk_size })
    }

    /// Every chunk held, as reported to the master on registration.
    pub fn inventory(&self) -> Vec<Chunk> {
        let mut inventory: Vec<Chunk> = self
            .chunks
            .iter()
            .map(|(handle, chunk)| Chunk::new(*handle, chunk.version))
            .collect();
        inventory.sort_by_key(|c| c.handle);
        inventory
    }

    pub fn version(&self, handle: ChunkHandle) -> Option<u64> {
        self.chunks.get(&handle).map(|c| c.version)
    }

    pub fn len(&self, handle: ChunkHandle) -> Option<u64> {
        self.chunks.get(&handle).map(|c| c.data.len() as u64)
    }

    /// Start an empty chunk. Creating a chunk that already exists leaves it untouched.
    pub fn create(&mut self, chunk: Chunk) -> Result<()> {
        if self.chunks.contains_key(&chunk.handle) {
            return Ok(());
        }
        self.chunks.insert(
            chunk.handle,
            StoredChunk { version: chunk.version, data: Vec::new(), checksum: crc32fast::hash(&[]) },
        );
        self.persist(chunk.handle)
    }

    /// Move a chunk forward to a newer version. Versions never go backwards.
    pub fn set_version(&mut self, chunk: Chunk) -> Result<()> {
        let stored = self.chunks.get_mut(&chunk.handle).ok_or(GfsError::UnknownChunk(chunk.handle))?;
        if chunk.version < stored.version {
            return Err(GfsError::stale(
                chunk.handle,
                format!("version {} is older than stored {}", chunk.version, stored.version),
            ));
        }
        stored.version = chunk.version;
        self.persist_meta(chunk.handle)
    }

    pub fn read(&self, chunk: Chunk, start: u64, end: u64) -> Result<Vec<u8>> {
        let stored = self.chunks.get(&chunk.handle).ok_or(GfsError::UnknownChunk(chunk.handle))?;
        if chunk.version > stored.version {
            return Err(GfsError::stale(
                chunk.handle,
                format!("replica holds version {}, reader wants {}", stored.version, chunk.version),
            ));
        }
        let len = stored.data.len() as u64;
        if start > end || end > len {
            return Err(GfsError::OutOfRange { handle: chunk.handle, start, end, len });
        }
        Ok(stored.data[start as usize..end as usize].to_vec())
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end.
    pub fn write_at(&mut self, chunk: Chunk, offset: u64, data: &[u8]) -> Result<()> {
        let chunk_size = self.chunk_size;
        let stored = self.stored_at_version(chunk)?;
        let end = match offset.checked_add(data.len() as u64) {
            Some(end) if end <= chunk_size => end,
            end => {
                return Err(GfsError::OutOfRange {
                    handle: chunk.handle,
                    start: offset,
                    end: end.unwrap_or(u64::MAX),
                    len: chunk_size,
                })
            }
        };

        let old_len = stored.data.len();
        if old_len < end as usize {
            stored.data.resize(end as usize, 0);
        }
        stored.data[offset as usize..end as usize].copy_from_slice(data);
        stored.checksum = if offset == old_len as u64 {
            // Pure append: extend the running checksum.
            let mut hasher = crc32fast::Hasher::new_with_initial_len(stored.checksum, old_len as u64);
            hasher.update(data);
            hasher.finalize()
        } else {
            crc32fast::hash(&stored.data)
        };
        self.persist_range(chunk.handle, offset, data)
    }

    /// Append `data` at the current end of the chunk and return where it landed.
    /// A record that does not fit is rejected whole.
    pub fn append(&mut self, chunk: Chunk, data: &[u8]) -> Result<u64> {
        let chunk_size = self.chunk_size;
        let stored = self.stored_at_version(chunk)?;
        let offset = stored.data.len() as u64;
        if data.len() as u64 > chunk_size.saturating_sub(offset) {
            return Err(GfsError::ChunkFull {
                handle: chunk.handle,
                len: offset,
                requested: data.len() as u64,
                capacity: chunk_size,
            });
        }
        self.write_at(chunk, offset, data)?;
        Ok(offset)
    }

    /// Duplicate `src` locally as `dst`, for copy-on-write after a snapshot.
    pub fn copy(&mut self, src: Chunk, dst: Chunk) -> Result<()> {
        let stored = self.chunks.get(&src.handle).ok_or(GfsError::UnknownChunk(src.handle))?;
        if stored.version != src.version {
            return Err(GfsError::stale(
                src.handle,
                format!("copy source is version {}, stored {}", src.version, stored.version),
            ));
        }
        let copy = StoredChunk { version: dst.version, data: stored.data.clone(), checksum: stored.checksum };
        self.chunks.insert(dst.handle, copy);
        self.persist(dst.handle)
    }

    pub fn delete(&mut self, handle: ChunkHandle) -> Result<()> {
        if self.chunks.remove(&handle).is_none() {
            return Ok(());
        }
        if let Some(dir) = &self.storage_dir {
            for path in [chunk_path(dir, handle), meta_path(dir, handle)] {
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| storage_err(&path, e))?;
                }
            }
        }
        Ok(())
    }

    fn stored_at_version(&mut self, chunk: Chunk) -> Result<&mut StoredChunk> {
        let stored = self.chunks.get_mut(&chunk.handle).ok_or(GfsError::UnknownChunk(chunk.handle))?;
        if stored.version != chunk.version {
            return Err(GfsError::stale(
                chunk.handle,
                format!("mutation for version {}, stored {}", chunk.version, stored.version),
            ));
        }
        Ok(stored)
    }

    /// Write the whole chunk file and its metadata.
    fn persist(&self, handle: ChunkHandle) -> Result<()> {
        let (Some(dir), Some(stored)) = (&self.storage_dir, self.chunks.get(&handle)) else {
            return Ok(());
        };

        let path = chunk_path(dir, handle);
        std::fs::write(&path, &stored.data).map_err(|e| storage_err(&path, e))?;
        self.persist_meta(handle)
    }

    /// Write only `data` at `offset` of the chunk file. Seeking past the end
    /// leaves a zero-filled gap, matching the in-memory copy.
    fn persist_range(&self, handle: ChunkHandle, offset: u64, data: &[u8]) -> Result<()> {
        let Some(dir) = &self.storage_dir else {
            return Ok(());
        };

        let path = chunk_path(dir, handle);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| storage_err(&path, e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| storage_err(&path, e))?;
        file.write_all(data).map_err(|e| storage_err(&path, e))?;
        self.persist_meta(handle)
    }

    fn persist_meta(&self, handle: ChunkHandle) -> Result<()> {
        let (Some(dir), Some(stored)) = (&self.storage_dir, self.chunks.get(&handle)) else {
            return Ok(());
        };

        let meta = serde_json::to_vec(&ChunkMeta { version: stored.version, checksum: stored.checksum })?;
        let path = meta_path(dir, handle);
        std::fs::write(&path, meta).map_err(|e| storage_err(&path, e))
    }
}

fn chunk_path(dir: &Path, handle: ChunkHandle) -> PathBuf {
    dir.join(format!("ch{handle}"))
}

fn meta_path(dir: &Path, handle: ChunkHandle) -> PathBuf {
    dir.join(format!("ch{handle}.meta"))
}

// Chunk files are named `ch{handle}`; anything else in the directory is ignored.
fn parse_chunk_file_name(name: &str) -> Option<ChunkHandle> {
    name.strip_prefix("ch")?.parse().ok()
}

fn load_chunk(path: &Path) -> Result<StoredChunk> {
    let data = std::fs::read(path).map_err(|e| storage_err(path, e))?;
    let meta_file = path.with_extension("meta");
    let meta = std::fs::read(&meta_file).map_err(|e| storage_err(&meta_file, e))?;
    let meta: ChunkMeta = serde_json::from_slice(&meta)?;

    let checksum = crc32fast::hash(&data);
    if checksum != meta.checksum {
        return Err(GfsError::Storage(format!(
            "checksum mismatch: stored {:#x}, computed {checksum:#x}",
            meta.checksum
        )));
    }
    Ok(StoredChunk { version: meta.version, data, checksum })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(chunk: Chunk) -> ChunkStore {
        let mut store = ChunkStore::in_memory(16);
        store.create(chunk).unwrap();
        store
    }

    #[test]
    fn append_assigns_offsets_in_order() {
        let chunk = Chunk::new(1, 1);
        let mut store = store_with(chunk);

        assert_eq!(store.append(chunk, b"hello").unwrap(), 0);
        assert_eq!(store.append(chunk, b"world").unwrap(), 5);
        assert_eq!(store.read(chunk, 0, 10).unwrap(), b"helloworld");
    }

    #[test]
    fn append_never_splits_a_record() {
        let chunk = Chunk::new(1, 1);
        let mut store = store_with(chunk);
        store.append(chunk, b"0123456789").unwrap();

        let err = store.append(chunk, b"abcdefg").unwrap_err();
        assert!(matches!(err, GfsError::ChunkFull { len: 10, requested: 7, capacity: 16, .. }));
        assert_eq!(store.len(1), Some(10));
        // A smaller record still fits.
        assert_eq!(store.append(chunk, b"abcdef").unwrap(), 10);
    }

    #[test]
    fn write_zero_fills_and_respects_capacity() {
        let chunk = Chunk::new(2, 1);
        let mut store = store_with(chunk);

        store.write_at(chunk, 4, b"xy").unwrap();
        assert_eq!(store.read(chunk, 0, 6).unwrap(), b"\0\0\0\0xy");
        assert!(matches!(store.write_at(chunk, 15, b"ab"), Err(GfsError::OutOfRange { .. })));
    }

    #[test]
    fn huge_offsets_are_out_of_range() {
        let chunk = Chunk::new(2, 1);
        let mut store = store_with(chunk);
        store.append(chunk, b"ab").unwrap();

        let err = store.write_at(chunk, u64::MAX, b"xy").unwrap_err();
        assert!(matches!(err, GfsError::OutOfRange { start: u64::MAX, end: u64::MAX, len: 16, .. }));
        assert!(matches!(store.write_at(chunk, u64::MAX - 1, b"xy"), Err(GfsError::OutOfRange { .. })));
        assert_eq!(store.len(2), Some(2));
    }

    #[test]
    fn mutation_at_wrong_version_is_rejected() {
        let mut store = store_with(Chunk::new(3, 2));
        store.write_at(Chunk::new(3, 2), 0, b"keep").unwrap();

        let err = store.write_at(Chunk::new(3, 1), 0, b"lost").unwrap_err();
        assert!(matches!(err, GfsError::StaleLease { handle: 3, .. }));
        assert_eq!(store.read(Chunk::new(3, 2), 0, 4).unwrap(), b"keep");
        assert!(store.set_version(Chunk::new(3, 1)).is_err());
    }

    #[test]
    fn read_bounds() {
        let chunk = Chunk::new(4, 1);
        let mut store = store_with(chunk);
        store.append(chunk, b"abc").unwrap();

        assert!(matches!(store.read(chunk, 0, 4), Err(GfsError::OutOfRange { len: 3, .. })));
        assert!(matches!(store.read(chunk, 2, 1), Err(GfsError::OutOfRange { .. })));
        assert!(matches!(store.read(Chunk::new(9, 1), 0, 1), Err(GfsError::UnknownChunk(9))));
        assert!(matches!(store.read(Chunk::new(4, 2), 0, 1), Err(GfsError::StaleLease { .. })));
        // A reader with older location info is still served.
        assert_eq!(store.read(Chunk::new(4, 0), 0, 3).unwrap(), b"abc");
    }

    #[test]
    fn copy_is_independent() {
        let src = Chunk::new(5, 1);
        let dst = Chunk::new(6, 1);
        let mut store = store_with(src);
        store.append(src, b"base").unwrap();

        store.copy(src, dst).unwrap();
        store.append(src, b"-src").unwrap();
        assert_eq!(store.read(dst, 0, 4).unwrap(), b"base");
        assert_eq!(store.len(6), Some(4));
    }

    #[test]
    fn directory_store_survives_reopen_and_drops_corrupt_chunks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = ChunkStore::open(dir.path().to_path_buf(), 64).unwrap();
            store.create(Chunk::new(1, 3)).unwrap();
            store.append(Chunk::new(1, 3), b"persisted").unwrap();
            store.create(Chunk::new(2, 1)).unwrap();
            store.append(Chunk::new(2, 1), b"corrupted").unwrap();
        }
        std::fs::write(dir.path().join("ch2"), b"tampered!").unwrap();

        let store = ChunkStore::open(dir.path().to_path_buf(), 64).unwrap();
        assert_eq!(store.inventory(), vec![Chunk::new(1, 3)]);
        assert_eq!(store.read(Chunk::new(1, 3), 0, 9).unwrap(), b"persisted");
    }

    #[test]
    fn partial_writes_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = Chunk::new(3, 1);
        {
            let mut store = ChunkStore::open(dir.path().to_path_buf(), 64).unwrap();
            store.create(chunk).unwrap();
            store.append(chunk, b"head").unwrap();
            // Past the end, then over the middle of what is already there.
            store.write_at(chunk, 8, b"tail").unwrap();
            store.write_at(chunk, 2, b"AD").unwrap();
            store.append(chunk, b"!").unwrap();
            store.set_version(Chunk::new(3, 2)).unwrap();
        }

        let on_disk = std::fs::read(dir.path().join("ch3")).unwrap();
        assert_eq!(on_disk, b"heAD\0\0\0\0tail!");

        let store = ChunkStore::open(dir.path().to_path_buf(), 64).unwrap();
        assert_eq!(store.inventory(), vec![Chunk::new(3, 2)]);
        assert_eq!(store.read(Chunk::new(3, 2), 0, 13).unwrap(), on_disk);
    }

    #[test]
    fn delete_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::open(dir.path().to_path_buf(), 64).unwrap();
        store.create(Chunk::new(7, 1)).unwrap();
        store.delete(7).unwrap();

        assert!(store.inventory().is_empty());
        assert!(!dir.path().join("ch7").exists());
        assert!(!dir.path().join("ch7.meta").exists());
    }
}
