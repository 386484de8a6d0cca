use std::collections::HashMap;

use trie_rs::TrieBuilder;

use crate::core::{ChunkHandle, GfsError, Result};

pub struct File {
    /// The chunks that make up the file, in order.
    pub chunks: Vec<ChunkHandle>,
}

/// Flat map from full path to file. Directories are implied by `/` in names.
#[derive(Default)]
pub struct Namespace {
    files: HashMap<String, File>,
}

impl Namespace {
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Result<&File> {
        self.files.get(path).ok_or_else(|| GfsError::NotFound(path.to_string()))
    }

    pub fn get_mut(&mut self, path: &str) -> Result<&mut File> {
        self.files.get_mut(path).ok_or_else(|| GfsError::NotFound(path.to_string()))
    }

    pub fn insert(&mut self, path: &str, file: File) -> Result<()> {
        if self.files.contains_key(path) {
            return Err(GfsError::AlreadyExists(path.to_string()));
        }
        self.files.insert(path.to_string(), file);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<File> {
        self.files.remove(path).ok_or_else(|| GfsError::NotFound(path.to_string()))
    }

    /// The handle at `index` of `path`.
    pub fn chunk(&self, path: &str, index: u64) -> Result<ChunkHandle> {
        self.get(path)?
            .chunks
            .get(index as usize)
            .copied()
            .ok_or_else(|| GfsError::NotFound(format!("{path} has no chunk {index}")))
    }

    /// List the file tree for a path prefix (akin to `tree`).
    pub fn ls_tree(&self, prefix: &str) -> Vec<String> {
        if self.files.is_empty() {
            return Vec::new();
        }
        let mut result: Vec<String> = if prefix.is_empty() {
            self.files.keys().cloned().collect()
        } else {
            let mut builder = TrieBuilder::<u8>::new();
            for path in self.files.keys() {
                builder.push(path.as_str());
            }
            let trie = builder.build();
            trie.predictive_search(prefix).collect()
        };
        result.sort();
        result
    }

    /// List the files directly inside a directory.
    pub fn ls(&self, dir: &str) -> Vec<String> {
        let base = dir.trim_end_matches('/');
        let base_prefix = format!("{base}/");
        self.ls_tree(&base_prefix)
            .into_iter()
            .filter(|path| !path[base_prefix.len()..].contains('/'))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace(paths: &[&str]) -> Namespace {
        let mut ns = Namespace::default();
        for (i, path) in paths.iter().enumerate() {
            ns.insert(path, File { chunks: vec![i as u64] }).unwrap();
        }
        ns
    }

    #[test]
    fn insert_collides() {
        let mut ns = namespace(&["/a"]);
        let err = ns.insert("/a", File { chunks: vec![] }).unwrap_err();
        assert_eq!(err, GfsError::AlreadyExists("/a".into()));
    }

    #[test]
    fn chunk_lookup() {
        let ns = namespace(&["/a", "/b"]);
        assert_eq!(ns.chunk("/b", 0).unwrap(), 1);
        assert!(matches!(ns.chunk("/b", 1), Err(GfsError::NotFound(_))));
        assert!(matches!(ns.chunk("/c", 0), Err(GfsError::NotFound(_))));
    }

    #[test]
    fn listing() {
        let ns = namespace(&["/files/a", "/files/b", "/files/deep/c", "/other"]);

        assert_eq!(ns.ls("/files"), vec!["/files/a", "/files/b"]);
        assert_eq!(ns.ls("/files/"), vec!["/files/a", "/files/b"]);
        assert_eq!(ns.ls(""), vec!["/other"]);
        assert_eq!(ns.ls_tree("/files/"), vec!["/files/a", "/files/b", "/files/deep/c"]);
        assert_eq!(ns.ls_tree("").len(), 4);
        assert!(ns.ls_tree("/nothing").is_empty());
    }
}
