//! Stores that serve compiled device binaries
//!
//! Binaries are read as a sequence of chunks; the binary cache concatenates
//! them. Stores are read-only and may be shared between contexts.

use crate::error::{OffloadError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default chunk size used by [`DirectoryStore`]
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Read-only source of binary resources
pub trait ResourceStore: Send + Sync {
    /// Fetch the resource at `path` as a sequence of byte chunks
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if no resource exists at `path`.
    fn fetch(&self, path: &str) -> Result<Vec<Vec<u8>>>;
}

/// Serves binaries from files below a root directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
    chunk_size: usize,
}

impl DirectoryStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Read files in chunks of `chunk_size` bytes
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Directory the store reads from
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceStore for DirectoryStore {
    fn fetch(&self, path: &str) -> Result<Vec<Vec<u8>>> {
        let full_path = self.root.join(path.trim_start_matches('/'));
        if !full_path.is_file() {
            return Err(OffloadError::ResourceNotFound(full_path.display().to_string()));
        }

        let mut file = File::open(&full_path)?;
        let mut chunks = Vec::new();
        loop {
            let mut chunk = Vec::with_capacity(self.chunk_size);
            let read = (&mut file).take(self.chunk_size as u64).read_to_end(&mut chunk)?;
            if read == 0 {
                break;
            }
            chunks.push(chunk);
        }

        tracing::debug!(path = %full_path.display(), chunks = chunks.len(), "binary resource read");
        Ok(chunks)
    }
}

/// Serves preloaded binaries from memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    resources: HashMap<String, Vec<Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource made of one chunk
    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.resources.insert(path.into(), vec![bytes.into()]);
    }

    /// Register a resource made of several chunks
    pub fn insert_chunks(&mut self, path: impl Into<String>, chunks: Vec<Vec<u8>>) {
        self.resources.insert(path.into(), chunks);
    }

    /// Number of successful fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl ResourceStore for MemoryStore {
    fn fetch(&self, path: &str) -> Result<Vec<Vec<u8>>> {
        let chunks = self
            .resources
            .get(path)
            .cloned()
            .ok_or_else(|| OffloadError::ResourceNotFound(path.to_string()))?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(chunks)
    }
}
