//! Per-context cache of compiled device binaries
//!
//! The first request for a filename reads it from the resource store and
//! concatenates its chunks into one contiguous blob. Later requests return the
//! cached blob. The program set of a process is assumed stable, so entries
//! are never evicted.

use crate::config::COMPILE_ERROR_SUFFIX;
use crate::error::{OffloadError, Result};
use crate::resources::ResourceStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Memoized binary blobs keyed by filename
#[derive(Debug, Default)]
pub struct BinaryCache {
    blobs: HashMap<String, Arc<[u8]>>,
}

impl BinaryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the binary at `filename`, reading it from `store` on first use
    ///
    /// Returns `Arc<[u8]>` so a cache hit is a pointer copy.
    ///
    /// # Errors
    ///
    /// - `CompileFailure` if `filename` marks a failed build. This is checked
    ///   before the cache or the store is consulted.
    /// - Any error from the store.
    pub fn load(&mut self, filename: &str, store: &dyn ResourceStore) -> Result<Arc<[u8]>> {
        ensure_compiled(filename)?;

        if let Some(blob) = self.blobs.get(filename) {
            return Ok(Arc::clone(blob));
        }

        let blob: Arc<[u8]> = concat_chunks(store.fetch(filename)?).into();
        tracing::debug!(filename, bytes = blob.len(), "binary cached");
        self.blobs.insert(filename.to_string(), Arc::clone(&blob));
        Ok(blob)
    }

    /// True if `filename` has been loaded
    pub fn contains(&self, filename: &str) -> bool {
        self.blobs.contains_key(filename)
    }

    /// Number of cached binaries
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// Fail with `CompileFailure` if `filename` carries the failed-build suffix
pub fn ensure_compiled(filename: &str) -> Result<()> {
    if filename.ends_with(COMPILE_ERROR_SUFFIX) {
        return Err(OffloadError::CompileFailure {
            path: filename.to_string(),
        });
    }
    Ok(())
}

fn concat_chunks(chunks: Vec<Vec<u8>>) -> Vec<u8> {
    let total_len = chunks.iter().map(Vec::len).sum();
    let mut blob = Vec::with_capacity(total_len);
    for chunk in chunks {
        blob.extend_from_slice(&chunk);
    }
    blob
}
