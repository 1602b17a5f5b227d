//! Handles of serialized units of work
//!
//! A handle is the heap address of a serialized root object. Handles are only
//! meaningful inside the launch that produced them; the table is cleared at
//! the start of every write phase.

use crate::config::REFERENCE_TAG_BITS;
use crate::error::{OffloadError, Result};
use std::collections::HashMap;
use std::fmt;

/// Stable identity of a unit of work within one submission (its batch index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub usize);

impl KernelId {
    /// Position of the unit in its batch
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Heap address of a serialized object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// Create a handle from a heap address
    pub const fn new(address: u64) -> Self {
        Handle(address)
    }

    /// Heap address
    pub const fn address(self) -> u64 {
        self.0
    }

    /// Object number encoded by this address
    pub const fn object_number(self) -> u64 {
        self.0 >> REFERENCE_TAG_BITS
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Unit-of-work to handle mapping for one launch
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: HashMap<KernelId, Handle>,
    owners: HashMap<Handle, KernelId>,
}

impl HandleTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the handle of `id`
    ///
    /// # Errors
    ///
    /// Returns `DuplicateHandle` if another unit already owns `handle`.
    pub fn record(&mut self, id: KernelId, handle: Handle) -> Result<()> {
        if let Some(&first) = self.owners.get(&handle) {
            if first != id {
                return Err(OffloadError::DuplicateHandle {
                    handle: handle.address(),
                    first,
                    second: id,
                });
            }
        }
        if let Some(previous) = self.entries.insert(id, handle) {
            self.owners.remove(&previous);
        }
        self.owners.insert(handle, id);
        Ok(())
    }

    /// Handle recorded for `id`
    pub fn get(&self, id: KernelId) -> Result<Handle> {
        self.entries.get(&id).copied().ok_or(OffloadError::MissingHandle(id))
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.owners.clear();
    }

    /// Number of recorded units
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded entries ordered by unit id
    pub fn entries(&self) -> Vec<(KernelId, Handle)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(id, handle)| (*id, *handle)).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}
