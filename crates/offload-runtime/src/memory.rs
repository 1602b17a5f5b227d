//! Host-side memory regions shared with the device
//!
//! A launch uses five regions:
//!
//! ```text
//! ┌──────────────┬────────────────────────────────────────────────┐
//! │ object       │ serialized object graphs (heap semantics)      │
//! │ handles      │ one root reference per unit of work            │
//! │ exceptions   │ one exception slot per device thread           │
//! │ classes      │ class metadata written by the device           │
//! │ texture      │ fixed 64 bytes, lives as long as the context   │
//! └──────────────┴────────────────────────────────────────────────┘
//! ```
//!
//! Each region is a plain byte buffer with a cursor (`address`) for sequential
//! access. The object region additionally tracks a heap end pointer that the
//! serializer bumps as it appends objects.

use crate::config::REFERENCE_TAG_BITS;
use crate::error::{OffloadError, Result};
use std::fmt;
use std::ops::Range;

/// Width of a reference slot in bytes
pub const REFERENCE_WIDTH: u64 = 8;

/// Alignment of every heap allocation. The low tag bits of a reference are
/// always zero, so `reference >> REFERENCE_TAG_BITS` is an object number.
pub const HEAP_ALIGNMENT: u64 = 1 << REFERENCE_TAG_BITS;

/// Which role a region plays in a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Object,
    Handles,
    Exceptions,
    Classes,
    Texture,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Object => "object",
            Self::Handles => "handles",
            Self::Exceptions => "exceptions",
            Self::Classes => "classes",
            Self::Texture => "texture",
        };
        f.write_str(name)
    }
}

/// An owned, fixed-size, addressable byte buffer
///
/// All accesses are bounds-checked. A region is released exactly once by
/// [`release`](MemoryRegion::release), which consumes it.
pub struct MemoryRegion {
    kind: RegionKind,
    data: Vec<u8>,
    address: u64,
    heap_end: u64,
}

impl MemoryRegion {
    /// Allocate a zero-filled region of `size` bytes
    ///
    /// # Errors
    ///
    /// Returns `ResourceFault` if the host cannot provide the backing memory.
    pub fn allocate(kind: RegionKind, size: u64) -> Result<Self> {
        let len = usize::try_from(size)
            .map_err(|_| OffloadError::resource(format!("{kind} region of {size} bytes exceeds the address space")))?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| OffloadError::resource(format!("cannot allocate {size} bytes for {kind} region: {e}")))?;
        data.resize(len, 0);

        tracing::trace!(region = %kind, size, "region allocated");

        Ok(Self {
            kind,
            data,
            address: 0,
            heap_end: 0,
        })
    }

    /// Role of this region
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Current cursor position
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Move the cursor. Bounds are checked on the next access.
    pub fn set_address(&mut self, offset: u64) {
        self.address = offset;
    }

    /// First byte past the last heap allocation
    pub fn heap_end_ptr(&self) -> u64 {
        self.heap_end
    }

    /// Reset the heap end to the start of the static-data prefix.
    ///
    /// Statics are the first thing serialized on every launch, so resetting to
    /// zero yields the same addresses for the same inputs on every launch.
    pub fn clear_heap_end_ptr(&mut self) {
        self.heap_end = 0;
    }

    /// Adopt a heap end reported back by the device
    pub fn set_heap_end_ptr(&mut self, heap_end: u64) -> Result<()> {
        if heap_end > self.size() {
            return Err(OffloadError::RegionOutOfBounds {
                region: self.kind,
                offset: heap_end,
                size: 0,
                region_size: self.size(),
            });
        }
        self.heap_end = heap_end;
        Ok(())
    }

    /// Bump-allocate `size` bytes at the heap end and return their address
    ///
    /// # Errors
    ///
    /// Returns `ResourceFault` when the region cannot hold the allocation.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        let start = self.heap_end.div_ceil(HEAP_ALIGNMENT) * HEAP_ALIGNMENT;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= self.size())
            .ok_or_else(|| {
                OffloadError::resource(format!(
                    "{} region exhausted: {size} bytes requested at {start:#x}, region holds {} bytes",
                    self.kind,
                    self.size()
                ))
            })?;
        self.heap_end = end;
        Ok(start)
    }

    /// Read a value at the cursor and advance past it
    pub fn read<T: bytemuck::Pod>(&mut self) -> Result<T> {
        let value = self.read_at(self.address)?;
        self.address += std::mem::size_of::<T>() as u64;
        Ok(value)
    }

    /// Write a value at the cursor and advance past it
    pub fn write<T: bytemuck::Pod>(&mut self, value: T) -> Result<()> {
        self.write_at(self.address, value)?;
        self.address += std::mem::size_of::<T>() as u64;
        Ok(())
    }

    /// Read a value at `offset` without moving the cursor
    pub fn read_at<T: bytemuck::Pod>(&self, offset: u64) -> Result<T> {
        let range = self.span(offset, std::mem::size_of::<T>() as u64)?;
        Ok(bytemuck::pod_read_unaligned(&self.data[range]))
    }

    /// Write a value at `offset` without moving the cursor
    pub fn write_at<T: bytemuck::Pod>(&mut self, offset: u64, value: T) -> Result<()> {
        let range = self.span(offset, std::mem::size_of::<T>() as u64)?;
        self.data[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Read one reference at the cursor
    pub fn read_ref(&mut self) -> Result<u64> {
        self.read::<u64>()
    }

    /// Write one reference at the cursor
    pub fn write_ref(&mut self, value: u64) -> Result<()> {
        self.write::<u64>(value)
    }

    /// Raw contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw contents, mutable
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Release the region's memory
    pub fn release(self) {
        tracing::trace!(region = %self.kind, size = self.size(), "region released");
    }

    fn span(&self, offset: u64, size: u64) -> Result<Range<usize>> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size() => Ok(offset as usize..end as usize),
            _ => Err(OffloadError::RegionOutOfBounds {
                region: self.kind,
                offset,
                size,
                region_size: self.size(),
            }),
        }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("address", &self.address)
            .field("heap_end", &self.heap_end)
            .finish()
    }
}
