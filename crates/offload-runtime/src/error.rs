//! Error types for context operations and decoded device faults

use crate::exception::{ArrayBoundsFault, ExceptionObject};
use crate::handles::KernelId;
use crate::memory::RegionKind;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, OffloadError>;

/// Errors raised by the execution context and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    /// The selected binary variant is the output of a failed compilation
    #[error("device binary {path} was produced by a failed compilation")]
    CompileFailure { path: String },

    /// A device thread dereferenced a null reference
    #[error("null pointer dereference on device thread {thread}")]
    NullPointer { thread: usize },

    /// The device-side allocator ran out of heap
    #[error("device heap exhausted on thread {thread}")]
    OutOfMemory { thread: usize },

    /// A device thread indexed past the end of an array
    #[error("array index out of bounds on device thread {thread}: {fault}")]
    ArrayBounds { thread: usize, fault: ArrayBoundsFault },

    /// A generic device fault object, re-raised unchanged
    #[error("device thread {thread} raised {error}")]
    DeviceError { thread: usize, error: ExceptionObject },

    /// Any other exception object decoded from the heap
    #[error("unknown device exception on thread {thread}: {payload}")]
    UnknownDeviceFault { thread: usize, payload: ExceptionObject },

    /// Driver-level failure or exhausted device memory
    #[error("resource fault: {0}")]
    ResourceFault(String),

    /// Region access out of bounds
    #[error("{region} region access out of bounds: offset {offset} + size {size} > region size {region_size}")]
    RegionOutOfBounds {
        region: RegionKind,
        offset: u64,
        size: u64,
        region_size: u64,
    },

    /// The binary is not present in the resource store
    #[error("binary resource not found: {0}")]
    ResourceNotFound(String),

    /// I/O error while reading from a resource store
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A serializer broke its contract
    #[error("serialization error: {0}")]
    Serialization(String),

    /// `init` called while the object heap is still allocated
    #[error("object heap is already allocated ({size} bytes)")]
    HeapAlreadySized { size: u64 },

    /// Thread topology the device cannot run
    #[error("invalid thread configuration: {0}")]
    InvalidThreadConfig(String),

    /// Batch launch with no units of work
    #[error("batch launch requires at least one unit of work")]
    EmptyBatch,

    /// No handle was recorded for a unit during the write phase
    #[error("no handle recorded for unit {0}")]
    MissingHandle(KernelId),

    /// Two units were serialized to the same heap address
    #[error("handle {handle:#x} assigned to both unit {first} and unit {second}")]
    DuplicateHandle {
        handle: u64,
        first: KernelId,
        second: KernelId,
    },

    /// Operation on a closed context
    #[error("execution context is closed")]
    Closed,

    /// Native launch library or symbol could not be loaded
    #[error("failed to load launch library: {0}")]
    Library(String),
}

impl OffloadError {
    /// Create a resource fault
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::ResourceFault(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True for faults decoded from the exception region
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            Self::NullPointer { .. }
                | Self::OutOfMemory { .. }
                | Self::ArrayBounds { .. }
                | Self::DeviceError { .. }
                | Self::UnknownDeviceFault { .. }
        )
    }

    /// Device thread that raised the fault, if this is a device fault
    pub fn faulting_thread(&self) -> Option<usize> {
        match self {
            Self::NullPointer { thread }
            | Self::OutOfMemory { thread }
            | Self::ArrayBounds { thread, .. }
            | Self::DeviceError { thread, .. }
            | Self::UnknownDeviceFault { thread, .. } => Some(*thread),
            _ => None,
        }
    }
}
