//! Decoding of the per-thread exception region
//!
//! Every device thread owns one reference-wide slot. Zero means the thread
//! finished normally. A nonzero slot is a tagged reference:
//!
//! ```text
//!  63                                   4 3      0
//! ┌──────────────────────────────────────┬────────┐
//! │            object number             │  tag   │
//! └──────────────────────────────────────┴────────┘
//! ```
//!
//! The object number is first compared against the program's sentinel
//! numbers. If neither matches, the whole reference is the heap address of a
//! serialized exception object.

use crate::config::REFERENCE_TAG_BITS;
use crate::error::{OffloadError, Result};
use crate::handles::Handle;
use crate::memory::MemoryRegion;
use crate::serialize::Serializer;
use std::fmt;

/// Program-specific object numbers reserved for built-in faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinels {
    pub null_pointer: u64,
    pub out_of_memory: u64,
}

/// Outcome of one exception slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionSlot {
    /// Thread finished without an exception
    Ok,
    /// Thread dereferenced null
    NullFault,
    /// Device allocator ran out of heap
    OomFault,
    /// Thread raised an exception object stored at this handle
    ObjectFault(Handle),
}

impl ExceptionSlot {
    /// Decode a raw slot value
    ///
    /// Sentinels take precedence over the heap: a sentinel match never reads
    /// the object region.
    pub fn decode(raw: u64, sentinels: Sentinels) -> Self {
        if raw == 0 {
            return Self::Ok;
        }
        let object_number = raw >> REFERENCE_TAG_BITS;
        if object_number == sentinels.null_pointer {
            Self::NullFault
        } else if object_number == sentinels.out_of_memory {
            Self::OomFault
        } else {
            Self::ObjectFault(Handle::new(raw))
        }
    }

    /// True if the slot reports a fault
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// A device exception object rebuilt on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionObject {
    /// Fully qualified type of the exception
    pub type_name: String,
    /// Message, if the exception carried one
    pub message: Option<String>,
}

impl ExceptionObject {
    pub fn new(type_name: impl Into<String>, message: Option<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message,
        }
    }
}

impl fmt::Display for ExceptionObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.type_name, message),
            None => f.write_str(&self.type_name),
        }
    }
}

/// Details of an out-of-bounds array access on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayBoundsFault {
    /// Index that was accessed
    pub index: i64,
    /// Length of the array
    pub length: i64,
    /// Heap reference of the array
    pub array: u64,
}

impl fmt::Display for ArrayBoundsFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {} outside array of length {} at {:#x}",
            self.index, self.length, self.array
        )
    }
}

/// Exception kinds a serializer can decode from the heap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceException {
    /// A fault object that is re-raised as-is
    Error(ExceptionObject),
    /// An object carrying array-bounds details
    ArrayBounds(ArrayBoundsFault),
    /// Anything else; surfaced wrapped with the object as payload
    Other(ExceptionObject),
}

impl DeviceException {
    /// Convert into the error raised for `thread`
    pub fn into_error(self, thread: usize) -> OffloadError {
        match self {
            Self::Error(error) => OffloadError::DeviceError { thread, error },
            Self::ArrayBounds(fault) => OffloadError::ArrayBounds { thread, fault },
            Self::Other(payload) => OffloadError::UnknownDeviceFault { thread, payload },
        }
    }
}

/// Turn one decoded slot into a result, reading the heap only for object faults
pub fn raise_for_slot<U>(
    thread: usize,
    slot: ExceptionSlot,
    serializer: &mut dyn Serializer<U>,
) -> Result<()> {
    match slot {
        ExceptionSlot::Ok => Ok(()),
        ExceptionSlot::NullFault => Err(OffloadError::NullPointer { thread }),
        ExceptionSlot::OomFault => Err(OffloadError::OutOfMemory { thread }),
        ExceptionSlot::ObjectFault(handle) => Err(serializer.read_exception(handle)?.into_error(thread)),
    }
}

/// Read `slots` exception slots from the cursor of `exceptions`
///
/// Stops at the first faulting slot and returns its error; no later slot is
/// read and no result may be deserialized after a fault.
pub fn scan_slots<U>(
    exceptions: &mut MemoryRegion,
    slots: usize,
    sentinels: Sentinels,
    serializer: &mut dyn Serializer<U>,
) -> Result<()> {
    for thread in 0..slots {
        let slot = ExceptionSlot::decode(exceptions.read_ref()?, sentinels);
        if let Err(err) = raise_for_slot(thread, slot, serializer) {
            tracing::error!(thread, ?slot, error = %err, "device thread faulted");
            return Err(err);
        }
    }
    Ok(())
}
