//! Devices a context can launch on
//!
//! The context only needs two things from a device: the id passed to the
//! native launcher and the amount of free global memory, which sizes the
//! object heap when it is not sized explicitly.

use crate::error::Result;

#[cfg(feature = "cuda")]
use crate::error::OffloadError;
#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;
#[cfg(feature = "cuda")]
use std::sync::Arc;

/// A compute device
pub trait Device: Send + Sync {
    /// Device ordinal passed to the native launcher
    fn id(&self) -> i32;

    /// Free global memory in bytes
    fn free_global_memory_bytes(&self) -> Result<u64>;
}

/// A device with a fixed amount of free memory
///
/// Used with host-side launchers and in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDevice {
    id: i32,
    free_bytes: u64,
}

impl HostDevice {
    pub const fn new(id: i32, free_bytes: u64) -> Self {
        Self { id, free_bytes }
    }
}

impl Device for HostDevice {
    fn id(&self) -> i32 {
        self.id
    }

    fn free_global_memory_bytes(&self) -> Result<u64> {
        Ok(self.free_bytes)
    }
}

/// A CUDA GPU queried through the driver API
#[cfg(feature = "cuda")]
pub struct CudaGpu {
    ordinal: i32,
    device: Arc<CudaDevice>,
}

#[cfg(feature = "cuda")]
impl CudaGpu {
    /// Open the GPU with the given ordinal
    ///
    /// # Errors
    ///
    /// Returns `ResourceFault` if no such device exists or the driver cannot
    /// be initialized.
    pub fn new(ordinal: i32) -> Result<Self> {
        let index = usize::try_from(ordinal)
            .map_err(|_| OffloadError::resource(format!("invalid CUDA device ordinal {ordinal}")))?;
        let device = CudaDevice::new(index)
            .map_err(|e| OffloadError::resource(format!("CUDA device {ordinal} not available: {e}")))?;
        Ok(Self { ordinal, device })
    }

    /// Check if a CUDA device is present
    pub fn is_available() -> bool {
        CudaDevice::new(0).is_ok()
    }
}

#[cfg(feature = "cuda")]
impl Device for CudaGpu {
    fn id(&self) -> i32 {
        self.ordinal
    }

    fn free_global_memory_bytes(&self) -> Result<u64> {
        self.device
            .bind_to_thread()
            .map_err(|e| OffloadError::resource(format!("cannot bind CUDA device {}: {e}", self.ordinal)))?;
        let (free, _total) = cudarc::driver::result::mem_get_info()
            .map_err(|e| OffloadError::resource(format!("cannot query CUDA device {} memory: {e}", self.ordinal)))?;
        Ok(free as u64)
    }
}

// Stub implementation when CUDA feature is not enabled
#[cfg(not(feature = "cuda"))]
pub struct CudaGpu;

#[cfg(not(feature = "cuda"))]
impl CudaGpu {
    pub fn new(_ordinal: i32) -> Result<Self> {
        Err(crate::error::OffloadError::resource(
            "CUDA devices require the 'cuda' feature to be enabled",
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}
