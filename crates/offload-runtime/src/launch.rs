//! The native launch boundary
//!
//! A launch hands the device binary, the thread topology and the four
//! launch regions to the native side and blocks until the device finishes.
//! Two implementations are provided:
//!
//! - [`DylibLauncher`] calls the C entry point `offload_launch` resolved from
//!   a shared library
//! - [`FnLauncher`] runs a Rust closure, used to emulate a device on the host
//!
//! # C ABI
//!
//! ```text
//! int32_t offload_launch(int32_t device_id,
//!                        const uint8_t *binary, int32_t binary_length,
//!                        int32_t block_shape_x, int32_t grid_shape_x,
//!                        int32_t thread_count,
//!                        CRegion *object, CRegion *handles,
//!                        CRegion *exceptions, CRegion *classes,
//!                        bool dynamic_alloc_used);
//! ```
//!
//! A nonzero return is a driver-level failure.

use crate::error::{OffloadError, Result};
use crate::memory::MemoryRegion;
use libloading::Library;
use std::fmt;
use std::path::Path;

/// Symbol every launch library must export
pub const LAUNCH_SYMBOL: &[u8] = b"offload_launch\0";

/// Everything one launch needs
pub struct LaunchRequest<'a> {
    pub device_id: i32,
    pub binary: &'a [u8],
    pub block_shape_x: u32,
    pub grid_shape_x: u32,
    pub thread_count: u32,
    pub object: &'a mut MemoryRegion,
    pub handles: &'a mut MemoryRegion,
    pub exceptions: &'a mut MemoryRegion,
    pub classes: &'a mut MemoryRegion,
    pub dynamic_alloc_used: bool,
}

impl fmt::Debug for LaunchRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("device_id", &self.device_id)
            .field("binary_len", &self.binary.len())
            .field("block_shape_x", &self.block_shape_x)
            .field("grid_shape_x", &self.grid_shape_x)
            .field("thread_count", &self.thread_count)
            .field("object", &self.object)
            .field("handles", &self.handles)
            .field("exceptions", &self.exceptions)
            .field("classes", &self.classes)
            .field("dynamic_alloc_used", &self.dynamic_alloc_used)
            .finish()
    }
}

/// Executes a binary on a device, blocking until it completes
pub trait NativeLauncher: Send {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()>;
}

impl<L: NativeLauncher + ?Sized> NativeLauncher for Box<L> {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()> {
        (**self).launch(request)
    }
}

// ================================================================================================
// C ABI
// ================================================================================================

/// A region as seen by the native side
#[repr(C)]
#[derive(Debug)]
pub struct CRegion {
    pub data: *mut u8,
    pub size: u64,
    pub heap_end: u64,
}

impl CRegion {
    /// Borrow `region` for the duration of a native call
    pub fn from_region(region: &mut MemoryRegion) -> Self {
        Self {
            size: region.size(),
            heap_end: region.heap_end_ptr(),
            data: region.as_bytes_mut().as_mut_ptr(),
        }
    }
}

/// Signature of the `offload_launch` entry point
pub type LaunchFn = unsafe extern "C" fn(
    device_id: i32,
    binary: *const u8,
    binary_length: i32,
    block_shape_x: i32,
    grid_shape_x: i32,
    thread_count: i32,
    object: *mut CRegion,
    handles: *mut CRegion,
    exceptions: *mut CRegion,
    classes: *mut CRegion,
    dynamic_alloc_used: bool,
) -> i32;

/// Launcher backed by a native `offload_launch` entry point
pub struct DylibLauncher {
    entry: LaunchFn,
    // Keeps `entry` mapped
    _library: Option<Library>,
}

impl DylibLauncher {
    /// Load `offload_launch` from the shared library at `path`
    ///
    /// # Errors
    ///
    /// Returns `Library` if the library cannot be opened or does not export
    /// the entry point.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: loading runs the library's initializers; launch libraries are
        // trusted native code and the symbol type matches the documented ABI.
        unsafe {
            let library = Library::new(path)
                .map_err(|e| OffloadError::Library(format!("{}: {e}", path.display())))?;
            let entry: LaunchFn = *library
                .get::<LaunchFn>(LAUNCH_SYMBOL)
                .map_err(|e| OffloadError::Library(format!("{}: missing offload_launch: {e}", path.display())))?;

            tracing::debug!(path = %path.display(), "launch library loaded");

            Ok(Self {
                entry,
                _library: Some(library),
            })
        }
    }

    /// Wrap an entry point that is already linked into the process
    ///
    /// # Safety
    ///
    /// `entry` must honour the ABI above: it may only touch the bytes each
    /// region describes and must not retain any pointer after returning.
    pub unsafe fn from_entry_point(entry: LaunchFn) -> Self {
        Self { entry, _library: None }
    }
}

impl fmt::Debug for DylibLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DylibLauncher")
            .field("dynamic", &self._library.is_some())
            .finish()
    }
}

fn c_int(name: &str, value: impl TryInto<i32>) -> Result<i32> {
    value
        .try_into()
        .map_err(|_| OffloadError::resource(format!("{name} does not fit the native launch ABI")))
}

impl NativeLauncher for DylibLauncher {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()> {
        let binary_length = c_int("binary length", request.binary.len())?;
        let block_shape_x = c_int("block shape", request.block_shape_x)?;
        let grid_shape_x = c_int("grid shape", request.grid_shape_x)?;
        let thread_count = c_int("thread count", request.thread_count)?;

        let mut object = CRegion::from_region(request.object);
        let mut handles = CRegion::from_region(request.handles);
        let mut exceptions = CRegion::from_region(request.exceptions);
        let mut classes = CRegion::from_region(request.classes);

        // SAFETY: every CRegion points into a region borrowed mutably for the
        // whole call, and `size` is that region's length.
        let status = unsafe {
            (self.entry)(
                request.device_id,
                request.binary.as_ptr(),
                binary_length,
                block_shape_x,
                grid_shape_x,
                thread_count,
                &mut object,
                &mut handles,
                &mut exceptions,
                &mut classes,
                request.dynamic_alloc_used,
            )
        };

        if status != 0 {
            return Err(OffloadError::resource(format!(
                "native launch on device {} failed with status {status}",
                request.device_id
            )));
        }

        request.object.set_heap_end_ptr(object.heap_end)
    }
}

// ================================================================================================
// Host emulation
// ================================================================================================

/// Launcher that runs a closure in place of the device
pub struct FnLauncher<F> {
    body: F,
    launches: usize,
}

impl<F> FnLauncher<F>
where
    F: FnMut(LaunchRequest<'_>) -> Result<()> + Send,
{
    pub fn new(body: F) -> Self {
        Self { body, launches: 0 }
    }

    /// Number of launches performed
    pub fn launches(&self) -> usize {
        self.launches
    }
}

impl<F> NativeLauncher for FnLauncher<F>
where
    F: FnMut(LaunchRequest<'_>) -> Result<()> + Send,
{
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()> {
        self.launches += 1;
        (self.body)(request)
    }
}
