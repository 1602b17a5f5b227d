//! Launch topology, context configuration and protocol constants

use crate::error::{OffloadError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

// ================================================================================================
// Protocol constants
// ================================================================================================

/// Device memory kept free when the heap is sized from the device's free memory
pub const DEVICE_HEADROOM_BYTES: u64 = 64 * 1024 * 1024;

/// Low bits of a reference that carry the tag; the rest is the object number
pub const REFERENCE_TAG_BITS: u32 = 4;

/// Size of the class metadata region
pub const CLASS_REGION_BYTES: u64 = 1024;

/// Size of the texture region, allocated once per context
pub const TEXTURE_REGION_BYTES: u64 = 64;

/// Suffix the compiler gives to the binary path of a failed build
pub const COMPILE_ERROR_SUFFIX: &str = ".error";

// ================================================================================================
// Thread configuration
// ================================================================================================

/// Device execution topology for one launch
///
/// Launches are one-dimensional: the native side receives the block and grid
/// shapes along x only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Threads per block
    pub block_shape_x: u32,
    /// Blocks in the grid
    pub grid_shape_x: u32,
    /// Logical threads that execute the kernel
    pub thread_count: u32,
}

impl ThreadConfig {
    pub const fn new(block_shape_x: u32, grid_shape_x: u32, thread_count: u32) -> Self {
        Self {
            block_shape_x,
            grid_shape_x,
            thread_count,
        }
    }

    /// Cover `thread_count` threads with blocks of `block_size`
    ///
    /// A zero block size is treated as 1.
    pub const fn linear(thread_count: u32, block_size: u32) -> Self {
        let block_size = if block_size == 0 { 1 } else { block_size };
        Self::new(block_size, thread_count.div_ceil(block_size), thread_count)
    }

    /// Threads the grid can hold
    pub const fn capacity(&self) -> u64 {
        // u32 * u32 always fits in u64
        self.block_shape_x as u64 * self.grid_shape_x as u64
    }

    /// Reject topologies the device cannot run
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(OffloadError::InvalidThreadConfig("thread count must be positive".into()));
        }
        if self.capacity() == 0 {
            return Err(OffloadError::InvalidThreadConfig(format!("empty grid: {self}")));
        }
        if u64::from(self.thread_count) > self.capacity() {
            return Err(OffloadError::InvalidThreadConfig(format!(
                "{} threads do not fit in {self}",
                self.thread_count
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block={}, grid={}, threads={}",
            self.block_shape_x, self.grid_shape_x, self.thread_count
        )
    }
}

// ================================================================================================
// Context configuration
// ================================================================================================

/// Host pointer width, which selects the binary variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerWidth {
    /// 32-bit host
    Narrow,
    /// 64-bit host
    Wide,
}

impl PointerWidth {
    /// Width of the running host
    pub const fn host() -> Self {
        if cfg!(target_pointer_width = "32") {
            Self::Narrow
        } else {
            Self::Wide
        }
    }

    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "32" | "narrow" => Some(Self::Narrow),
            "64" | "wide" => Some(Self::Wide),
            _ => None,
        }
    }
}

impl Default for PointerWidth {
    fn default() -> Self {
        Self::host()
    }
}

/// Tunable behaviour of an execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Binary variant to select
    pub pointer_width: PointerWidth,
    /// Dump the start of the object region after every write and read phase
    pub print_mem: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            pointer_width: PointerWidth::host(),
            print_mem: false,
        }
    }
}

impl ContextConfig {
    /// Build a configuration from environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `OFFLOAD_POINTER_WIDTH` - `32`/`narrow` or `64`/`wide`
    /// - `OFFLOAD_PRINT_MEM` - `true`/`1` enables the memory dump
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(width) = env::var("OFFLOAD_POINTER_WIDTH") {
            match PointerWidth::from_env_value(&width) {
                Some(parsed) => config.pointer_width = parsed,
                None => tracing::warn!(value = %width, "ignoring unrecognized OFFLOAD_POINTER_WIDTH"),
            }
        }

        if let Ok(flag) = env::var("OFFLOAD_PRINT_MEM") {
            config.print_mem = flag.eq_ignore_ascii_case("true") || flag == "1";
        }

        config
    }
}
