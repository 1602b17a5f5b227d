//! Host-side execution context for offloading kernels to a compute device
//!
//! This crate provides:
//! - **Binary cache**: compiled device binaries loaded once per context
//! - **Memory regions**: bounds-checked buffers shared with the device
//! - **Serialization protocol**: the contract generated serializers implement
//! - **Exception decoding**: per-thread fault slots turned into typed errors
//! - **Execution context**: the state machine that drives template and batch
//!   launches
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ExecutionContext                      │
//! │     run(program, unit) / run_batch(program, units)      │
//! └──────┬──────────────┬──────────────┬────────────────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌──────────────┐
//! │BinaryCache │ │ Serializer │ │NativeLauncher│
//! │ (resources)│ │  (program) │ │ (C ABI/host) │
//! └────────────┘ └─────┬──────┘ └──────┬───────┘
//!                      │               │
//!                      ▼               ▼
//!        ┌───────────────────────────────────────┐
//!        │ object │ handles │ exceptions │ classes│
//!        └───────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use offload_runtime::{ContextState, ExecutionContext, FnLauncher, HostDevice, LaunchRequest, MemoryStore};
//! use std::sync::Arc;
//!
//! # fn main() -> offload_runtime::Result<()> {
//! let device = HostDevice::new(0, 256 * 1024 * 1024);
//! let launcher = FnLauncher::new(|_request: LaunchRequest<'_>| Ok(()));
//! let mut context = ExecutionContext::new(&device, launcher, Arc::new(MemoryStore::new()))?;
//!
//! context.init_with_size(1 << 20)?;
//! assert_eq!(context.state(), ContextState::Sized);
//!
//! context.close();
//! # Ok(())
//! # }
//! ```

pub mod binary_cache;
pub mod config;
pub mod context;
pub mod device;
pub mod dump;
pub mod error;
pub mod exception;
pub mod handles;
pub mod launch;
pub mod memory;
pub mod resources;
pub mod serialize;
pub mod stats;

// Re-export public API
pub use binary_cache::BinaryCache;
pub use config::{ContextConfig, PointerWidth, ThreadConfig};
pub use context::{ContextState, ExecutionContext};
pub use device::{CudaGpu, Device, HostDevice};
pub use error::{OffloadError, Result};
pub use exception::{ArrayBoundsFault, DeviceException, ExceptionObject, ExceptionSlot, Sentinels};
pub use handles::{Handle, HandleTable, KernelId};
pub use launch::{CRegion, DylibLauncher, FnLauncher, LaunchFn, LaunchRequest, NativeLauncher};
pub use memory::{MemoryRegion, RegionKind};
pub use resources::{DirectoryStore, MemoryStore, ResourceStore};
pub use serialize::{CompiledProgram, Serializer};
pub use stats::{LaunchMode, StatsRow};
