//! The execution context
//!
//! One context drives launches on one device. It owns the object heap, the
//! texture region, the binary cache and the handle table, and re-allocates
//! the handle, exception and class regions for every launch.
//!
//! ```text
//!                 init / init_with_size
//! Uninitialized ─────────────────────────▶ Sized
//!       │                                   │
//!       │ run / run_batch (lazy init)       │ run / run_batch
//!       ▼                                   ▼
//!     Ready ◀──────── Launched ◀────────── Ready
//!       │
//!       │ close
//!       ▼
//!    Closed
//! ```
//!
//! Every launch goes through three phases: write (serialize the units into
//! the heap), launch (blocking native call) and read (decode every exception
//! slot, then deserialize the units back).

use crate::binary_cache::BinaryCache;
use crate::config::{ContextConfig, ThreadConfig, CLASS_REGION_BYTES, DEVICE_HEADROOM_BYTES, TEXTURE_REGION_BYTES};
use crate::device::Device;
use crate::dump;
use crate::error::{OffloadError, Result};
use crate::exception;
use crate::handles::{HandleTable, KernelId};
use crate::launch::{LaunchRequest, NativeLauncher};
use crate::memory::{MemoryRegion, RegionKind, REFERENCE_WIDTH};
use crate::resources::ResourceStore;
use crate::serialize::CompiledProgram;
use crate::stats::{LaunchMode, StatsRow};
use offload_tracing::PhaseTimer;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No heap yet
    Uninitialized,
    /// Heap allocated, no launch prepared
    Sized,
    /// All regions allocated
    Ready,
    /// Native launch in progress
    Launched,
    /// Regions released
    Closed,
}

/// Mutable views of the launch regions, borrowed together
struct Regions<'a> {
    object: &'a mut MemoryRegion,
    texture: &'a mut MemoryRegion,
    handles: &'a mut MemoryRegion,
    exceptions: &'a mut MemoryRegion,
}

/// Runs compiled programs on one device
pub struct ExecutionContext<'d> {
    device: &'d dyn Device,
    launcher: Box<dyn NativeLauncher + 'd>,
    store: Arc<dyn ResourceStore>,
    config: ContextConfig,
    state: ContextState,
    binaries: BinaryCache,
    handle_table: HandleTable,
    object: Option<MemoryRegion>,
    handles: Option<MemoryRegion>,
    exceptions: Option<MemoryRegion>,
    classes: Option<MemoryRegion>,
    texture: MemoryRegion,
    stats: Vec<StatsRow>,
}

impl<'d> ExecutionContext<'d> {
    /// Create a context with the default configuration
    pub fn new(
        device: &'d dyn Device,
        launcher: impl NativeLauncher + 'd,
        store: Arc<dyn ResourceStore>,
    ) -> Result<Self> {
        Self::with_config(device, launcher, store, ContextConfig::default())
    }

    /// Create a context
    ///
    /// Only the texture region is allocated here; the heap is sized by
    /// [`init`](Self::init), [`init_with_size`](Self::init_with_size) or the
    /// first launch.
    pub fn with_config(
        device: &'d dyn Device,
        launcher: impl NativeLauncher + 'd,
        store: Arc<dyn ResourceStore>,
        config: ContextConfig,
    ) -> Result<Self> {
        let texture = MemoryRegion::allocate(RegionKind::Texture, TEXTURE_REGION_BYTES)?;
        tracing::debug!(device = device.id(), pointer_width = ?config.pointer_width, "execution context created");

        Ok(Self {
            device,
            launcher: Box::new(launcher),
            store,
            config,
            state: ContextState::Uninitialized,
            binaries: BinaryCache::new(),
            handle_table: HandleTable::new(),
            object: None,
            handles: None,
            exceptions: None,
            classes: None,
            texture,
            stats: Vec::new(),
        })
    }

    // ============================================================================================
    // Heap sizing
    // ============================================================================================

    /// Size the heap from the device's free memory
    ///
    /// The heap gets everything except [`DEVICE_HEADROOM_BYTES`] and the
    /// auxiliary regions currently allocated.
    ///
    /// # Errors
    ///
    /// - `ResourceFault` if the device has less free memory than that.
    /// - `HeapAlreadySized` if the heap is allocated.
    /// - `Closed` after [`close`](Self::close).
    #[tracing::instrument(skip(self), fields(device = self.device.id()))]
    pub fn init(&mut self) -> Result<()> {
        self.ensure_unsized()?;

        let auxiliary: u64 = [&self.handles, &self.exceptions, &self.classes]
            .into_iter()
            .map(|region| region.as_ref().map_or(0, MemoryRegion::size))
            .sum();
        self.size_heap_from_device(auxiliary)
    }

    fn size_heap_from_device(&mut self, auxiliary: u64) -> Result<()> {
        let free = self.device.free_global_memory_bytes()?;
        let size = free
            .checked_sub(DEVICE_HEADROOM_BYTES)
            .and_then(|rest| rest.checked_sub(auxiliary))
            .ok_or_else(|| {
                OffloadError::resource(format!(
                    "device {} has {free} bytes free, below the {DEVICE_HEADROOM_BYTES} byte headroom plus {auxiliary} bytes of launch regions",
                    self.device.id()
                ))
            })?;

        self.allocate_heap(size)
    }

    /// Size the heap to exactly `bytes`
    ///
    /// # Errors
    ///
    /// Same as [`init`](Self::init), minus the device query.
    #[tracing::instrument(skip(self))]
    pub fn init_with_size(&mut self, bytes: u64) -> Result<()> {
        self.ensure_unsized()?;
        self.allocate_heap(bytes)
    }

    fn ensure_unsized(&self) -> Result<()> {
        self.ensure_open()?;
        match &self.object {
            Some(heap) => Err(OffloadError::HeapAlreadySized { size: heap.size() }),
            None => Ok(()),
        }
    }

    fn allocate_heap(&mut self, size: u64) -> Result<()> {
        self.object = Some(MemoryRegion::allocate(RegionKind::Object, size)?);
        if self.state == ContextState::Uninitialized {
            self.state = ContextState::Sized;
        }
        tracing::debug!(size, "object heap sized");
        Ok(())
    }

    // ============================================================================================
    // Launches
    // ============================================================================================

    /// Run `program` with one unit of work shared by every thread
    ///
    /// On success `unit` holds the state the device left it in.
    ///
    /// # Errors
    ///
    /// - `CompileFailure` if the selected binary is a failed build, before any
    ///   region is touched.
    /// - `ResourceFault` if the heap cannot hold the unit or the launch fails.
    /// - A device fault if any thread raised one; `unit` is left untouched.
    #[tracing::instrument(skip_all, fields(device = self.device.id(), threads = %thread_config))]
    pub fn run<P: CompiledProgram>(
        &mut self,
        program: &P,
        unit: &mut P::Unit,
        thread_config: ThreadConfig,
    ) -> Result<()> {
        self.ensure_open()?;
        let slots = thread_config.thread_count as usize;
        self.execute(program, std::slice::from_mut(unit), slots, thread_config, LaunchMode::Template)
    }

    /// Run `program` with one unit of work per logical thread
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run), plus `EmptyBatch` for an empty slice. A fault on
    /// any thread leaves every unit untouched.
    #[tracing::instrument(skip_all, fields(device = self.device.id(), units = units.len(), threads = %thread_config))]
    pub fn run_batch<P: CompiledProgram>(
        &mut self,
        program: &P,
        units: &mut [P::Unit],
        thread_config: ThreadConfig,
    ) -> Result<()> {
        self.ensure_open()?;
        if units.is_empty() {
            return Err(OffloadError::EmptyBatch);
        }
        if thread_config.thread_count as usize != units.len() {
            tracing::warn!(
                units = units.len(),
                thread_count = thread_config.thread_count,
                "thread count differs from batch size; one exception slot per unit"
            );
        }
        let slots = units.len();
        self.execute(program, units, slots, thread_config, LaunchMode::Batch)
    }

    fn execute<P: CompiledProgram>(
        &mut self,
        program: &P,
        units: &mut [P::Unit],
        slots: usize,
        thread_config: ThreadConfig,
        mode: LaunchMode,
    ) -> Result<()> {
        let filename = program.binary_path(self.config.pointer_width);
        let binary = self.binaries.load(filename, self.store.as_ref())?;
        thread_config.validate()?;

        self.prepare_regions(units.len() as u64 * REFERENCE_WIDTH, slots as u64 * REFERENCE_WIDTH)?;

        let write_time = self.write_phase(program, units)?;
        let launch_time = self.launch_phase(program, &binary, thread_config)?;
        let read_time = self.read_phase(program, units, slots)?;

        let heap_bytes_used = self.object.as_ref().map_or(0, MemoryRegion::heap_end_ptr);
        self.stats.push(StatsRow {
            mode,
            units: units.len(),
            threads: thread_config,
            binary_bytes: binary.len(),
            heap_bytes_used,
            write_time,
            launch_time,
            read_time,
        });
        tracing::debug!(?mode, units = units.len(), heap_bytes_used, "launch complete");
        Ok(())
    }

    /// Size the heap if needed, then allocate fresh auxiliary regions
    ///
    /// A lazily sized heap leaves room for the regions about to be allocated,
    /// so a failed sizing leaves no region behind.
    fn prepare_regions(&mut self, handle_bytes: u64, exception_bytes: u64) -> Result<()> {
        for region in [self.handles.take(), self.exceptions.take(), self.classes.take()]
            .into_iter()
            .flatten()
        {
            region.release();
        }

        if self.object.is_none() {
            self.size_heap_from_device(handle_bytes + exception_bytes + CLASS_REGION_BYTES)?;
        }

        self.handles = Some(MemoryRegion::allocate(RegionKind::Handles, handle_bytes)?);
        self.exceptions = Some(MemoryRegion::allocate(RegionKind::Exceptions, exception_bytes)?);
        self.classes = Some(MemoryRegion::allocate(RegionKind::Classes, CLASS_REGION_BYTES)?);
        self.state = ContextState::Ready;
        Ok(())
    }

    fn write_phase<P: CompiledProgram>(&mut self, program: &P, units: &[P::Unit]) -> Result<Duration> {
        let timer = PhaseTimer::start("write");
        {
            let (regions, table) = self.split()?;
            table.clear();
            regions.object.clear_heap_end_ptr();
            regions.object.set_address(0);
            regions.handles.set_address(0);

            let mut serializer = program.serializer(regions.object, regions.texture);
            serializer.write_statics()?;
            for (index, unit) in units.iter().enumerate() {
                let handle = serializer.write_instance(unit)?;
                table.record(KernelId(index), handle)?;
                regions.handles.write_ref(handle.address())?;
            }
        }
        self.dump_heap("write");
        Ok(timer.finish())
    }

    fn launch_phase<P: CompiledProgram>(
        &mut self,
        program: &P,
        binary: &[u8],
        thread_config: ThreadConfig,
    ) -> Result<Duration> {
        let device_id = self.device.id();
        self.state = ContextState::Launched;
        let timer = PhaseTimer::start("launch");

        let ExecutionContext {
            launcher,
            object,
            handles,
            exceptions,
            classes,
            ..
        } = self;
        let outcome = match (object.as_mut(), handles.as_mut(), exceptions.as_mut(), classes.as_mut()) {
            (Some(object), Some(handles), Some(exceptions), Some(classes)) => launcher.launch(LaunchRequest {
                device_id,
                binary,
                block_shape_x: thread_config.block_shape_x,
                grid_shape_x: thread_config.grid_shape_x,
                thread_count: thread_config.thread_count,
                object,
                handles,
                exceptions,
                classes,
                dynamic_alloc_used: program.uses_dynamic_allocation(),
            }),
            _ => Err(OffloadError::Closed),
        };

        self.state = ContextState::Ready;
        outcome?;
        Ok(timer.finish())
    }

    fn read_phase<P: CompiledProgram>(&mut self, program: &P, units: &mut [P::Unit], slots: usize) -> Result<Duration> {
        let timer = PhaseTimer::start("read");
        let sentinels = program.sentinels();
        {
            let (regions, table) = self.split()?;
            regions.object.set_address(0);
            regions.handles.set_address(0);
            regions.exceptions.set_address(0);

            let mut serializer = program.serializer(regions.object, regions.texture);
            exception::scan_slots(regions.exceptions, slots, sentinels, &mut *serializer)?;

            serializer.read_statics()?;
            for (index, unit) in units.iter_mut().enumerate() {
                let handle = table.get(KernelId(index))?;
                serializer.read_instance(handle, unit)?;
            }
        }
        self.dump_heap("read");
        Ok(timer.finish())
    }

    fn split(&mut self) -> Result<(Regions<'_>, &mut HandleTable)> {
        let ExecutionContext {
            object,
            texture,
            handles,
            exceptions,
            handle_table,
            ..
        } = self;
        match (object.as_mut(), handles.as_mut(), exceptions.as_mut()) {
            (Some(object), Some(handles), Some(exceptions)) => Ok((
                Regions {
                    object,
                    texture,
                    handles,
                    exceptions,
                },
                handle_table,
            )),
            _ => Err(OffloadError::Closed),
        }
    }

    fn dump_heap(&self, phase: &str) {
        if !(self.config.print_mem || dump::print_mem_enabled()) {
            return;
        }
        if let Some(heap) = &self.object {
            dump::dump_region(heap, phase);
        }
    }

    // ============================================================================================
    // Shutdown
    // ============================================================================================

    /// Release the heap and the launch regions
    ///
    /// Calling it again is a no-op. Every later operation fails with `Closed`.
    pub fn close(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }
        for region in [self.object.take(), self.handles.take(), self.exceptions.take(), self.classes.take()]
            .into_iter()
            .flatten()
        {
            region.release();
        }
        self.handle_table.clear();
        self.state = ContextState::Closed;
        tracing::debug!(device = self.device.id(), launches = self.stats.len(), "execution context closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ContextState::Closed {
            return Err(OffloadError::Closed);
        }
        Ok(())
    }

    // ============================================================================================
    // Inspection
    // ============================================================================================

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn device(&self) -> &'d dyn Device {
        self.device
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// One row per successful launch, oldest first
    pub fn stats(&self) -> &[StatsRow] {
        &self.stats
    }

    pub fn binary_cache(&self) -> &BinaryCache {
        &self.binaries
    }

    /// Handles recorded by the most recent write phase
    pub fn handle_table(&self) -> &HandleTable {
        &self.handle_table
    }

    /// Size of the object heap, if allocated
    pub fn heap_size(&self) -> Option<u64> {
        self.object.as_ref().map(MemoryRegion::size)
    }

    /// Region of the given kind, if currently allocated
    pub fn region(&self, kind: RegionKind) -> Option<&MemoryRegion> {
        match kind {
            RegionKind::Object => self.object.as_ref(),
            RegionKind::Handles => self.handles.as_ref(),
            RegionKind::Exceptions => self.exceptions.as_ref(),
            RegionKind::Classes => self.classes.as_ref(),
            RegionKind::Texture => Some(&self.texture),
        }
    }
}

impl Drop for ExecutionContext<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
