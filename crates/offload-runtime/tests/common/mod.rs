//! Shared fixtures: a sample kernel, its serializer and a launcher that
//! executes the kernel on the host.
//!
//! Heap layout written by [`SampleSerializer`]:
//!
//! ```text
//! statics   0..32   launches: i32
//! root      +0  class: u32   +4  scale: i32   +8  output: i64   +16 values: ref
//! array     +0  class: u32   +4  length: u32  +8  elements: i32 × length
//! exception +0  class: u32   +4  msg len: u32 +8  index: i64    +16 length: i64
//!           +24 array: ref   +32 message bytes
//! ```

#![allow(dead_code)]

use offload_runtime::config::REFERENCE_TAG_BITS;
use offload_runtime::{
    ArrayBoundsFault, CompiledProgram, DeviceException, ExceptionObject, Handle, LaunchRequest, MemoryRegion,
    MemoryStore, NativeLauncher, OffloadError, Result, Serializer,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const NULL_SENTINEL: u64 = 1;
pub const OOM_SENTINEL: u64 = 2;
pub const STATICS_BYTES: u64 = 32;

const ROOT_CLASS: u32 = 1;
const ARRAY_CLASS: u32 = 2;
const ERROR_CLASS: u32 = 3;
const BOUNDS_CLASS: u32 = 4;
const OTHER_CLASS: u32 = 5;

const ROOT_BYTES: u64 = 24;
const ARRAY_HEADER_BYTES: u64 = 8;
const EXCEPTION_HEADER_BYTES: u64 = 32;

pub const NARROW_BINARY: &[u8] = b"sample-kernel-32";
pub const WIDE_BINARY: &[u8] = b"sample-kernel-64";

// ================================================================================================
// Sample kernel
// ================================================================================================

/// Scales every value and accumulates the scaled values into `output`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleUnit {
    pub values: Vec<i32>,
    pub scale: i32,
    pub output: i64,
}

impl SampleUnit {
    pub fn new(values: Vec<i32>, scale: i32) -> Self {
        Self {
            values,
            scale,
            output: 0,
        }
    }

    /// What the kernel computes, run in-process
    pub fn run_on_host(&mut self) {
        for value in &mut self.values {
            *value *= self.scale;
            self.output += i64::from(*value);
        }
    }
}

pub struct SampleProgram {
    narrow: String,
    wide: String,
    dynamic_alloc: bool,
    launches: Mutex<i32>,
    statics_reads: AtomicUsize,
    instance_reads: AtomicUsize,
    exception_reads: AtomicUsize,
}

impl SampleProgram {
    pub fn new(stem: &str) -> Self {
        Self::with_paths(format!("{stem}.cubin32"), format!("{stem}.cubin64"))
    }

    /// A program whose compilation failed for both variants
    pub fn failed(stem: &str) -> Self {
        Self::with_paths(format!("{stem}.cubin32.error"), format!("{stem}.cubin64.error"))
    }

    fn with_paths(narrow: String, wide: String) -> Self {
        Self {
            narrow,
            wide,
            dynamic_alloc: true,
            launches: Mutex::new(0),
            statics_reads: AtomicUsize::new(0),
            instance_reads: AtomicUsize::new(0),
            exception_reads: AtomicUsize::new(0),
        }
    }

    /// Store serving both binary variants of this program
    pub fn store(&self) -> Arc<MemoryStore> {
        let mut store = MemoryStore::new();
        store.insert(self.narrow.clone(), NARROW_BINARY);
        store.insert_chunks(
            self.wide.clone(),
            WIDE_BINARY.chunks(5).map(<[u8]>::to_vec).collect(),
        );
        Arc::new(store)
    }

    /// Static launch counter, as last read back from the device
    pub fn launches(&self) -> i32 {
        *self.launches.lock()
    }

    pub fn statics_reads(&self) -> usize {
        self.statics_reads.load(Ordering::SeqCst)
    }

    pub fn instance_reads(&self) -> usize {
        self.instance_reads.load(Ordering::SeqCst)
    }

    pub fn exception_reads(&self) -> usize {
        self.exception_reads.load(Ordering::SeqCst)
    }
}

impl CompiledProgram for SampleProgram {
    type Unit = SampleUnit;

    fn narrow_binary_path(&self) -> &str {
        &self.narrow
    }

    fn wide_binary_path(&self) -> &str {
        &self.wide
    }

    fn uses_dynamic_allocation(&self) -> bool {
        self.dynamic_alloc
    }

    fn null_pointer_sentinel(&self) -> u64 {
        NULL_SENTINEL
    }

    fn out_of_memory_sentinel(&self) -> u64 {
        OOM_SENTINEL
    }

    fn serializer<'r>(
        &'r self,
        object: &'r mut MemoryRegion,
        _texture: &'r mut MemoryRegion,
    ) -> Box<dyn Serializer<SampleUnit> + 'r> {
        Box::new(SampleSerializer { program: self, object })
    }
}

// ================================================================================================
// Serializer
// ================================================================================================

pub struct SampleSerializer<'r> {
    program: &'r SampleProgram,
    object: &'r mut MemoryRegion,
}

impl SampleSerializer<'_> {
    fn expect_class(&self, address: u64, class: u32) -> Result<()> {
        let found: u32 = self.object.read_at(address)?;
        if found != class {
            return Err(OffloadError::serialization(format!(
                "expected class {class} at {address:#x}, found {found}"
            )));
        }
        Ok(())
    }
}

impl Serializer<SampleUnit> for SampleSerializer<'_> {
    fn write_statics(&mut self) -> Result<()> {
        let at = self.object.alloc(STATICS_BYTES)?;
        self.object.write_at(at, *self.program.launches.lock())
    }

    fn write_instance(&mut self, unit: &SampleUnit) -> Result<Handle> {
        let root = self.object.alloc(ROOT_BYTES)?;
        let array = self.object.alloc(ARRAY_HEADER_BYTES + 4 * unit.values.len() as u64)?;

        self.object.write_at(root, ROOT_CLASS)?;
        self.object.write_at(root + 4, unit.scale)?;
        self.object.write_at(root + 8, unit.output)?;
        self.object.write_at(root + 16, array)?;

        self.object.write_at(array, ARRAY_CLASS)?;
        self.object.write_at(array + 4, unit.values.len() as u32)?;
        for (index, value) in unit.values.iter().enumerate() {
            self.object.write_at(array + ARRAY_HEADER_BYTES + 4 * index as u64, *value)?;
        }

        Ok(Handle::new(root))
    }

    fn read_statics(&mut self) -> Result<()> {
        *self.program.launches.lock() = self.object.read_at(0)?;
        self.program.statics_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_instance(&mut self, handle: Handle, into: &mut SampleUnit) -> Result<()> {
        let root = handle.address();
        self.expect_class(root, ROOT_CLASS)?;
        let array: u64 = self.object.read_at(root + 16)?;
        self.expect_class(array, ARRAY_CLASS)?;

        let length: u32 = self.object.read_at(array + 4)?;
        into.values = (0..u64::from(length))
            .map(|index| self.object.read_at::<i32>(array + ARRAY_HEADER_BYTES + 4 * index))
            .collect::<Result<_>>()?;
        into.scale = self.object.read_at(root + 4)?;
        into.output = self.object.read_at(root + 8)?;

        self.program.instance_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_exception(&mut self, handle: Handle) -> Result<DeviceException> {
        self.program.exception_reads.fetch_add(1, Ordering::SeqCst);

        let at = handle.address();
        let class: u32 = self.object.read_at(at)?;
        let message_len: u32 = self.object.read_at(at + 4)?;
        let start = (at + EXCEPTION_HEADER_BYTES) as usize;
        let message = self
            .object
            .as_bytes()
            .get(start..start + message_len as usize)
            .ok_or_else(|| OffloadError::serialization("exception message outside the heap"))?;
        let message = String::from_utf8(message.to_vec()).map_err(|e| OffloadError::serialization(e.to_string()))?;
        let message = (!message.is_empty()).then_some(message);

        match class {
            ERROR_CLASS => Ok(DeviceException::Error(ExceptionObject::new("StackOverflowError", message))),
            BOUNDS_CLASS => Ok(DeviceException::ArrayBounds(ArrayBoundsFault {
                index: self.object.read_at(at + 8)?,
                length: self.object.read_at(at + 16)?,
                array: self.object.read_at(at + 24)?,
            })),
            OTHER_CLASS => Ok(DeviceException::Other(ExceptionObject::new("IllegalStateException", message))),
            other => Err(OffloadError::serialization(format!("class {other} is not an exception"))),
        }
    }
}

// ================================================================================================
// Simulated device
// ================================================================================================

/// Fault injected on one device thread
#[derive(Debug, Clone)]
pub enum Fault {
    NullPointer,
    OutOfMemory,
    Error(String),
    ArrayBounds { index: i64, length: i64 },
    Other(String),
}

/// What the launcher observed for one launch
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub device_id: i32,
    pub binary: Vec<u8>,
    pub block_shape_x: u32,
    pub grid_shape_x: u32,
    pub thread_count: u32,
    pub dynamic_alloc_used: bool,
    pub handles: Vec<u64>,
    pub exception_slots: u64,
    pub class_region_bytes: u64,
}

/// Runs the sample kernel on the host
///
/// Thread `t` works on unit `t % n` and element `t / n` of that unit, where
/// `n` is the number of handles. A template launch therefore spreads one
/// unit over all threads and a batch launch gives each thread its own unit.
#[derive(Debug, Default)]
pub struct SimulatedLauncher {
    faults: Vec<(usize, Fault)>,
    records: Arc<Mutex<Vec<LaunchRecord>>>,
}

impl SimulatedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `fault` on `thread` instead of running the kernel there
    pub fn with_fault(mut self, thread: usize, fault: Fault) -> Self {
        self.faults.push((thread, fault));
        self
    }

    /// Launch log shared with the launcher
    pub fn records(&self) -> Arc<Mutex<Vec<LaunchRecord>>> {
        Arc::clone(&self.records)
    }

    fn fault_for(&self, thread: usize) -> Option<&Fault> {
        self.faults.iter().find(|(t, _)| *t == thread).map(|(_, fault)| fault)
    }
}

impl NativeLauncher for SimulatedLauncher {
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()> {
        let LaunchRequest {
            device_id,
            binary,
            block_shape_x,
            grid_shape_x,
            thread_count,
            object,
            handles,
            exceptions,
            classes,
            dynamic_alloc_used,
        } = request;

        let unit_count = handles.size() / 8;
        let roots = (0..unit_count)
            .map(|index| handles.read_at::<u64>(index * 8))
            .collect::<Result<Vec<_>>>()?;

        self.records.lock().push(LaunchRecord {
            device_id,
            binary: binary.to_vec(),
            block_shape_x,
            grid_shape_x,
            thread_count,
            dynamic_alloc_used,
            handles: roots.clone(),
            exception_slots: exceptions.size() / 8,
            class_region_bytes: classes.size(),
        });

        let launches: i32 = object.read_at(0)?;
        object.write_at(0, launches + 1)?;

        for thread in 0..thread_count as usize {
            if let Some(fault) = self.fault_for(thread) {
                let raw = raise(object, fault)?;
                exceptions.write_at(thread as u64 * 8, raw)?;
                continue;
            }
            let root = roots[thread % roots.len()];
            let element = (thread / roots.len()) as u64;
            scale_element(object, root, element)?;
        }
        Ok(())
    }
}

fn scale_element(object: &mut MemoryRegion, root: u64, element: u64) -> Result<()> {
    let scale: i32 = object.read_at(root + 4)?;
    let array: u64 = object.read_at(root + 16)?;
    let length: u32 = object.read_at(array + 4)?;
    if element >= u64::from(length) {
        return Ok(());
    }

    let at = array + ARRAY_HEADER_BYTES + 4 * element;
    let value = object.read_at::<i32>(at)? * scale;
    object.write_at(at, value)?;
    let output = object.read_at::<i64>(root + 8)? + i64::from(value);
    object.write_at(root + 8, output)
}

/// Write an exception for `fault` and return the slot value
fn raise(object: &mut MemoryRegion, fault: &Fault) -> Result<u64> {
    let (class, message, index, length) = match fault {
        // Tag bits set on purpose: decoding must ignore them
        Fault::NullPointer => return Ok((NULL_SENTINEL << REFERENCE_TAG_BITS) | 0x3),
        Fault::OutOfMemory => return Ok(OOM_SENTINEL << REFERENCE_TAG_BITS),
        Fault::Error(message) => (ERROR_CLASS, message.as_str(), 0, 0),
        Fault::ArrayBounds { index, length } => (BOUNDS_CLASS, "", *index, *length),
        Fault::Other(message) => (OTHER_CLASS, message.as_str(), 0, 0),
    };

    let at = object.alloc(EXCEPTION_HEADER_BYTES + message.len() as u64)?;
    object.write_at(at, class)?;
    object.write_at(at + 4, message.len() as u32)?;
    object.write_at(at + 8, index)?;
    object.write_at(at + 16, length)?;
    object.write_at(at + 24, 0u64)?;
    let start = (at + EXCEPTION_HEADER_BYTES) as usize;
    object.as_bytes_mut()[start..start + message.len()].copy_from_slice(message.as_bytes());
    Ok(at)
}
