//! Contract between the execution context and generated serializers
//!
//! A compiled program carries everything the context needs to run it: the two
//! binary variants, its sentinel object numbers and a serializer factory. The
//! serializer moves object graphs between host values and the object region.
//!
//! # Protocol
//!
//! Write phase (heap end reset to 0 beforehand):
//!
//! 1. `write_statics` lays out the static-data prefix
//! 2. `write_instance` once per unit, returning the handle of its root object
//!
//! Read phase (every exception slot already decoded clean):
//!
//! 1. `read_statics` restores static data
//! 2. `read_instance` once per unit at the handle recorded during writing
//!
//! `read_exception` is only called for a faulting slot, with the heap address
//! taken from that slot.

use crate::config::PointerWidth;
use crate::error::Result;
use crate::exception::{DeviceException, Sentinels};
use crate::handles::Handle;
use crate::memory::MemoryRegion;

/// Moves units of work of type `U` in and out of the object region
pub trait Serializer<U> {
    /// Write static data at the start of the heap
    fn write_statics(&mut self) -> Result<()>;

    /// Serialize `unit` and return the heap address of its root object
    fn write_instance(&mut self, unit: &U) -> Result<Handle>;

    /// Restore static data written back by the device
    fn read_statics(&mut self) -> Result<()>;

    /// Deserialize the object at `handle` into `into`
    fn read_instance(&mut self, handle: Handle, into: &mut U) -> Result<()>;

    /// Decode the exception object at `handle`
    fn read_exception(&mut self, handle: Handle) -> Result<DeviceException>;
}

/// A kernel compiled for the device
pub trait CompiledProgram {
    /// Host type of one unit of work
    type Unit;

    /// Binary for 32-bit hosts
    fn narrow_binary_path(&self) -> &str;

    /// Binary for 64-bit hosts
    fn wide_binary_path(&self) -> &str;

    /// Whether the kernel allocates on the device heap
    fn uses_dynamic_allocation(&self) -> bool;

    /// Object number that marks a null dereference
    fn null_pointer_sentinel(&self) -> u64;

    /// Object number that marks device heap exhaustion
    fn out_of_memory_sentinel(&self) -> u64;

    /// Serializer bound to the object and texture regions of one launch
    fn serializer<'r>(
        &'r self,
        object: &'r mut MemoryRegion,
        texture: &'r mut MemoryRegion,
    ) -> Box<dyn Serializer<Self::Unit> + 'r>;

    /// Binary variant for `width`
    fn binary_path(&self, width: PointerWidth) -> &str {
        match width {
            PointerWidth::Narrow => self.narrow_binary_path(),
            PointerWidth::Wide => self.wide_binary_path(),
        }
    }

    /// Both sentinels, as the exception decoder takes them
    fn sentinels(&self) -> Sentinels {
        Sentinels {
            null_pointer: self.null_pointer_sentinel(),
            out_of_memory: self.out_of_memory_sentinel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExceptionObject;
    use crate::memory::RegionKind;

    /// Stores one u32 per unit right after the statics
    struct Counter;

    struct CounterSerializer<'r> {
        object: &'r mut MemoryRegion,
    }

    impl Serializer<u32> for CounterSerializer<'_> {
        fn write_statics(&mut self) -> Result<()> {
            let at = self.object.alloc(16)?;
            self.object.write_at(at, 0xfeed_u32)
        }

        fn write_instance(&mut self, unit: &u32) -> Result<Handle> {
            let at = self.object.alloc(4)?;
            self.object.write_at(at, *unit)?;
            Ok(Handle::new(at))
        }

        fn read_statics(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_instance(&mut self, handle: Handle, into: &mut u32) -> Result<()> {
            *into = self.object.read_at(handle.address())?;
            Ok(())
        }

        fn read_exception(&mut self, _handle: Handle) -> Result<DeviceException> {
            Ok(DeviceException::Other(ExceptionObject::new("Counter", None)))
        }
    }

    impl CompiledProgram for Counter {
        type Unit = u32;

        fn narrow_binary_path(&self) -> &str {
            "counter.cubin32"
        }

        fn wide_binary_path(&self) -> &str {
            "counter.cubin64"
        }

        fn uses_dynamic_allocation(&self) -> bool {
            false
        }

        fn null_pointer_sentinel(&self) -> u64 {
            3
        }

        fn out_of_memory_sentinel(&self) -> u64 {
            9
        }

        fn serializer<'r>(
            &'r self,
            object: &'r mut MemoryRegion,
            _texture: &'r mut MemoryRegion,
        ) -> Box<dyn Serializer<u32> + 'r> {
            Box::new(CounterSerializer { object })
        }
    }

    #[test]
    fn test_binary_path_by_width() {
        assert_eq!(Counter.binary_path(PointerWidth::Narrow), "counter.cubin32");
        assert_eq!(Counter.binary_path(PointerWidth::Wide), "counter.cubin64");
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(
            Counter.sentinels(),
            Sentinels {
                null_pointer: 3,
                out_of_memory: 9
            }
        );
    }

    #[test]
    fn test_statics_precede_instances() {
        let mut object = MemoryRegion::allocate(RegionKind::Object, 64).unwrap();
        let mut texture = MemoryRegion::allocate(RegionKind::Texture, 64).unwrap();

        let handle = {
            let mut serializer = Counter.serializer(&mut object, &mut texture);
            serializer.write_statics().unwrap();
            serializer.write_instance(&41).unwrap()
        };
        assert_eq!(handle, Handle(16));

        object.write_at(handle.address(), 42u32).unwrap();
        let mut unit = 0;
        Counter
            .serializer(&mut object, &mut texture)
            .read_instance(handle, &mut unit)
            .unwrap();
        assert_eq!(unit, 42);
    }
}
