//! Checked byte and value transfers on top of a [`ProcessMemory`] backend.
//!
//! Every transfer is a single backend call. If the backend reports fewer
//! bytes than requested the transfer fails with
//! [`MemoryAccessError::PartialTransfer`]; nothing is truncated or retried.

use std::io;
use std::mem::size_of;

use bytemuck::Pod;
use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::trace;

use crate::memory::protection::ProcessAccess;
use crate::pointer::RawPointer;
use crate::process::{ProcessError, ProcessHandle};
use crate::value::{Value, ValueKind};

#[derive(Error, Debug)]
pub enum MemoryAccessError {
    #[error("partial transfer at {address:#x}: {transferred} of {requested} bytes")]
    PartialTransfer {
        address: usize,
        requested: usize,
        transferred: usize,
    },
    #[error("memory access failed at {address:#x}: {source}")]
    Os { address: usize, source: io::Error },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("failed to decode memory: {0}")]
    Decode(String),
}

/// Raw access to some address space.
///
/// Implementations issue one OS-level transfer per call and return the
/// number of bytes the OS reports as moved, which may be less than asked for.
pub trait ProcessMemory {
    fn read_raw(&self, address: usize, buffer: &mut [u8]) -> io::Result<usize>;

    fn write_raw(&self, address: usize, data: &[u8]) -> io::Result<usize>;
}

/// Fills `buffer` from `address`.
pub fn read_into<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
    buffer: &mut [u8],
) -> Result<(), MemoryAccessError> {
    let address = address.address();
    let requested = buffer.len();
    trace!(address, requested, "read");

    let transferred = memory
        .read_raw(address, buffer)
        .map_err(|source| MemoryAccessError::Os { address, source })?;

    if transferred != requested {
        return Err(MemoryAccessError::PartialTransfer {
            address,
            requested,
            transferred,
        });
    }

    Ok(())
}

pub fn read_bytes<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
    count: usize,
) -> Result<Vec<u8>, MemoryAccessError> {
    let mut data = vec![0; count];

    read_into(memory, address, &mut data)?;

    Ok(data)
}

pub fn write_bytes<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
    data: &[u8],
) -> Result<(), MemoryAccessError> {
    let address = address.address();
    let requested = data.len();
    trace!(address, requested, "write");

    let transferred = memory
        .write_raw(address, data)
        .map_err(|source| MemoryAccessError::Os { address, source })?;

    if transferred != requested {
        return Err(MemoryAccessError::PartialTransfer {
            address,
            requested,
            transferred,
        });
    }

    Ok(())
}

/// Reads a `T` in the target's native layout.
pub fn read_value<T: Pod, M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<T>,
) -> Result<T, MemoryAccessError> {
    let bytes = read_bytes(memory, address.cast(), size_of::<T>())?;
    Ok(bytemuck::pod_read_unaligned(&bytes))
}

pub fn write_value<T: Pod, M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<T>,
    value: &T,
) -> Result<(), MemoryAccessError> {
    write_bytes(memory, address.cast(), bytemuck::bytes_of(value))
}

macro_rules! create_read_primitive {
    ($type:ty) => {
        paste::paste! {
            #[doc = concat!("Reads a little-endian `", stringify!($type), "`.")]
            pub fn [<read_ $type>]<M: ProcessMemory + ?Sized>(
                memory: &M,
                address: RawPointer<u8>,
            ) -> Result<$type, MemoryAccessError> {
                let memory = read_bytes(memory, address, size_of::<$type>())?;

                memory
                    .as_slice()
                    .[<read_ $type>]::<LittleEndian>()
                    .map_err(|_| MemoryAccessError::Decode(concat!("failed to decode ", stringify!($type)).to_string()))
            }
        }
    };
}

create_read_primitive!(u16);
create_read_primitive!(i16);
create_read_primitive!(u32);
create_read_primitive!(i32);
create_read_primitive!(u64);
create_read_primitive!(i64);
create_read_primitive!(f32);
create_read_primitive!(f64);

pub fn read_u8<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
) -> Result<u8, MemoryAccessError> {
    read_value(memory, address)
}

/// Reads a native-width address.
pub fn read_pointer<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
) -> Result<RawPointer<u8>, MemoryAccessError> {
    read_value::<usize, _>(memory, address.cast()).map(RawPointer::new)
}

/// Follows a pointer chain: for each offset, dereference the current address
/// and add the offset. The final address is returned, not dereferenced.
///
/// `resolve_pointer_chain(m, base, &[0x10, 0x8])` is `*(*base + 0x10) + 0x8`.
pub fn resolve_pointer_chain<M: ProcessMemory + ?Sized>(
    memory: &M,
    base: RawPointer<u8>,
    offsets: &[isize],
) -> Result<RawPointer<u8>, MemoryAccessError> {
    let mut current = base;

    for &offset in offsets {
        current = read_pointer(memory, current)?.byte_offset(offset);
    }

    Ok(current)
}

pub fn read_any<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
    kind: ValueKind,
) -> Result<Value, MemoryAccessError> {
    let bytes = read_bytes(memory, address, kind.size())?;

    Value::from_ne_bytes(kind, &bytes)
        .ok_or_else(|| MemoryAccessError::Decode(format!("failed to decode {kind}")))
}

pub fn write_any<M: ProcessMemory + ?Sized>(
    memory: &M,
    address: RawPointer<u8>,
    value: &Value,
) -> Result<(), MemoryAccessError> {
    write_bytes(memory, address, &value.to_ne_bytes())
}

/// Copies `count` bytes out of the calling process through the same checked
/// path used for other processes.
pub fn read_current(address: RawPointer<u8>, count: usize) -> Result<Vec<u8>, MemoryAccessError> {
    let handle = ProcessHandle::current(ProcessAccess::VM_READ)?;
    read_bytes(&handle, address, count)
}

pub fn write_current(address: RawPointer<u8>, data: &[u8]) -> Result<(), MemoryAccessError> {
    let handle = ProcessHandle::current(ProcessAccess::VM_WRITE | ProcessAccess::VM_OPERATION)?;
    write_bytes(&handle, address, data)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;

    /// Sparse fake address space; reads and writes stop at the first unmapped byte.
    #[derive(Default)]
    struct FakeMemory {
        bytes: RefCell<BTreeMap<usize, u8>>,
        fail: bool,
    }

    impl FakeMemory {
        fn with(address: usize, data: &[u8]) -> Self {
            let memory = FakeMemory::default();
            for (i, byte) in data.iter().enumerate() {
                memory.bytes.borrow_mut().insert(address + i, *byte);
            }
            memory
        }
    }

    impl ProcessMemory for FakeMemory {
        fn read_raw(&self, address: usize, buffer: &mut [u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            let bytes = self.bytes.borrow();
            for (i, slot) in buffer.iter_mut().enumerate() {
                match bytes.get(&(address + i)) {
                    Some(byte) => *slot = *byte,
                    None => return Ok(i),
                }
            }
            Ok(buffer.len())
        }

        fn write_raw(&self, address: usize, data: &[u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            let mut bytes = self.bytes.borrow_mut();
            for (i, byte) in data.iter().enumerate() {
                match bytes.get_mut(&(address + i)) {
                    Some(slot) => *slot = *byte,
                    None => return Ok(i),
                }
            }
            Ok(data.len())
        }
    }

    #[test]
    fn short_reads_are_errors() {
        let memory = FakeMemory::with(0x100, &[1, 2, 3]);

        let err = read_bytes(&memory, RawPointer::new(0x100), 4).unwrap_err();
        assert!(matches!(
            err,
            MemoryAccessError::PartialTransfer {
                address: 0x100,
                requested: 4,
                transferred: 3
            }
        ));
    }

    #[test]
    fn short_writes_are_errors() {
        let memory = FakeMemory::with(0x100, &[0; 3]);

        let err = write_bytes(&memory, RawPointer::new(0x100), &[9; 4]).unwrap_err();
        assert!(matches!(
            err,
            MemoryAccessError::PartialTransfer {
                requested: 4,
                transferred: 3,
                ..
            }
        ));
    }

    #[test]
    fn backend_failures_carry_the_address() {
        let memory = FakeMemory {
            fail: true,
            ..Default::default()
        };

        let err = read_bytes(&memory, RawPointer::new(0xABC), 1).unwrap_err();
        assert!(matches!(err, MemoryAccessError::Os { address: 0xABC, .. }));
    }

    #[test]
    fn typed_values_round_trip() {
        let memory = FakeMemory::with(0x200, &[0; 8]);
        let address = RawPointer::<f64>::new(0x200);

        write_value(&memory, address, &-12.25f64).unwrap();
        assert_eq!(read_value(&memory, address).unwrap(), -12.25);
    }

    #[test]
    fn decodes_little_endian_primitives() {
        let memory = FakeMemory::with(0x10, &[0x78, 0x56, 0x34, 0x12]);

        assert_eq!(read_u32(&memory, RawPointer::new(0x10)).unwrap(), 0x1234_5678);
        assert_eq!(read_u16(&memory, RawPointer::new(0x12)).unwrap(), 0x1234);
        assert_eq!(read_u8(&memory, RawPointer::new(0x13)).unwrap(), 0x12);
    }

    #[test]
    fn follows_pointer_chains() {
        let memory = FakeMemory::with(0x1000, &0x2000usize.to_ne_bytes());
        for (i, byte) in 0x3000usize.to_ne_bytes().iter().enumerate() {
            memory.bytes.borrow_mut().insert(0x2010 + i, *byte);
        }

        let end = resolve_pointer_chain(&memory, RawPointer::new(0x1000), &[0x10, 0x8]).unwrap();
        assert_eq!(end.address(), 0x3008);

        let unchanged = resolve_pointer_chain(&memory, RawPointer::new(0x1000), &[]).unwrap();
        assert_eq!(unchanged.address(), 0x1000);

        let err = resolve_pointer_chain(&memory, RawPointer::new(0x1000), &[0, 0]).unwrap_err();
        assert!(matches!(err, MemoryAccessError::PartialTransfer { transferred: 0, .. }));
    }

    #[test]
    fn runtime_kinds_round_trip() {
        let memory = FakeMemory::with(0x40, &[0; 8]);

        write_any(&memory, RawPointer::new(0x40), &Value::I32(-7)).unwrap();
        assert_eq!(
            read_any(&memory, RawPointer::new(0x40), ValueKind::I32).unwrap(),
            Value::I32(-7)
        );
    }
}
