use std::io;

use libc::{c_int, pid_t};
use mach::kern_return::{
    kern_return_t, KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT, KERN_PROTECTION_FAILURE,
    KERN_SUCCESS,
};
use mach::message::mach_msg_type_number_t;
use mach::port::{mach_port_name_t, mach_port_t, MACH_PORT_NULL};
use mach::vm::{
    mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_region, mach_vm_write,
};
use mach::vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_NONE, VM_PROT_READ, VM_PROT_WRITE};
use mach::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
use mach::vm_statistics::VM_FLAGS_ANYWHERE;
use mach::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::warn;

use crate::memory::native::{Context64, ContextFlags};
use crate::memory::protection::{PageState, PageType, ProcessAccess, Protection};
use crate::memory::query::{PageInfo, QueryError};
use crate::memory::region::MemoryRegion;
use crate::pointer::RawPointer;
use crate::process::{Module, ProcessError};

#[allow(non_camel_case_types)]
type vm_map_t = mach_port_t;
#[allow(non_camel_case_types)]
type vm_address_t = mach_vm_address_t;
#[allow(non_camel_case_types)]
type vm_size_t = mach_vm_size_t;

extern "C" {
    fn vm_read_overwrite(
        target_task: vm_map_t,
        address: vm_address_t,
        size: vm_size_t,
        data: vm_address_t,
        out_size: *mut vm_size_t,
    ) -> kern_return_t;
}

pub(crate) fn max_user_address() -> usize {
    0x7fff_ffff_ffff
}

pub(crate) fn thread_context(_tid: u32, _flags: ContextFlags) -> Result<Context64, ProcessError> {
    Err(ProcessError::Unsupported("thread contexts on macos".to_string()))
}

fn kern_error(operation: &str, result: kern_return_t) -> io::Error {
    io::Error::other(format!("{operation} failed with kern_return_t {result}"))
}

fn protection_from_vm(prot: vm_prot_t) -> Protection {
    Protection::from_rwx(
        prot & VM_PROT_READ != 0,
        prot & VM_PROT_WRITE != 0,
        prot & VM_PROT_EXECUTE != 0,
    )
}

fn protection_to_vm(protection: Protection) -> vm_prot_t {
    let (read, write, execute) = protection.rwx();
    let mut prot = VM_PROT_NONE;
    if read {
        prot |= VM_PROT_READ;
    }
    if write {
        prot |= VM_PROT_WRITE;
    }
    if execute {
        prot |= VM_PROT_EXECUTE;
    }
    prot
}

pub(crate) struct OsHandle {
    task: mach_port_name_t,
    owned: bool,
}

impl OsHandle {
    pub fn open(pid: u32, access: ProcessAccess) -> Result<Self, ProcessError> {
        // kill(0) and kill(-1) address process groups, not a single pid
        if pid == 0 || pid > pid_t::MAX as u32 {
            return Err(ProcessError::NotFound(pid.to_string()));
        }

        if pid as pid_t == unsafe { libc::getpid() } {
            return Ok(Self {
                task: unsafe { mach::traps::mach_task_self() },
                owned: false,
            });
        }

        if unsafe { libc::kill(pid as pid_t, 0) } != 0
            && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
        {
            return Err(ProcessError::NotFound(pid.to_string()));
        }

        let mut task: mach_port_name_t = MACH_PORT_NULL;
        let result = unsafe {
            mach::traps::task_for_pid(mach::traps::mach_task_self(), pid as c_int, &mut task)
        };
        if result != KERN_SUCCESS {
            return Err(ProcessError::AccessDenied { pid, access });
        }

        Ok(Self { task, owned: true })
    }

    pub fn close(&mut self) -> io::Result<()> {
        if !self.owned || self.task == MACH_PORT_NULL {
            return Ok(());
        }

        let task = std::mem::replace(&mut self.task, MACH_PORT_NULL);
        let result =
            unsafe { mach::mach_port::mach_port_deallocate(mach::traps::mach_task_self(), task) };
        if result != KERN_SUCCESS {
            return Err(kern_error("mach_port_deallocate", result));
        }

        Ok(())
    }

    pub fn read(&self, address: usize, buffer: &mut [u8]) -> io::Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let mut read_len = 0 as vm_size_t;
        let result = unsafe {
            vm_read_overwrite(
                self.task,
                address as vm_address_t,
                buffer.len() as vm_size_t,
                buffer.as_mut_ptr() as vm_address_t,
                &mut read_len,
            )
        };

        if result != KERN_SUCCESS {
            return Err(kern_error("vm_read_overwrite", result));
        }

        Ok(read_len as usize)
    }

    pub fn write(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let result = unsafe {
            mach_vm_write(
                self.task,
                address as mach_vm_address_t,
                data.as_ptr() as _,
                data.len() as mach_msg_type_number_t,
            )
        };

        if result != KERN_SUCCESS {
            return Err(kern_error("mach_vm_write", result));
        }

        Ok(data.len())
    }

    pub fn query(&self, address: usize) -> Result<PageInfo, QueryError> {
        let mut region_address = address as mach_vm_address_t;
        let mut region_size: mach_vm_size_t = 0;
        let mut info: vm_region_basic_info_64 = unsafe { std::mem::zeroed() };
        let mut count = vm_region_basic_info_64::count();
        let mut object_name: mach_port_t = MACH_PORT_NULL;

        let result = unsafe {
            mach_vm_region(
                self.task,
                &mut region_address,
                &mut region_size,
                VM_REGION_BASIC_INFO_64,
                &mut info as *mut vm_region_basic_info_64 as vm_region_info_t,
                &mut count,
                &mut object_name,
            )
        };

        // mach_vm_region returns the next region at or above the address,
        // so everything before it is unallocated.
        if result == KERN_INVALID_ADDRESS || (result == KERN_SUCCESS && region_address as usize > address) {
            let end = if result == KERN_SUCCESS {
                region_address as usize
            } else {
                max_user_address().saturating_add(1).max(address.saturating_add(1))
            };

            return Ok(PageInfo {
                base_address: RawPointer::new(address),
                allocation_base: RawPointer::null(),
                allocation_protect: Protection::empty(),
                region_size: end - address,
                state: PageState::FREE,
                protect: Protection::NO_ACCESS,
                page_type: PageType::empty(),
            });
        }

        if result != KERN_SUCCESS {
            return Err(match result {
                KERN_PROTECTION_FAILURE => QueryError::AccessDenied { address },
                _ => QueryError::Os(kern_error("mach_vm_region", result)),
            });
        }

        Ok(PageInfo {
            base_address: RawPointer::new(region_address as usize),
            allocation_base: RawPointer::new(region_address as usize),
            allocation_protect: protection_from_vm(info.max_protection),
            region_size: region_size as usize,
            state: PageState::COMMIT,
            protect: protection_from_vm(info.protection),
            page_type: if info.shared != 0 {
                PageType::MAPPED
            } else {
                PageType::PRIVATE
            },
        })
    }

    pub fn regions(&self) -> Result<Vec<PageInfo>, QueryError> {
        super::walk_by_query(max_user_address(), |address| self.query(address))
    }

    pub fn protect(
        &self,
        address: usize,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, QueryError> {
        let previous = self.query(address)?.protect;

        if !protection.modifiers().is_empty() {
            warn!(
                modifiers = protection.modifiers().bits(),
                "protection modifiers have no mach equivalent and are ignored"
            );
        }

        let result = unsafe {
            mach_vm_protect(
                self.task,
                address as mach_vm_address_t,
                len as mach_vm_size_t,
                0,
                protection_to_vm(protection),
            )
        };

        match result {
            KERN_SUCCESS => Ok(previous),
            KERN_PROTECTION_FAILURE => Err(QueryError::AccessDenied { address }),
            KERN_INVALID_ADDRESS => Err(QueryError::InvalidAddress { address }),
            _ => Err(QueryError::Os(kern_error("mach_vm_protect", result))),
        }
    }

    pub fn allocate(&self, size: usize, protection: Protection) -> Result<MemoryRegion, QueryError> {
        let mut address: mach_vm_address_t = 0;
        let result = unsafe {
            mach_vm_allocate(self.task, &mut address, size as mach_vm_size_t, VM_FLAGS_ANYWHERE)
        };
        if result != KERN_SUCCESS {
            return Err(match result {
                KERN_INVALID_ARGUMENT => QueryError::InvalidAddress { address: 0 },
                _ => QueryError::Os(kern_error("mach_vm_allocate", result)),
            });
        }

        let region = MemoryRegion::new(RawPointer::new(address as usize), size);
        let result = unsafe {
            mach_vm_protect(self.task, address, size as mach_vm_size_t, 0, protection_to_vm(protection))
        };
        if result != KERN_SUCCESS {
            // release the pages before reporting
            let _ = self.free(region);
            return Err(QueryError::Os(kern_error("mach_vm_protect", result)));
        }

        Ok(region)
    }

    pub fn free(&self, region: MemoryRegion) -> Result<(), QueryError> {
        let address = region.low().address();
        let result = unsafe {
            mach_vm_deallocate(self.task, address as mach_vm_address_t, region.size() as mach_vm_size_t)
        };

        match result {
            KERN_SUCCESS => Ok(()),
            KERN_INVALID_ADDRESS | KERN_INVALID_ARGUMENT => Err(QueryError::InvalidAddress { address }),
            _ => Err(QueryError::Os(kern_error("mach_vm_deallocate", result))),
        }
    }

    pub fn modules(&self) -> Result<Vec<Module>, ProcessError> {
        Err(ProcessError::Unsupported(
            "module enumeration on macos".to_string(),
        ))
    }
}
