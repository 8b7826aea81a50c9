use std::ffi::OsString;
use std::io;
use std::mem::{size_of, size_of_val};
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;

use winapi::{
    ctypes::c_void,
    shared::{
        basetsd::SIZE_T,
        minwindef::{DWORD, FALSE, HMODULE, LPCVOID, LPVOID, MAX_PATH},
        winerror::{
            ERROR_ACCESS_DENIED, ERROR_INVALID_ADDRESS, ERROR_INVALID_PARAMETER, ERROR_NOACCESS,
            ERROR_PARTIAL_COPY,
        },
    },
    um::{
        handleapi::CloseHandle,
        memoryapi::{
            ReadProcessMemory, VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, VirtualQueryEx,
            WriteProcessMemory,
        },
        processthreadsapi::{
            GetCurrentThreadId, GetThreadContext, OpenProcess, OpenThread, ResumeThread,
            SuspendThread,
        },
        psapi::{EnumProcessModules, GetModuleFileNameExW, GetModuleInformation, MODULEINFO},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{
            HANDLE, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PMEMORY_BASIC_INFORMATION,
            THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SUSPEND_RESUME,
        },
    },
};

use crate::memory::native::{Context64, ContextFlags, MemoryBasicInformation};
use crate::memory::protection::{ProcessAccess, Protection};
use crate::memory::query::{PageInfo, QueryError};
use crate::memory::region::MemoryRegion;
use crate::pointer::RawPointer;
use crate::process::{Module, ProcessError};

pub(crate) fn max_user_address() -> usize {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.lpMaximumApplicationAddress as usize
}

fn last_error_code(err: &io::Error) -> Option<DWORD> {
    err.raw_os_error().map(|code| code as DWORD)
}

/// Suspends thread `tid`, captures the register groups in `flags` and
/// resumes it, also when the capture fails.
#[cfg(target_arch = "x86_64")]
pub(crate) fn thread_context(tid: u32, flags: ContextFlags) -> Result<Context64, ProcessError> {
    if tid == unsafe { GetCurrentThreadId() } {
        return Err(ProcessError::Unsupported(
            "capturing the context of the calling thread".to_string(),
        ));
    }

    let access = THREAD_GET_CONTEXT | THREAD_SUSPEND_RESUME | THREAD_QUERY_INFORMATION;
    let thread = unsafe { OpenThread(access, FALSE, tid) };
    if thread.is_null() {
        let err = io::Error::last_os_error();
        return Err(match last_error_code(&err) {
            Some(ERROR_INVALID_PARAMETER) => ProcessError::NotFound(format!("thread {tid}")),
            _ => ProcessError::Os(err),
        });
    }

    let context = suspended_context(thread, flags);
    unsafe { CloseHandle(thread) };
    context
}

#[cfg(target_arch = "x86_64")]
fn suspended_context(thread: HANDLE, flags: ContextFlags) -> Result<Context64, ProcessError> {
    if unsafe { SuspendThread(thread) } == DWORD::MAX {
        return Err(ProcessError::Os(io::Error::last_os_error()));
    }

    let mut context = Context64::new(flags);
    let captured = unsafe { GetThreadContext(thread, &mut context as *mut Context64 as *mut _) };
    let capture_error = (captured == 0).then(io::Error::last_os_error);

    let resumed = unsafe { ResumeThread(thread) } != DWORD::MAX;
    if let Some(err) = capture_error {
        return Err(ProcessError::Os(err));
    }
    if !resumed {
        return Err(ProcessError::Os(io::Error::last_os_error()));
    }

    Ok(context)
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn thread_context(_tid: u32, _flags: ContextFlags) -> Result<Context64, ProcessError> {
    Err(ProcessError::Unsupported(
        "thread contexts outside x86_64".to_string(),
    ))
}

pub(crate) struct OsHandle {
    handle: HANDLE,
}

// A process HANDLE is a kernel object reference, not thread-affine.
unsafe impl Send for OsHandle {}

impl OsHandle {
    pub fn open(pid: u32, access: ProcessAccess) -> Result<Self, ProcessError> {
        let handle = unsafe { OpenProcess(access.bits(), FALSE, pid) };
        if handle.is_null() {
            let err = io::Error::last_os_error();
            return Err(match last_error_code(&err) {
                Some(ERROR_ACCESS_DENIED) => ProcessError::AccessDenied { pid, access },
                Some(ERROR_INVALID_PARAMETER) => ProcessError::NotFound(pid.to_string()),
                _ => ProcessError::Os(err),
            });
        }

        Ok(Self { handle })
    }

    pub fn close(&mut self) -> io::Result<()> {
        if self.handle.is_null() {
            return Ok(());
        }

        let handle = std::mem::replace(&mut self.handle, std::ptr::null_mut());
        if unsafe { CloseHandle(handle) } == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn read(&self, address: usize, buffer: &mut [u8]) -> io::Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let mut read: SIZE_T = 0;
        let result = unsafe {
            ReadProcessMemory(
                self.handle,
                address as LPCVOID,
                buffer.as_mut_ptr() as LPVOID,
                buffer.len(),
                &mut read,
            )
        };

        if result == 0 {
            let err = io::Error::last_os_error();
            // the caller turns the short count into a partial-transfer error
            if last_error_code(&err) == Some(ERROR_PARTIAL_COPY) {
                return Ok(read);
            }
            return Err(err);
        }

        Ok(read)
    }

    pub fn write(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut written: SIZE_T = 0;
        let result = unsafe {
            WriteProcessMemory(
                self.handle,
                address as LPVOID,
                data.as_ptr() as LPCVOID,
                data.len(),
                &mut written,
            )
        };

        if result == 0 {
            let err = io::Error::last_os_error();
            if last_error_code(&err) == Some(ERROR_PARTIAL_COPY) {
                return Ok(written);
            }
            return Err(err);
        }

        Ok(written)
    }

    pub fn query(&self, address: usize) -> Result<PageInfo, QueryError> {
        let mut mbi = MemoryBasicInformation::default();

        let result = unsafe {
            VirtualQueryEx(
                self.handle,
                address as LPCVOID,
                &mut mbi as *mut MemoryBasicInformation as PMEMORY_BASIC_INFORMATION,
                size_of::<MemoryBasicInformation>() as SIZE_T,
            )
        };

        if result == 0 {
            let err = io::Error::last_os_error();
            return Err(match last_error_code(&err) {
                Some(ERROR_ACCESS_DENIED) => QueryError::AccessDenied { address },
                Some(ERROR_INVALID_PARAMETER) => QueryError::InvalidAddress { address },
                _ => QueryError::Os(err),
            });
        }

        Ok(PageInfo::from(mbi))
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
        let mut previous: DWORD = 0;

        let result = unsafe {
            VirtualProtectEx(
                self.handle,
                address as LPVOID,
                len as SIZE_T,
                protection.bits(),
                &mut previous,
            )
        };

        if result == 0 {
            let err = io::Error::last_os_error();
            return Err(match last_error_code(&err) {
                Some(ERROR_ACCESS_DENIED) => QueryError::AccessDenied { address },
                Some(ERROR_INVALID_ADDRESS) | Some(ERROR_INVALID_PARAMETER) | Some(ERROR_NOACCESS) => {
                    QueryError::InvalidAddress { address }
                }
                _ => QueryError::Os(err),
            });
        }

        Ok(Protection::from_bits_retain(previous))
    }

    pub fn allocate(&self, size: usize, protection: Protection) -> Result<MemoryRegion, QueryError> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                std::ptr::null_mut(),
                size as SIZE_T,
                MEM_COMMIT | MEM_RESERVE,
                protection.bits(),
            )
        };

        if address.is_null() {
            let err = io::Error::last_os_error();
            return Err(match last_error_code(&err) {
                Some(ERROR_ACCESS_DENIED) => QueryError::AccessDenied { address: 0 },
                Some(ERROR_INVALID_PARAMETER) => QueryError::InvalidAddress { address: 0 },
                _ => QueryError::Os(err),
            });
        }

        Ok(MemoryRegion::new(RawPointer::new(address as usize), size))
    }

    /// Releases the whole allocation that starts at `region.low()`.
    pub fn free(&self, region: MemoryRegion) -> Result<(), QueryError> {
        let address = region.low().address();
        if unsafe { VirtualFreeEx(self.handle, address as LPVOID, 0, MEM_RELEASE) } == 0 {
            let err = io::Error::last_os_error();
            return Err(match last_error_code(&err) {
                Some(ERROR_ACCESS_DENIED) => QueryError::AccessDenied { address },
                Some(ERROR_INVALID_ADDRESS) | Some(ERROR_INVALID_PARAMETER) => {
                    QueryError::InvalidAddress { address }
                }
                _ => QueryError::Os(err),
            });
        }

        Ok(())
    }

    pub fn modules(&self) -> Result<Vec<Module>, ProcessError> {
        let mut handles: Vec<HMODULE> = vec![std::ptr::null_mut(); 256];

        loop {
            let capacity = size_of_val(handles.as_slice()) as DWORD;
            let mut needed: DWORD = 0;

            let result = unsafe {
                EnumProcessModules(self.handle, handles.as_mut_ptr(), capacity, &mut needed)
            };
            if result == 0 {
                return Err(ProcessError::Os(io::Error::last_os_error()));
            }

            let count = needed as usize / size_of::<HMODULE>();
            if needed <= capacity {
                handles.truncate(count);
                break;
            }

            handles.resize(count, std::ptr::null_mut());
        }

        let mut modules = Vec::with_capacity(handles.len());

        for module in handles.into_iter().filter(|module| !module.is_null()) {
            let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
            let result = unsafe {
                GetModuleInformation(
                    self.handle,
                    module,
                    &mut info,
                    size_of::<MODULEINFO>() as DWORD,
                )
            };
            if result == 0 {
                continue;
            }

            let mut file_name = [0u16; MAX_PATH];
            let len = unsafe {
                GetModuleFileNameExW(
                    self.handle,
                    module,
                    file_name.as_mut_ptr(),
                    file_name.len() as DWORD,
                )
            };
            if len == 0 {
                continue;
            }

            let path = PathBuf::from(OsString::from_wide(&file_name[..len as usize]));
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            modules.push(Module {
                name,
                path,
                region: MemoryRegion::new(
                    RawPointer::new(info.lpBaseOfDll as *mut c_void as usize),
                    info.SizeOfImage as usize,
                ),
            });
        }

        Ok(modules)
    }
}
