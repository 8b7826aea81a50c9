use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;

use sysinfo::{Pid, Process, ProcessExt, ProcessRefreshKind, RefreshKind, System, SystemExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::memory::io::ProcessMemory;
use crate::memory::native::{Context64, ContextFlags};
use crate::memory::protection::{ProcessAccess, Protection};
use crate::memory::query::{PageInfo, QueryError, Regions};
use crate::memory::region::MemoryRegion;
use crate::platform::{self, OsHandle};
use crate::pointer::RawPointer;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process not found with criteria {0}")]
    NotFound(String),
    #[error("access {access:?} denied for process {pid}")]
    AccessDenied { pid: u32, access: ProcessAccess },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("os error: {0}")]
    Os(#[from] io::Error),
}

/// An image mapped into a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub path: PathBuf,
    pub region: MemoryRegion,
}

/// An open capability on another process's address space, limited to the
/// rights it was opened with.
///
/// Close it with [`close`](Self::close) to observe failures; dropping the
/// handle closes it too and logs any failure. The handle can move between
/// threads but is not `Sync`: concurrent use needs external locking or a
/// second handle.
pub struct ProcessHandle {
    pid: u32,
    access: ProcessAccess,
    inner: OsHandle,
    _not_sync: PhantomData<Cell<()>>,
}

impl ProcessHandle {
    pub fn open(pid: u32, access: ProcessAccess) -> Result<Self, ProcessError> {
        let inner = OsHandle::open(pid, access)?;
        debug!(pid, access = access.bits(), "opened process handle");

        Ok(Self {
            pid,
            access,
            inner,
            _not_sync: PhantomData,
        })
    }

    /// Opens the calling process.
    pub fn current(access: ProcessAccess) -> Result<Self, ProcessError> {
        Self::open(std::process::id(), access)
    }

    /// Opens the first process whose name contains `name`.
    pub fn open_by_name(name: &str, access: ProcessAccess) -> Result<Self, ProcessError> {
        Self::open(find_process_id(name)?, access)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn access(&self) -> ProcessAccess {
        self.access
    }

    /// Releases the OS capability and reports whether that succeeded.
    pub fn close(mut self) -> Result<(), ProcessError> {
        debug!(pid = self.pid, "closing process handle");
        self.inner.close().map_err(ProcessError::Os)
    }

    fn allows(&self, rights: ProcessAccess) -> bool {
        self.access.intersects(rights)
    }

    fn can_query(&self) -> bool {
        self.allows(ProcessAccess::QUERY_INFORMATION | ProcessAccess::QUERY_LIMITED_INFORMATION)
    }

    pub fn query<T>(&self, address: RawPointer<T>) -> Result<PageInfo, QueryError> {
        let address = address.address();
        if !self.can_query() {
            return Err(QueryError::AccessDenied { address });
        }

        self.inner.query(address)
    }

    /// Changes the protection of `[address, address + len)` and returns the
    /// protection that was in effect before. Nothing is restored automatically.
    pub fn set_protection<T>(
        &self,
        address: RawPointer<T>,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, QueryError> {
        let address = address.address();
        if !self.allows(ProcessAccess::VM_OPERATION) {
            return Err(QueryError::AccessDenied { address });
        }

        let previous = self.inner.protect(address, len, protection)?;
        debug!(
            pid = self.pid,
            address,
            len,
            from = previous.bits(),
            to = protection.bits(),
            "changed protection"
        );

        Ok(previous)
    }

    /// Commits `size` bytes of fresh memory in the process. On Linux only the
    /// calling process can be targeted.
    pub fn allocate(&self, size: usize, protection: Protection) -> Result<MemoryRegion, QueryError> {
        if !self.allows(ProcessAccess::VM_OPERATION) {
            return Err(QueryError::AccessDenied { address: 0 });
        }

        let region = self.inner.allocate(size, protection)?;
        debug!(pid = self.pid, %region, protection = protection.bits(), "allocated memory");

        Ok(region)
    }

    /// Releases a region returned by [`allocate`](Self::allocate).
    pub fn free(&self, region: MemoryRegion) -> Result<(), QueryError> {
        if !self.allows(ProcessAccess::VM_OPERATION) {
            return Err(QueryError::AccessDenied {
                address: region.low().address(),
            });
        }

        self.inner.free(region)?;
        debug!(pid = self.pid, %region, "freed memory");

        Ok(())
    }

    /// Every page range of the process, lowest address first.
    pub fn regions(&self) -> Regions<'_> {
        Regions::new(self)
    }

    pub(crate) fn region_snapshot(&self) -> Result<Vec<PageInfo>, QueryError> {
        if !self.can_query() {
            return Err(QueryError::AccessDenied { address: 0 });
        }

        self.inner.regions()
    }

    pub fn modules(&self) -> Result<Vec<Module>, ProcessError> {
        if !self.can_query() {
            return Err(ProcessError::AccessDenied {
                pid: self.pid,
                access: ProcessAccess::QUERY_INFORMATION,
            });
        }

        self.inner.modules()
    }

    /// First module whose file name matches `name`, ignoring ASCII case.
    pub fn find_module(&self, name: &str) -> Result<Module, ProcessError> {
        self.modules()?
            .into_iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))
    }
}

impl ProcessMemory for ProcessHandle {
    fn read_raw(&self, address: usize, buffer: &mut [u8]) -> io::Result<usize> {
        if !self.allows(ProcessAccess::VM_READ) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }

        self.inner.read(address, buffer)
    }

    fn write_raw(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        if !self.allows(ProcessAccess::VM_WRITE) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }

        self.inner.write(address, data)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Err(err) = self.inner.close() {
            warn!(pid = self.pid, error = %err, "failed to close process handle");
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("access", &self.access)
            .finish()
    }
}

/// Suspends thread `tid` of any process, captures the register groups in
/// `flags` and resumes it. Only available on x86_64 Windows.
pub fn thread_context(tid: u32, flags: ContextFlags) -> Result<Context64, ProcessError> {
    platform::thread_context(tid, flags)
}

fn process_system() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

/// Pid of the first running process whose name contains `name`.
pub fn find_process_id(name: &str) -> Result<u32, ProcessError> {
    let sys = process_system();

    let process: Option<&Process> = sys.processes_by_name(name).take(1).next();
    process
        .map(|process| usize::from(process.pid()) as u32)
        .ok_or_else(|| ProcessError::NotFound(name.to_string()))
}

pub fn retrieve_process_exe(pid: u32) -> Result<PathBuf, ProcessError> {
    let sys = process_system();

    let process = sys
        .process(Pid::from(pid as usize))
        .ok_or_else(|| ProcessError::NotFound(pid.to_string()))?;

    Ok(process.exe().to_owned())
}

pub fn retrieve_process_name(pid: u32) -> Result<String, ProcessError> {
    let sys = process_system();

    sys.process(Pid::from(pid as usize))
        .map(|process| process.name().to_string())
        .ok_or_else(|| ProcessError::NotFound(pid.to_string()))
}
