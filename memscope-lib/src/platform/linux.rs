use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};

use libc::{c_void, iovec, pid_t, process_vm_readv, process_vm_writev};
use tracing::warn;

use crate::memory::native::{Context64, ContextFlags};
use crate::memory::protection::{PageState, PageType, ProcessAccess, Protection};
use crate::memory::query::{PageInfo, QueryError};
use crate::memory::region::MemoryRegion;
use crate::pointer::RawPointer;
use crate::process::{Module, ProcessError};

#[cfg(target_pointer_width = "64")]
pub(crate) fn max_user_address() -> usize {
    0x0000_ffff_ffff_ffff
}

#[cfg(not(target_pointer_width = "64"))]
pub(crate) fn max_user_address() -> usize {
    usize::MAX
}

pub(crate) fn thread_context(_tid: u32, _flags: ContextFlags) -> Result<Context64, ProcessError> {
    Err(ProcessError::Unsupported("thread contexts on linux".to_string()))
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

fn prot_flags(protection: Protection) -> libc::c_int {
    let (read, write, execute) = protection.rwx();
    let mut prot = libc::PROT_NONE;
    if read {
        prot |= libc::PROT_READ;
    }
    if write {
        prot |= libc::PROT_WRITE;
    }
    if execute {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn open_error(pid: u32, access: ProcessAccess, err: io::Error) -> ProcessError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ProcessError::AccessDenied { pid, access },
        io::ErrorKind::NotFound => ProcessError::NotFound(pid.to_string()),
        _ => ProcessError::Os(err),
    }
}

/// A pid plus, when reads or writes were requested, an open `/proc/<pid>/mem`.
///
/// Opening the mem file performs the same ptrace access check the kernel
/// applies to `process_vm_readv`, and opening `maps` the one applied to
/// queries, so a refused open is a refused handle.
pub(crate) struct OsHandle {
    pid: u32,
    mem: Option<File>,
}

impl OsHandle {
    pub fn open(pid: u32, access: ProcessAccess) -> Result<Self, ProcessError> {
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));
        if !proc_dir.exists() {
            return Err(ProcessError::NotFound(pid.to_string()));
        }

        if access.intersects(ProcessAccess::QUERY_INFORMATION | ProcessAccess::QUERY_LIMITED_INFORMATION) {
            File::open(proc_dir.join("maps")).map_err(|e| open_error(pid, access, e))?;
        }

        let mem = if access.intersects(ProcessAccess::VM_READ | ProcessAccess::VM_WRITE) {
            let file = OpenOptions::new()
                .read(access.contains(ProcessAccess::VM_READ))
                .write(access.contains(ProcessAccess::VM_WRITE))
                .open(proc_dir.join("mem"))
                .map_err(|e| open_error(pid, access, e))?;
            Some(file)
        } else {
            None
        };

        Ok(Self { pid, mem })
    }

    fn require_self(&self, operation: &str) -> Result<(), QueryError> {
        if self.pid != std::process::id() {
            return Err(QueryError::Unsupported(format!("{operation} of another process")));
        }

        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some(file) = self.mem.take() {
            let fd = file.into_raw_fd();
            if unsafe { libc::close(fd) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }

    fn mem_file(&self, err: io::Error) -> io::Result<&File> {
        self.mem.as_ref().ok_or(err)
    }

    pub fn read(&self, address: usize, buffer: &mut [u8]) -> io::Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let local_iov = iovec {
            iov_base: buffer.as_mut_ptr() as *mut c_void,
            iov_len: buffer.len(),
        };

        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: buffer.len(),
        };

        let result = unsafe { process_vm_readv(self.pid as pid_t, &local_iov, 1, &remote_iov, 1, 0) };
        if result >= 0 {
            return Ok(result as usize);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EPERM) => {
                self.mem_file(err)?.read_at(buffer, address as u64)
            }
            _ => Err(err),
        }
    }

    pub fn write(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let local_iov = iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        };

        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: data.len(),
        };

        let result = unsafe { process_vm_writev(self.pid as pid_t, &local_iov, 1, &remote_iov, 1, 0) };
        if result >= 0 {
            return Ok(result as usize);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EPERM) => {
                self.mem_file(err)?.write_at(data, address as u64)
            }
            _ => Err(err),
        }
    }

    pub fn query(&self, address: usize) -> Result<PageInfo, QueryError> {
        let maps = read_maps(self.pid, address)?;
        Ok(page_info(&maps, address))
    }

    /// The whole address space from a single read of the maps file.
    pub fn regions(&self) -> Result<Vec<PageInfo>, QueryError> {
        let maps = read_maps(self.pid, 0)?;
        Ok(walk(&maps))
    }

    /// `mprotect` only reaches the calling process, so other pids are refused.
    pub fn protect(
        &self,
        address: usize,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, QueryError> {
        self.require_self("changing protection")?;

        let previous = self.query(address)?.protect;

        if !protection.modifiers().is_empty() {
            warn!(
                modifiers = protection.modifiers().bits(),
                "protection modifiers have no mprotect equivalent and are ignored"
            );
        }

        let page = page_size();
        let start = address & !(page - 1);
        let length = address.saturating_add(len) - start;

        if unsafe { libc::mprotect(start as *mut c_void, length, prot_flags(protection)) } != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EACCES) => QueryError::AccessDenied { address },
                Some(libc::ENOMEM) | Some(libc::EINVAL) => QueryError::InvalidAddress { address },
                _ => QueryError::Os(err),
            });
        }

        Ok(previous)
    }

    /// Anonymous private pages from `mmap`, in the calling process only.
    pub fn allocate(&self, size: usize, protection: Protection) -> Result<MemoryRegion, QueryError> {
        self.require_self("allocating memory")?;

        let address = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot_flags(protection),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if address == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EINVAL) => QueryError::InvalidAddress { address: 0 },
                _ => QueryError::Os(err),
            });
        }

        Ok(MemoryRegion::new(RawPointer::new(address as usize), size))
    }

    pub fn free(&self, region: MemoryRegion) -> Result<(), QueryError> {
        self.require_self("freeing memory")?;

        let address = region.low().address();
        if unsafe { libc::munmap(address as *mut c_void, region.size()) } != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EINVAL) => QueryError::InvalidAddress { address },
                _ => QueryError::Os(err),
            });
        }

        Ok(())
    }

    pub fn modules(&self) -> Result<Vec<Module>, ProcessError> {
        let maps = read_maps(self.pid, 0).map_err(|e| match e {
            QueryError::AccessDenied { .. } => ProcessError::AccessDenied {
                pid: self.pid,
                access: ProcessAccess::QUERY_INFORMATION,
            },
            QueryError::Os(e) => ProcessError::Os(e),
            other => ProcessError::Os(io::Error::other(other.to_string())),
        })?;

        Ok(modules(&maps))
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MapEntry {
    start: usize,
    end: usize,
    read: bool,
    write: bool,
    execute: bool,
    inode: u64,
    path: Option<String>,
}

impl MapEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(6, ' ');
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?.as_bytes();
        let _offset = fields.next()?;
        let _device = fields.next()?;
        let inode = fields.next()?.parse().ok()?;
        let path = fields
            .next()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string);

        if perms.len() < 3 {
            return None;
        }

        Some(Self {
            start: usize::from_str_radix(start, 16).ok()?,
            end: usize::from_str_radix(end, 16).ok()?,
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            inode,
            path,
        })
    }

    fn protection(&self) -> Protection {
        // the kernel refuses remote transfers from these
        if let Some(path) = &self.path {
            if path.starts_with("[vvar") || path == "[vsyscall]" {
                return Protection::NO_ACCESS;
            }
        }

        Protection::from_rwx(self.read, self.write, self.execute)
    }

    fn is_file(&self) -> bool {
        self.inode != 0 && self.path.as_deref().is_some_and(|path| path.starts_with('/'))
    }
}

fn read_maps(pid: u32, address: usize) -> Result<Vec<MapEntry>, QueryError> {
    let content = fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => QueryError::AccessDenied { address },
        io::ErrorKind::NotFound => QueryError::Process(ProcessError::NotFound(pid.to_string())),
        _ => QueryError::Os(e),
    })?;

    Ok(content.lines().filter_map(MapEntry::parse).collect())
}

/// Free ranges report no allocation and no access, like `MEM_FREE` pages.
fn free_page(start: usize, end: usize) -> PageInfo {
    PageInfo {
        base_address: RawPointer::new(start),
        allocation_base: RawPointer::null(),
        allocation_protect: Protection::empty(),
        region_size: end - start,
        state: PageState::FREE,
        protect: Protection::NO_ACCESS,
        page_type: PageType::empty(),
    }
}

fn free_end(address: usize) -> usize {
    max_user_address().saturating_add(1).max(address.saturating_add(1))
}

fn mapped_page(entry: &MapEntry, allocation: &MapEntry, image: bool) -> PageInfo {
    let page_type = if !entry.is_file() {
        PageType::PRIVATE
    } else if image {
        PageType::IMAGE
    } else {
        PageType::MAPPED
    };

    PageInfo {
        base_address: RawPointer::new(entry.start),
        allocation_base: RawPointer::new(allocation.start),
        allocation_protect: allocation.protection(),
        region_size: entry.end - entry.start,
        state: PageState::COMMIT,
        protect: entry.protection(),
        page_type,
    }
}

fn page_info(maps: &[MapEntry], address: usize) -> PageInfo {
    let Some(index) = maps
        .iter()
        .position(|entry| entry.start <= address && address < entry.end)
    else {
        let start = maps
            .iter()
            .map(|entry| entry.end)
            .filter(|&end| end <= address)
            .max()
            .unwrap_or(0);
        let end = maps
            .iter()
            .map(|entry| entry.start)
            .filter(|&start| start > address)
            .min()
            .unwrap_or_else(|| free_end(address));

        return free_page(start, end);
    };

    let entry = &maps[index];
    let image = maps
        .iter()
        .any(|other| other.execute && other.inode == entry.inode && other.path == entry.path);

    mapped_page(entry, &maps[allocation_start(maps, index)], image)
}

fn same_file(previous: &MapEntry, current: &MapEntry) -> bool {
    previous.end == current.start && previous.inode == current.inode && previous.path == current.path
}

/// Every mapped and free range from address zero up to the highest user
/// address, in one pass over entries sorted by address.
fn walk(maps: &[MapEntry]) -> Vec<PageInfo> {
    let limit = max_user_address();
    let images: HashSet<(u64, &str)> = maps
        .iter()
        .filter(|entry| entry.execute && entry.is_file())
        .filter_map(|entry| Some((entry.inode, entry.path.as_deref()?)))
        .collect();

    let mut pages = Vec::with_capacity(maps.len() * 2 + 1);
    let mut cursor = 0;
    let mut allocation = 0;

    for (index, entry) in maps.iter().enumerate() {
        if entry.end <= cursor {
            continue;
        }

        if entry.start > cursor {
            pages.push(free_page(cursor, entry.start));
            cursor = entry.start;
            if cursor > limit {
                return pages;
            }
        }

        if !(entry.is_file() && index > 0 && same_file(&maps[index - 1], entry)) {
            allocation = index;
        }

        let image = entry.is_file()
            && entry
                .path
                .as_deref()
                .is_some_and(|path| images.contains(&(entry.inode, path)));

        pages.push(mapped_page(entry, &maps[allocation], image));
        cursor = entry.end;
        if cursor > limit {
            return pages;
        }
    }

    pages.push(free_page(cursor, free_end(cursor)));
    pages
}

/// A file mapping's allocation starts at the first of the contiguous entries
/// backed by the same file; anonymous entries are their own allocation.
fn allocation_start(maps: &[MapEntry], index: usize) -> usize {
    let mut first = index;

    if !maps[index].is_file() {
        return first;
    }

    while first > 0 {
        let previous = &maps[first - 1];
        let current = &maps[first];
        if !same_file(previous, current) {
            break;
        }
        first -= 1;
    }

    first
}

fn modules(maps: &[MapEntry]) -> Vec<Module> {
    let mut modules: Vec<Module> = Vec::new();

    for entry in maps.iter().filter(|entry| entry.is_file()) {
        let Some(path) = entry.path.as_deref() else {
            continue;
        };

        if let Some(module) = modules.iter_mut().find(|module| module.path == Path::new(path)) {
            let low = module.region.low().address().min(entry.start);
            let end = module.region.end().address().max(entry.end);
            module.region = MemoryRegion::new(RawPointer::new(low), end - low);
            continue;
        }

        let path = PathBuf::from(path);
        modules.push(Module {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
            region: MemoryRegion::new(RawPointer::new(entry.start), entry.end - entry.start),
        });
    }

    modules
}
