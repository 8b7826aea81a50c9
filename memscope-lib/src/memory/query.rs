use thiserror::Error;
use tracing::trace;

use crate::memory::protection::{PageState, PageType, ProcessAccess, Protection};
use crate::memory::region::MemoryRegion;
use crate::pointer::RawPointer;
use crate::process::{ProcessError, ProcessHandle};

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("access denied at {address:#x}")]
    AccessDenied { address: usize },
    #[error("invalid address {address:#x}")]
    InvalidAddress { address: usize },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}

/// Attributes of a run of pages that share protection, state and type.
///
/// A snapshot taken at query time; it is never cached or refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub base_address: RawPointer<u8>,
    pub allocation_base: RawPointer<u8>,
    pub allocation_protect: Protection,
    pub region_size: usize,
    pub state: PageState,
    pub protect: Protection,
    pub page_type: PageType,
}

impl PageInfo {
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base_address, self.region_size)
    }

    pub fn is_committed(&self) -> bool {
        self.state.contains(PageState::COMMIT)
    }

    pub fn is_free(&self) -> bool {
        self.state.contains(PageState::FREE)
    }

    pub fn is_readable(&self) -> bool {
        self.is_committed() && self.protect.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.is_committed() && self.protect.is_writable()
    }
}

/// Queries the page range holding `address` in the calling process.
pub fn query<T>(address: RawPointer<T>) -> Result<PageInfo, QueryError> {
    ProcessHandle::current(ProcessAccess::QUERY_INFORMATION)?.query(address)
}

/// Changes the protection of `[address, address + len)` in the calling
/// process and returns the protection that was in effect before. Nothing is
/// restored automatically.
pub fn set_protection<T>(
    address: RawPointer<T>,
    len: usize,
    protection: Protection,
) -> Result<Protection, QueryError> {
    ProcessHandle::current(ProcessAccess::VM_OPERATION | ProcessAccess::QUERY_INFORMATION)?
        .set_protection(address, len, protection)
}

enum Walk {
    Pending,
    Pages(std::vec::IntoIter<PageInfo>),
    Done,
}

/// Walks a process's address space one [`PageInfo`] at a time, from address
/// zero up to the highest user-mode address.
///
/// The address space is read on the first call to `next`; a failure there is
/// yielded once and ends the walk.
pub struct Regions<'a> {
    handle: &'a ProcessHandle,
    walk: Walk,
}

impl<'a> Regions<'a> {
    pub(crate) fn new(handle: &'a ProcessHandle) -> Self {
        Self {
            handle,
            walk: Walk::Pending,
        }
    }
}

impl Iterator for Regions<'_> {
    type Item = Result<PageInfo, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.walk, Walk::Pending) {
            match self.handle.region_snapshot() {
                Ok(pages) => self.walk = Walk::Pages(pages.into_iter()),
                Err(err) => {
                    self.walk = Walk::Done;
                    return Some(Err(err));
                }
            }
        }

        let Walk::Pages(pages) = &mut self.walk else {
            return None;
        };
        let info = pages.next()?;

        trace!(
            base = %info.base_address,
            size = info.region_size,
            state = info.state.bits(),
            "region"
        );

        Some(Ok(info))
    }
}
