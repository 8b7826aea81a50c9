#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{thread_context, OsHandle};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use self::linux::{thread_context, OsHandle};

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub(crate) use self::macos::{thread_context, OsHandle};

#[cfg(not(target_os = "linux"))]
use crate::memory::query::{PageInfo, QueryError};

/// Walks the address space up to `limit` one query at a time, for backends
/// where a query is a single system call.
#[cfg(not(target_os = "linux"))]
fn walk_by_query<F>(limit: usize, mut query: F) -> Result<Vec<PageInfo>, QueryError>
where
    F: FnMut(usize) -> Result<PageInfo, QueryError>,
{
    let mut pages = Vec::new();
    let mut next = Some(0usize);

    while let Some(address) = next.filter(|&address| address <= limit) {
        let info = query(address)?;
        next = info
            .base_address
            .address()
            .checked_add(info.region_size)
            .filter(|&next| next > address);
        pages.push(info);
    }

    Ok(pages)
}
