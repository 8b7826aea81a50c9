//! Flag sets shared with the Windows memory and process APIs.
//!
//! The bit values are the Windows ABI constants and are used verbatim on every
//! platform, so a value read on one host means the same thing on another.

use bitflags::bitflags;

bitflags! {
    /// Rights requested when opening a process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProcessAccess: u32 {
        const TERMINATE = 0x0000_0001;
        const CREATE_THREAD = 0x0000_0002;
        const VM_OPERATION = 0x0000_0008;
        const VM_READ = 0x0000_0010;
        const VM_WRITE = 0x0000_0020;
        const DUP_HANDLE = 0x0000_0040;
        const CREATE_PROCESS = 0x0000_0080;
        const SET_INFORMATION = 0x0000_0200;
        const QUERY_INFORMATION = 0x0000_0400;
        const QUERY_LIMITED_INFORMATION = 0x0000_1000;
        const SYNCHRONIZE = 0x0010_0000;
        const ALL = 0x001F_0FFF;
    }
}

bitflags! {
    /// Page protection, `PAGE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const NO_ACCESS = 0x001;
        const READ_ONLY = 0x002;
        const READ_WRITE = 0x004;
        const WRITE_COPY = 0x008;
        const EXECUTE = 0x010;
        const EXECUTE_READ = 0x020;
        const EXECUTE_READ_WRITE = 0x040;
        const EXECUTE_WRITE_COPY = 0x080;
        const GUARD = 0x100;
        const NO_CACHE = 0x200;
        const WRITE_COMBINE = 0x400;
    }
}

bitflags! {
    /// Page state, `MEM_COMMIT` / `MEM_RESERVE` / `MEM_FREE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageState: u32 {
        const COMMIT = 0x0000_1000;
        const RESERVE = 0x0000_2000;
        const FREE = 0x0001_0000;
    }
}

bitflags! {
    /// Page type, `MEM_IMAGE` / `MEM_MAPPED` / `MEM_PRIVATE`. Empty for free pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageType: u32 {
        const IMAGE = 0x0100_0000;
        const MAPPED = 0x0004_0000;
        const PRIVATE = 0x0002_0000;
    }
}

impl Protection {
    const MODIFIERS: Protection = Protection::GUARD
        .union(Protection::NO_CACHE)
        .union(Protection::WRITE_COMBINE);

    const READABLE: Protection = Protection::READ_ONLY
        .union(Protection::READ_WRITE)
        .union(Protection::WRITE_COPY)
        .union(Protection::EXECUTE_READ)
        .union(Protection::EXECUTE_READ_WRITE)
        .union(Protection::EXECUTE_WRITE_COPY);

    const WRITABLE: Protection = Protection::READ_WRITE
        .union(Protection::WRITE_COPY)
        .union(Protection::EXECUTE_READ_WRITE)
        .union(Protection::EXECUTE_WRITE_COPY);

    const EXECUTABLE: Protection = Protection::EXECUTE
        .union(Protection::EXECUTE_READ)
        .union(Protection::EXECUTE_READ_WRITE)
        .union(Protection::EXECUTE_WRITE_COPY);

    /// Closest protection constant for a POSIX-style permission triple.
    /// Write-only pages have no constant of their own and map to `READ_WRITE`.
    pub const fn from_rwx(read: bool, write: bool, execute: bool) -> Self {
        match (read, write, execute) {
            (false, false, false) => Protection::NO_ACCESS,
            (_, false, false) => Protection::READ_ONLY,
            (_, true, false) => Protection::READ_WRITE,
            (false, false, true) => Protection::EXECUTE,
            (_, false, true) => Protection::EXECUTE_READ,
            (_, true, true) => Protection::EXECUTE_READ_WRITE,
        }
    }

    /// The `(read, write, execute)` triple of the base protection, ignoring
    /// the `GUARD`, `NO_CACHE` and `WRITE_COMBINE` modifiers.
    pub fn rwx(self) -> (bool, bool, bool) {
        (
            self.intersects(Self::READABLE),
            self.intersects(Self::WRITABLE),
            self.intersects(Self::EXECUTABLE),
        )
    }

    pub fn modifiers(self) -> Protection {
        self & Self::MODIFIERS
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE) && !self.intersects(Protection::GUARD | Protection::NO_ACCESS)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE) && !self.intersects(Protection::GUARD | Protection::NO_ACCESS)
    }

    pub fn is_executable(self) -> bool {
        self.intersects(Self::EXECUTABLE)
    }

    /// `r-x`-style rendering of the base protection, with `g` appended for guard pages.
    pub fn to_rwx_string(self) -> String {
        let (read, write, execute) = self.rwx();
        let mut text = String::with_capacity(4);
        text.push(if read { 'r' } else { '-' });
        text.push(if write { 'w' } else { '-' });
        text.push(if execute { 'x' } else { '-' });
        if self.contains(Protection::GUARD) {
            text.push('g');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_match_the_windows_abi() {
        assert_eq!(ProcessAccess::ALL.bits(), 0x1F0FFF);
        assert_eq!(ProcessAccess::VM_READ.bits(), 0x10);
        assert_eq!(ProcessAccess::SYNCHRONIZE.bits(), 0x100000);
        assert_eq!(Protection::EXECUTE_READ_WRITE.bits(), 0x40);
        assert_eq!(Protection::WRITE_COMBINE.bits(), 0x400);
        assert_eq!(PageState::FREE.bits(), 0x10000);
        assert_eq!(PageType::IMAGE.bits(), 0x1000000);
    }

    #[test]
    fn rwx_round_trips_through_constants() {
        for read in [false, true] {
            for execute in [false, true] {
                let protection = Protection::from_rwx(read, true, execute);
                assert_eq!(protection.rwx(), (true, true, execute));
            }
            let protection = Protection::from_rwx(read, false, false);
            assert_eq!(protection.rwx(), (read, false, false));
        }
        assert_eq!(Protection::from_rwx(false, false, true).rwx(), (false, false, true));
    }

    #[test]
    fn guard_pages_are_not_readable() {
        assert!(Protection::READ_WRITE.is_readable());
        assert!(!(Protection::READ_WRITE | Protection::GUARD).is_readable());
        assert!(!Protection::NO_ACCESS.is_readable());
        assert!(!Protection::EXECUTE.is_readable());
        assert_eq!(
            (Protection::READ_ONLY | Protection::NO_CACHE).modifiers(),
            Protection::NO_CACHE
        );
    }

    #[test]
    fn unknown_bits_survive() {
        let raw = 0x4000_0020;
        assert_eq!(Protection::from_bits_retain(raw).bits(), raw);
    }

    #[test]
    fn renders_permission_strings() {
        assert_eq!(Protection::EXECUTE_READ.to_rwx_string(), "r-x");
        assert_eq!((Protection::READ_WRITE | Protection::GUARD).to_rwx_string(), "rw-g");
        assert_eq!(Protection::NO_ACCESS.to_rwx_string(), "---");
    }
}
