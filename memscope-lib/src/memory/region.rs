use std::fmt;

use crate::memory::query::{self, PageInfo, QueryError};
use crate::pointer::RawPointer;

/// A contiguous address range `[low, low + size)`.
///
/// Every constructor normalizes to this half-open form. [`from_bounds`]
/// takes an inclusive upper bound, so a region built from `(lo, hi)` contains
/// both `lo` and `hi` and nothing outside them.
///
/// [`from_bounds`]: MemoryRegion::from_bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    low: RawPointer<u8>,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(low: RawPointer<u8>, size: usize) -> Self {
        Self { low, size }
    }

    /// Region spanning `low..=high`. `None` if `high < low`, or if the range
    /// covers the whole address space and its size does not fit in `usize`.
    pub fn from_bounds(low: RawPointer<u8>, high: RawPointer<u8>) -> Option<Self> {
        if high < low {
            return None;
        }
        let size = (high.address() - low.address()).checked_add(1)?;
        Some(Self::new(low, size))
    }

    /// Region of the calling thread's stack: from the allocation base of the
    /// page range holding a local variable up to the end of that range.
    pub fn current_stack() -> Result<Self, QueryError> {
        let marker = 0u8;
        let info = query::query(RawPointer::address_of(&marker))?;
        let below = info
            .base_address
            .address()
            .saturating_sub(info.allocation_base.address());
        Ok(Self::new(info.allocation_base, below + info.region_size))
    }

    pub const fn low(&self) -> RawPointer<u8> {
        self.low
    }

    /// Last address inside the region. Equal to `low` for an empty region.
    pub const fn high(&self) -> RawPointer<u8> {
        self.low.byte_add(self.size.saturating_sub(1))
    }

    /// First address past the region.
    pub const fn end(&self) -> RawPointer<u8> {
        self.low.byte_add(self.size)
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains<T>(&self, pointer: RawPointer<T>) -> bool {
        self.offset_of(pointer).is_some()
    }

    /// Offset of `pointer` from `low`, if it lies inside the region.
    pub fn offset_of<T>(&self, pointer: RawPointer<T>) -> Option<usize> {
        let offset = pointer.address().wrapping_sub(self.low.address());
        (offset < self.size).then_some(offset)
    }

    pub fn contains_region(&self, other: &MemoryRegion) -> bool {
        if other.is_empty() {
            return self.contains(other.low);
        }
        self.contains(other.low) && self.contains(other.high())
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        !self.is_empty() && !other.is_empty() && (self.contains(other.low) || other.contains(self.low))
    }
}

impl From<PageInfo> for MemoryRegion {
    fn from(info: PageInfo) -> Self {
        info.region()
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} ({:#x} bytes)", self.low, self.end(), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(address: usize) -> RawPointer<u8> {
        RawPointer::new(address)
    }

    #[test]
    fn bounds_are_inclusive_on_both_ends() {
        let region = MemoryRegion::from_bounds(ptr(0x1000), ptr(0x1FFF)).unwrap();
        assert_eq!(region.size(), 0x1000);
        assert_eq!(region.high(), ptr(0x1FFF));
        assert!(region.contains(ptr(0x1000)));
        assert!(region.contains(ptr(0x1FFF)));
        assert!(!region.contains(ptr(0x0FFF)));
        assert!(!region.contains(ptr(0x2000)));
    }

    #[test]
    fn base_and_size_exclude_the_end() {
        let region = MemoryRegion::new(ptr(0x400000), 0x100);
        assert!(region.contains(ptr(0x400000)));
        assert!(region.contains(ptr(0x4000FF)));
        assert!(!region.contains(ptr(0x400100)));
        assert!(!region.contains(ptr(0x3FFFFF)));
        assert_eq!(region.end(), ptr(0x400100));
    }

    #[test]
    fn both_constructors_agree() {
        let a = MemoryRegion::new(ptr(0x10), 0x20);
        let b = MemoryRegion::from_bounds(a.low(), a.high()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(MemoryRegion::from_bounds(ptr(2), ptr(1)).is_none());
        assert!(MemoryRegion::from_bounds(ptr(0), ptr(usize::MAX)).is_none());
        assert_eq!(MemoryRegion::from_bounds(ptr(5), ptr(5)).unwrap().size(), 1);
    }

    #[test]
    fn empty_regions_contain_nothing() {
        let region = MemoryRegion::new(ptr(0x1000), 0);
        assert!(region.is_empty());
        assert!(!region.contains(ptr(0x1000)));
    }

    #[test]
    fn regions_at_the_top_of_the_address_space() {
        let region = MemoryRegion::from_bounds(ptr(usize::MAX - 1), ptr(usize::MAX)).unwrap();
        assert!(region.contains(ptr(usize::MAX)));
        assert!(!region.contains(ptr(0)));
    }

    #[test]
    fn offsets_and_overlap() {
        let outer = MemoryRegion::new(ptr(0x1000), 0x1000);
        let inner = MemoryRegion::new(ptr(0x1800), 0x800);
        let beside = MemoryRegion::new(ptr(0x2000), 0x10);

        assert_eq!(outer.offset_of(ptr(0x1800)), Some(0x800));
        assert_eq!(outer.offset_of(ptr(0x2000)), None);
        assert!(outer.contains_region(&inner));
        assert!(!inner.contains_region(&outer));
        assert!(outer.overlaps(&inner));
        assert!(!outer.overlaps(&beside));
    }
}
