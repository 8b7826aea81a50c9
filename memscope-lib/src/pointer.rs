use std::any::type_name;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;
use std::str::FromStr;

use thiserror::Error;

use crate::value::{Value, ValueKind};

/// A typed machine address.
///
/// `RawPointer` is a coordinate, not a reference: it owns nothing, borrows
/// nothing, and never checks what lives at the address. All arithmetic wraps.
///
/// Byte-scale arithmetic ([`byte_add`](Self::byte_add),
/// [`byte_sub`](Self::byte_sub)) ignores the element type, element-scale
/// arithmetic ([`increment`](Self::increment), [`decrement`](Self::decrement),
/// [`offset`](Self::offset)) multiplies by `size_of::<T>()`.
///
/// Every method that touches the pointee is `unsafe` and carries the contract
/// of [`std::ptr::read`] / [`std::ptr::write`]: the address must be mapped,
/// readable or writable as needed, and aligned for `T` unless the `_unaligned`
/// variant is used. Nothing here validates that.
#[repr(transparent)]
pub struct RawPointer<T> {
    address: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RawPointer<T> {
    pub const NULL: Self = Self::new(0);

    pub const fn new(address: usize) -> Self {
        Self {
            address,
            _marker: PhantomData,
        }
    }

    pub const fn null() -> Self {
        Self::NULL
    }

    /// Address of a live value.
    pub fn address_of(value: &T) -> Self {
        Self::new(value as *const T as usize)
    }

    pub const fn address(self) -> usize {
        self.address
    }

    pub const fn is_null(self) -> bool {
        self.address == 0
    }

    /// Size in bytes of one `T`.
    pub const fn element_size(self) -> usize {
        size_of::<T>()
    }

    pub const fn byte_add(self, bytes: usize) -> Self {
        Self::new(self.address.wrapping_add(bytes))
    }

    pub const fn byte_sub(self, bytes: usize) -> Self {
        Self::new(self.address.wrapping_sub(bytes))
    }

    pub const fn byte_offset(self, bytes: isize) -> Self {
        Self::new(self.address.wrapping_add_signed(bytes))
    }

    pub const fn increment(self, count: usize) -> Self {
        self.byte_add(count.wrapping_mul(size_of::<T>()))
    }

    pub const fn decrement(self, count: usize) -> Self {
        self.byte_sub(count.wrapping_mul(size_of::<T>()))
    }

    pub const fn offset(self, count: isize) -> Self {
        self.byte_offset(count.wrapping_mul(size_of::<T>() as isize))
    }

    pub const fn next(self) -> Self {
        self.increment(1)
    }

    pub const fn prev(self) -> Self {
        self.decrement(1)
    }

    /// Signed distance in bytes from `origin` to `self`.
    pub const fn distance(self, origin: Self) -> isize {
        self.address.wrapping_sub(origin.address) as isize
    }

    /// Same address, different element type. The pointee is not touched.
    pub const fn cast<U>(self) -> RawPointer<U> {
        RawPointer::new(self.address)
    }

    pub fn as_ptr(self) -> *const T {
        self.address as *const T
    }

    pub fn as_mut_ptr(self) -> *mut T {
        self.address as *mut T
    }

    /// # Safety
    ///
    /// `self + element_offset` must be valid for reads and aligned for `T`.
    pub unsafe fn read(self, element_offset: usize) -> T {
        ptr::read(self.increment(element_offset).as_ptr())
    }

    /// # Safety
    ///
    /// `self + element_offset` must be valid for reads of `size_of::<T>()` bytes.
    pub unsafe fn read_unaligned(self, element_offset: usize) -> T {
        ptr::read_unaligned(self.increment(element_offset).as_ptr())
    }

    /// Overwrites the element without dropping the previous value.
    ///
    /// # Safety
    ///
    /// `self + element_offset` must be valid for writes and aligned for `T`.
    pub unsafe fn write(self, value: T, element_offset: usize) {
        ptr::write(self.increment(element_offset).as_mut_ptr(), value)
    }

    /// # Safety
    ///
    /// `self + element_offset` must be valid for writes of `size_of::<T>()` bytes.
    pub unsafe fn write_unaligned(self, value: T, element_offset: usize) {
        ptr::write_unaligned(self.increment(element_offset).as_mut_ptr(), value)
    }

    /// # Safety
    ///
    /// The pointee must be a valid `T` that outlives `'a` and is not mutated
    /// through another path while the reference is alive.
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        &*self.as_ptr()
    }

    /// # Safety
    ///
    /// As [`as_ref`](Self::as_ref), and no other reference to the pointee may
    /// exist while the returned one is alive.
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        &mut *self.as_mut_ptr()
    }

    /// Copies `count` consecutive elements starting at element `start`.
    ///
    /// # Safety
    ///
    /// Every element in the range must be readable and aligned for `T`.
    pub unsafe fn copy_out(self, start: usize, count: usize) -> Vec<T>
    where
        T: Copy,
    {
        let first = self.increment(start);
        (0..count).map(|i| first.read(i)).collect()
    }

    /// Writes `values` to consecutive elements starting at `self`.
    ///
    /// # Safety
    ///
    /// The destination range must be writable, aligned for `T`, and must not
    /// overlap `values`.
    pub unsafe fn write_all(self, values: &[T])
    where
        T: Copy,
    {
        if values.is_empty() {
            return;
        }
        ptr::copy_nonoverlapping(values.as_ptr(), self.as_mut_ptr(), values.len());
    }

    /// Zeroes `count` elements.
    ///
    /// # Safety
    ///
    /// The range must be writable, and all-zero bytes must be a valid `T`.
    pub unsafe fn clear(self, count: usize) {
        if count == 0 {
            return;
        }
        ptr::write_bytes(self.as_mut_ptr(), 0, count);
    }

    /// Reads a native-width address stored at pointer-sized slot `element_offset`.
    ///
    /// # Safety
    ///
    /// The slot must be readable and aligned for `usize`.
    pub unsafe fn read_pointer<U>(self, element_offset: usize) -> RawPointer<U> {
        RawPointer::new(self.cast::<usize>().read(element_offset))
    }

    /// # Safety
    ///
    /// The slot must be writable and aligned for `usize`.
    pub unsafe fn write_pointer<U>(self, pointer: RawPointer<U>, element_offset: usize) {
        self.cast::<usize>().write(pointer.address(), element_offset)
    }

    /// Reads a value whose type is only known at runtime. `element_offset` is
    /// counted in units of `kind`, as if the pointer had been cast to it first.
    ///
    /// # Safety
    ///
    /// The `kind.size()` bytes at the target must be readable. Alignment is
    /// not required.
    pub unsafe fn read_any(self, kind: ValueKind, element_offset: usize) -> Value {
        let size = kind.size();
        let bytes = self
            .cast::<u8>()
            .byte_add(element_offset.wrapping_mul(size))
            .copy_out(0, size);
        match Value::from_ne_bytes(kind, &bytes) {
            Some(value) => value,
            None => unreachable!("copied exactly {size} bytes for {kind}"),
        }
    }

    /// Writes a value whose type is only known at runtime. `element_offset` is
    /// counted in units of `value.kind()`.
    ///
    /// # Safety
    ///
    /// The `value.kind().size()` bytes at the target must be writable.
    pub unsafe fn write_any(self, value: Value, element_offset: usize) {
        let bytes = value.to_ne_bytes();
        self.cast::<u8>()
            .byte_add(element_offset.wrapping_mul(bytes.len()))
            .write_all(&bytes)
    }
}

impl<T> Clone for RawPointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawPointer<T> {}

impl<T> Default for RawPointer<T> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<T> PartialEq for RawPointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for RawPointer<T> {}

impl<T> PartialOrd for RawPointer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RawPointer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl<T> Hash for RawPointer<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state)
    }
}

impl<T> From<usize> for RawPointer<T> {
    fn from(address: usize) -> Self {
        Self::new(address)
    }
}

impl<T> From<*const T> for RawPointer<T> {
    fn from(ptr: *const T) -> Self {
        Self::new(ptr as usize)
    }
}

impl<T> From<*mut T> for RawPointer<T> {
    fn from(ptr: *mut T) -> Self {
        Self::new(ptr as usize)
    }
}

impl<T> From<RawPointer<T>> for usize {
    fn from(ptr: RawPointer<T>) -> Self {
        ptr.address
    }
}

impl<T> fmt::Debug for RawPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPointer<{}>({:#X})", type_name::<T>(), self.address)
    }
}

impl<T> fmt::Display for RawPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.address)
    }
}

impl<T> fmt::UpperHex for RawPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.address, f)
    }
}

impl<T> fmt::LowerHex for RawPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.address, f)
    }
}

impl<T> fmt::Pointer for RawPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.as_ptr(), f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid address: {0:?}")]
pub struct ParseAddressError(pub String);

/// Accepts `0x`-prefixed hex or plain decimal.
impl<T> FromStr for RawPointer<T> {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let parsed = match text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
        {
            Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
            None => text.replace('_', "").parse::<usize>(),
        };

        parsed
            .map(Self::new)
            .map_err(|_| ParseAddressError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_arithmetic_round_trips() {
        for address in [0usize, 1, 0x1000, usize::MAX - 3, usize::MAX] {
            let p = RawPointer::<u64>::new(address);
            for n in [0usize, 1, 7, 0x10000, usize::MAX] {
                assert_eq!(p.byte_add(n).byte_sub(n), p);
            }
        }
    }

    #[test]
    fn element_arithmetic_scales_by_size() {
        let p = RawPointer::<u32>::new(0x1000);
        assert_eq!(p.increment(3).address(), 0x100C);
        assert_eq!(p.decrement(2).address(), 0x0FF8);
        assert_eq!(p.next().address(), 0x1004);
        assert_eq!(p.prev().address(), 0x0FFC);
        assert_eq!(p.offset(-4).address(), 0x0FF0);
        assert_eq!(p.cast::<u8>().increment(3).address(), 0x1003);
    }

    #[test]
    fn byte_arithmetic_ignores_element_type() {
        let p = RawPointer::<u64>::new(0x2000);
        assert_eq!(p.byte_add(1).address(), 0x2001);
        assert_eq!(p.byte_offset(-1).address(), 0x1FFF);
    }

    #[test]
    fn null_matches_zero_address() {
        assert!(RawPointer::<u8>::null().is_null());
        assert!(RawPointer::<u8>::default().is_null());
        assert!(!RawPointer::<u8>::new(1).is_null());
        for address in [0usize, 1, 0xDEAD] {
            let p = RawPointer::<i16>::new(address);
            assert_eq!(p.is_null(), p.address() == 0);
        }
    }

    #[test]
    fn comparisons_follow_addresses() {
        let lo = RawPointer::<u8>::new(0x10);
        let hi = RawPointer::<u8>::new(0x20);
        assert!(lo < hi);
        assert!(lo <= hi);
        assert!(hi > lo);
        assert!(hi >= hi);
        assert_ne!(lo, hi);
        assert_eq!(hi.distance(lo), 0x10);
        assert_eq!(lo.distance(hi), -0x10);
    }

    #[test]
    fn reads_and_writes_local_memory() {
        let mut values = [1u32, 2, 3, 4];
        let p = RawPointer::from(values.as_mut_ptr());

        unsafe {
            assert_eq!(p.read(0), 1);
            assert_eq!(p.read(3), 4);
            p.write(40, 3);
            assert_eq!(p.copy_out(1, 3), vec![2, 3, 40]);
            p.write_all(&[9, 8]);
            p.clear(1);
        }

        assert_eq!(values, [0, 8, 3, 40]);
    }

    #[test]
    fn cast_reinterprets_without_conversion() {
        let value = 0x0403_0201u32;
        let p = RawPointer::address_of(&value).cast::<u8>();
        let bytes = unsafe { p.copy_out(0, 4) };
        assert_eq!(bytes, value.to_ne_bytes());
    }

    #[test]
    fn reads_pointers_stored_in_memory() {
        let target = 7u16;
        let mut slot = RawPointer::address_of(&target).address();
        let p = RawPointer::address_of(&slot);

        let inner: RawPointer<u16> = unsafe { p.read_pointer(0) };
        assert_eq!(unsafe { inner.read(0) }, 7);

        let other = 9u16;
        unsafe { RawPointer::from(&mut slot as *mut usize).write_pointer(RawPointer::address_of(&other), 0) };
        assert_eq!(slot, RawPointer::address_of(&other).address());
    }

    #[test]
    fn dispatches_on_runtime_kind() {
        let mut buffer = [0u8; 16];
        let p = RawPointer::from(buffer.as_mut_ptr());

        unsafe {
            p.write_any(Value::U16(0xBEEF), 1);
            p.write_any(Value::F32(1.5), 2);
            assert_eq!(p.read_any(ValueKind::U16, 1), Value::U16(0xBEEF));
            assert_eq!(p.read_any(ValueKind::F32, 2), Value::F32(1.5));
        }

        assert_eq!(&buffer[2..4], &0xBEEFu16.to_ne_bytes());
        assert_eq!(&buffer[8..12], &1.5f32.to_ne_bytes());
    }

    #[test]
    fn formats_as_hex() {
        let p = RawPointer::<u8>::new(0xABCDEF);
        assert_eq!(p.to_string(), "0xABCDEF");
        assert_eq!(format!("{p:x}"), "abcdef");
        assert!(format!("{p:?}").contains("u8"));
    }

    #[test]
    fn parses_hex_and_decimal() {
        assert_eq!("0x1000".parse::<RawPointer<u8>>().unwrap().address(), 0x1000);
        assert_eq!("0X7fff_0000".parse::<RawPointer<u8>>().unwrap().address(), 0x7fff_0000);
        assert_eq!("4096".parse::<RawPointer<u8>>().unwrap().address(), 4096);
        assert!("0xZZ".parse::<RawPointer<u8>>().is_err());
        assert!("".parse::<RawPointer<u8>>().is_err());
    }
}
