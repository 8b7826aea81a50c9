use std::mem::{offset_of, size_of};

use bitflags::bitflags;

use crate::memory::protection::{PageState, PageType, Protection};
use crate::memory::query::PageInfo;
use crate::pointer::RawPointer;

/// `MEMORY_BASIC_INFORMATION`, laid out exactly as the Windows SDK declares it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBasicInformation {
    pub base_address: usize,
    pub allocation_base: usize,
    pub allocation_protect: u32,
    #[cfg(target_pointer_width = "64")]
    pub partition_id: u16,
    pub region_size: usize,
    pub state: u32,
    pub protect: u32,
    pub type_: u32,
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(size_of::<MemoryBasicInformation>() == 48);
    assert!(offset_of!(MemoryBasicInformation, allocation_base) == 8);
    assert!(offset_of!(MemoryBasicInformation, allocation_protect) == 16);
    assert!(offset_of!(MemoryBasicInformation, partition_id) == 20);
    assert!(offset_of!(MemoryBasicInformation, region_size) == 24);
    assert!(offset_of!(MemoryBasicInformation, state) == 32);
    assert!(offset_of!(MemoryBasicInformation, protect) == 36);
    assert!(offset_of!(MemoryBasicInformation, type_) == 40);
};

#[cfg(target_pointer_width = "32")]
const _: () = {
    assert!(size_of::<MemoryBasicInformation>() == 28);
    assert!(offset_of!(MemoryBasicInformation, allocation_protect) == 8);
    assert!(offset_of!(MemoryBasicInformation, region_size) == 12);
    assert!(offset_of!(MemoryBasicInformation, state) == 16);
    assert!(offset_of!(MemoryBasicInformation, protect) == 20);
    assert!(offset_of!(MemoryBasicInformation, type_) == 24);
};

impl From<MemoryBasicInformation> for PageInfo {
    fn from(mbi: MemoryBasicInformation) -> Self {
        PageInfo {
            base_address: RawPointer::new(mbi.base_address),
            allocation_base: RawPointer::new(mbi.allocation_base),
            allocation_protect: Protection::from_bits_retain(mbi.allocation_protect),
            region_size: mbi.region_size,
            state: PageState::from_bits_retain(mbi.state),
            protect: Protection::from_bits_retain(mbi.protect),
            page_type: PageType::from_bits_retain(mbi.type_),
        }
    }
}

bitflags! {
    /// `CONTEXT_*` selectors for the AMD64 register groups to capture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        const AMD64 = 0x0010_0000;
        const CONTROL = 0x0010_0001;
        const INTEGER = 0x0010_0002;
        const SEGMENTS = 0x0010_0004;
        const FLOATING_POINT = 0x0010_0008;
        const DEBUG_REGISTERS = 0x0010_0010;
        const FULL = Self::CONTROL.bits() | Self::INTEGER.bits() | Self::FLOATING_POINT.bits();
        const ALL = Self::FULL.bits() | Self::SEGMENTS.bits() | Self::DEBUG_REGISTERS.bits();
    }
}

/// The x86_64 `CONTEXT` record filled by `GetThreadContext`.
///
/// `flt_save` holds the raw `XMM_SAVE_AREA32` and each `vector_register`
/// entry is an `M128A` as low and high halves.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,

    pub context_flags: u32,
    pub mx_csr: u32,

    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub seg_ss: u16,
    pub eflags: u32,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,

    pub flt_save: [u8; 512],

    pub vector_register: [[u64; 2]; 26],
    pub vector_control: u64,

    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

const _: () = {
    assert!(size_of::<Context64>() == 1232);
    assert!(offset_of!(Context64, context_flags) == 0x30);
    assert!(offset_of!(Context64, mx_csr) == 0x34);
    assert!(offset_of!(Context64, seg_cs) == 0x38);
    assert!(offset_of!(Context64, eflags) == 0x44);
    assert!(offset_of!(Context64, dr0) == 0x48);
    assert!(offset_of!(Context64, rax) == 0x78);
    assert!(offset_of!(Context64, rsp) == 0x98);
    assert!(offset_of!(Context64, rip) == 0xf8);
    assert!(offset_of!(Context64, flt_save) == 0x100);
    assert!(offset_of!(Context64, vector_register) == 0x300);
    assert!(offset_of!(Context64, vector_control) == 0x4a0);
    assert!(offset_of!(Context64, debug_control) == 0x4a8);
    assert!(offset_of!(Context64, last_exception_from_rip) == 0x4c8);
};

impl Context64 {
    /// A zeroed record asking for the register groups in `flags`.
    pub fn new(flags: ContextFlags) -> Self {
        // all-zero is a valid value for every field
        let mut context: Self = unsafe { std::mem::zeroed() };
        context.context_flags = flags.bits();
        context
    }

    pub fn flags(&self) -> ContextFlags {
        ContextFlags::from_bits_retain(self.context_flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_raw_records() {
        let mbi = MemoryBasicInformation {
            base_address: 0x7000,
            allocation_base: 0x6000,
            allocation_protect: 0x04,
            region_size: 0x2000,
            state: 0x1000,
            protect: 0x20,
            type_: 0x0100_0000,
            ..Default::default()
        };

        let info = PageInfo::from(mbi);
        assert_eq!(info.base_address.address(), 0x7000);
        assert_eq!(info.allocation_base.address(), 0x6000);
        assert_eq!(info.allocation_protect, Protection::READ_WRITE);
        assert_eq!(info.protect, Protection::EXECUTE_READ);
        assert_eq!(info.state, PageState::COMMIT);
        assert_eq!(info.page_type, PageType::IMAGE);
        assert_eq!(info.region().size(), 0x2000);
    }

    #[test]
    fn context_records_carry_their_flags() {
        let context = Context64::new(ContextFlags::FULL);

        assert_eq!(context.context_flags, 0x0010_000B);
        assert!(context.flags().contains(ContextFlags::INTEGER));
        assert!(!context.flags().contains(ContextFlags::DEBUG_REGISTERS));
        assert_eq!(context.rip, 0);
        assert_eq!(std::mem::align_of::<Context64>(), 16);
    }
}
