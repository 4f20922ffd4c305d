//! # 32-bit Task State Segment
//!
//! The kernel never uses hardware task switching. The TSS is only consulted
//! when an interrupt or `int 0x80` arrives in ring 3: the CPU then loads
//! `ss0:esp0` before pushing the user's `ss`, `esp`, `eflags`, `cs` and
//! `eip`. Every dispatch of a user process therefore points `esp0` at the
//! top of that process's kernel stack ([`set_kernel_stack`]).
//!
//! `iopb_offset` points past the end of the segment, so user code has no
//! port access.

use crate::gdt::KERNEL_DS;
use core::ptr::addr_of_mut;
use kernel_memory_addresses::VirtualAddress;

#[repr(C)]
pub struct Tss32 {
    link: u32,
    /// Ring-0 stack pointer loaded on entry from ring 3.
    pub esp0: u32,
    /// Ring-0 stack segment; the kernel data selector.
    pub ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    /// eax ecx edx ebx esp ebp esi edi, used by hardware task switches only.
    gprs: [u32; 8],
    /// es cs ss ds fs gs
    segments: [u32; 6],
    ldt: u32,
    trap: u16,
    pub iopb_offset: u16,
}

impl Tss32 {
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            link: 0,
            esp0: 0,
            ss0: KERNEL_DS as u32,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            gprs: [0; 8],
            segments: [0; 6],
            ldt: 0,
            trap: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

impl Default for Tss32 {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(size_of::<Tss32>() == 104);

static mut TSS: Tss32 = Tss32::new();

/// Address of the TSS for its GDT descriptor.
pub fn tss_base() -> VirtualAddress {
    #[allow(clippy::cast_possible_truncation)]
    VirtualAddress::new(addr_of_mut!(TSS) as usize as u32)
}

/// Point `esp0` at `top`, the stack the next ring 3 → 0 transition uses.
///
/// Called with interrupts masked; the TSS is only read by the CPU on an
/// interrupt from user mode.
#[allow(clippy::cast_possible_truncation)]
pub fn set_kernel_stack(top: usize) {
    // SAFETY: single CPU, interrupts masked; the field is plain data.
    unsafe { addr_of_mut!(TSS.esp0).write_volatile(top as u32) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_bitmap_is_disabled() {
        let tss = Tss32::new();
        assert_eq!(tss.iopb_offset, 104);
        assert_eq!(tss.ss0, 0x10);
    }
}
