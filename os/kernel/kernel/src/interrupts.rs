//! # i386 Interrupt Descriptor Table (IDT)
//!
//! A 256-entry table of 8-byte gates with a fluent builder:
//!
//! ```ignore
//! // The system call gate, callable from ring 3:
//! idt[0x80]
//!     .set_handler(stub_addr)
//!     .selector(KERNEL_CS)
//!     .dpl(Dpl::Ring3)
//!     .present(true)
//!     .gate_interrupt();
//!
//! unsafe { idt.load() };
//! ```
//!
//! ## Acronyms
//! - **IDT** – *Interrupt Descriptor Table*
//! - **DPL** – *Descriptor Privilege Level*; the lowest privilege allowed to
//!   raise the vector with `int n`
//! - **P** – *Present* bit
//!
//! ## Gates
//! Every gate the kernel installs is an **interrupt gate**: the CPU clears
//! `IF` on entry, so handlers run with interrupts masked until they return
//! through `iret` or a context switch restores a thread that had them on.

pub mod page_fault;
pub mod pic;
pub mod pit;
#[cfg(target_os = "none")]
pub mod stubs;
pub mod syscall;
pub mod timer;

use crate::privilege::Dpl;
use bitfield_struct::bitfield;
use core::mem::size_of;
use core::ops::{Index, IndexMut};

const _: () = assert!(size_of::<IdtEntry>() == 8);
const _: () = assert!(align_of::<Idt>() == 8);

/// Exception vectors the kernel handles.
pub mod vectors {
    pub const DIVIDE_ERROR: u8 = 0;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;

    /// Vectors `0..32` are CPU exceptions.
    pub const EXCEPTION_COUNT: u8 = 32;

    /// Exceptions for which the CPU pushes an error code.
    #[must_use]
    pub const fn has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10..=14 | 17 | 21)
    }
}

/// The attribute byte of a gate plus the reserved byte before it.
///
/// ```text
///  15  14 13  12  11    8  7        0
/// +---+-----+---+--------+----------+
/// | P | DPL | S |  Type  | reserved |
/// +---+-----+---+--------+----------+
/// ```
#[bitfield(u16)]
pub struct IdtGateAttr {
    #[bits(8)]
    __zero0: u8,

    /// 0xE = 32-bit interrupt gate, 0xF = 32-bit trap gate.
    #[bits(4)]
    pub typ: u8,

    /// Must be zero for interrupt and trap gates.
    #[bits(1)]
    pub s: bool,

    #[bits(2)]
    pub dpl: u8,

    #[bits(1)]
    pub present: bool,
}

impl IdtGateAttr {
    pub const INTERRUPT_GATE: u8 = 0xE;
    pub const TRAP_GATE: u8 = 0xF;

    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(Self::INTERRUPT_GATE).with_s(false)
    }

    #[inline]
    #[must_use]
    pub const fn trap_gate() -> Self {
        Self::new().with_typ(Self::TRAP_GATE).with_s(false)
    }
}

#[repr(C, align(8))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// An IDT with every gate absent. Any interrupt raises a double fault
    /// until its gate is filled.
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Load this table into the IDTR.
    ///
    /// # Safety
    /// CPL0 only. Every present entry must point at a valid handler in the
    /// kernel code segment.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn load(&'static self) {
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as usize as u32,
        };
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        let _ = idtr;
    }

    /// Number of present gates.
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

/// Operand of `lidt`.
#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u32,
}

/// One 8-byte i386 gate descriptor.
///
/// ```text
/// 63            48 47          32 31          16 15           0
/// +---------------+--------------+--------------+--------------+
/// | offset[31:16] | P DPL 0 Type | selector     | offset[15:0] |
/// +---------------+--------------+--------------+--------------+
/// ```
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attr: u16,
    offset_hi: u16,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateType {
    /// Clears `IF` on entry.
    InterruptGate,
    /// Leaves `IF` unchanged.
    TrapGate,
}

impl IdtEntry {
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attr: IdtGateAttr::new().into_bits(),
        offset_hi: 0,
    };

    /// Point this entry at the stub at `handler` and return a builder.
    ///
    /// The entry starts out absent, ring 0 only, as an interrupt gate.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_handler(&mut self, handler: usize) -> IdtEntryBuilder<'_> {
        let addr = handler as u32;
        self.offset_lo = (addr & 0xFFFF) as u16;
        self.offset_hi = (addr >> 16) as u16;
        self.selector = crate::gdt::KERNEL_CS;
        self.attr = IdtGateAttr::interrupt_gate()
            .with_present(false)
            .with_dpl(0)
            .into_bits();
        IdtEntryBuilder { entry: self }
    }

    #[must_use]
    pub const fn handler(&self) -> u32 {
        (self.offset_lo as u32) | ((self.offset_hi as u32) << 16)
    }

    #[must_use]
    pub const fn selector(&self) -> u16 {
        self.selector
    }

    #[must_use]
    pub const fn attr(&self) -> IdtGateAttr {
        IdtGateAttr::from_bits(self.attr)
    }

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.attr().present()
    }

    #[must_use]
    pub const fn to_u64(self) -> u64 {
        (self.offset_lo as u64)
            | ((self.selector as u64) << 16)
            | ((self.attr as u64) << 32)
            | ((self.offset_hi as u64) << 48)
    }
}

pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    #[inline]
    pub const fn present(self, p: bool) -> Self {
        self.entry.attr = IdtGateAttr::from_bits(self.entry.attr).with_present(p).into_bits();
        self
    }

    /// Lowest privilege allowed to raise the vector with `int n`.
    #[inline]
    pub const fn dpl(self, dpl: Dpl) -> Self {
        self.entry.attr = IdtGateAttr::from_bits(self.entry.attr)
            .with_dpl(dpl.into_bits())
            .into_bits();
        self
    }

    #[inline]
    pub const fn kernel_only(self) -> Self {
        self.dpl(Dpl::Ring0)
    }

    #[inline]
    pub const fn user_callable(self) -> Self {
        self.dpl(Dpl::Ring3)
    }

    #[inline]
    pub const fn gate_interrupt(self) -> Self {
        self.entry.attr = IdtGateAttr::from_bits(self.entry.attr)
            .with_typ(IdtGateAttr::INTERRUPT_GATE)
            .with_s(false)
            .into_bits();
        self
    }

    #[inline]
    pub const fn gate_trap(self) -> Self {
        self.entry.attr = IdtGateAttr::from_bits(self.entry.attr)
            .with_typ(IdtGateAttr::TRAP_GATE)
            .with_s(false)
            .into_bits();
        self
    }

    #[inline]
    pub const fn gate_type(self, gate_type: GateType) -> Self {
        match gate_type {
            GateType::InterruptGate => self.gate_interrupt(),
            GateType::TrapGate => self.gate_trap(),
        }
    }

    #[inline]
    pub const fn selector(self, sel: u16) -> Self {
        self.entry.selector = sel;
        self
    }
}

/// Exception gates, ring 0 only.
pub trait ExceptionInterrupts {
    /// Route every CPU exception vector to `stub_for(vector)`.
    fn init_exception_gates(&mut self, stub_for: impl Fn(u8) -> usize) -> &mut Self;
}

impl ExceptionInterrupts for Idt {
    fn init_exception_gates(&mut self, stub_for: impl Fn(u8) -> usize) -> &mut Self {
        for vector in 0..vectors::EXCEPTION_COUNT {
            self[usize::from(vector)]
                .set_handler(stub_for(vector))
                .selector(crate::gdt::KERNEL_CS)
                .kernel_only()
                .present(true)
                .gate_type(GateType::InterruptGate);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_interrupt_gate_encoding() {
        let mut idt = Idt::new();
        idt[3]
            .set_handler(0x0010_2345)
            .selector(0x08)
            .present(true)
            .gate_interrupt();
        let e = idt[3];
        assert_eq!(e.to_u64(), 0x0010_8E00_0008_2345);
        assert_eq!(e.handler(), 0x0010_2345);
        assert!(e.is_present());
    }

    #[test]
    fn user_callable_gate_has_dpl3() {
        let mut idt = Idt::new();
        idt[0x80].set_handler(0x1000).user_callable().present(true);
        assert_eq!(idt[0x80].attr().dpl(), 3);
        assert_eq!(idt[0x80].attr().into_bits() >> 8, 0xEE);
    }

    #[test]
    fn exception_gates_cover_all_exceptions() {
        let mut idt = Idt::new();
        idt.init_exception_gates(|v| 0x10_0000 + usize::from(v) * 16);
        assert_eq!(idt.present_count(), 32);
        assert_eq!(idt[14].handler(), 0x10_00E0);
        assert_eq!(idt[14].attr().dpl(), 0);
        assert!(!idt[32].is_present());
    }

    #[test]
    fn error_code_vectors() {
        assert!(vectors::has_error_code(vectors::PAGE_FAULT));
        assert!(vectors::has_error_code(vectors::GENERAL_PROTECTION));
        assert!(vectors::has_error_code(vectors::DOUBLE_FAULT));
        assert!(!vectors::has_error_code(vectors::DIVIDE_ERROR));
        assert!(!vectors::has_error_code(vectors::INVALID_OPCODE));
        assert!(!vectors::has_error_code(32));
    }
}
