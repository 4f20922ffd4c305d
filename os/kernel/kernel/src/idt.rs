//! # Global Interrupt Descriptor Table
//!
//! The IDT lives in static storage: `lidt` only stores its address and the
//! CPU reads gates from memory on every interrupt.
//!
//! ## Ordering at boot
//! 1. [`crate::gdt::init_gdt_and_tss`] so the gates' selector and the TSS
//!    stack exist.
//! 2. [`init_idt_once`].
//! 3. Remap the PIC and start the PIT.
//! 4. Interrupts come on with the first dispatched thread.

use crate::interrupts::Idt;
use core::mem::MaybeUninit;

static mut IDT: MaybeUninit<Idt> = MaybeUninit::uninit();

/// Install `idt` as the system table and load it into the IDTR.
///
/// # Safety
/// Once, with interrupts disabled, after the GDT is loaded. Every present
/// gate must point at a valid entry stub.
pub unsafe fn init_idt_once(idt: Idt) {
    #[allow(static_mut_refs)]
    unsafe {
        let idt = IDT.write(idt);
        log::debug!("IDT at {:p} with {} gates", idt, idt.present_count());
        IDT.assume_init_ref().load();
    }
}
