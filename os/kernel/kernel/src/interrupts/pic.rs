//! # 8259A Programmable Interrupt Controller pair
//!
//! At reset the master PIC delivers IRQ 0..7 on vectors 8..15, right on top
//! of the CPU exceptions. [`remap`] moves both controllers to
//! [`MASTER_OFFSET`] and [`SLAVE_OFFSET`] and masks every line except those
//! asked for.

use crate::ports::{inb, outb};

const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const EOI: u8 = 0x20;

/// First vector of IRQ 0..7.
pub const MASTER_OFFSET: u8 = 0x20;
/// First vector of IRQ 8..15.
pub const SLAVE_OFFSET: u8 = 0x28;

/// The PIT channel 0 line.
pub const IRQ_TIMER: u8 = 0;
/// Cascade line the slave hangs off.
const IRQ_CASCADE: u8 = 2;

/// Vector an IRQ line arrives on after [`remap`].
#[must_use]
pub const fn vector_of(irq: u8) -> u8 {
    if irq < 8 { MASTER_OFFSET + irq } else { SLAVE_OFFSET + (irq - 8) }
}

/// The IRQ line behind `vector`, if it is one of the remapped ones.
#[must_use]
pub const fn irq_of(vector: u8) -> Option<u8> {
    if vector >= MASTER_OFFSET && vector < SLAVE_OFFSET + 8 {
        Some(vector - MASTER_OFFSET)
    } else {
        None
    }
}

/// Mask bytes for master and slave that leave only `enabled` lines open.
///
/// The cascade line stays open whenever a slave line is enabled.
#[must_use]
pub fn masks_for(enabled: &[u8]) -> (u8, u8) {
    let mut open: u16 = 0;
    for &irq in enabled.iter().filter(|&&irq| irq < 16) {
        open |= 1 << irq;
    }
    if open & 0xFF00 != 0 {
        open |= 1 << IRQ_CASCADE;
    }
    let [lo, hi] = (!open).to_le_bytes();
    (lo, hi)
}

/// Reinitialise both controllers and unmask `enabled`.
///
/// # Safety
/// Ring 0 with interrupts disabled; no other code may talk to the PIC.
pub unsafe fn remap(enabled: &[u8]) {
    let (master_mask, slave_mask) = masks_for(enabled);
    unsafe {
        outb(MASTER_CMD, ICW1_INIT | ICW1_ICW4);
        outb(SLAVE_CMD, ICW1_INIT | ICW1_ICW4);
        outb(MASTER_DATA, MASTER_OFFSET);
        outb(SLAVE_DATA, SLAVE_OFFSET);
        outb(MASTER_DATA, 1 << IRQ_CASCADE);
        outb(SLAVE_DATA, IRQ_CASCADE);
        outb(MASTER_DATA, ICW4_8086);
        outb(SLAVE_DATA, ICW4_8086);
        outb(MASTER_DATA, master_mask);
        outb(SLAVE_DATA, slave_mask);
    }
    log::debug!(
        "PIC remapped to {MASTER_OFFSET:#04x}/{SLAVE_OFFSET:#04x}, masks {master_mask:#04x}/{slave_mask:#04x}"
    );
}

/// Acknowledge `irq`.
///
/// # Safety
/// Only from the handler of that IRQ.
pub unsafe fn end_of_interrupt(irq: u8) {
    unsafe {
        if irq >= 8 {
            outb(SLAVE_CMD, EOI);
        }
        outb(MASTER_CMD, EOI);
    }
}

/// Current master and slave masks.
///
/// # Safety
/// Ring 0.
pub unsafe fn masks() -> (u8, u8) {
    unsafe { (inb(MASTER_DATA), inb(SLAVE_DATA)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_timer_is_open() {
        assert_eq!(masks_for(&[IRQ_TIMER]), (0xFE, 0xFF));
    }

    #[test]
    fn slave_lines_open_the_cascade() {
        assert_eq!(masks_for(&[0, 12]), (0b1111_1010, 0b1110_1111));
    }

    #[test]
    fn vectors_follow_the_offsets() {
        assert_eq!(vector_of(IRQ_TIMER), 0x20);
        assert_eq!(vector_of(14), 0x2E);
        assert_eq!(irq_of(0x20), Some(0));
        assert_eq!(irq_of(0x2F), Some(15));
        assert_eq!(irq_of(0x80), None);
        assert_eq!(irq_of(14), None);
    }
}
