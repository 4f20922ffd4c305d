use crate::gdt::KERNEL_CS;
use crate::interrupts::{GateType, Idt, pic};

/// Vector of the PIT tick once the PIC is remapped.
pub const TIMER_VECTOR: u8 = pic::vector_of(pic::IRQ_TIMER);

pub trait TimerInterrupt {
    fn init_timer_gate(&mut self, handler: usize) -> &mut Self;
}

impl TimerInterrupt for Idt {
    fn init_timer_gate(&mut self, handler: usize) -> &mut Self {
        self[usize::from(TIMER_VECTOR)]
            .set_handler(handler)
            .selector(KERNEL_CS)
            .present(true)
            .kernel_only()
            .gate_type(GateType::InterruptGate);

        let e = &self[usize::from(TIMER_VECTOR)];
        debug_assert_eq!(e.selector(), 0x08);
        debug_assert_eq!(e.attr().into_bits() >> 8, 0x8E);

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_sits_on_the_first_remapped_vector() {
        let mut idt = Idt::new();
        idt.init_timer_gate(0x0010_0400);
        assert_eq!(TIMER_VECTOR, 0x20);
        assert!(idt[0x20].is_present());
        assert_eq!(idt[0x20].attr().dpl(), 0);
    }
}
