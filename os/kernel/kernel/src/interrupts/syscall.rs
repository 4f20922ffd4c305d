use crate::gdt::KERNEL_CS;
use crate::interrupts::{GateType, Idt};
use stdlib::syscall_abi::SYSCALL_VECTOR;

pub trait SyscallInterrupt {
    fn init_syscall_gate(&mut self, handler: usize) -> &mut Self;
}

impl SyscallInterrupt for Idt {
    fn init_syscall_gate(&mut self, handler: usize) -> &mut Self {
        // An interrupt gate: system calls run with IF clear.
        self[usize::from(SYSCALL_VECTOR)]
            .set_handler(handler)
            .selector(KERNEL_CS)
            .present(true)
            .user_callable()
            .gate_type(GateType::InterruptGate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::{Dpl, Rpl};

    #[test]
    fn ring3_may_raise_the_syscall_vector() {
        let mut idt = Idt::new();
        idt.init_syscall_gate(0x0010_0800);
        let gate = idt[0x80];
        assert_eq!(gate.attr().dpl(), 3);
        assert_eq!(gate.attr().typ(), 0xE);
        assert!(Dpl::from_bits(gate.attr().dpl()).permits_int_from(Rpl::Ring3));
    }
}
