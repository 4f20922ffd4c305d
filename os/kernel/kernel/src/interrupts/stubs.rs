//! # Interrupt entry and exit stubs
//!
//! Each vector gets a tiny stub that makes the stack uniform (a dummy error
//! code where the CPU pushes none, then the vector number) and jumps to
//! [`trap_common`]. The common path completes the [`TrapFrame`], loads the
//! kernel data segments and calls [`trap_dispatch`] with a pointer to the
//! frame. Returning from the dispatcher falls through into [`trap_return`],
//! which is also where freshly forked and spawned processes start.
//!
//! ```text
//!   user_ss   ─┐
//!   user_esp   │ pushed by the CPU (ss/esp only on a ring change)
//!   eflags     │
//!   cs         │
//!   eip       ─┘
//!   error_code   pushed by the CPU or the stub
//!   vector       pushed by the stub
//!   eax .. edi   pushad
//!   ds es fs gs  pushed last, gs lowest
//! ```
//!
//! [`TrapFrame`]: kernel_proc::context::TrapFrame
//! [`trap_dispatch`]: crate::traps::trap_dispatch

use crate::gdt::KERNEL_DS;
use crate::interrupts::pic;
use crate::interrupts::vectors::EXCEPTION_COUNT;
use crate::traps::trap_dispatch;
use core::arch::naked_asm;
use stdlib::syscall_abi::SYSCALL_VECTOR;

macro_rules! stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            )
        }
    };
    ($name:ident, $vector:expr, error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            )
        }
    };
}

stub!(exc00, 0);
stub!(exc01, 1);
stub!(exc02, 2);
stub!(exc03, 3);
stub!(exc04, 4);
stub!(exc05, 5);
stub!(exc06, 6);
stub!(exc07, 7);
stub!(exc08, 8, error_code);
stub!(exc09, 9);
stub!(exc10, 10, error_code);
stub!(exc11, 11, error_code);
stub!(exc12, 12, error_code);
stub!(exc13, 13, error_code);
stub!(exc14, 14, error_code);
stub!(exc15, 15);
stub!(exc16, 16);
stub!(exc17, 17, error_code);
stub!(exc18, 18);
stub!(exc19, 19);
stub!(exc20, 20);
stub!(exc21, 21, error_code);
stub!(exc22, 22);
stub!(exc23, 23);
stub!(exc24, 24);
stub!(exc25, 25);
stub!(exc26, 26);
stub!(exc27, 27);
stub!(exc28, 28);
stub!(exc29, 29);
stub!(exc30, 30);
stub!(exc31, 31);

stub!(irq00, pic::MASTER_OFFSET);
stub!(irq01, pic::MASTER_OFFSET + 1);
stub!(irq02, pic::MASTER_OFFSET + 2);
stub!(irq03, pic::MASTER_OFFSET + 3);
stub!(irq04, pic::MASTER_OFFSET + 4);
stub!(irq05, pic::MASTER_OFFSET + 5);
stub!(irq06, pic::MASTER_OFFSET + 6);
stub!(irq07, pic::MASTER_OFFSET + 7);
stub!(irq08, pic::SLAVE_OFFSET);
stub!(irq09, pic::SLAVE_OFFSET + 1);
stub!(irq10, pic::SLAVE_OFFSET + 2);
stub!(irq11, pic::SLAVE_OFFSET + 3);
stub!(irq12, pic::SLAVE_OFFSET + 4);
stub!(irq13, pic::SLAVE_OFFSET + 5);
stub!(irq14, pic::SLAVE_OFFSET + 6);
stub!(irq15, pic::SLAVE_OFFSET + 7);

stub!(syscall_entry, SYSCALL_VECTOR);

const EXCEPTION_STUBS: [extern "C" fn(); EXCEPTION_COUNT as usize] = [
    exc00, exc01, exc02, exc03, exc04, exc05, exc06, exc07, exc08, exc09, exc10, exc11, exc12,
    exc13, exc14, exc15, exc16, exc17, exc18, exc19, exc20, exc21, exc22, exc23, exc24, exc25,
    exc26, exc27, exc28, exc29, exc30, exc31,
];

const IRQ_STUBS: [extern "C" fn(); 16] = [
    irq00, irq01, irq02, irq03, irq04, irq05, irq06, irq07, irq08, irq09, irq10, irq11, irq12,
    irq13, irq14, irq15,
];

/// Entry stub of CPU exception `vector`.
#[must_use]
pub fn exception_stub(vector: u8) -> usize {
    EXCEPTION_STUBS[usize::from(vector) % EXCEPTION_STUBS.len()] as usize
}

/// Entry stub of hardware line `irq`.
#[must_use]
pub fn irq_stub(irq: u8) -> usize {
    IRQ_STUBS[usize::from(irq) % IRQ_STUBS.len()] as usize
}

/// Entry stub of the system call gate.
#[must_use]
pub fn syscall_stub() -> usize {
    syscall_entry as usize
}

/// Address of [`trap_return`], the start of every new user process.
#[must_use]
pub fn trap_return_addr() -> usize {
    trap_return as usize
}

#[unsafe(naked)]
extern "C" fn trap_common() {
    naked_asm!(
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, {kernel_ds}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "cld",
        "push esp",
        "call {dispatch}",
        "add esp, 4",
        "jmp {ret}",
        kernel_ds = const KERNEL_DS,
        dispatch = sym trap_dispatch,
        ret = sym trap_return,
    )
}

/// Pop a [`TrapFrame`](kernel_proc::context::TrapFrame) off the stack and
/// `iret` through it.
#[unsafe(naked)]
pub extern "C" fn trap_return() {
    naked_asm!(
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        // vector and error code
        "add esp, 8",
        "iretd",
    )
}
