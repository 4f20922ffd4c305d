//! # Context switch
//!
//! A switch saves the callee-saved registers of the outgoing thread on its
//! own kernel stack, stores the resulting stack pointer in its PCB and
//! resumes the incoming thread from the stack pointer saved there, in the
//! layout of [`kernel_proc::context::Context`]. The final `ret` lands either
//! where that thread called [`switch_context`] itself, or in one of the
//! start trampolines for a thread that never ran.

use crate::state::kernel;
use crate::tss;
use core::arch::naked_asm;
use kernel_proc::Switch;
use kernel_proc::context::Trampolines;

/// Save `ebp ebx esi edi` and the return address to the current stack,
/// store the stack pointer at `save_sp` and resume from `to_sp`.
#[unsafe(naked)]
unsafe extern "C" fn switch_context(save_sp: *mut usize, to_sp: usize) {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "mov [eax], esp",
        "mov esp, edx",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
    )
}

/// First instruction of a kernel thread: `ebx` holds the entry point, `esi`
/// its argument. The thread exits with whatever the entry returns.
#[unsafe(naked)]
extern "C" fn kernel_thread_start() {
    naked_asm!(
        "sti",
        "push esi",
        "call ebx",
        "add esp, 4",
        "push eax",
        "call {exit}",
        "ud2",
        exit = sym crate::traps::exit_current,
    )
}

/// Where never-run threads begin.
#[must_use]
pub fn trampolines() -> Trampolines {
    Trampolines {
        kernel_thread: kernel_thread_start as usize,
        trap_return: crate::interrupts::stubs::trap_return_addr(),
    }
}

/// Carry out a dispatch decision.
///
/// Loads `esp0` for a user process and the incoming address space, then
/// switches stacks. Returns when the outgoing thread is dispatched again.
///
/// Interrupts must be disabled and the kernel lock released.
pub fn apply(switch: Switch) {
    log::trace!("switch {:?} -> {}", switch.from, switch.to);
    {
        let k = kernel().lock_irq();
        if let Some(top) = switch.kernel_stack_top {
            tss::set_kernel_stack(top);
        }
        // SAFETY: the scheduler only hands out spaces owned by live processes.
        unsafe { k.vmm.activate(switch.space) };
    }
    // SAFETY: `save_sp` points into the outgoing PCB, which stays in its slot
    // at least until it is reaped; `to_sp` holds a context record.
    unsafe { switch_context(switch.save_sp, switch.to_sp) };
}

/// Carry out a dispatch away from a thread that must never run again.
pub fn leave_for_good(switch: Option<Switch>) -> ! {
    if let Some(switch) = switch {
        apply(switch);
    }
    panic!("a finished thread was dispatched again");
}
