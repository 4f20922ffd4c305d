//! # Trap dispatch
//!
//! Every interrupt, exception and system call funnels through
//! [`trap_dispatch`] with the saved [`TrapFrame`]. After the handler, a trap
//! that came from ring 3 passes through [`return_to_user`], which is where
//! pending signals take effect.

use crate::interrupts::page_fault::PageFaultError;
use crate::interrupts::{pic, timer::TIMER_VECTOR, vectors};
use crate::state::kernel;
use crate::switch::{apply, leave_for_good};
use crate::syscall;
use kernel_memory_addresses::VirtualAddress;
use kernel_proc::context::TrapFrame;
use kernel_proc::signal::{Disposition, Signal};
use kernel_proc::{Delivery, Pid, ProcError};
use kernel_registers::LoadRegisterUnsafe;
use kernel_registers::cr2::Cr2;
use kernel_sync::irq::sti_enable_interrupts;
use log::{debug, error, info, warn};
use stdlib::syscall_abi::SYSCALL_VECTOR;

#[unsafe(no_mangle)]
pub extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    #[allow(clippy::cast_possible_truncation)]
    let vector = frame.vector as u8;
    match vector {
        TIMER_VECTOR => timer(),
        SYSCALL_VECTOR => syscall::dispatch(frame),
        v if v < vectors::EXCEPTION_COUNT => exception(frame, v),
        v => match pic::irq_of(v) {
            Some(irq) => {
                // Masked lines still show up as spurious IRQ 7/15.
                debug!("unexpected IRQ {irq}");
                // SAFETY: acknowledging the line that just fired.
                unsafe { pic::end_of_interrupt(irq) };
            }
            None => warn!("interrupt on unused vector {v:#04x}"),
        },
    }

    if frame.from_user_mode() {
        return_to_user(frame);
    }
}

fn timer() {
    // SAFETY: this is the timer handler.
    unsafe { pic::end_of_interrupt(pic::IRQ_TIMER) };
    let switch = kernel().lock_irq().sched.tick();
    if let Some(switch) = switch {
        apply(switch);
    }
}

fn exception(frame: &mut TrapFrame, vector: u8) {
    let cr2 = if vector == vectors::PAGE_FAULT {
        // SAFETY: ring 0.
        Some(unsafe { Cr2::load_unsafe() }.0)
    } else {
        None
    };

    if !frame.from_user_mode() {
        kernel_fault(frame, vector, cr2);
    }

    let sig = match vector {
        vectors::DIVIDE_ERROR => Signal::SIGFPE,
        vectors::INVALID_OPCODE => Signal::SIGILL,
        _ => Signal::SIGSEGV,
    };
    let mut k = kernel().lock_irq();
    let Some(pid) = k.sched.current() else {
        panic!("user exception {vector} without a current process");
    };
    match cr2 {
        Some(addr) => info!(
            "{pid}: page fault at {addr} (eip={:#010x}): {}",
            frame.eip,
            PageFaultError::from_bits(frame.error_code).explain()
        ),
        None => info!(
            "{pid}: exception {vector} at eip={:#010x}, error code {:#x}",
            frame.eip, frame.error_code
        ),
    }

    let procs = k.sched.processes_mut();
    let catchable = procs.get(pid).is_some_and(|p| {
        matches!(p.signals.disposition(sig), Disposition::Catch { .. })
            && !p.signals.blocked.contains(sig)
    });
    if catchable {
        if let Err(e) = procs.kill(None, pid, sig.number()) {
            warn!("{pid}: could not post {sig}: {e}");
        }
        return;
    }

    // Re-running the instruction would only fault again.
    match procs.exit(pid, sig.termination_status()) {
        Ok(()) => {}
        Err(ProcError::InitExited) => panic!("init killed by {sig} at eip={:#010x}", frame.eip),
        Err(e) => panic!("{pid} could not be terminated after {sig}: {e}"),
    }
    let switch = k.sched.reschedule();
    drop(k);
    leave_for_good(switch);
}

fn kernel_fault(frame: &TrapFrame, vector: u8, cr2: Option<VirtualAddress>) -> ! {
    match cr2 {
        Some(addr) => panic!(
            "kernel page fault at {addr}, eip={:#010x}: {}",
            frame.eip,
            PageFaultError::from_bits(frame.error_code).explain()
        ),
        None => panic!(
            "kernel exception {vector} at eip={:#010x}, error code {:#x}\n{frame:#x?}",
            frame.eip, frame.error_code
        ),
    }
}

/// Deliver pending signals before `frame` goes back to ring 3.
///
/// A process that is terminated here never returns; a stopped one returns
/// once it has been continued, after another round of delivery.
pub fn return_to_user(frame: &mut TrapFrame) {
    loop {
        let switch = {
            let mut k = kernel().lock_irq();
            let crate::state::Kernel { vmm, sched, .. } = &mut *k;
            let Some(pid) = sched.current() else { return };
            match sched.processes_mut().deliver_pending(vmm, pid, frame) {
                Ok(Delivery::None | Delivery::Handled(_)) => return,
                Ok(Delivery::Terminated(sig)) => {
                    debug!("{pid} terminated by {sig} on the way to user mode");
                    let switch = sched.reschedule();
                    drop(k);
                    leave_for_good(switch);
                }
                Ok(Delivery::Stopped(_)) => sched.reschedule(),
                Err(ProcError::InitExited) => panic!("init can no longer take signals"),
                Err(e) => {
                    error!("{pid}: signal delivery failed: {e}");
                    return;
                }
            }
        };
        if let Some(switch) = switch {
            apply(switch);
        }
    }
}

/// Where a kernel thread goes when its entry function returns.
pub extern "C" fn exit_current(status: i32) -> ! {
    kernel_sync::irq::cli_stop_interrupts();
    let switch = {
        let mut k = kernel().lock_irq();
        let Some(pid) = k.sched.current() else {
            panic!("exit without a current process");
        };
        match k.sched.processes_mut().exit(pid, status) {
            Ok(()) => {}
            Err(ProcError::InitExited) => panic!("init exited with {status}"),
            Err(e) => panic!("{pid} could not exit: {e}"),
        }
        k.sched.reschedule()
    };
    leave_for_good(switch)
}

/// The idle process: wait for the next interrupt, forever.
pub extern "C" fn idle_main(_arg: usize) -> ! {
    debug_assert_eq!(kernel().lock_irq().sched.current(), Some(Pid::IDLE));
    loop {
        sti_enable_interrupts();
        halt();
    }
}

/// Stop the CPU until the next interrupt.
pub fn halt() {
    // SAFETY: ring 0.
    unsafe { core::arch::asm!("hlt", options(nomem, nostack, preserves_flags)) };
}
