//! # System call dispatch
//!
//! `int 0x80` arrives here with the number in `eax` and up to three
//! arguments in `ebx`, `ecx` and `edx`. The result goes back in `eax`,
//! negative error numbers included (see [`stdlib::syscall_abi`]).
//!
//! Calls that block (`wait`, `sleep`, `yield`) release the kernel lock
//! before switching away and pick it up again once the caller runs.

use crate::errno::errno;
use crate::state::{Kernel, kernel};
use crate::switch::{apply, leave_for_good};
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use kernel_alloc::vmm::VmmError;
use kernel_info::memory::is_user_range;
use kernel_memory_addresses::VirtualAddress;
use kernel_proc::context::TrapFrame;
use kernel_proc::fd::FileHandle;
use kernel_proc::signal::{SigAction, Signal, SignalSet};
use kernel_proc::{ARG_MAX, Pid, ProcError, Scheduler, WaitOutcome};
use log::{info, trace};
use stdlib::syscall_abi::{Errno, SIG_DFL, SIG_IGN, Sysno, WAIT_ANY, encode};

/// Longest path `exec` accepts, terminator included.
const PATH_MAX: usize = 256;

/// Most arguments `exec` copies in.
const MAX_ARGS: usize = 16;

/// Bytes `write` moves per copy.
const WRITE_CHUNK: usize = 256;

type SysResult = Result<u32, Errno>;

pub fn dispatch(frame: &mut TrapFrame) {
    let (a, b, c) = (frame.ebx, frame.ecx, frame.edx);
    let Some(no) = Sysno::from_raw(frame.eax) else {
        info!("unknown system call {}", frame.eax);
        frame.eax = Errno::ENOSYS.to_return();
        return;
    };
    trace!("syscall {no:?}({a:#x}, {b:#x}, {c:#x})");

    let result = match no {
        Sysno::Exit => sys_exit(a),
        // The restored frame carries its own eax.
        Sysno::SigReturn => return sys_sigreturn(frame),
        Sysno::Fork => sys_fork(frame),
        Sysno::Exec => sys_exec(frame, a, b),
        Sysno::Wait => sys_wait(a, b),
        Sysno::Yield => sys_yield(),
        Sysno::Sleep => sys_sleep(a),
        Sysno::GetPid => with_current(|_, pid| Ok(pid.as_u32())),
        Sysno::GetPpid => with_current(|k, pid| {
            Ok(k.sched.processes().parent_of(pid).map_or(0, Pid::as_u32))
        }),
        Sysno::Kill => with_current(|k, pid| {
            k.sched
                .processes_mut()
                .kill(Some(pid), Pid::new(a), b)
                .map(|()| 0)
                .map_err(errno)
        }),
        Sysno::Signal => sys_signal(a, b, c),
        Sysno::SigProcMask => with_current(|k, pid| {
            k.sched
                .processes_mut()
                .sigprocmask(pid, SignalSet::from_bits(a))
                .map(SignalSet::bits)
                .map_err(errno)
        }),
        Sysno::Sbrk => with_current(|k, pid| {
            let Kernel { vmm, sched, .. } = k;
            #[allow(clippy::cast_possible_wrap)]
            let delta = a as i32;
            sched
                .processes_mut()
                .sbrk(vmm, pid, delta)
                .map(VirtualAddress::as_u32)
                .map_err(errno)
        }),
        Sysno::Write => sys_write(a, b, c),
    };

    if let Err(e) = result {
        trace!("syscall {no:?} failed: {e}");
    }
    frame.eax = encode(result);
}

fn current(sched: &Scheduler) -> Result<Pid, Errno> {
    sched.current().ok_or(Errno::ESRCH)
}

/// Run `f` under the kernel lock with the calling process.
fn with_current(f: impl FnOnce(&mut Kernel, Pid) -> SysResult) -> SysResult {
    let mut k = kernel().lock_irq();
    let pid = current(&k.sched)?;
    f(&mut k, pid)
}

fn fault(e: VmmError) -> Errno {
    errno(ProcError::from(e))
}

fn sys_exit(status: u32) -> ! {
    #[allow(clippy::cast_possible_wrap)]
    let status = status as i32;
    let switch = {
        let mut k = kernel().lock_irq();
        let Some(pid) = k.sched.current() else {
            panic!("exit without a current process");
        };
        match k.sched.processes_mut().exit(pid, status) {
            Ok(()) => {}
            Err(ProcError::InitExited) => panic!("init exited with status {status}"),
            Err(e) => panic!("{pid} could not exit: {e}"),
        }
        k.sched.reschedule()
    };
    leave_for_good(switch)
}

fn sys_sigreturn(frame: &mut TrapFrame) {
    let switch = {
        let mut k = kernel().lock_irq();
        let Kernel { vmm, sched, .. } = &mut *k;
        let Some(pid) = sched.current() else { return };
        let procs = sched.processes_mut();
        match procs.sigreturn(vmm, pid, frame) {
            Ok(()) => return,
            Err(e) => info!("{pid}: bad signal frame ({e}), killing it"),
        }
        match procs.exit(pid, Signal::SIGSEGV.termination_status()) {
            Ok(()) => {}
            Err(ProcError::InitExited) => panic!("init returned from a signal with a broken frame"),
            Err(e) => panic!("{pid} could not be terminated: {e}"),
        }
        sched.reschedule()
    };
    leave_for_good(switch);
}

fn sys_fork(frame: &TrapFrame) -> SysResult {
    let mut k = kernel().lock_irq();
    let Kernel { vmm, sched, .. } = &mut *k;
    let pid = current(sched)?;
    let child = sched.processes_mut().fork(vmm, pid, frame).map_err(errno)?;
    Ok(child.as_u32())
}

fn sys_exec(frame: &mut TrapFrame, path_ptr: u32, argv_ptr: u32) -> SysResult {
    let mut k = kernel().lock_irq();
    let Kernel { vmm, sched, files } = &mut *k;
    let pid = current(sched)?;
    let space = sched
        .processes()
        .get(pid)
        .and_then(|p| p.space)
        .ok_or(Errno::EINVAL)?;

    let mut path_buf = [0u8; PATH_MAX];
    let path = vmm
        .read_user_str(space, VirtualAddress::new(path_ptr), &mut path_buf)
        .map_err(fault)?;
    let path = core::str::from_utf8(path).map_err(|_| Errno::ENOENT)?;

    let mut arena = Vec::new();
    arena.try_reserve_exact(ARG_MAX).map_err(|_| Errno::ENOMEM)?;
    arena.resize(ARG_MAX, 0u8);
    let mut spans = ArrayVec::<(usize, usize), MAX_ARGS>::new();
    if argv_ptr != 0 {
        let mut used = 0;
        for i in 0..=MAX_ARGS {
            #[allow(clippy::cast_possible_truncation)]
            let slot = VirtualAddress::new(argv_ptr)
                .checked_add(4 * i as u32)
                .ok_or(Errno::EFAULT)?;
            let mut raw = [0u8; 4];
            vmm.copy_from_user(space, slot, &mut raw).map_err(fault)?;
            let arg = u32::from_le_bytes(raw);
            if arg == 0 {
                break;
            }
            if i == MAX_ARGS || used >= arena.len() {
                return Err(Errno::E2BIG);
            }
            let len = match vmm.read_user_str(space, VirtualAddress::new(arg), &mut arena[used..]) {
                Ok(s) => s.len(),
                Err(VmmError::Unterminated(_)) => return Err(Errno::E2BIG),
                Err(e) => return Err(fault(e)),
            };
            spans.push((used, len));
            used += len + 1;
        }
    }
    let argv: ArrayVec<&[u8], MAX_ARGS> = spans.iter().map(|&(at, len)| &arena[at..at + len]).collect();

    sched
        .processes_mut()
        .exec(vmm, &*files, pid, path, &argv, frame)
        .map_err(errno)?;
    // The new program starts with eax = 0.
    Ok(0)
}

fn sys_wait(target: u32, status_ptr: u32) -> SysResult {
    let target = (target != WAIT_ANY).then(|| Pid::new(target));
    let status_at = (status_ptr != 0).then(|| VirtualAddress::new(status_ptr));

    if let Some(at) = status_at {
        // Fail before a child is reaped and its status lost.
        let k = kernel().lock_irq();
        let pid = current(&k.sched)?;
        let space = k.sched.processes().get(pid).and_then(|p| p.space).ok_or(Errno::EINVAL)?;
        k.vmm.check_user(space, at, 4, true).map_err(fault)?;
    }

    loop {
        let switch = {
            let mut k = kernel().lock_irq();
            let Kernel { vmm, sched, .. } = &mut *k;
            let pid = current(sched)?;
            match sched.processes_mut().wait(vmm, pid, target).map_err(errno)? {
                WaitOutcome::Reaped { pid: child, status } => {
                    if let Some(at) = status_at {
                        let space = sched.processes().get(pid).and_then(|p| p.space).ok_or(Errno::EINVAL)?;
                        vmm.copy_to_user(space, at, &status.to_le_bytes()).map_err(fault)?;
                    }
                    return Ok(child.as_u32());
                }
                WaitOutcome::Blocked => sched.reschedule(),
            }
        };
        if let Some(switch) = switch {
            apply(switch);
        }
    }
}

fn sys_yield() -> SysResult {
    let switch = kernel().lock_irq().sched.yield_now();
    if let Some(switch) = switch {
        apply(switch);
    }
    Ok(0)
}

fn sys_sleep(ticks: u32) -> SysResult {
    let (pid, switch) = {
        let mut k = kernel().lock_irq();
        let pid = current(&k.sched)?;
        let switch = k.sched.sleep_current(u64::from(ticks)).map_err(errno)?;
        (pid, switch)
    };
    if let Some(switch) = switch {
        apply(switch);
    }
    if kernel().lock_irq().sched.processes_mut().take_interrupted(pid) {
        Err(Errno::EINTR)
    } else {
        Ok(0)
    }
}

fn sys_signal(signo: u32, handler: u32, restorer: u32) -> SysResult {
    let action = match handler {
        SIG_DFL => SigAction::Default,
        SIG_IGN => SigAction::Ignore,
        h => {
            if !is_user_range(h, 1) || !is_user_range(restorer, 1) {
                return Err(Errno::EFAULT);
            }
            SigAction::Catch {
                handler: VirtualAddress::new(h),
                restorer: VirtualAddress::new(restorer),
            }
        }
    };
    with_current(|k, pid| {
        let old = k.sched.processes_mut().sigaction(pid, signo, action).map_err(errno)?;
        Ok(match old {
            SigAction::Default => SIG_DFL,
            SigAction::Ignore => SIG_IGN,
            SigAction::Catch { handler, .. } => handler.as_u32(),
        })
    })
}

fn sys_write(fd: u32, buf: u32, len: u32) -> SysResult {
    with_current(|k, pid| {
        let pcb = k.sched.processes().get(pid).ok_or(Errno::ESRCH)?;
        if pcb.fds.get(fd as usize) != Some(FileHandle::CONSOLE) {
            return Err(Errno::EINVAL);
        }
        let space = pcb.space.ok_or(Errno::EINVAL)?;
        let start = VirtualAddress::new(buf);
        k.vmm.check_user(space, start, len, false).map_err(fault)?;

        let mut chunk = [0u8; WRITE_CHUNK];
        let mut done = 0u32;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let n = (len - done).min(WRITE_CHUNK as u32);
            let at = start.checked_add(done).ok_or(Errno::EFAULT)?;
            let part = &mut chunk[..n as usize];
            k.vmm.copy_from_user(space, at, part).map_err(fault)?;
            kernel_qemu::qemu_fmt::write_bytes(part);
            done += n;
        }
        Ok(len)
    })
}
