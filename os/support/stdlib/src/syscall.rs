//! `int 0x80` system call wrappers.
//!
//! On anything but the i386 kernel target the raw entry reports
//! [`Errno::ENOSYS`], which keeps the wrappers buildable on the host.

use crate::syscall_abi::{Errno, SIG_DFL, SIG_IGN, Sysno, WAIT_ANY, decode};
use core::ffi::CStr;

/// A signal disposition for [`signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Default,
    Ignore,
    Catch(extern "C" fn(u32)),
}

#[inline(always)]
#[allow(clippy::inline_always)]
unsafe fn raw(no: Sysno, a: u32, b: u32, c: u32) -> u32 {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let ret: u32;
        // `ebx` is reserved by LLVM on x86; swap it in and out by hand.
        unsafe {
            core::arch::asm!(
                "xchg {a}, ebx",
                "int 0x80",
                "xchg {a}, ebx",
                a = inout(reg) a => _,
                inlateout("eax") no as u32 => ret,
                in("ecx") b,
                in("edx") c,
            );
        }
        ret
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        let _ = (no, a, b, c);
        Errno::ENOSYS.to_return()
    }
}

fn call(no: Sysno, a: u32, b: u32, c: u32) -> Result<u32, Errno> {
    // SAFETY: the kernel validates every pointer argument.
    decode(unsafe { raw(no, a, b, c) })
}

fn addr<T: ?Sized>(p: *const T) -> u32 {
    // Addresses are 32 bits wide on the kernel's target.
    #[allow(clippy::cast_possible_truncation)]
    let a = p.cast::<u8>() as usize as u32;
    a
}

fn code_addr(f: usize) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let a = f as u32;
    a
}

pub fn exit(status: i32) -> ! {
    #[allow(clippy::cast_sign_loss)]
    let _ = call(Sysno::Exit, status as u32, 0, 0);
    loop {
        core::hint::spin_loop();
    }
}

/// # Errors
/// `EAGAIN` if the process table is full, `ENOMEM`.
pub fn fork() -> Result<u32, Errno> {
    call(Sysno::Fork, 0, 0, 0)
}

/// Replace the running program. Returns only on failure.
///
/// `argv` must end with a null pointer.
///
/// # Errors
/// `ENOENT`, `ENOEXEC`, `E2BIG`, `ENOMEM`, `EFAULT`.
pub fn exec(path: &CStr, argv: &[*const u8]) -> Errno {
    match call(Sysno::Exec, addr(path.as_ptr()), addr(argv.as_ptr()), 0) {
        Ok(_) => Errno::EINVAL,
        Err(e) => e,
    }
}

/// Wait for a child to exit; `None` waits for any child.
/// Returns the child's id and exit status.
///
/// # Errors
/// `ECHILD` without a matching child, `EINTR`.
pub fn wait(pid: Option<u32>) -> Result<(u32, i32), Errno> {
    let mut status = 0i32;
    let pid = call(
        Sysno::Wait,
        pid.unwrap_or(WAIT_ANY),
        addr(&raw mut status),
        0,
    )?;
    Ok((pid, status))
}

pub fn yield_now() {
    let _ = call(Sysno::Yield, 0, 0, 0);
}

/// # Errors
/// `EINTR` if a signal ended the sleep early.
pub fn sleep(ticks: u32) -> Result<(), Errno> {
    call(Sysno::Sleep, ticks, 0, 0).map(|_| ())
}

#[must_use]
pub fn getpid() -> u32 {
    call(Sysno::GetPid, 0, 0, 0).unwrap_or(0)
}

#[must_use]
pub fn getppid() -> u32 {
    call(Sysno::GetPpid, 0, 0, 0).unwrap_or(0)
}

/// # Errors
/// `EINVAL`, `ESRCH`, `EPERM`.
pub fn kill(pid: u32, signo: u32) -> Result<(), Errno> {
    call(Sysno::Kill, pid, signo, 0).map(|_| ())
}

/// Install `handler` for `signo`. Returns the previous handler address,
/// or [`SIG_DFL`]/[`SIG_IGN`].
///
/// # Errors
/// `EINVAL` for a bad signal or an attempt to catch `SIGKILL`/`SIGSTOP`.
pub fn signal(signo: u32, handler: Handler) -> Result<u32, Errno> {
    let h = match handler {
        Handler::Default => SIG_DFL,
        Handler::Ignore => SIG_IGN,
        Handler::Catch(f) => code_addr(f as usize),
    };
    let restorer: extern "C" fn() = sigreturn_restorer;
    call(Sysno::Signal, signo, h, code_addr(restorer as usize))
}

/// Replace the blocked signal mask, returning the old one.
///
/// # Errors
/// Not expected; reported as returned by the kernel.
pub fn sigprocmask(mask: u32) -> Result<u32, Errno> {
    call(Sysno::SigProcMask, mask, 0, 0)
}

/// Move the program break; returns the previous break.
///
/// # Errors
/// `ENOMEM`, `EINVAL` below the heap start.
pub fn sbrk(delta: i32) -> Result<*mut u8, Errno> {
    #[allow(clippy::cast_sign_loss)]
    let old = call(Sysno::Sbrk, delta as u32, 0, 0)?;
    Ok(old as usize as *mut u8)
}

/// # Errors
/// `EINVAL` for a descriptor that is not a console, `EFAULT`.
pub fn write(fd: u32, bytes: &[u8]) -> Result<usize, Errno> {
    #[allow(clippy::cast_possible_truncation)]
    let len = bytes.len() as u32;
    call(Sysno::Write, fd, addr(bytes.as_ptr()), len).map(|n| n as usize)
}

/// Return address of every signal handler: traps into `sigreturn`, which
/// restores the interrupted registers and never comes back here.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[unsafe(naked)]
pub extern "C" fn sigreturn_restorer() {
    core::arch::naked_asm!(
        "mov eax, {no}",
        "int 0x80",
        "ud2",
        no = const Sysno::SigReturn as u32,
    )
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub extern "C" fn sigreturn_restorer() {}
