//! # System call ABI
//!
//! System calls enter the kernel through `int 0x80`:
//!
//! | register | on entry           | on return        |
//! |----------|--------------------|------------------|
//! | `eax`    | [`Sysno`]          | result           |
//! | `ebx`    | first argument     | preserved        |
//! | `ecx`    | second argument    | preserved        |
//! | `edx`    | third argument     | preserved        |
//!
//! A result in `[-4095, -1]` (as `i32`) is a negated [`Errno`]; anything
//! else is the successful value.

use core::fmt;

/// The software interrupt vector of the system call gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// `signal` handler value restoring the default action.
pub const SIG_DFL: u32 = 0;

/// `signal` handler value ignoring the signal.
pub const SIG_IGN: u32 = 1;

/// `wait` target meaning "any child".
pub const WAIT_ANY: u32 = u32::MAX;

/// Signal numbers, as in the i386 Linux ABI.
pub mod signo {
    pub const SIGHUP: u32 = 1;
    pub const SIGINT: u32 = 2;
    pub const SIGKILL: u32 = 9;
    pub const SIGUSR1: u32 = 10;
    pub const SIGSEGV: u32 = 11;
    pub const SIGUSR2: u32 = 12;
    pub const SIGTERM: u32 = 15;
    pub const SIGCHLD: u32 = 17;
    pub const SIGCONT: u32 = 18;
    pub const SIGSTOP: u32 = 19;

    /// Mask bit of `sig` for `sigprocmask`: bit `n` is signal `n`.
    #[must_use]
    pub const fn mask(sig: u32) -> u32 {
        1 << sig
    }
}

/// Largest magnitude of an error result.
const MAX_ERRNO: u32 = 4095;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sysno {
    /// `exit(status)`; does not return.
    Exit = 1,
    /// `fork()`: the child's id in the parent, `0` in the child.
    Fork = 2,
    /// `exec(path, argv)`: `argv` is a null-terminated array of C strings
    /// and may itself be null.
    Exec = 3,
    /// `wait(pid, status_ptr)`: `pid` is [`WAIT_ANY`] or a child id;
    /// `status_ptr` may be null.
    Wait = 4,
    Yield = 5,
    /// `sleep(ticks)`
    Sleep = 6,
    GetPid = 7,
    GetPpid = 8,
    /// `kill(pid, signo)`
    Kill = 9,
    /// `signal(signo, handler, restorer)`: returns the previous handler.
    Signal = 10,
    /// Issued by the restorer when a signal handler returns.
    SigReturn = 11,
    /// `sbrk(delta)`: returns the previous break.
    Sbrk = 12,
    /// `write(fd, buf, len)`
    Write = 13,
    /// `sigprocmask(mask)`: returns the previous mask.
    SigProcMask = 14,
}

impl Sysno {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Exit,
            2 => Self::Fork,
            3 => Self::Exec,
            4 => Self::Wait,
            5 => Self::Yield,
            6 => Self::Sleep,
            7 => Self::GetPid,
            8 => Self::GetPpid,
            9 => Self::Kill,
            10 => Self::Signal,
            11 => Self::SigReturn,
            12 => Self::Sbrk,
            13 => Self::Write,
            14 => Self::SigProcMask,
            _ => return None,
        })
    }
}

/// Error numbers, with the values of the i386 Linux ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    E2BIG = 7,
    ENOEXEC = 8,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EFAULT = 14,
    EINVAL = 22,
    ENOSYS = 38,
}

impl Errno {
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => Self::EPERM,
            2 => Self::ENOENT,
            3 => Self::ESRCH,
            4 => Self::EINTR,
            7 => Self::E2BIG,
            8 => Self::ENOEXEC,
            10 => Self::ECHILD,
            11 => Self::EAGAIN,
            12 => Self::ENOMEM,
            14 => Self::EFAULT,
            22 => Self::EINVAL,
            38 => Self::ENOSYS,
            _ => return None,
        })
    }

    /// The value placed in `eax`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_return(self) -> u32 {
        (-(self as i32)) as u32
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::EPERM => "operation not permitted",
            Self::ENOENT => "no such file",
            Self::ESRCH => "no such process",
            Self::EINTR => "interrupted system call",
            Self::E2BIG => "argument list too long",
            Self::ENOEXEC => "exec format error",
            Self::ECHILD => "no child processes",
            Self::EAGAIN => "resource temporarily unavailable",
            Self::ENOMEM => "out of memory",
            Self::EFAULT => "bad address",
            Self::EINVAL => "invalid argument",
            Self::ENOSYS => "function not implemented",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Split a raw `eax` result into value or error.
///
/// Unknown error numbers in the error range come back as [`Errno::EINVAL`].
///
/// # Errors
/// The decoded [`Errno`] for a result in the error range.
#[allow(clippy::cast_possible_wrap)]
pub const fn decode(ret: u32) -> Result<u32, Errno> {
    if ret > u32::MAX - MAX_ERRNO {
        let raw = -(ret as i32);
        match Errno::from_raw(raw) {
            Some(e) => Err(e),
            None => Err(Errno::EINVAL),
        }
    } else {
        Ok(ret)
    }
}

/// Encode a handler result for `eax`.
#[must_use]
pub const fn encode(result: Result<u32, Errno>) -> u32 {
    match result {
        Ok(v) => v,
        Err(e) => e.to_return(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_travel_as_negative_numbers() {
        assert_eq!(Errno::ECHILD.to_return() as i32, -10);
        assert_eq!(decode(Errno::ESRCH.to_return()), Err(Errno::ESRCH));
        assert_eq!(decode(encode(Err(Errno::ENOMEM))), Err(Errno::ENOMEM));
        assert_eq!(decode((-4000i32) as u32), Err(Errno::EINVAL));
    }

    #[test]
    fn signal_masks_use_the_signal_number_as_bit() {
        assert_eq!(signo::mask(signo::SIGUSR1), 1 << 10);
        assert_eq!(signo::mask(signo::SIGHUP), 0b10);
    }

    #[test]
    fn large_addresses_are_values() {
        // A break or pointer above 2 GiB is still a success.
        assert_eq!(decode(0xBFFF_0000), Ok(0xBFFF_0000));
        assert_eq!(decode(u32::MAX - 4095), Ok(u32::MAX - 4095));
    }

    #[test]
    fn numbers_are_stable() {
        for raw in 1..=14 {
            assert_eq!(Sysno::from_raw(raw).map(|s| s as u32), Some(raw));
        }
        assert_eq!(Sysno::from_raw(0), None);
        assert_eq!(Sysno::from_raw(15), None);
    }
}
