//! Mapping of process manager errors to the error numbers user programs see.

use kernel_elf::ElfError;
use kernel_proc::ProcError;
use stdlib::syscall_abi::Errno;

/// The errno a failed system call reports for `err`.
///
/// `InitExited` never reaches user space: callers treat it as fatal before
/// asking for a number.
#[must_use]
pub const fn errno(err: ProcError) -> Errno {
    match err {
        ProcError::TableFull => Errno::EAGAIN,
        ProcError::OutOfMemory => Errno::ENOMEM,
        ProcError::NoSuchProcess => Errno::ESRCH,
        ProcError::NoChildren => Errno::ECHILD,
        ProcError::NotUserProcess | ProcError::InvalidSignal | ProcError::InvalidArgument => {
            Errno::EINVAL
        }
        ProcError::PermissionDenied | ProcError::InitExited => Errno::EPERM,
        ProcError::Interrupted => Errno::EINTR,
        ProcError::ArgumentsTooLarge => Errno::E2BIG,
        ProcError::Exec(ElfError::NotFound) => Errno::ENOENT,
        ProcError::Exec(_) => Errno::ENOEXEC,
        ProcError::Memory(_) => Errno::EFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::vmm::VmmError;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn process_errors() {
        assert_eq!(errno(ProcError::NoChildren), Errno::ECHILD);
        assert_eq!(errno(ProcError::NoSuchProcess), Errno::ESRCH);
        assert_eq!(errno(ProcError::TableFull), Errno::EAGAIN);
        assert_eq!(errno(ProcError::Interrupted), Errno::EINTR);
        assert_eq!(errno(ProcError::PermissionDenied), Errno::EPERM);
    }

    #[test]
    fn exec_errors_distinguish_missing_files() {
        assert_eq!(errno(ProcError::Exec(ElfError::NotFound)), Errno::ENOENT);
        assert_eq!(errno(ProcError::Exec(ElfError::BadMagic)), Errno::ENOEXEC);
        assert_eq!(errno(ProcError::ArgumentsTooLarge), Errno::E2BIG);
    }

    #[test]
    fn user_signal_numbers_match_the_kernel() {
        use kernel_proc::signal::Signal;
        use stdlib::syscall_abi::signo;
        assert_eq!(Signal::SIGKILL.number(), signo::SIGKILL);
        assert_eq!(Signal::SIGUSR1.number(), signo::SIGUSR1);
        assert_eq!(Signal::SIGSTOP.number(), signo::SIGSTOP);
        assert_eq!(Signal::SIGCHLD.number(), signo::SIGCHLD);
    }

    #[test]
    fn bad_user_pointers_fault() {
        let e = ProcError::from(VmmError::NotUserAddress(VirtualAddress::new(0x1000)));
        assert_eq!(errno(e), Errno::EFAULT);
        assert_eq!(errno(ProcError::from(VmmError::OutOfMemory)), Errno::ENOMEM);
    }
}
