//! # Processes and Scheduling
//!
//! The process table, the operations that move processes through their
//! life cycle and the round-robin scheduler that picks who runs.
//!
//! ```text
//! Scheduler ──owns──▶ ProcessManager ──owns──▶ ProcessTable ──▶ [Pcb; N]
//!     │                    │                                    │
//!     │ Switch             │ &mut Vmm (address spaces, frames)  └─ ready queue
//!     ▼                    ▼                                       by slot index
//!  kernel: TSS, CR3, switch_context
//! ```
//!
//! Nothing in this crate switches stacks. A dispatch decision comes back as
//! a [`Switch`] and the kernel performs it after releasing its state lock,
//! with interrupts still masked. New processes get a hand-built
//! [`Context`](context::Context) record on their kernel stack so that the
//! first switch to them looks like any other.
//!
//! User processes each own a private page directory; kernel threads run on
//! the shared kernel directory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod context;
pub mod fd;
mod manager;
pub mod pcb;
mod scheduler;
pub mod signal;
pub mod table;

pub use manager::{ARG_MAX, Delivery, ProcessManager, WaitOutcome};
pub use pcb::{BlockReason, Credentials, Mode, Pcb, Pid, ProcessState};
pub use scheduler::{SchedStats, Scheduler, Switch};

use kernel_alloc::vmm::VmmError;
use kernel_elf::ElfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProcError {
    #[error("process table is full")]
    TableFull,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such process")]
    NoSuchProcess,
    #[error("no children to wait for")]
    NoChildren,
    #[error("not a user process")]
    NotUserProcess,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid signal")]
    InvalidSignal,
    #[error("interrupted by a signal")]
    Interrupted,
    #[error("init exited")]
    InitExited,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("argument list too long")]
    ArgumentsTooLarge,
    #[error("exec failed: {0}")]
    Exec(ElfError),
    #[error("memory: {0}")]
    Memory(VmmError),
}

impl From<VmmError> for ProcError {
    fn from(value: VmmError) -> Self {
        match value {
            VmmError::OutOfMemory => Self::OutOfMemory,
            other => Self::Memory(other),
        }
    }
}

impl From<ElfError> for ProcError {
    fn from(value: ElfError) -> Self {
        match value {
            ElfError::Map(e) => e.into(),
            other => Self::Exec(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_reported_uniformly() {
        assert_eq!(ProcError::from(VmmError::OutOfMemory), ProcError::OutOfMemory);
        assert_eq!(
            ProcError::from(ElfError::Map(VmmError::OutOfMemory)),
            ProcError::OutOfMemory
        );
        assert_eq!(ProcError::from(ElfError::BadMagic), ProcError::Exec(ElfError::BadMagic));
    }
}
