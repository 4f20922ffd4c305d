//! # Process Control Block

use crate::context::KernelStack;
use crate::fd::FdTable;
use crate::signal::SignalState;
use arrayvec::ArrayString;
use core::fmt;
use kernel_info::process::{IDLE_PID, INIT_PID, PROCESS_NAME_LEN};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::RootPage;

/// Priority of ordinary processes; inherited across `fork`.
pub const DEFAULT_PRIORITY: u8 = 128;

/// The idle process alone runs at the lowest priority.
pub const IDLE_PRIORITY: u8 = 0;

/// Process identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const IDLE: Self = Self(IDLE_PID);
    pub const INIT: Self = Self(INIT_PID);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Why a process is not runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// In `wait`, for any child (`None`) or a specific one.
    WaitChild(Option<Pid>),
    /// Until the scheduler tick reaches `until`.
    Sleep { until: u64 },
    /// By `SIGSTOP`, until `SIGCONT`.
    Stopped,
    /// By a kernel component, until it calls `wake`.
    Explicit,
}

impl BlockReason {
    /// Whether a deliverable signal ends the block early.
    #[must_use]
    pub const fn is_interruptible(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Lifecycle state.
///
/// ```text
/// Unused -> Created -> Ready <-> Running -> Zombie -> Unused
///                        ^         |
///                        +- Blocked <+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Unused,
    Created,
    Ready,
    Running,
    Blocked(BlockReason),
    Zombie,
}

impl ProcessState {
    /// Neither unused nor a zombie.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Unused | Self::Zombie)
    }
}

/// Privilege level the process returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const ROOT: Self = Self { uid: 0, gid: 0 };

    /// Root may signal anyone; everyone else only processes of the same uid.
    #[must_use]
    pub const fn may_signal(self, target: Self) -> bool {
        self.uid == 0 || self.uid == target.uid
    }
}

/// User memory bookkeeping of a user process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLayout {
    pub entry: VirtualAddress,
    pub stack_top: VirtualAddress,
    pub stack_bottom: VirtualAddress,
    /// First byte of the heap, the page boundary above the image.
    pub brk_start: VirtualAddress,
    /// Current program break.
    pub brk: VirtualAddress,
}

/// One slot of the process table.
#[derive(Default)]
pub struct Pcb {
    pub pid: Pid,
    pub parent: Pid,
    pub name: ArrayString<PROCESS_NAME_LEN>,
    pub state: ProcessState,
    pub mode: Mode,
    pub creds: Credentials,

    /// Saved kernel stack pointer; a [`Context`](crate::context::Context)
    /// record sits at this address while the process is switched out.
    pub context_sp: usize,
    pub kernel_stack: Option<KernelStack>,
    pub space: Option<RootPage>,
    pub user: Option<UserLayout>,

    pub fds: FdTable,
    pub signals: SignalState,
    /// Set when a signal ended a block early.
    pub interrupted: bool,

    pub priority: u8,
    pub time_slice: u32,
    pub ticks: u64,
    pub exit_status: i32,

    // Ready queue links, as slot indices.
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
    pub(crate) queued: bool,
}

impl Default for Pid {
    fn default() -> Self {
        Self::IDLE
    }
}

impl Pcb {
    /// Copy `name`, cut at a character boundary if it is too long.
    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        let mut end = name.len().min(PROCESS_NAME_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name.push_str(&name[..end]);
    }

    /// Whether any ready queue, blocked or zombie linkage is left.
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.queued || self.prev.is_some() || self.next.is_some()
    }

    /// Top of the kernel stack, for the TSS of user processes.
    #[must_use]
    pub fn kernel_stack_top(&self) -> Option<usize> {
        self.kernel_stack.as_ref().map(KernelStack::top)
    }
}

impl fmt::Debug for Pcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pcb")
            .field("pid", &self.pid)
            .field("parent", &self.parent)
            .field("name", &self.name.as_str())
            .field("state", &self.state)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_are_cut() {
        let mut pcb = Pcb::default();
        pcb.set_name("a-very-long-process-name");
        assert_eq!(pcb.name.as_str(), "a-very-long-proc");
        pcb.set_name("ääääääääää");
        assert_eq!(pcb.name.len(), 16);
    }

    #[test]
    fn default_slot_is_unused_and_unlinked() {
        let pcb = Pcb::default();
        assert_eq!(pcb.state, ProcessState::Unused);
        assert!(!pcb.is_linked());
        assert!(!pcb.state.is_live());
    }

    #[test]
    fn only_root_crosses_uids() {
        let alice = Credentials { uid: 1000, gid: 100 };
        let bob = Credentials { uid: 1001, gid: 100 };
        assert!(Credentials::ROOT.may_signal(alice));
        assert!(alice.may_signal(alice));
        assert!(!alice.may_signal(bob));
    }
}
