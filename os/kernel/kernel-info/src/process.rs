//! # Process Limits

/// Default number of slots in the process table.
pub const MAX_PROCESSES: usize = 64;

/// Lower bound accepted for `max_procs=` on the command line.
pub const MIN_PROCESSES: usize = 4;

/// Upper bound accepted for `max_procs=` on the command line.
pub const MAX_PROCESSES_LIMIT: usize = 256;

/// Open file descriptor slots per process.
pub const MAX_FDS: usize = 16;

/// Number of signal slots; valid signal numbers are `1..NSIG`.
pub const NSIG: usize = 32;

/// Maximum length of a process name in bytes.
pub const PROCESS_NAME_LEN: usize = 16;

/// Process id of the idle process.
pub const IDLE_PID: u32 = 0;

/// Process id of init, the reparenting target.
pub const INIT_PID: u32 = 1;

/// Timer ticks a process may run before it is preempted.
pub const DEFAULT_TIME_SLICE: u32 = 5;

/// PIT interrupt frequency.
pub const TIMER_HZ: u32 = 100;

const _: () = {
    assert!(MIN_PROCESSES <= MAX_PROCESSES);
    assert!(MAX_PROCESSES <= MAX_PROCESSES_LIMIT);
    assert!(NSIG <= u32::BITS as usize);
    assert!(DEFAULT_TIME_SLICE > 0);
};
