//! # Round-Robin Scheduler
//!
//! The next process is the first one in the ready queue that is not idle;
//! idle runs only when nothing else is ready. A dispatched process gets a
//! full time slice, and the process it replaces goes to the tail of the
//! queue if it is still runnable.
//!
//! Dispatch decisions come back as a [`Switch`]. The kernel applies it in
//! this order: load `esp0` for user processes, load CR3 if the space
//! differs, then call the switch routine with `save_sp` and `to_sp`.

use crate::ProcError;
use crate::context::Trampolines;
use crate::manager::ProcessManager;
use crate::pcb::{BlockReason, Mode, Pid, ProcessState};
use kernel_info::config::KernelConfig;
use kernel_vmem::RootPage;
use log::{info, trace};

/// A context switch to perform.
#[derive(Debug)]
pub struct Switch {
    pub from: Option<Pid>,
    pub to: Pid,
    /// Where the outgoing stack pointer is stored.
    pub save_sp: *mut usize,
    /// Stack pointer of the incoming process, pointing at its saved context.
    pub to_sp: usize,
    pub space: RootPage,
    /// `esp0` for the TSS when the incoming process runs in user mode.
    pub kernel_stack_top: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub switches: u64,
    pub ticks: u64,
    pub idle_ticks: u64,
    /// Ready queue depth, idle included.
    pub ready: usize,
}

pub struct Scheduler {
    procs: ProcessManager,
    /// Stack pointer of the boot thread, saved once by the first dispatch.
    boot_sp: usize,
    time_slice: u32,
    preempt_depth: u32,
    need_resched: bool,
    started: bool,
    ticks: u64,
    idle_ticks: u64,
    switches: u64,
}

impl Scheduler {
    /// A process table sized by `config` holding only the idle process,
    /// which starts in `idle_entry`.
    ///
    /// # Errors
    /// [`ProcError::OutOfMemory`] if the table or the idle stack cannot be
    /// allocated.
    pub fn new(
        config: &KernelConfig<'_>,
        trampolines: Trampolines,
        kernel_root: RootPage,
        idle_entry: usize,
    ) -> Result<Self, ProcError> {
        let mut procs = ProcessManager::new(config.max_processes, trampolines, kernel_root)?;
        procs.install_idle(idle_entry)?;
        Ok(Self {
            procs,
            boot_sp: 0,
            time_slice: config.time_slice.max(1),
            preempt_depth: 0,
            need_resched: false,
            started: false,
            ticks: 0,
            idle_ticks: 0,
            switches: 0,
        })
    }

    #[must_use]
    pub const fn processes(&self) -> &ProcessManager {
        &self.procs
    }

    pub const fn processes_mut(&mut self) -> &mut ProcessManager {
        &mut self.procs
    }

    #[must_use]
    pub fn current(&self) -> Option<Pid> {
        self.procs.current()
    }

    /// Scheduler ticks since boot.
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// The first dispatch, away from the boot thread which is never resumed.
    ///
    /// # Panics
    /// If called twice.
    pub fn start(&mut self) -> Switch {
        assert!(!self.started, "scheduler started twice");
        self.started = true;
        let next = self.pick_next();
        let switch = self.dispatch(None, next);
        info!("scheduler started with {}", switch.to);
        switch
    }

    /// Timer tick: account, wake sleepers and preempt an exhausted slice.
    pub fn tick(&mut self) -> Option<Switch> {
        self.ticks += 1;
        self.wake_sleepers();

        let cur = self.procs.table().current()?;
        let table = self.procs.table_mut();
        let pcb = table.slot_mut(cur);
        if pcb.pid == Pid::IDLE {
            self.idle_ticks += 1;
            if self.non_idle_ready() {
                self.need_resched = true;
            }
        } else {
            pcb.ticks += 1;
            pcb.time_slice = pcb.time_slice.saturating_sub(1);
            if pcb.time_slice == 0 {
                self.need_resched = true;
            }
        }

        if self.preempt_depth > 0 || !self.need_resched {
            return None;
        }
        self.reschedule()
    }

    /// Give up the rest of the time slice.
    pub fn yield_now(&mut self) -> Option<Switch> {
        self.reschedule()
    }

    /// Pick the next process. `None` if the current one keeps running.
    ///
    /// A running current process goes to the back of the ready queue first;
    /// a blocked or exited one does not. A kernel thread takes its pending
    /// kill or stop here.
    pub fn reschedule(&mut self) -> Option<Switch> {
        self.need_resched = false;
        let prev = self.procs.table().current();
        if let Some(p) = prev
            && self.procs.table().slot(p).state == ProcessState::Running
        {
            self.procs.deliver_to_kernel_thread(p);
        }
        let table = self.procs.table_mut();
        if let Some(p) = prev {
            table.set_current(None);
            if table.slot(p).state == ProcessState::Running {
                table.push_ready(p);
            }
        }

        let next = self.pick_next();
        if Some(next) == prev {
            let table = self.procs.table_mut();
            table.remove_ready(next);
            table.set_current(Some(next));
            let pcb = table.slot_mut(next);
            pcb.state = ProcessState::Running;
            pcb.time_slice = self.time_slice;
            return None;
        }
        Some(self.dispatch(prev, next))
    }

    /// Block the running process and switch away.
    ///
    /// # Errors
    /// [`ProcError::NoSuchProcess`] before the scheduler runs, or any error
    /// of [`ProcessManager::block`].
    pub fn block_current(&mut self, reason: BlockReason) -> Result<Option<Switch>, ProcError> {
        let pid = self.current().ok_or(ProcError::NoSuchProcess)?;
        self.procs.block(pid, reason)?;
        Ok(self.reschedule())
    }

    /// Put the running process to sleep for `ticks` timer ticks.
    ///
    /// # Errors
    /// [`ProcError::Interrupted`] without sleeping if a signal is already
    /// pending, otherwise as [`block_current`](Self::block_current).
    pub fn sleep_current(&mut self, ticks: u64) -> Result<Option<Switch>, ProcError> {
        let pid = self.current().ok_or(ProcError::NoSuchProcess)?;
        if ticks == 0 {
            return Ok(self.yield_now());
        }
        if self.procs.get(pid).is_some_and(|p| p.signals.has_actionable()) {
            return Err(ProcError::Interrupted);
        }
        let until = self.ticks.saturating_add(ticks);
        self.block_current(BlockReason::Sleep { until })
    }

    /// Suspend preemption; nests.
    pub const fn preempt_disable(&mut self) {
        self.preempt_depth += 1;
    }

    /// Resume preemption, dispatching if a slice ran out meanwhile.
    pub fn preempt_enable(&mut self) -> Option<Switch> {
        debug_assert!(self.preempt_depth > 0, "unbalanced preempt_enable");
        self.preempt_depth = self.preempt_depth.saturating_sub(1);
        if self.preempt_depth == 0 && self.need_resched && self.started {
            self.reschedule()
        } else {
            None
        }
    }

    #[must_use]
    pub const fn preemption_enabled(&self) -> bool {
        self.preempt_depth == 0
    }

    #[must_use]
    pub const fn stats(&self) -> SchedStats {
        SchedStats {
            switches: self.switches,
            ticks: self.ticks,
            idle_ticks: self.idle_ticks,
            ready: self.procs.table().ready_len(),
        }
    }

    fn non_idle_ready(&self) -> bool {
        let table = self.procs.table();
        table.ready().any(|i| table.slot(i).pid != Pid::IDLE)
    }

    fn wake_sleepers(&mut self) {
        let now = self.ticks;
        for idx in 0..self.procs.table().capacity() {
            if let ProcessState::Blocked(BlockReason::Sleep { until }) =
                self.procs.table().slot(idx).state
                && until <= now
            {
                self.procs.make_ready(idx);
            }
        }
    }

    /// First non-idle process in the ready queue, else idle.
    fn pick_next(&self) -> usize {
        let table = self.procs.table();
        let mut idle = None;
        for idx in table.ready() {
            if table.slot(idx).pid == Pid::IDLE {
                idle = Some(idx);
            } else {
                return idx;
            }
        }
        match idle {
            Some(idx) => idx,
            None => panic!("nothing to run: idle process is missing from the ready queue"),
        }
    }

    fn dispatch(&mut self, prev: Option<usize>, next: usize) -> Switch {
        let kernel_root = self.procs.kernel_root();
        let time_slice = self.time_slice;
        let table = self.procs.table_mut();
        table.remove_ready(next);
        table.set_current(Some(next));

        let from = prev.map(|p| table.slot(p).pid);
        let save_sp = match prev {
            Some(p) => &raw mut table.slot_mut(p).context_sp,
            None => &raw mut self.boot_sp,
        };

        let pcb = table.slot_mut(next);
        pcb.state = ProcessState::Running;
        pcb.time_slice = time_slice;
        self.switches += 1;
        trace!("switch {from:?} -> {}", pcb.pid);

        Switch {
            from,
            to: pcb.pid,
            save_sp,
            to_sp: pcb.context_sp,
            space: pcb.space.unwrap_or(kernel_root),
            kernel_stack_top: if pcb.mode == Mode::User {
                pcb.kernel_stack_top()
            } else {
                None
            },
        }
    }
}
