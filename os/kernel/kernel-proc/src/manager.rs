//! # Process Manager
//!
//! Creation, `fork`, `exit`, `wait` and blocking. Every operation checks its
//! preconditions and acquires every resource before it touches the table, so
//! a failure never leaves a half-built process behind.

mod exec;
mod memory;
mod signals;

pub use exec::ARG_MAX;
pub use signals::Delivery;

use crate::ProcError;
use crate::context::{Context, ContextBuilder, KernelStack, Trampolines, TrapFrame};
use crate::fd::FdTable;
use crate::pcb::{
    BlockReason, Credentials, DEFAULT_PRIORITY, IDLE_PRIORITY, Mode, Pcb, Pid, ProcessState,
    UserLayout,
};
use crate::signal::{Signal, SignalState};
use crate::table::ProcessTable;
use kernel_alloc::vmm::Vmm;
use kernel_elf::{FileSource, LoadedImage};
use kernel_info::memory::KERNEL_STACK_SIZE;
use kernel_vmem::{FrameAlloc, PhysMapper, RootPage};
use log::{debug, info};

/// Result of [`ProcessManager::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A zombie child was found and released.
    Reaped { pid: Pid, status: i32 },
    /// The caller is now blocked; reschedule and call `wait` again once
    /// woken.
    Blocked,
}

/// Everything a slot needs besides its id and stack.
struct Admission<'n> {
    name: &'n str,
    parent: Pid,
    creds: Credentials,
    mode: Mode,
    space: RootPage,
    user: Option<UserLayout>,
    fds: FdTable,
    signals: SignalState,
    priority: u8,
}

pub struct ProcessManager {
    table: ProcessTable,
    trampolines: Trampolines,
    kernel_root: RootPage,
    session: Credentials,
}

impl ProcessManager {
    /// An empty table of `capacity` slots.
    ///
    /// # Errors
    /// [`ProcError::OutOfMemory`] if the table cannot be allocated.
    pub fn new(
        capacity: usize,
        trampolines: Trampolines,
        kernel_root: RootPage,
    ) -> Result<Self, ProcError> {
        Ok(Self {
            table: ProcessTable::new(capacity)?,
            trampolines,
            kernel_root,
            session: Credentials::ROOT,
        })
    }

    #[must_use]
    pub const fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub(crate) const fn table_mut(&mut self) -> &mut ProcessTable {
        &mut self.table
    }

    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    /// Credentials for processes created without a creator.
    pub const fn set_session(&mut self, creds: Credentials) {
        self.session = creds;
    }

    #[must_use]
    pub fn current(&self) -> Option<Pid> {
        self.table.current_pid()
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.table.get(pid)
    }

    #[must_use]
    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.table.get(pid).map(|p| p.state)
    }

    #[must_use]
    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.table.get(pid).map(|p| p.parent)
    }

    /// Place the idle process into the table. It is ready but never picked
    /// while anything else is.
    pub(crate) fn install_idle(&mut self, entry: usize) -> Result<(), ProcError> {
        let idx = self.table.find_free().ok_or(ProcError::TableFull)?;
        let mut stack = KernelStack::new(KERNEL_STACK_SIZE).ok_or(ProcError::OutOfMemory)?;
        let sp = ContextBuilder::new(&mut stack)
            .finish(Context::kernel_thread(&self.trampolines, entry, 0));
        self.admit(
            idx,
            Pid::IDLE,
            stack,
            sp,
            Admission {
                name: "idle",
                parent: Pid::IDLE,
                creds: Credentials::ROOT,
                mode: Mode::Kernel,
                space: self.kernel_root,
                user: None,
                fds: FdTable::default(),
                signals: SignalState::new(),
                priority: IDLE_PRIORITY,
            },
        );
        Ok(())
    }

    /// Create a kernel thread that starts in `entry(arg)` on the kernel
    /// address space.
    ///
    /// # Errors
    /// [`ProcError::TableFull`] or [`ProcError::OutOfMemory`] for the stack.
    pub fn create_kernel(
        &mut self,
        creator: Option<Pid>,
        name: &str,
        entry: usize,
        arg: usize,
    ) -> Result<Pid, ProcError> {
        let creds = self.creator_credentials(creator)?;
        let idx = self.table.find_free().ok_or(ProcError::TableFull)?;
        let mut stack = KernelStack::new(KERNEL_STACK_SIZE).ok_or(ProcError::OutOfMemory)?;
        let sp = ContextBuilder::new(&mut stack)
            .finish(Context::kernel_thread(&self.trampolines, entry, arg));

        let pid = self.table.allocate_pid();
        self.admit(
            idx,
            pid,
            stack,
            sp,
            Admission {
                name,
                parent: Self::parent_for(pid, creator),
                creds,
                mode: Mode::Kernel,
                space: self.kernel_root,
                user: None,
                fds: FdTable::with_console(),
                signals: SignalState::new(),
                priority: DEFAULT_PRIORITY,
            },
        );
        info!("created kernel thread {pid} ({name})");
        Ok(pid)
    }

    /// Create a user process from a loaded address space.
    ///
    /// `space` must hold the image described by `image`. A user stack with
    /// `argv` is added and the first dispatch enters user mode at the image
    /// entry. `space` is taken over: on failure it is destroyed.
    ///
    /// # Errors
    /// [`ProcError::TableFull`], [`ProcError::OutOfMemory`] or
    /// [`ProcError::ArgumentsTooLarge`].
    pub fn create_user<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        creator: Option<Pid>,
        name: &str,
        space: RootPage,
        image: LoadedImage,
        argv: &[&[u8]],
    ) -> Result<Pid, ProcError> {
        match self.try_create_user(vmm, creator, name, space, image, argv) {
            Ok(pid) => Ok(pid),
            Err(e) => {
                vmm.destroy_space(space);
                Err(e)
            }
        }
    }

    fn try_create_user<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        creator: Option<Pid>,
        name: &str,
        space: RootPage,
        image: LoadedImage,
        argv: &[&[u8]],
    ) -> Result<Pid, ProcError> {
        let creds = self.creator_credentials(creator)?;
        let idx = self.table.find_free().ok_or(ProcError::TableFull)?;
        let mut stack = KernelStack::new(KERNEL_STACK_SIZE).ok_or(ProcError::OutOfMemory)?;
        let (layout, sp) = exec::setup_user_stack(vmm, space, image, argv)?;

        let frame = TrapFrame::user(layout.entry, sp);
        let ksp = ContextBuilder::new(&mut stack)
            .trap_frame(&frame)
            .finish(Context::trap_return(&self.trampolines));

        let pid = self.table.allocate_pid();
        self.admit(
            idx,
            pid,
            stack,
            ksp,
            Admission {
                name,
                parent: Self::parent_for(pid, creator),
                creds,
                mode: Mode::User,
                space,
                user: Some(layout),
                fds: FdTable::with_console(),
                signals: SignalState::new(),
                priority: DEFAULT_PRIORITY,
            },
        );
        info!("created user process {pid} ({name}), entry {}", layout.entry);
        Ok(pid)
    }

    /// Load the executable at `path` into a fresh address space and create
    /// a user process running it.
    ///
    /// # Errors
    /// [`ProcError::Exec`] for a missing or malformed image, otherwise as
    /// [`create_user`](Self::create_user).
    pub fn spawn<M: PhysMapper, A: FrameAlloc, F: FileSource + ?Sized>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        files: &F,
        creator: Option<Pid>,
        path: &str,
        argv: &[&[u8]],
    ) -> Result<Pid, ProcError> {
        let space = vmm.create_user_space()?;
        let image = match kernel_elf::load_path(vmm, space, files, path) {
            Ok(image) => image,
            Err(e) => {
                vmm.destroy_space(space);
                return Err(e.into());
            }
        };
        self.create_user(vmm, creator, exec::file_name(path), space, image, argv)
    }

    /// Duplicate the user process `caller`, which entered the kernel with
    /// `frame`. The child resumes from the same frame with `eax = 0`; the
    /// caller should return the child's id.
    ///
    /// # Errors
    /// [`ProcError::NotUserProcess`] for kernel threads,
    /// [`ProcError::TableFull`] or [`ProcError::OutOfMemory`].
    pub fn fork<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        caller: Pid,
        frame: &TrapFrame,
    ) -> Result<Pid, ProcError> {
        let parent_idx = self.live_index(caller)?;
        let parent = self.table.slot(parent_idx);
        if parent.mode != Mode::User {
            return Err(ProcError::NotUserProcess);
        }
        let parent_space = parent.space.ok_or(ProcError::NotUserProcess)?;

        let idx = self.table.find_free().ok_or(ProcError::TableFull)?;
        let mut stack = KernelStack::new(KERNEL_STACK_SIZE).ok_or(ProcError::OutOfMemory)?;
        let space = vmm.clone_space(parent_space)?;

        let mut child_frame = *frame;
        child_frame.eax = 0;
        let sp = ContextBuilder::new(&mut stack)
            .trap_frame(&child_frame)
            .finish(Context::trap_return(&self.trampolines));

        let parent = self.table.slot(parent_idx);
        let name = parent.name;
        let mut signals = parent.signals;
        signals.pending = crate::signal::SignalSet::EMPTY;
        let admission = Admission {
            name: name.as_str(),
            parent: caller,
            creds: parent.creds,
            mode: Mode::User,
            space,
            user: parent.user,
            fds: parent.fds,
            signals,
            priority: parent.priority,
        };

        let pid = self.table.allocate_pid();
        self.admit(idx, pid, stack, sp, admission);
        debug!("fork: {caller} -> {pid}");
        Ok(pid)
    }

    /// Turn `pid` into a zombie with `status`.
    ///
    /// Its children go to init, a parent waiting for it becomes ready and
    /// receives `SIGCHLD`. Address space and kernel stack stay until the
    /// zombie is reaped. If `pid` is running, the caller must reschedule.
    ///
    /// # Errors
    /// [`ProcError::InitExited`] for init, which is fatal,
    /// [`ProcError::PermissionDenied`] for the idle process,
    /// [`ProcError::NoSuchProcess`] if `pid` is not live.
    pub fn exit(&mut self, pid: Pid, status: i32) -> Result<(), ProcError> {
        if pid == Pid::IDLE {
            return Err(ProcError::PermissionDenied);
        }
        if pid == Pid::INIT {
            return Err(ProcError::InitExited);
        }
        let idx = self.live_index(pid)?;
        self.terminate_slot(idx, status);
        Ok(())
    }

    fn terminate_slot(&mut self, idx: usize, status: i32) {
        self.table.remove_ready(idx);
        let pcb = self.table.slot_mut(idx);
        let pid = pcb.pid;
        let parent = pcb.parent;
        pcb.fds.close_all();
        pcb.exit_status = status;
        pcb.state = ProcessState::Zombie;
        pcb.interrupted = false;
        info!("process {pid} ({}) exited with {status}", pcb.name);

        let mut orphaned_zombie = None;
        for i in 0..self.table.capacity() {
            let child = self.table.slot_mut(i);
            if child.state != ProcessState::Unused && child.parent == pid && child.pid != pid {
                child.parent = Pid::INIT;
                if child.state == ProcessState::Zombie {
                    orphaned_zombie = Some(child.pid);
                }
                debug!("reparented {} to init", child.pid);
            }
        }
        if let Some(zombie) = orphaned_zombie {
            self.wake_waiter(Pid::INIT, zombie);
        }

        if let Some(pidx) = self.table.index_of(parent)
            && self.table.slot(pidx).state.is_live()
        {
            self.post(pidx, Signal::SIGCHLD);
            self.wake_waiter(parent, pid);
        }
    }

    /// Reap a zombie child of `caller`, any child for `target == None`.
    ///
    /// With live children but no zombie among them the caller is blocked
    /// and [`WaitOutcome::Blocked`] returned.
    ///
    /// # Errors
    /// [`ProcError::NoChildren`] immediately if there is no matching child,
    /// [`ProcError::Interrupted`] if a signal ended or would end the wait.
    pub fn wait<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &mut Vmm<M, A>,
        caller: Pid,
        target: Option<Pid>,
    ) -> Result<WaitOutcome, ProcError> {
        let idx = self.live_index(caller)?;

        let mut any = false;
        let mut zombie = None;
        for c in self.table.children(caller) {
            let child = self.table.slot(c);
            if target.is_some_and(|t| t != child.pid) {
                continue;
            }
            any = true;
            if child.state == ProcessState::Zombie {
                zombie = Some(c);
                break;
            }
        }

        if let Some(c) = zombie {
            // A signal that woke this wait is done with once a child is reaped.
            self.table.slot_mut(idx).interrupted = false;
            let (pid, status) = self.reap(vmm, c);
            return Ok(WaitOutcome::Reaped { pid, status });
        }
        if !any {
            return Err(ProcError::NoChildren);
        }

        let pcb = self.table.slot_mut(idx);
        if core::mem::take(&mut pcb.interrupted) || pcb.signals.has_actionable() {
            return Err(ProcError::Interrupted);
        }
        self.block_slot(idx, BlockReason::WaitChild(target));
        Ok(WaitOutcome::Blocked)
    }

    /// Release a zombie's slot, kernel stack and address space.
    fn reap<M: PhysMapper, A: FrameAlloc>(&mut self, vmm: &mut Vmm<M, A>, idx: usize) -> (Pid, i32) {
        debug_assert_eq!(self.table.slot(idx).state, ProcessState::Zombie);
        let pcb = self.table.release(idx);
        if pcb.mode == Mode::User
            && let Some(space) = pcb.space
        {
            vmm.destroy_space(space);
        }
        debug!("reaped {} with status {}", pcb.pid, pcb.exit_status);
        (pcb.pid, pcb.exit_status)
    }

    /// Block `pid` for `reason`.
    ///
    /// # Errors
    /// [`ProcError::PermissionDenied`] for the idle process,
    /// [`ProcError::NoSuchProcess`] if `pid` is not live.
    pub fn block(&mut self, pid: Pid, reason: BlockReason) -> Result<(), ProcError> {
        if pid == Pid::IDLE {
            return Err(ProcError::PermissionDenied);
        }
        let idx = self.live_index(pid)?;
        self.block_slot(idx, reason);
        Ok(())
    }

    fn block_slot(&mut self, idx: usize, reason: BlockReason) {
        self.table.remove_ready(idx);
        let pcb = self.table.slot_mut(idx);
        pcb.interrupted = false;
        pcb.state = ProcessState::Blocked(reason);
    }

    /// Make a blocked `pid` runnable; `false` if it was not blocked.
    pub fn wake(&mut self, pid: Pid) -> bool {
        self.table.index_of(pid).is_some_and(|idx| self.make_ready(idx))
    }

    /// Whether a signal cut the last block of `pid` short. Clears the flag.
    pub fn take_interrupted(&mut self, pid: Pid) -> bool {
        self.table
            .get_mut(pid)
            .is_some_and(|p| core::mem::take(&mut p.interrupted))
    }

    pub(crate) fn make_ready(&mut self, idx: usize) -> bool {
        if !matches!(self.table.slot(idx).state, ProcessState::Blocked(_)) {
            return false;
        }
        if self.table.current() == Some(idx) {
            // Blocked but not switched away from yet.
            self.table.slot_mut(idx).state = ProcessState::Running;
        } else {
            self.table.push_ready(idx);
        }
        true
    }

    /// Wake `waiter` if it waits for `child` or for any child.
    fn wake_waiter(&mut self, waiter: Pid, child: Pid) {
        let Some(idx) = self.table.index_of(waiter) else {
            return;
        };
        if let ProcessState::Blocked(BlockReason::WaitChild(target)) = self.table.slot(idx).state
            && target.is_none_or(|t| t == child)
        {
            self.make_ready(idx);
        }
    }

    fn live_index(&self, pid: Pid) -> Result<usize, ProcError> {
        self.table
            .index_of(pid)
            .filter(|&i| self.table.slot(i).state.is_live())
            .ok_or(ProcError::NoSuchProcess)
    }

    fn creator_credentials(&self, creator: Option<Pid>) -> Result<Credentials, ProcError> {
        match creator {
            Some(pid) => Ok(self.table.slot(self.live_index(pid)?).creds),
            None => Ok(self.session),
        }
    }

    /// Init's parent is idle; processes without a creator belong to init.
    fn parent_for(pid: Pid, creator: Option<Pid>) -> Pid {
        match creator {
            Some(c) => c,
            None if pid == Pid::INIT => Pid::IDLE,
            None => Pid::INIT,
        }
    }

    fn admit(&mut self, idx: usize, pid: Pid, stack: KernelStack, sp: usize, a: Admission<'_>) {
        let pcb = self.table.slot_mut(idx);
        *pcb = Pcb {
            pid,
            parent: a.parent,
            state: ProcessState::Created,
            mode: a.mode,
            creds: a.creds,
            context_sp: sp,
            kernel_stack: Some(stack),
            space: Some(a.space),
            user: a.user,
            fds: a.fds,
            signals: a.signals,
            priority: a.priority,
            ..Pcb::default()
        };
        pcb.set_name(a.name);
        self.table.push_ready(idx);
    }
}
