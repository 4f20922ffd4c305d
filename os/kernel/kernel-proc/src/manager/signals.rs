//! Sending, delivering and returning from signals.
//!
//! A caught signal is delivered on the way back to user mode by pushing a
//! frame onto the user stack and redirecting the trap frame to the handler:
//!
//! ```text
//!  sp + 0   restorer      return address of the handler
//!  sp + 4   signo         the handler's argument
//!  sp + 8   blocked mask  before delivery
//!  sp + 12  TrapFrame     interrupted user registers
//! ```
//!
//! The restorer issues `sigreturn`, which finds the frame 4 bytes above its
//! stack pointer (the handler's `ret` popped the return address).

use super::ProcessManager;
use crate::ProcError;
use crate::context::TrapFrame;
use crate::pcb::{BlockReason, Credentials, Mode, Pid, ProcessState};
use crate::signal::{Disposition, SigAction, Signal, SignalSet};
use kernel_alloc::vmm::Vmm;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::debug;

const SIGNAL_FRAME_BYTES: usize = 12 + TrapFrame::BYTES;

/// What `sigreturn` reads back: the blocked mask and the saved registers.
const SIGRETURN_BYTES: usize = 4 + TrapFrame::BYTES;

/// What happened on the way back to user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing to deliver.
    None,
    /// The trap frame now enters the handler for this signal.
    Handled(Signal),
    /// The process is a zombie now; reschedule.
    Terminated(Signal),
    /// The process is stopped; reschedule.
    Stopped(Signal),
}

impl ProcessManager {
    /// Send signal `signo` to `target`. `sender` is `None` for the kernel.
    ///
    /// Signal `0` only checks that `target` exists and may be signalled.
    /// A terminating signal kills a process that is not running right away;
    /// the running process sees it on its way back to user mode.
    ///
    /// # Errors
    /// [`ProcError::InvalidSignal`], [`ProcError::NoSuchProcess`], or
    /// [`ProcError::PermissionDenied`] for the idle process or a process of
    /// another user.
    pub fn kill(&mut self, sender: Option<Pid>, target: Pid, signo: u32) -> Result<(), ProcError> {
        let sig = match signo {
            0 => None,
            n => Some(Signal::new(n).ok_or(ProcError::InvalidSignal)?),
        };
        let idx = self.table.index_of(target).ok_or(ProcError::NoSuchProcess)?;
        if target == Pid::IDLE {
            return Err(ProcError::PermissionDenied);
        }
        let creds = match sender {
            Some(pid) => self.table.slot(self.live_index(pid)?).creds,
            None => Credentials::ROOT,
        };
        if !creds.may_signal(self.table.slot(idx).creds) {
            return Err(ProcError::PermissionDenied);
        }
        if let Some(sig) = sig
            && self.table.slot(idx).state != ProcessState::Zombie
        {
            self.post(idx, sig);
        }
        Ok(())
    }

    /// Make `sig` pending on slot `idx` and apply its immediate effects.
    pub(super) fn post(&mut self, idx: usize, sig: Signal) {
        let is_current = self.table.current() == Some(idx);
        let pcb = self.table.slot_mut(idx);
        let disposition = pcb.signals.disposition(sig);

        // Init only ever sees signals it asked for.
        if pcb.pid == Pid::INIT && !matches!(disposition, Disposition::Catch { .. }) {
            return;
        }
        match disposition {
            Disposition::Ignore => return,
            Disposition::Continue => {
                pcb.signals.pending.remove(Signal::SIGSTOP);
                if pcb.state == ProcessState::Blocked(BlockReason::Stopped) {
                    debug!("{} continued", pcb.pid);
                    self.make_ready(idx);
                }
                return;
            }
            _ => {}
        }

        pcb.signals.pending.insert(sig);
        if sig == Signal::SIGCONT {
            pcb.signals.pending.remove(Signal::SIGSTOP);
            if pcb.state == ProcessState::Blocked(BlockReason::Stopped) {
                self.make_ready(idx);
            }
        }
        let pcb = self.table.slot(idx);
        if pcb.signals.blocked.contains(sig) || is_current {
            return;
        }

        match (disposition, pcb.state) {
            (Disposition::Terminate, _) => {
                debug!("{} killed by {sig}", pcb.pid);
                self.terminate_slot(idx, sig.termination_status());
            }
            (Disposition::Stop, ProcessState::Blocked(BlockReason::Stopped)) => {
                self.table.slot_mut(idx).signals.pending.remove(sig);
            }
            (Disposition::Stop, _) => {
                let pcb = self.table.slot_mut(idx);
                pcb.signals.pending.remove(sig);
                debug!("{} stopped by {sig}", pcb.pid);
                self.block_slot(idx, BlockReason::Stopped);
            }
            (Disposition::Catch { .. }, ProcessState::Blocked(reason)) if reason.is_interruptible() => {
                self.table.slot_mut(idx).interrupted = true;
                self.make_ready(idx);
            }
            _ => {}
        }
    }

    /// Install `action` for `signo`, returning the previous one.
    ///
    /// # Errors
    /// [`ProcError::InvalidSignal`] for a bad number or an attempt to catch
    /// or ignore `SIGKILL`/`SIGSTOP`, [`ProcError::NotUserProcess`] for a
    /// handler in a kernel thread.
    pub fn sigaction(&mut self, pid: Pid, signo: u32, action: SigAction) -> Result<SigAction, ProcError> {
        let sig = Signal::new(signo).ok_or(ProcError::InvalidSignal)?;
        let idx = self.live_index(pid)?;
        let pcb = self.table.slot_mut(idx);
        if matches!(action, SigAction::Catch { .. }) && pcb.mode != Mode::User {
            return Err(ProcError::NotUserProcess);
        }
        pcb.signals.set_action(sig, action).ok_or(ProcError::InvalidSignal)
    }

    /// Replace the blocked mask of `pid`, returning the old one.
    ///
    /// # Errors
    /// [`ProcError::NoSuchProcess`].
    pub fn sigprocmask(&mut self, pid: Pid, set: SignalSet) -> Result<SignalSet, ProcError> {
        let idx = self.live_index(pid)?;
        let signals = &mut self.table.slot_mut(idx).signals;
        let old = signals.blocked;
        signals.set_blocked(set);
        Ok(old)
    }

    /// Deliver the next pending signal of `pid`, which is about to return
    /// to user mode through `frame`.
    ///
    /// A handler frame that cannot be written to the user stack kills the
    /// process with `SIGSEGV`.
    ///
    /// # Errors
    /// [`ProcError::NoSuchProcess`], or [`ProcError::InitExited`] if that
    /// process is init.
    pub fn deliver_pending<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<M, A>,
        pid: Pid,
        frame: &mut TrapFrame,
    ) -> Result<Delivery, ProcError> {
        let idx = self.live_index(pid)?;
        if !frame.from_user_mode() {
            return Ok(Delivery::None);
        }

        while let Some((sig, disposition)) = self.table.slot_mut(idx).signals.take_next() {
            match disposition {
                Disposition::Ignore | Disposition::Continue => {}
                Disposition::Terminate | Disposition::Stop if pid == Pid::INIT => {}
                Disposition::Terminate => {
                    self.terminate_slot(idx, sig.termination_status());
                    return Ok(Delivery::Terminated(sig));
                }
                Disposition::Stop => {
                    self.block_slot(idx, BlockReason::Stopped);
                    return Ok(Delivery::Stopped(sig));
                }
                Disposition::Catch { handler, restorer } => {
                    if self.push_signal_frame(vmm, idx, sig, handler, restorer, frame).is_err() {
                        if pid == Pid::INIT {
                            return Err(ProcError::InitExited);
                        }
                        self.terminate_slot(idx, Signal::SIGSEGV.termination_status());
                        return Ok(Delivery::Terminated(Signal::SIGSEGV));
                    }
                    debug!("{pid}: delivering {sig} to handler at {handler}");
                    return Ok(Delivery::Handled(sig));
                }
            }
        }
        Ok(Delivery::None)
    }

    /// Act on signals pending for kernel thread `idx` as it is switched
    /// away from. Only terminating and stopping signals apply; kernel
    /// threads cannot catch signals.
    pub(crate) fn deliver_to_kernel_thread(&mut self, idx: usize) -> Delivery {
        if self.table.slot(idx).mode != Mode::Kernel {
            return Delivery::None;
        }
        while let Some((sig, disposition)) = self.table.slot_mut(idx).signals.take_next() {
            match disposition {
                Disposition::Terminate => {
                    debug!("{} killed by {sig}", self.table.slot(idx).pid);
                    self.terminate_slot(idx, sig.termination_status());
                    return Delivery::Terminated(sig);
                }
                Disposition::Stop => {
                    self.block_slot(idx, BlockReason::Stopped);
                    return Delivery::Stopped(sig);
                }
                _ => {}
            }
        }
        Delivery::None
    }

    fn push_signal_frame<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<M, A>,
        idx: usize,
        sig: Signal,
        handler: VirtualAddress,
        restorer: VirtualAddress,
        frame: &mut TrapFrame,
    ) -> Result<(), ProcError> {
        let pcb = self.table.slot_mut(idx);
        let space = pcb.space.ok_or(ProcError::NotUserProcess)?;

        #[allow(clippy::cast_possible_truncation)]
        let len = SIGNAL_FRAME_BYTES as u32;
        // `sp + 4` is 16-byte aligned at handler entry.
        let base = frame
            .user_esp
            .checked_sub(len)
            .ok_or(ProcError::InvalidArgument)?
            & !0xF;
        let sp = VirtualAddress::new(base.checked_sub(4).ok_or(ProcError::InvalidArgument)?);

        let mut bytes = [0u8; SIGNAL_FRAME_BYTES];
        bytes[0..4].copy_from_slice(&restorer.as_u32().to_le_bytes());
        bytes[4..8].copy_from_slice(&sig.number().to_le_bytes());
        bytes[8..12].copy_from_slice(&pcb.signals.blocked.bits().to_le_bytes());
        bytes[12..].copy_from_slice(&frame.to_bytes());
        vmm.check_user(space, sp, len, true)?;
        vmm.copy_to_user(space, sp, &bytes)?;

        // The signal stays blocked while its handler runs.
        pcb.signals.blocked.insert(sig);
        frame.eip = handler.as_u32();
        frame.user_esp = sp.as_u32();
        Ok(())
    }

    /// Undo a signal delivery: restore the registers and the blocked mask
    /// saved in the frame at `frame.user_esp + 4`.
    ///
    /// # Errors
    /// [`ProcError::Memory`] if the frame is not readable user memory; the
    /// caller should kill the process with `SIGSEGV`.
    pub fn sigreturn<M: PhysMapper, A: FrameAlloc>(
        &mut self,
        vmm: &Vmm<M, A>,
        pid: Pid,
        frame: &mut TrapFrame,
    ) -> Result<(), ProcError> {
        let idx = self.live_index(pid)?;
        let pcb = self.table.slot_mut(idx);
        let space = pcb.space.ok_or(ProcError::NotUserProcess)?;
        if pcb.mode != Mode::User {
            return Err(ProcError::NotUserProcess);
        }

        let at = VirtualAddress::new(frame.user_esp)
            .checked_add(4)
            .ok_or(ProcError::InvalidArgument)?;
        let mut bytes = [0u8; SIGRETURN_BYTES];
        vmm.copy_from_user(space, at, &mut bytes)?;

        let mask = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut saved = [0u8; TrapFrame::BYTES];
        saved.copy_from_slice(&bytes[4..]);
        frame.restore_user(&TrapFrame::from_bytes(&saved));
        pcb.signals.set_blocked(SignalSet::from_bits(mask));
        Ok(())
    }
}
