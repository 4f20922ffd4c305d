//! # Signals
//!
//! Numbers follow the i386 Linux/POSIX assignment so that user programs can
//! use the usual constants. Valid numbers are `1..NSIG`; `0` is accepted by
//! `kill` as an existence check and never becomes pending.

use core::fmt;
use kernel_info::process::NSIG;
use kernel_memory_addresses::VirtualAddress;

/// A valid signal number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    pub const SIGHUP: Self = Self(1);
    pub const SIGINT: Self = Self(2);
    pub const SIGQUIT: Self = Self(3);
    pub const SIGILL: Self = Self(4);
    pub const SIGTRAP: Self = Self(5);
    pub const SIGABRT: Self = Self(6);
    pub const SIGBUS: Self = Self(7);
    pub const SIGFPE: Self = Self(8);
    pub const SIGKILL: Self = Self(9);
    pub const SIGUSR1: Self = Self(10);
    pub const SIGSEGV: Self = Self(11);
    pub const SIGUSR2: Self = Self(12);
    pub const SIGPIPE: Self = Self(13);
    pub const SIGALRM: Self = Self(14);
    pub const SIGTERM: Self = Self(15);
    pub const SIGCHLD: Self = Self(17);
    pub const SIGCONT: Self = Self(18);
    pub const SIGSTOP: Self = Self(19);

    /// `None` for `0` and anything `>= NSIG`.
    #[must_use]
    pub const fn new(signo: u32) -> Option<Self> {
        if signo == 0 || signo as usize >= NSIG {
            None
        } else {
            #[allow(clippy::cast_possible_truncation)]
            Some(Self(signo as u8))
        }
    }

    #[must_use]
    pub const fn number(self) -> u32 {
        self.0 as u32
    }

    /// `SIGKILL` and `SIGSTOP` can be neither caught nor ignored.
    #[must_use]
    pub const fn is_catchable(self) -> bool {
        self.0 != Self::SIGKILL.0 && self.0 != Self::SIGSTOP.0
    }

    #[must_use]
    pub const fn default_action(self) -> DefaultAction {
        match self.0 {
            17 | 18 => DefaultAction::Ignore,
            19 => DefaultAction::Stop,
            _ => DefaultAction::Terminate,
        }
    }

    /// Exit status of a process terminated by this signal.
    #[must_use]
    pub const fn termination_status(self) -> i32 {
        128 + self.0 as i32
    }

    const fn bit(self) -> u32 {
        1 << self.0
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG#{}", self.0)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
}

/// A set of signals, bit `n` standing for signal `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: Self = Self(0);

    /// Signals that can never be blocked.
    pub const UNBLOCKABLE: Self = Self(Signal::SIGKILL.bit() | Signal::SIGSTOP.bit());

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        // Bit 0 has no signal.
        Self(bits & !1)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, sig: Signal) -> bool {
        self.0 & sig.bit() != 0
    }

    pub const fn insert(&mut self, sig: Signal) {
        self.0 |= sig.bit();
    }

    pub const fn remove(&mut self, sig: Signal) {
        self.0 &= !sig.bit();
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Lowest numbered member.
    #[must_use]
    pub const fn first(self) -> Option<Signal> {
        if self.0 == 0 {
            None
        } else {
            #[allow(clippy::cast_possible_truncation)]
            Some(Signal(self.0.trailing_zeros() as u8))
        }
    }
}

/// What a process asked to happen on a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigAction {
    #[default]
    Default,
    Ignore,
    /// Run `handler(signo)` on the user stack; it returns into `restorer`,
    /// which must issue `sigreturn`.
    Catch {
        handler: VirtualAddress,
        restorer: VirtualAddress,
    },
}

/// What a pending signal resolves to once dispositions are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ignore,
    Terminate,
    Stop,
    Continue,
    Catch {
        handler: VirtualAddress,
        restorer: VirtualAddress,
    },
}

/// Per-process signal state.
#[derive(Debug, Clone, Copy)]
pub struct SignalState {
    pub pending: SignalSet,
    pub blocked: SignalSet,
    actions: [SigAction; NSIG],
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: SignalSet::EMPTY,
            blocked: SignalSet::EMPTY,
            actions: [SigAction::Default; NSIG],
        }
    }

    #[must_use]
    pub const fn action(&self, sig: Signal) -> SigAction {
        self.actions[sig.0 as usize]
    }

    /// Install `action` and return the previous one.
    ///
    /// `None` if `sig` cannot be caught or ignored.
    pub fn set_action(&mut self, sig: Signal, action: SigAction) -> Option<SigAction> {
        if !sig.is_catchable() && action != SigAction::Default {
            return None;
        }
        let old = core::mem::replace(&mut self.actions[sig.0 as usize], action);
        // Ignoring a signal discards it if it is already pending.
        if action == SigAction::Ignore
            || (action == SigAction::Default && sig.default_action() == DefaultAction::Ignore)
        {
            self.pending.remove(sig);
        }
        Some(old)
    }

    pub fn set_blocked(&mut self, set: SignalSet) {
        self.blocked = set.without(SignalSet::UNBLOCKABLE);
    }

    /// Caught handlers do not survive an exec; ignored signals stay ignored.
    pub fn reset_on_exec(&mut self) {
        for a in &mut self.actions {
            if matches!(a, SigAction::Catch { .. }) {
                *a = SigAction::Default;
            }
        }
    }

    /// Pending and not blocked.
    #[must_use]
    pub const fn deliverable(&self) -> SignalSet {
        self.pending.without(self.blocked)
    }

    /// Whether a deliverable signal would do something, which is what
    /// interrupts a blocking call.
    #[must_use]
    pub fn has_actionable(&self) -> bool {
        let mut set = self.deliverable();
        while let Some(sig) = set.first() {
            if self.disposition(sig) != Disposition::Ignore {
                return true;
            }
            set.remove(sig);
        }
        false
    }

    #[must_use]
    pub const fn disposition(&self, sig: Signal) -> Disposition {
        if sig.0 == Signal::SIGCONT.0 && matches!(self.action(sig), SigAction::Default) {
            return Disposition::Continue;
        }
        match self.action(sig) {
            SigAction::Ignore => Disposition::Ignore,
            SigAction::Catch { handler, restorer } => Disposition::Catch { handler, restorer },
            SigAction::Default => match sig.default_action() {
                DefaultAction::Terminate => Disposition::Terminate,
                DefaultAction::Ignore => Disposition::Ignore,
                DefaultAction::Stop => Disposition::Stop,
            },
        }
    }

    /// Remove and return the next deliverable signal with its disposition.
    pub fn take_next(&mut self) -> Option<(Signal, Disposition)> {
        let sig = self.deliverable().first()?;
        self.pending.remove(sig);
        Some((sig, self.disposition(sig)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_validated() {
        assert_eq!(Signal::new(0), None);
        assert_eq!(Signal::new(9), Some(Signal::SIGKILL));
        assert_eq!(Signal::new(NSIG as u32), None);
        assert_eq!(Signal::SIGTERM.termination_status(), 143);
    }

    #[test]
    fn kill_and_stop_cannot_be_caught() {
        let mut s = SignalState::new();
        let catch = SigAction::Catch {
            handler: VirtualAddress::new(0x0804_8000),
            restorer: VirtualAddress::new(0x0804_8100),
        };
        assert_eq!(s.set_action(Signal::SIGKILL, SigAction::Ignore), None);
        assert_eq!(s.set_action(Signal::SIGSTOP, catch), None);
        assert_eq!(s.set_action(Signal::SIGUSR1, catch), Some(SigAction::Default));
        assert_eq!(s.action(Signal::SIGUSR1), catch);

        s.set_blocked(SignalSet::from_bits(u32::MAX));
        assert!(!s.blocked.contains(Signal::SIGKILL));
        assert!(s.blocked.contains(Signal::SIGUSR1));
    }

    #[test]
    fn delivery_order_and_blocking() {
        let mut s = SignalState::new();
        s.pending.insert(Signal::SIGTERM);
        s.pending.insert(Signal::SIGINT);
        s.blocked.insert(Signal::SIGINT);

        assert_eq!(s.take_next(), Some((Signal::SIGTERM, Disposition::Terminate)));
        assert_eq!(s.take_next(), None);
        s.set_blocked(SignalSet::EMPTY);
        assert_eq!(s.take_next(), Some((Signal::SIGINT, Disposition::Terminate)));
    }

    #[test]
    fn default_ignored_signals_do_not_interrupt() {
        let mut s = SignalState::new();
        s.pending.insert(Signal::SIGCHLD);
        assert!(!s.has_actionable());
        assert_eq!(s.disposition(Signal::SIGCONT), Disposition::Continue);
        s.pending.insert(Signal::SIGUSR2);
        assert!(s.has_actionable());
    }

    #[test]
    fn ignoring_discards_pending() {
        let mut s = SignalState::new();
        s.pending.insert(Signal::SIGHUP);
        s.set_action(Signal::SIGHUP, SigAction::Ignore);
        assert!(s.pending.is_empty());
    }
}
