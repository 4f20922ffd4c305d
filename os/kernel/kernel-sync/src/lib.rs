//! # Kernel synchronization primitives
//!
//! The kernel runs on a single CPU. Mutual exclusion against interrupt
//! handlers is therefore a matter of masking interrupts ([`IrqGuard`]); the
//! spin lock underneath only catches re-entrant use, which would otherwise
//! corrupt state silently. On the host the same types are real locks, which
//! is what the tests exercise.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod once;
mod raw_spin;

pub use irq::{IrqGuard, IrqMutex, without_interrupts};
pub use mutex::{Mutex, MutexGuard};
pub use once::SyncOnceCell;
pub use raw_spin::RawSpin;

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
