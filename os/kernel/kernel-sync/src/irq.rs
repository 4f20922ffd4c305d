use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::ops::{Deref, DerefMut};
use kernel_registers::LoadRegister;
use kernel_registers::eflags::Eflags;

/// A mutex guard that also disables interrupts while held.
///
/// `IrqMutex` combines an interrupt guard with a regular [`MutexGuard`].
/// When created via [`Mutex::lock_irq`], it:
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying mutex,
///
/// releasing them in reverse order on drop. On a single CPU this is the
/// whole critical-section discipline: the timer interrupt cannot observe
/// a half-updated process table.
///
/// # Examples
///
/// ```no_run
/// use kernel_sync::SpinMutex;
///
/// static M: SpinMutex<u32> = SpinMutex::new(0);
///
/// {
///     let mut g = M.lock_irq();
///     *g += 1;
/// }
/// // interrupts and mutex are released here
/// ```
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    // Field order matters: the lock is released before interrupts come back.
    g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard’s lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        let g = self.lock();
        IrqMutex { g, _irq: irq }
    }
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.g
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.g
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Only valid in ring 0.
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Only valid in ring 0.
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Whether `IF` is currently set.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    Eflags::load().if_interrupt_enable()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, so guards nest.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// Runs `f` with interrupts masked.
#[inline]
pub fn without_interrupts<U>(f: impl FnOnce() -> U) -> U {
    let _guard = IrqGuard::new();
    f()
}
