//! # Kernel-wide state
//!
//! The memory manager, the scheduler (which owns the process table) and the
//! boot files sit behind one spin lock. Interrupt and system call handlers
//! take it with [`lock_irq`](kernel_sync::SpinMutex::lock_irq) and must drop
//! it before switching stacks: the next thread would otherwise spin on a
//! lock its predecessor still holds.

use crate::modules::BootModules;
use kernel_alloc::frame_alloc::BitmapFrameAlloc;
use kernel_alloc::phys_mapper::IdentityPhysMapper;
use kernel_alloc::vmm::Vmm;
use kernel_proc::Scheduler;
use kernel_sync::{SpinMutex, SyncOnceCell};

pub type KernelVmm = Vmm<IdentityPhysMapper, BitmapFrameAlloc<'static>>;

pub struct Kernel {
    pub vmm: KernelVmm,
    pub sched: Scheduler,
    pub files: BootModules,
}

static KERNEL: SyncOnceCell<SpinMutex<Kernel>> = SyncOnceCell::new();

/// Publish the kernel state. Boot calls this once, before the first
/// dispatch.
///
/// # Panics
/// On a second call.
pub fn install(kernel: Kernel) -> &'static SpinMutex<Kernel> {
    match KERNEL.set(SpinMutex::new(kernel)) {
        Ok(k) => k,
        Err(_) => panic!("kernel state installed twice"),
    }
}

/// The kernel state.
///
/// # Panics
/// If called before [`install`]; every caller runs after boot completed.
pub fn kernel() -> &'static SpinMutex<Kernel> {
    match KERNEL.get() {
        Some(k) => k,
        None => panic!("kernel state used before boot finished"),
    }
}
