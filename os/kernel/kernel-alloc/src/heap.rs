//! # Kernel Heap
//!
//! [`KernelHeap`] wraps a [`FreeListHeap`] in a spin lock and implements
//! [`GlobalAlloc`], so the kernel binary can install it with
//! `#[global_allocator]`. The region is supplied once at boot through
//! [`KernelHeap::init`]; until then every allocation fails.
//!
//! The lock is taken with interrupts masked. Handlers may allocate (the timer
//! tick reaps, signal delivery builds frames), and on a single CPU a handler
//! spinning on a lock its own interrupted context holds would never return.
//!
//! Kernel and user process stacks, the process table and the argument
//! scratch space of `exec` all come from here.

use crate::free_list::FreeListHeap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use kernel_sync::SpinMutex;

/// Heap usage snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub size: usize,
    pub used: usize,
    pub free: usize,
}

pub struct KernelHeap {
    inner: SpinMutex<FreeListHeap>,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(FreeListHeap::new()),
        }
    }

    /// Give the heap its backing region.
    ///
    /// A second call is ignored.
    ///
    /// # Safety
    /// `[start, start + size)` must be writable memory owned by nobody else
    /// for the rest of the kernel's life, aligned for a pointer.
    pub unsafe fn init(&self, start: usize, size: usize) {
        let mut heap = self.inner.lock_irq();
        if heap.is_initialized() {
            log::warn!("kernel heap initialized twice");
            return;
        }
        // SAFETY: forwarded from the caller.
        unsafe { heap.init(start, size) };
        log::info!("kernel heap: {} KiB at {start:#010x}", size >> 10);
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let heap = self.inner.lock_irq();
        HeapStats {
            size: heap.size(),
            used: heap.used(),
            free: heap.free_bytes(),
        }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock_irq()
            .allocate(layout)
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: `GlobalAlloc` guarantees the pointer and layout match.
        unsafe { self.inner.lock_irq().deallocate(ptr, layout) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: same contract.
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            // SAFETY: fresh block of at least `layout.size()` bytes.
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Region([u8; 8192]);

    #[test]
    fn fails_until_initialized() {
        let heap = KernelHeap::new();
        let layout = Layout::new::<[u32; 4]>();
        assert!(unsafe { heap.alloc(layout) }.is_null());

        let mut region = Box::new(Region([0xCC; 8192]));
        unsafe { heap.init(region.0.as_mut_ptr() as usize, 8192) };
        let p = unsafe { heap.alloc_zeroed(layout) };
        assert!(!p.is_null());
        assert!(unsafe { core::slice::from_raw_parts(p, 16) }.iter().all(|b| *b == 0));

        let stats = heap.stats();
        assert_eq!(stats.size, 8192);
        assert!(stats.used >= 16);
        unsafe { heap.dealloc(p, layout) };
        assert_eq!(heap.stats().used, 0);
    }
}
