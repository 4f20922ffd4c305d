//! # Identity [`PhysMapper`]
//!
//! Every address space maps low physical memory `[0, identity_cap)` at the
//! same virtual addresses, so a physical address below the cap is directly
//! usable as a pointer no matter which page directory is active. This is
//! what lets the kernel edit a process's page tables without switching to it.
//!
//! Frames above the cap are never handed out by the frame allocator, which
//! keeps every frame a page table can point to reachable through this
//! mapper.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the identity-mapped low memory window.
#[derive(Debug, Clone, Copy)]
pub struct IdentityPhysMapper {
    limit: u32,
}

impl IdentityPhysMapper {
    /// A mapper for the window `[0, limit)`.
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self { limit }
    }

    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }
}

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(
            u64::from(pa.as_u32()) + size_of::<T>() as u64 <= u64::from(self.limit),
            "{pa} is outside the identity map"
        );
        // SAFETY: the caller upholds the `PhysMapper` contract; the window is
        // identity mapped in every address space.
        unsafe { &mut *(pa.as_usize() as *mut T) }
    }
}
