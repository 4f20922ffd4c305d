//! # Virtual Memory Support
//!
//! i386 two-level paging for the kernel and its user processes.
//!
//! ## What you get
//! - An [`AddressSpace`] handle over one page directory: map, unmap,
//!   translate, create, clone and destroy.
//! - [`PageEntryBits`], the 32-bit directory/table entry as a bitfield.
//! - [`PageFlags`], the permission set callers ask for.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 ─► Page Directory ─► Page Table ─► 4 KiB frame
//!          1024 × PDE        1024 × PTE
//! ```
//!
//! | Level | Table | Entry | Description |
//! |:------|:------|:------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | One per address space, referenced by CR3. Each entry covers 4 MiB and points to a page table. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps one 4 KiB frame. |
//!
//! Permissions intersect along the walk: a user-accessible page needs the
//! `US` bit on both its PDE and its PTE.
//!
//! ## Ownership
//!
//! Every address space shares the kernel's identity-mapped page tables:
//! their PDEs are copied verbatim into each new directory. Everything an
//! address space allocated for itself (page tables and leaf frames) carries
//! the [`owned`](PageEntryBits::owned) tag in one of the OS-available bits.
//! Cloning deep-copies exactly the owned part; destroying frees exactly the
//! owned part. Shared kernel tables are never touched by either.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

pub mod address_space;
mod page_entry_bits;
mod page_table;
#[cfg(any(test, feature = "test-support"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, RootPage};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{ENTRIES_PER_TABLE, PageTable};

pub use kernel_info::memory as info;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

bitflags::bitflags! {
    /// Permissions requested for a leaf mapping.
    ///
    /// Present is implied. Without [`WRITABLE`](Self::WRITABLE) the page is
    /// read-only; without [`USER`](Self::USER) it is supervisor-only.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page is writable.
        ///
        /// Ring 0 honours read-only pages too, because the kernel enables
        /// `CR0.WP`.
        const WRITABLE = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER     = 1 << 2;
    }
}

impl PageFlags {
    /// User read/write, e.g. stacks, heap and data segments.
    pub const USER_RW: Self = Self::USER.union(Self::WRITABLE);

    /// User read-only (i386 has no execute-disable without PAE).
    pub const USER_RO: Self = Self::USER;

    /// Kernel read/write.
    pub const KERNEL_RW: Self = Self::WRITABLE;
}

/// Errors from page table manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    /// The frame allocator had nothing left for a table or a page.
    #[error("out of physical frames")]
    OutOfFrames,
    /// The address has no present mapping.
    #[error("address {0} is not mapped")]
    NotMapped(VirtualAddress),
    /// The address is already mapped; remapping would leak the old frame.
    #[error("address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    /// A user mapping was requested outside the user range, or a change
    /// would touch a page table shared with the kernel.
    #[error("address {0} is in the kernel range")]
    KernelRange(VirtualAddress),
    /// An address that must be page aligned is not.
    #[error("address {0:#010x} is not page aligned")]
    Misaligned(u32),
}

/// Source of **physical** 4 KiB frames for page tables and pages.
///
/// The implementation decides where frames come from (bitmap, test arena).
/// Returned frames are page aligned by construction. `None` means
/// out-of-memory and is always recoverable for the caller.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame previously handed out by [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space. The kernel identity maps low memory, so its mapper is a
/// plain cast; tests back physical memory by a host buffer.
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables (identity range).
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa`, and no other live reference may
///   alias them.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Invalidate the TLB entry for one page of the *active* address space.
#[inline]
pub fn invlpg(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = va;
}

/// Align `x` down to the nearest multiple of `a` (a power of two).
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (a power of two), or `None`
/// if the result does not fit in 32 bits.
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), Some(0));
/// assert_eq!(align_up(1,       4096), Some(4096));
/// assert_eq!(align_up(4096,    4096), Some(4096));
/// assert_eq!(align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ArenaFrames, FrameArena};
    use kernel_info::memory::IDENTITY_MAP_MIN;

    const USER_VA: VirtualAddress = VirtualAddress::new(0x0804_8000);

    fn setup(frames: u32) -> (FrameArena, ArenaFrames) {
        (FrameArena::with_frames(frames as usize), ArenaFrames::new(1, frames))
    }

    #[test]
    fn kernel_space_identity_maps_supervisor_pages() {
        let (phys, mut alloc) = setup(16);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();

        // One directory plus four tables for 16 MiB.
        assert_eq!(alloc.live(), 5);
        let va = VirtualAddress::new(0x0012_3456);
        assert_eq!(kernel.translate(va), Some(PhysicalAddress::new(0x0012_3456)));
        let e = kernel.entry(va).unwrap();
        assert!(e.writable());
        assert!(!e.user_access());
        assert!(!e.owned());
        assert!(!kernel.is_mapped(VirtualAddress::new(IDENTITY_MAP_MIN)));
    }

    #[test]
    fn kernel_space_build_failure_returns_frames() {
        let (phys, mut alloc) = setup(16);
        alloc.limit_to(3);
        let err = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).err();
        assert_eq!(err, Some(VmemError::OutOfFrames));
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn map_one_creates_user_table_and_leaf() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();

        let frame = user.map_anon(&mut alloc, USER_VA, PageFlags::USER_RW).unwrap();
        let e = user.entry(USER_VA).unwrap();
        assert!(e.present() && e.writable() && e.user_access() && e.owned());
        assert_eq!(e.frame(), frame);
        assert_eq!(user.translate(USER_VA + 0x10), Some(frame.base() + 0x10));

        // The mapping is private to the user space.
        assert!(!kernel.is_mapped(USER_VA));
        assert_eq!(user.owned_frames(), 2);
    }

    #[test]
    fn kernel_mappings_are_shared_and_protected() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();

        let low = VirtualAddress::new(0x0020_0000);
        assert_eq!(user.translate(low), kernel.translate(low));

        let frame = alloc.alloc_4k().unwrap();
        assert_eq!(
            user.map_one(&mut alloc, low, frame, PageFlags::USER_RW, true),
            Err(VmemError::KernelRange(low))
        );
        assert_eq!(
            user.map_one(&mut alloc, low, frame, PageFlags::KERNEL_RW, true),
            Err(VmemError::KernelRange(low))
        );
        assert_eq!(user.unmap_one(&mut alloc, low), Err(VmemError::KernelRange(low)));
        assert_eq!(
            user.map_one(&mut alloc, USER_VA + 1, frame, PageFlags::USER_RW, true),
            Err(VmemError::Misaligned(USER_VA.as_u32() + 1))
        );
    }

    #[test]
    fn double_map_is_rejected() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        user.map_anon(&mut alloc, USER_VA, PageFlags::USER_RO).unwrap();
        let before = alloc.live();
        assert_eq!(
            user.map_anon(&mut alloc, USER_VA, PageFlags::USER_RW),
            Err(VmemError::AlreadyMapped(USER_VA))
        );
        assert_eq!(alloc.live(), before);
    }

    #[test]
    fn destroy_returns_exactly_the_owned_frames() {
        let (phys, mut alloc) = setup(64);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let baseline = alloc.live();

        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        user.map_anon_range(&mut alloc, USER_VA, 3 * 4096, PageFlags::USER_RW).unwrap();
        user.map_anon(&mut alloc, VirtualAddress::new(0xBFFF_E000), PageFlags::USER_RW)
            .unwrap();
        // A non-owned leaf (e.g. a shared physical page) must survive.
        let shared = alloc.alloc_4k().unwrap();
        user.map_one(&mut alloc, VirtualAddress::new(0x0900_0000), shared, PageFlags::USER_RO, false)
            .unwrap();

        user.destroy(&mut alloc);
        assert_eq!(alloc.live(), baseline + 1);
        alloc.free_4k(shared);

        // The kernel space is untouched.
        assert!(kernel.is_mapped(VirtualAddress::new(0x0010_0000)));
    }

    #[test]
    fn clone_is_a_deep_copy() {
        let (phys, mut alloc) = setup(64);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let parent = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        parent.map_anon_range(&mut alloc, USER_VA, 2 * 4096, PageFlags::USER_RW).unwrap();
        parent.write_bytes(USER_VA + 0xFFE, b"abcd").unwrap();

        let child = parent.clone_user(&mut alloc).unwrap();
        assert_eq!(child.owned_frames(), parent.owned_frames());
        assert_ne!(child.translate(USER_VA), parent.translate(USER_VA));

        let mut buf = [0u8; 4];
        child.read_bytes(USER_VA + 0xFFE, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        child.write_bytes(USER_VA + 0xFFE, b"WXYZ").unwrap();
        parent.read_bytes(USER_VA + 0xFFE, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        assert_eq!(
            child.entry(USER_VA).unwrap().page_flags(),
            parent.entry(USER_VA).unwrap().page_flags()
        );
    }

    #[test]
    fn failed_clone_leaks_nothing() {
        let (phys, mut alloc) = setup(64);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let parent = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        parent.map_anon_range(&mut alloc, USER_VA, 4 * 4096, PageFlags::USER_RW).unwrap();

        let live = alloc.live();
        alloc.limit_to(4);
        assert_eq!(parent.clone_user(&mut alloc).err(), Some(VmemError::OutOfFrames));
        assert_eq!(alloc.live(), live);
        assert_eq!(alloc.available(), 4);
    }

    #[test]
    fn unmap_frees_owned_frame() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        user.map_anon(&mut alloc, USER_VA, PageFlags::USER_RW).unwrap();
        let live = alloc.live();

        user.unmap_one(&mut alloc, USER_VA).unwrap();
        assert_eq!(alloc.live(), live - 1);
        assert!(!user.is_mapped(USER_VA));
        assert_eq!(user.unmap_one(&mut alloc, USER_VA), Err(VmemError::NotMapped(USER_VA)));
    }

    #[test]
    fn byte_access_stops_at_unmapped_page() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        user.map_anon(&mut alloc, USER_VA, PageFlags::USER_RW).unwrap();

        let next = USER_VA + 4096;
        assert_eq!(user.write_bytes(USER_VA + 4094, b"xyz"), Err(VmemError::NotMapped(next)));
        assert_eq!(user.zero(USER_VA, 4096), Ok(()));
    }

    #[test]
    fn protect_keeps_frame_and_ownership() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        let frame = user.map_anon(&mut alloc, USER_VA, PageFlags::USER_RO).unwrap();

        user.protect(USER_VA, PageFlags::USER_RW).unwrap();
        let e = user.entry(USER_VA).unwrap();
        assert!(e.writable() && e.owned());
        assert_eq!(e.frame(), frame);

        let hole = USER_VA + 4096;
        assert_eq!(user.protect(hole, PageFlags::USER_RW), Err(VmemError::NotMapped(hole)));
        let low = VirtualAddress::new(0x1000);
        assert_eq!(user.protect(low, PageFlags::USER_RW), Err(VmemError::KernelRange(low)));
    }

    #[test]
    fn range_mapping_skips_present_pages() {
        let (phys, mut alloc) = setup(32);
        let kernel = AddressSpace::create_kernel(&phys, &mut alloc, IDENTITY_MAP_MIN).unwrap();
        let user = AddressSpace::new_user(&kernel, &mut alloc).unwrap();
        user.map_anon(&mut alloc, USER_VA + 4096, PageFlags::USER_RW).unwrap();

        let added = user
            .map_anon_range(&mut alloc, USER_VA + 0x10, 3 * 4096, PageFlags::USER_RW)
            .unwrap();
        // [0x0804_8010, 0x0804_b010) touches four pages, one already present.
        assert_eq!(added, 3);
    }
}
