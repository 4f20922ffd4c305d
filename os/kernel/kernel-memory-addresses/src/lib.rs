//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! by the paging, frame allocation and loader code.
//!
//! ## Overview
//!
//! The kernel runs in 32-bit protected mode, so every address is a `u32`.
//! The types here keep virtual and physical addresses apart at compile time
//! while remaining zero-cost wrappers.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory. |
//!
//! ## Page Sizes
//!
//! Two i386 page sizes exist as marker types implementing [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB pages, the granularity of frames and page tables
//! - [`Size4M`]: 4 MiB regions, the span covered by a single page directory entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0804_9123);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0x0804_9000);
//! assert_eq!(off.as_u32(), 0x123);
//! assert_eq!(page.join(off), va);
//!
//! let pa = PhysicalAddress::new(0x0030_2042);
//! assert_eq!(pa.page::<Size4K>().frame_number(), 0x302);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`.
//! - All alignment and offset calculations are `const fn`.
//! - The phantom marker `S` enforces the page size at the type level.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_virtual() {
        let va = VirtualAddress::new(0xBFFF_EFF8);
        let (vp, off) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u32(), 0xBFFF_E000);
        assert_eq!(off.as_u32(), 0xFF8);
        assert_eq!(vp.join(off), va);
    }

    #[test]
    fn directory_and_table_indices() {
        let va = VirtualAddress::new(0x0840_3abc);
        assert_eq!(va.directory_index(), 0x21);
        assert_eq!(va.table_index(), 0x003);
        assert_eq!(va.page::<Size4M>().base().as_u32(), 0x0840_0000);
    }

    #[test]
    fn frame_numbers_round_trip() {
        let pp = PhysicalPage::<Size4K>::from_frame_number(0x1_2345);
        assert_eq!(pp.base().as_u32(), 0x1234_5000);
        assert_eq!(pp.frame_number(), 0x1_2345);
    }

    #[test]
    fn alignment_helpers() {
        let pa = PhysicalAddress::new(0x0010_0001);
        assert!(!pa.is_aligned::<Size4K>());
        assert_eq!(pa.align_up::<Size4K>(), Some(PhysicalAddress::new(0x0010_1000)));
        assert_eq!(PhysicalAddress::new(0xFFFF_F001).align_up::<Size4K>(), None);
        assert_eq!(pa.align_down::<Size4K>().as_u32(), 0x0010_0000);
    }

    #[test]
    fn page_iteration_steps_by_size() {
        let start = VirtualPage::<Size4K>::containing(VirtualAddress::new(0x0800_0010));
        let next = start.checked_next().expect("next page");
        assert_eq!(next.base().as_u32(), 0x0800_1000);
        let last = VirtualPage::<Size4K>::containing(VirtualAddress::new(0xFFFF_F000));
        assert!(last.checked_next().is_none());
    }
}
