//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The physical side of memory management and the kernel heap.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Virtual Memory Manager (VMM)         │
//! │    • kernel and user address spaces                 │
//! │    • range-checked access to user memory            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • identity window [0, identity cap)              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • one bit per 4 KiB frame                        │
//! │    • deny by default, free what firmware certifies  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`frame_alloc`]: the bitmap frame allocator, the sole source of
//!   physical memory. Exhaustion is an ordinary `None`; a double free is
//!   corruption and panics.
//! - [`phys_mapper`]: turns a physical address below the identity cap into
//!   a pointer, valid in every address space.
//! - [`vmm`]: owns the above plus the kernel address space and manages user
//!   spaces by their page directory frame.
//! - [`heap`]: the kernel's `GlobalAlloc`, a first-fit free list over a
//!   fixed region reserved by the kernel image.
//!
//! Nothing here locks except the heap. The frame allocator and the VMM live
//! inside the kernel's single state lock, which is taken with interrupts
//! masked.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
mod free_list;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;

pub use free_list::FreeListHeap;
