//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants, process limits, the
//! Multiboot handoff structures and the run-time configuration parsed from
//! the kernel command line. It is the single source for numbers that must
//! agree between the linker script, the boot path, the paging code and the
//! process manager.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Virtual and physical layout of the 32-bit kernel:
//!
//! ```text
//! Virtual Address Space Layout (i386, two-level paging):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Kernel identity map            │ present in every address space,
//!             │  (low memory, image, heap)      │ supervisor only
//! identity cap├─────────────────────────────────┤ 64 MiB by default
//!             │  unmapped                       │
//! 0x0800_0000 ├─────────────────────────────────┤ USERSPACE_START
//!             │  User image, heap               │
//!             │            ...                  │
//!             │  User stack (grows down)        │
//! 0xC000_0000 ├─────────────────────────────────┤ USERSPACE_END
//!             │  unmapped                       │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ### Process Limits ([`process`])
//! Table sizes, signal numbering and scheduling quanta.
//!
//! ### Boot Information ([`boot`])
//! The Multiboot v1 information block and a safe, slice-based reader for its
//! memory map and module list.
//!
//! ### Run-time Configuration ([`config`])
//! [`KernelConfig`](config::KernelConfig) parsed from the boot command line.
//!
//! ## Build Integration
//!
//! The kernel's `build.rs` sources the load address from here:
//!
//! ```rust
//! use kernel_info::memory::PHYS_LOAD;
//!
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod config;
pub mod memory;
pub mod process;
