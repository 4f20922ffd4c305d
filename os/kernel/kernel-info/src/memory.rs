//! # Memory Layout

use kernel_memory_addresses::VirtualAddress;

/// Size of one physical frame and one virtual page.
pub const PAGE_SIZE: u32 = 4096;

/// Where the boot loader places the kernel image in physical memory.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker. The kernel runs identity mapped, so this is also its VMA.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Physical memory below this address (real mode IVT, BIOS data, VGA, ROMs)
/// is never handed out, regardless of what the firmware reports.
pub const LOW_MEMORY_RESERVED: u32 = 0x0010_0000;

/// Default amount of low physical memory identity mapped into every address space.
pub const IDENTITY_MAP_DEFAULT: u32 = 64 * 1024 * 1024;

/// Smallest accepted identity map; the kernel image and heap must fit.
pub const IDENTITY_MAP_MIN: u32 = 16 * 1024 * 1024;

/// Largest accepted identity map; it must end at or below [`USERSPACE_START`].
pub const IDENTITY_MAP_MAX: u32 = 128 * 1024 * 1024;

/// First virtual address usable by user processes.
pub const USERSPACE_START: VirtualAddress = VirtualAddress::new(0x0800_0000);

/// End (exclusive) of the user virtual range.
pub const USERSPACE_END: VirtualAddress = VirtualAddress::new(0xC000_0000);

/// Initial user stack pointer; one guard page sits between it and [`USERSPACE_END`].
pub const USER_STACK_TOP: VirtualAddress = VirtualAddress::new(0xBFFF_F000);

/// Size of the eagerly mapped user stack.
pub const USER_STACK_SIZE: u32 = 64 * 1024;

/// The size of a per-process kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Size of the statically reserved kernel heap.
pub const KERNEL_HEAP_SIZE: usize = 8 * 1024 * 1024;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE as usize));
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(IDENTITY_MAP_DEFAULT.is_multiple_of(4 * 1024 * 1024));
    assert!(IDENTITY_MAP_MIN <= IDENTITY_MAP_DEFAULT);
    assert!(IDENTITY_MAP_DEFAULT <= IDENTITY_MAP_MAX);
    assert!(IDENTITY_MAP_MAX <= USERSPACE_START.as_u32());
    assert!(USER_STACK_TOP.as_u32() < USERSPACE_END.as_u32());
    assert!(USER_STACK_TOP.as_u32() - USER_STACK_SIZE > USERSPACE_START.as_u32());
    assert!(PHYS_LOAD >= LOW_MEMORY_RESERVED);
};

/// Returns `true` if `[start, start + len)` lies entirely within user space.
///
/// ```
/// # use kernel_info::memory::is_user_range;
/// assert!(is_user_range(0x0804_8000, 0x1000));
/// assert!(!is_user_range(0x0010_0000, 0x1000));
/// assert!(!is_user_range(0xBFFF_F000, 0x2000));
/// ```
#[must_use]
pub const fn is_user_range(start: u32, len: u32) -> bool {
    let Some(end) = start.checked_add(len) else {
        return false;
    };
    start >= USERSPACE_START.as_u32() && end <= USERSPACE_END.as_u32()
}
