//! # Multiboot entry
//!
//! A Multiboot loader (GRUB, or QEMU's `-kernel`) loads the image at its
//! physical address and jumps to [`_start`] in 32-bit protected mode with
//! paging off, `eax` holding the loader magic and `ebx` the physical address
//! of the info block. Everything the loader hands over is reached through
//! physical addresses, which are valid pointers until paging comes on and
//! stay valid afterwards because the kernel identity maps low memory.

use arrayvec::ArrayVec;
use core::ffi::{CStr, c_char};
use kernel_info::boot::{
    MULTIBOOT_HEADER_CHECKSUM, MULTIBOOT_HEADER_FLAGS, MULTIBOOT_HEADER_MAGIC, MemoryKind,
    MemoryMap, MemoryRegion, ModuleEntry, MultibootInfo, info_flags,
};
use kernel_info::memory::LOW_MEMORY_RESERVED;
use kernel_memory_addresses::PhysicalAddress;

/// Most memory map entries kept; firmware maps are far shorter.
pub const MAX_REGIONS: usize = 64;

/// Most reserved ranges the frame allocator is told about.
pub const MAX_RESERVED: usize = 40;

#[used]
#[unsafe(link_section = ".multiboot")]
static MULTIBOOT_HEADER: [u32; 3] = [
    MULTIBOOT_HEADER_MAGIC,
    MULTIBOOT_HEADER_FLAGS,
    MULTIBOOT_HEADER_CHECKSUM,
];

/// Stack size.
const BOOT_STACK_SIZE: usize = 64 * 1024;

/// 16-byte aligned stack
#[repr(align(16))]
struct Aligned<const N: usize>([u8; N]);

#[unsafe(link_section = ".bss.boot")]
static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

/// Top of the boot stack. Boot runs on it, and so does every trap taken
/// before the first process is dispatched.
#[must_use]
pub fn boot_stack_top() -> usize {
    core::ptr::addr_of!(BOOT_STACK) as usize + BOOT_STACK_SIZE
}

/// The kernel entry point.
///
/// Switches to the boot stack and calls [`crate::kernel_main`] with the
/// loader magic and the info block address. The two pushes follow an 8 byte
/// pad so the stack is 16-byte aligned at the call.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "cli",
        "cld",
        "lea esp, [{stack} + {size}]",
        "xor ebp, ebp",
        "sub esp, 8",
        "push ebx",
        "push eax",
        "call {main}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        size = const BOOT_STACK_SIZE,
        main = sym crate::kernel_main,
    )
}

/// What the kernel keeps from the loader's info block.
pub struct BootInfo {
    pub cmdline: &'static str,
    /// Physical range of the command line string, terminator included.
    pub cmdline_range: Option<(u32, u32)>,
    pub regions: ArrayVec<MemoryRegion, MAX_REGIONS>,
    /// Raw module list, `16` bytes per module.
    pub module_list: &'static [u8],
    module_list_addr: u32,
}

impl BootInfo {
    /// Gather the loader's information.
    ///
    /// Without a full memory map, the basic `mem_upper` count stands in for
    /// one region above 1 MiB.
    ///
    /// # Safety
    /// `info` must be the block the loader passed, and every address in it
    /// must still be readable.
    pub unsafe fn from_multiboot(info: &MultibootInfo) -> Self {
        let (cmdline, cmdline_range) = if info.has(info_flags::CMDLINE) && info.cmdline != 0 {
            // SAFETY: the loader stores a NUL-terminated string there.
            let (s, len) = unsafe { (c_str_at(info.cmdline), c_str_span(info.cmdline)) };
            (s, Some((info.cmdline, len)))
        } else {
            ("", None)
        };

        let mut regions = ArrayVec::new();
        if info.has(info_flags::MEMORY_MAP) {
            // SAFETY: `mmap_length` bytes of map entries at `mmap_addr`.
            let bytes = unsafe { phys_bytes(info.mmap_addr, info.mmap_length) };
            for region in MemoryMap::new(bytes).iter() {
                if regions.try_push(region).is_err() {
                    log::warn!("memory map truncated at {MAX_REGIONS} entries");
                    break;
                }
            }
        } else if info.has(info_flags::MEMORY) {
            regions.push(MemoryRegion {
                base: u64::from(LOW_MEMORY_RESERVED),
                len: u64::from(info.mem_upper) * 1024,
                kind: MemoryKind::Available,
            });
        }

        let (module_list, module_list_addr) = if info.has(info_flags::MODULES) {
            #[allow(clippy::cast_possible_truncation)]
            let len = info.mods_count.saturating_mul(ModuleEntry::SIZE as u32);
            // SAFETY: `mods_count` entries of 16 bytes at `mods_addr`.
            (unsafe { phys_bytes(info.mods_addr, len) }, info.mods_addr)
        } else {
            (&[][..], 0)
        };

        Self {
            cmdline,
            cmdline_range,
            regions,
            module_list,
            module_list_addr,
        }
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleEntry> + '_ {
        kernel_info::boot::modules(self.module_list)
    }

    /// Physical ranges the frame allocator must never hand out: the kernel
    /// image (heap, frame bitmap and boot stack included) and everything
    /// the loader passed that the kernel still reads.
    #[must_use]
    pub fn reserved_ranges(&self) -> ArrayVec<(PhysicalAddress, u32), MAX_RESERVED> {
        let mut out = ArrayVec::new();
        let (start, end) = kernel_image();
        out.push((PhysicalAddress::new(start), end - start));
        if let Some((at, len)) = self.cmdline_range {
            out.push((PhysicalAddress::new(at), len));
        }
        if !self.module_list.is_empty() {
            #[allow(clippy::cast_possible_truncation)]
            let len = self.module_list.len() as u32;
            out.push((PhysicalAddress::new(self.module_list_addr), len));
        }
        for module in self.modules() {
            let strings = if module.string == 0 {
                None
            } else {
                // SAFETY: module strings are NUL-terminated.
                let len = unsafe { c_str_span(module.string) };
                Some((PhysicalAddress::new(module.string), len))
            };
            let ranges = [Some((PhysicalAddress::new(module.start), module.len())), strings];
            for range in ranges.into_iter().flatten() {
                if out.try_push(range).is_err() {
                    log::warn!("too many boot ranges to reserve; dropping {:?}", range);
                }
            }
        }
        out
    }
}

/// The module's image bytes.
///
/// # Safety
/// `module` must come from the loader's module list.
#[must_use]
pub unsafe fn module_bytes(module: &ModuleEntry) -> &'static [u8] {
    // SAFETY: the loader placed `len` bytes at `start`.
    unsafe { phys_bytes(module.start, module.len()) }
}

/// The module's command line, or `""`.
///
/// # Safety
/// `module` must come from the loader's module list.
#[must_use]
pub unsafe fn module_cmdline(module: &ModuleEntry) -> &'static str {
    if module.string == 0 {
        return "";
    }
    // SAFETY: see above.
    unsafe { c_str_at(module.string) }
}

/// The loader's info block.
///
/// # Safety
/// `addr` must be the `ebx` value a Multiboot loader passed.
#[must_use]
pub unsafe fn multiboot_info(addr: u32) -> &'static MultibootInfo {
    // SAFETY: per the caller.
    unsafe { &*(addr as usize as *const MultibootInfo) }
}

/// Physical range of the loaded kernel image, from the linker script.
#[allow(clippy::cast_possible_truncation)]
fn kernel_image() -> (u32, u32) {
    unsafe extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }
    let start = (&raw const __kernel_start) as usize as u32;
    let end = (&raw const __kernel_end) as usize as u32;
    (start, end)
}

unsafe fn phys_bytes(addr: u32, len: u32) -> &'static [u8] {
    if addr == 0 || len == 0 {
        return &[];
    }
    // SAFETY: the caller vouches for `len` readable bytes at `addr`.
    unsafe { core::slice::from_raw_parts(addr as usize as *const u8, len as usize) }
}

unsafe fn c_str_at(addr: u32) -> &'static str {
    // SAFETY: the caller vouches for a NUL-terminated string at `addr`.
    let s = unsafe { CStr::from_ptr(addr as usize as *const c_char) };
    s.to_str().unwrap_or("")
}

/// Bytes of the string at `addr`, terminator included.
#[allow(clippy::cast_possible_truncation)]
unsafe fn c_str_span(addr: u32) -> u32 {
    // SAFETY: as for `c_str_at`.
    let s = unsafe { CStr::from_ptr(addr as usize as *const c_char) };
    s.count_bytes() as u32 + 1
}
