use crate::LoadRegisterUnsafe;
use kernel_memory_addresses::VirtualAddress;

/// CR2: the linear address that caused the most recent page fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cr2(pub VirtualAddress);

#[cfg(all(feature = "asm", target_arch = "x86", target_os = "none"))]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(VirtualAddress::new(cr2))
    }
}

#[cfg(not(all(feature = "asm", target_arch = "x86", target_os = "none")))]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        Self(VirtualAddress::zero())
    }
}
