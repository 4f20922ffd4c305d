//! # x86 I/O Port Access
//!
//! Thin wrappers around `out dx, al` and `in al, dx` for the legacy devices
//! the kernel programs: the 8259A PIC pair and the 8253 PIT.
//!
//! ```text
//! 0x0020-0x0021   PIC #1
//! 0x0040-0x0043   PIT
//! 0x00A0-0x00A1   PIC #2
//! ```
//!
//! Host builds compile these to no-ops so the pure parts of the drivers stay
//! testable.

/// Write one byte to an I/O port.
///
/// # Safety
/// - Ring 0 (user code has no I/O permission bitmap).
/// - `port` must belong to the intended device and be in a state that
///   accepts this write.
/// - Multi-byte register protocols must not be interleaved with other
///   writers; callers keep interrupts off while programming a device.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = (port, val);
}

/// Read one byte from an I/O port.
///
/// # Safety
/// As for [`outb`]; reading some registers changes device state.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let v: u8;
        unsafe {
            core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
        }
        v
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        let _ = port;
        0xFF
    }
}
