//! # QEMU Debug Console Support
//!
//! Logging and tracing for a kernel running under QEMU. Output goes to the
//! debug console I/O port, which QEMU forwards to the host when started with
//! `-debugcon`:
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! ```
//!
//! ## Output Path
//!
//! ```text
//! log::info!() ──► QemuLogger ──┐
//!                               ├──► QemuSink (fmt::Write) ──► out 0x402
//! qemu_trace!() ────────────────┘
//! ```
//!
//! The port write is a plain `out dx, al` and works the same in 32-bit
//! protected mode. On real hardware the port is unused and writes vanish.
//! Off target (host tests) the sink discards its input.
//!
//! ## `enabled` Feature (default)
//!
//! Without it, [`qemu_trace!`] and the logger compile to nothing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! QemuLogger::new(LevelFilter::Debug).init().ok();
//! info!("frame allocator ready");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug console.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        let _ = (QEMU_DEBUG_PORT, c);
    }

    /// Writes raw bytes, e.g. from a user process's `write` system call.
    pub fn write_bytes(bytes: &[u8]) {
        bytes.iter().copied().for_each(dbg_putc);
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            write_bytes(s.as_bytes());
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort debug output.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    pub fn write_bytes(_: &[u8]) {}

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(_: fmt::Arguments) {}
}

#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
