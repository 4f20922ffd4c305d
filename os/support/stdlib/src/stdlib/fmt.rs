use crate::syscall::write;
use core::fmt::{self, Write};

/// Formats into a small buffer and hands it to `write` in chunks.
pub struct SyscallSink {
    fd: u32,
    buf: [u8; 128],
    len: usize,
}

impl SyscallSink {
    #[must_use]
    pub const fn new(fd: u32) -> Self {
        Self {
            fd,
            buf: [0; 128],
            len: 0,
        }
    }

    pub fn flush(&mut self) {
        if self.len > 0 {
            // Best-effort console output.
            let _ = write(self.fd, &self.buf[..self.len]);
            self.len = 0;
        }
    }
}

impl Write for SyscallSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if self.len == self.buf.len() {
                self.flush();
            }
            self.buf[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}

impl Drop for SyscallSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[doc(hidden)]
pub fn syscall_write(args: fmt::Arguments) {
    let mut sink = SyscallSink::new(super::STDOUT);
    fmt::write(&mut sink, args).ok();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        $crate::stdlib::fmt::syscall_write(core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        $crate::stdlib::fmt::syscall_write(core::format_args!("{}\n", core::format_args!($($arg)*)));
    }};
}
