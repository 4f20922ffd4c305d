//! # User-side runtime
//!
//! The system call numbers and error codes shared by kernel and user
//! programs ([`syscall_abi`]), the `int 0x80` wrappers ([`syscall`]) and a
//! minimal print facility on top of `write` ([`stdlib`]).
//!
//! The kernel only enables `kernel`, which pulls in the ABI definitions.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(feature = "syscall"), forbid(unsafe_code))]
#![cfg_attr(feature = "syscall", allow(unsafe_code))]

#[cfg(feature = "stdlib")]
#[macro_use]
pub mod stdlib;

#[cfg(feature = "syscall")]
pub mod syscall;

#[cfg(feature = "syscall-abi")]
pub mod syscall_abi;

#[cfg(feature = "stdlib")]
pub use stdlib::*;

#[cfg(all(feature = "stdlib", target_os = "none"))]
mod panic {
    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        crate::println!("panic: {info}");
        crate::syscall::exit(101)
    }
}
