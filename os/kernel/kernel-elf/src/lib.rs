//! # ELF32 Executable Loader
//!
//! Validates i386 ELF images and maps their `PT_LOAD` segments into a user
//! address space through the [`Vmm`](kernel_alloc::vmm::Vmm).
//!
//! ## Checks
//! - identification: magic, 32-bit class, little endian, version 1
//! - `e_machine == EM_386`, `e_type == ET_EXEC`
//! - the program header table lies inside the buffer and declares at least
//!   one `PT_LOAD`
//! - each loadable segment lies inside the buffer (`offset + filesz`), has
//!   `filesz <= memsz`, sits entirely in user space and has a consistent
//!   alignment
//!
//! All checks run before the first page is mapped.
//!
//! ## Loading
//! Every page spanning `[vaddr, vaddr + memsz)` is mapped zeroed, writable
//! only for `PF_W` segments, then the file bytes are copied over. The zeroed
//! tail beyond `filesz` is the uninitialized data (`.bss`).

#![cfg_attr(not(any(test, doctest)), no_std)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

pub mod header;
#[cfg(any(test, feature = "test-support"))]
pub mod image;
mod loader;

pub use loader::{LoadedImage, load_image, load_path, validate};

use kernel_alloc::vmm::VmmError;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("image is truncated")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 32-bit image")]
    NotElf32,
    #[error("not little endian")]
    NotLittleEndian,
    #[error("not an i386 image")]
    BadMachine,
    #[error("neither an executable nor a shared object")]
    BadType,
    #[error("malformed header")]
    BadHeader,
    #[error("no loadable segments")]
    NoLoadSegments,
    #[error("segment extends past the end of the image")]
    SegmentOutOfFile,
    #[error("segment at {0} is outside user space")]
    SegmentOutOfRange(VirtualAddress),
    #[error("segment alignment is inconsistent")]
    BadAlignment,
    #[error("no such file")]
    NotFound,
    #[error("mapping failed: {0}")]
    Map(#[from] VmmError),
}

/// Read-only access to whole files by path.
///
/// The loader is the only user. The kernel implements it over the boot
/// modules handed over by the boot loader.
pub trait FileSource {
    fn read(&self, path: &str) -> Option<&[u8]>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;

    fn image() -> Vec<u8> {
        ImageBuilder::new(0x0804_8000)
            .code(0x0804_8000, &[0xC3])
            .build()
    }

    #[test]
    fn accepts_minimal_image() {
        let bytes = image();
        let view = validate(&bytes).unwrap();
        assert_eq!(view.entry(), VirtualAddress::new(0x0804_8000));
        assert_eq!(view.iter_pt_load().count(), 1);
    }

    #[test]
    fn rejects_bad_identification() {
        let good = image();
        let cases: [(usize, u8, ElfError); 4] = [
            (0, 0x7E, ElfError::BadMagic),
            (4, 2, ElfError::NotElf32),
            (5, 2, ElfError::NotLittleEndian),
            (18, 62, ElfError::BadMachine),
        ];
        for (at, value, err) in cases {
            let mut bytes = good.clone();
            bytes[at] = value;
            assert_eq!(validate(&bytes).err(), Some(err), "byte {at}");
        }
        assert_eq!(validate(&good[..40]).err(), Some(ElfError::TooShort));
    }

    #[test]
    fn rejects_relocatable_and_shared_objects() {
        let mut bytes = image();
        bytes[16] = 1; // ET_REL
        assert_eq!(validate(&bytes).err(), Some(ElfError::BadType));
        bytes[16] = 3; // ET_DYN
        assert_eq!(validate(&bytes).err(), Some(ElfError::BadType));
    }

    #[test]
    fn requires_a_load_segment() {
        let mut bytes = image();
        // Turn the only PT_LOAD into PT_NOTE.
        bytes[header::EHDR_SIZE] = 4;
        assert_eq!(validate(&bytes).err(), Some(ElfError::NoLoadSegments));
    }

    #[test]
    fn program_headers_must_fit() {
        let mut bytes = image();
        bytes[44] = 200; // e_phnum
        assert_eq!(validate(&bytes).err(), Some(ElfError::TooShort));
    }
}
