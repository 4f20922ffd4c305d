//! Writer for small ELF32 executables, used by tests.

use crate::header::{EHDR_SIZE, EM_386, ET_EXEC, PFlags, PHDR_SIZE, PT_LOAD};
use alloc::vec::Vec;

const SEGMENT_ALIGN: u32 = 0x1000;

struct Segment {
    vaddr: u32,
    flags: PFlags,
    data: Vec<u8>,
    memsz: u32,
}

/// Builds an `ET_EXEC`, `EM_386` image with one `PT_LOAD` per segment.
///
/// Segment data is laid out after the program headers at offsets congruent
/// to the virtual address modulo the page size, like a linker would, with
/// the last segment ending exactly at the end of the file.
pub struct ImageBuilder {
    entry: u32,
    segments: Vec<Segment>,
}

impl ImageBuilder {
    #[must_use]
    pub const fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// A read-execute segment.
    #[must_use]
    pub fn code(self, vaddr: u32, bytes: &[u8]) -> Self {
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        self.segment(vaddr, PFlags::new().with_read(true).with_execute(true), bytes, len)
    }

    /// A read-write segment of `memsz` bytes, the first `bytes.len()` from the file.
    #[must_use]
    pub fn data(self, vaddr: u32, bytes: &[u8], memsz: u32) -> Self {
        self.segment(vaddr, PFlags::new().with_read(true).with_write(true), bytes, memsz)
    }

    #[must_use]
    pub fn segment(mut self, vaddr: u32, flags: PFlags, bytes: &[u8], memsz: u32) -> Self {
        self.segments.push(Segment {
            vaddr,
            flags,
            data: bytes.to_vec(),
            memsz,
        });
        self
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut offset = (EHDR_SIZE + phnum * PHDR_SIZE) as u32;
        let mut offsets = Vec::with_capacity(phnum);
        for s in &self.segments {
            let want = s.vaddr % SEGMENT_ALIGN;
            let base = offset - offset % SEGMENT_ALIGN;
            let mut at = base + want;
            if at < offset {
                at += SEGMENT_ALIGN;
            }
            offsets.push(at);
            offset = at + s.data.len() as u32;
        }

        let mut out = Vec::with_capacity(offset as usize);
        out.extend_from_slice(b"\x7FELF");
        out.extend_from_slice(&[1, 1, 1, 0]);
        out.resize(16, 0);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_386.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]); // no section headers
        debug_assert_eq!(out.len(), EHDR_SIZE);

        for (s, at) in self.segments.iter().zip(&offsets) {
            for word in [
                PT_LOAD,
                *at,
                s.vaddr,
                s.vaddr,
                s.data.len() as u32,
                s.memsz,
                s.flags.into_bits(),
                SEGMENT_ALIGN,
            ] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        for (s, at) in self.segments.iter().zip(&offsets) {
            out.resize(*at as usize, 0);
            out.extend_from_slice(&s.data);
        }
        out
    }
}
