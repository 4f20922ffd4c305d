//! ELF32 header and program header views without allocation.

use crate::ElfError;
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u32 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
pub struct Eh32 {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: VirtualAddress,
    pub e_phoff: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
pub struct Ph32 {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: VirtualAddress,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: PFlags,
    pub p_align: u32,
}

/// `Elf32_Phdr.p_flags`: bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
pub struct PFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

#[inline]
fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

#[inline]
fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// A validated image: header plus program header table, borrowed.
pub struct ElfView<'a> {
    bytes: &'a [u8],
    pub eh: Eh32,
}

impl<'a> ElfView<'a> {
    /// Check the identification, machine, type and program header table.
    ///
    /// # Errors
    /// The first [`ElfError`] the header violates. Segment contents are not
    /// inspected here.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < EHDR_SIZE {
            return Err(ElfError::TooShort);
        }
        if &bytes[0..4] != b"\x7FELF" {
            return Err(ElfError::BadMagic);
        }
        if bytes[4] != ELFCLASS32 {
            return Err(ElfError::NotElf32);
        }
        if bytes[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }

        let eh = Eh32 {
            e_type: le16(bytes, 16),
            e_machine: le16(bytes, 18),
            e_entry: VirtualAddress::new(le32(bytes, 24)),
            e_phoff: le32(bytes, 28),
            e_phentsize: le16(bytes, 42),
            e_phnum: le16(bytes, 44),
        };
        if eh.e_machine != EM_386 {
            return Err(ElfError::BadMachine);
        }
        // Only fixed-address executables; there is no relocation.
        if eh.e_type != ET_EXEC {
            return Err(ElfError::BadType);
        }
        if le32(bytes, 20) != EV_CURRENT || usize::from(eh.e_phentsize) != PHDR_SIZE {
            return Err(ElfError::BadHeader);
        }

        let need = (eh.e_phoff as usize)
            .checked_add(usize::from(eh.e_phnum) * PHDR_SIZE)
            .ok_or(ElfError::TooShort)?;
        if need > bytes.len() {
            return Err(ElfError::TooShort);
        }

        let view = Self { bytes, eh };
        if view.iter_pt_load().next().is_none() {
            return Err(ElfError::NoLoadSegments);
        }
        Ok(view)
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.eh.e_entry
    }

    /// Iterate all program headers.
    pub fn iter_ph(&self) -> impl Iterator<Item = Ph32> + '_ {
        let base = self.eh.e_phoff as usize;
        (0..usize::from(self.eh.e_phnum)).map(move |i| {
            let at = base + i * PHDR_SIZE;
            let s = &self.bytes[at..at + PHDR_SIZE];
            Ph32 {
                p_type: le32(s, 0),
                p_offset: le32(s, 4),
                p_vaddr: VirtualAddress::new(le32(s, 8)),
                p_filesz: le32(s, 16),
                p_memsz: le32(s, 20),
                p_flags: PFlags::from_bits(le32(s, 24)),
                p_align: le32(s, 28),
            }
        })
    }

    /// Only the `PT_LOAD` headers.
    pub fn iter_pt_load(&self) -> impl Iterator<Item = Ph32> + '_ {
        self.iter_ph().filter(|ph| ph.p_type == PT_LOAD)
    }
}

impl Ph32 {
    /// The in-file bytes of this segment.
    ///
    /// # Errors
    /// [`ElfError::SegmentOutOfFile`] if `offset + filesz` leaves `bytes`.
    pub fn file_bytes<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], ElfError> {
        let off = self.p_offset as usize;
        let end = off
            .checked_add(self.p_filesz as usize)
            .ok_or(ElfError::SegmentOutOfFile)?;
        bytes.get(off..end).ok_or(ElfError::SegmentOutOfFile)
    }
}
