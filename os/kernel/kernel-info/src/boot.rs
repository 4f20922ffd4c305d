//! # Kernel Boot Information
//!
//! The kernel is entered through the Multiboot v1 protocol. The boot loader
//! leaves the magic value in `eax` and the physical address of a
//! [`MultibootInfo`] block in `ebx`; `_start` forwards both to the kernel
//! entry point, which matches [`KernelEntryFn`].
//!
//! Everything the loader hands over lives in identity-mapped low memory. The
//! kernel turns the raw pointers into byte slices once and uses the readers
//! in this module from there on, so the parsing itself stays safe and can be
//! tested on the host.

use core::fmt;

/// Kernel function pointer, called from the assembly entry stub.
pub type KernelEntryFn = extern "C" fn(magic: u32, info: u32) -> !;

/// Value the boot loader places in `eax`.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Magic value of the Multiboot header embedded in the kernel image.
pub const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;

/// Header flags: page-align modules, provide a memory map.
pub const MULTIBOOT_HEADER_FLAGS: u32 = 0b11;

/// `MULTIBOOT_HEADER_MAGIC + FLAGS + CHECKSUM` must be zero.
pub const MULTIBOOT_HEADER_CHECKSUM: u32 =
    0u32.wrapping_sub(MULTIBOOT_HEADER_MAGIC.wrapping_add(MULTIBOOT_HEADER_FLAGS));

/// Bits in [`MultibootInfo::flags`].
pub mod info_flags {
    pub const MEMORY: u32 = 1 << 0;
    pub const CMDLINE: u32 = 1 << 2;
    pub const MODULES: u32 = 1 << 3;
    pub const MEMORY_MAP: u32 = 1 << 6;
}

/// The Multiboot information block (only the fields the kernel reads).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB of memory below 1 MiB.
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB.
    pub mem_upper: u32,
    pub boot_device: u32,
    /// Physical address of the NUL-terminated command line.
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

impl MultibootInfo {
    #[must_use]
    pub const fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Classification of a physical memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    Defective,
}

impl MemoryKind {
    const fn from_raw(kind: u32) -> Self {
        match kind {
            1 => Self::Available,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::Defective,
            _ => Self::Reserved,
        }
    }
}

/// One entry of the firmware memory map.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub len: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x}..{:#010x} {:?}",
            self.base,
            self.end(),
            self.kind
        )
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at.checked_add(4)?)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let lo = u64::from(read_u32(bytes, at)?);
    let hi = u64::from(read_u32(bytes, at.checked_add(4)?)?);
    Some(lo | (hi << 32))
}

/// Reader over the raw Multiboot memory map buffer.
///
/// Each entry starts with its own size field, which does not count itself,
/// so entries are walked by `size + 4`.
#[derive(Clone)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
}

impl<'a> MemoryMap<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn iter(&self) -> MemoryMapIter<'a> {
        MemoryMapIter {
            bytes: self.bytes,
            pos: 0,
        }
    }

    /// Highest end address over all available regions.
    #[must_use]
    pub fn available_end(&self) -> u64 {
        self.iter()
            .filter(|r| r.kind == MemoryKind::Available)
            .map(|r| r.end())
            .max()
            .unwrap_or(0)
    }
}

impl<'a> IntoIterator for &MemoryMap<'a> {
    type Item = MemoryRegion;
    type IntoIter = MemoryMapIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct MemoryMapIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Iterator for MemoryMapIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let size = read_u32(self.bytes, self.pos)? as usize;
        // A truncated trailing entry ends the walk.
        if size < 20 {
            return None;
        }
        let base = read_u64(self.bytes, self.pos + 4)?;
        let len = read_u64(self.bytes, self.pos + 12)?;
        let kind = read_u32(self.bytes, self.pos + 20)?;
        self.pos = self.pos.checked_add(size + 4)?;
        Some(MemoryRegion {
            base,
            len,
            kind: MemoryKind::from_raw(kind),
        })
    }
}

/// A boot module as described by the module list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    pub start: u32,
    pub end: u32,
    /// Physical address of the module's NUL-terminated command line.
    pub string: u32,
}

impl ModuleEntry {
    /// Size of one raw module list entry.
    pub const SIZE: usize = 16;

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterates the raw module list (`mods_count * 16` bytes).
pub fn modules(bytes: &[u8]) -> impl Iterator<Item = ModuleEntry> + '_ {
    bytes.chunks_exact(ModuleEntry::SIZE).filter_map(|chunk| {
        Some(ModuleEntry {
            start: read_u32(chunk, 0)?,
            end: read_u32(chunk, 4)?,
            string: read_u32(chunk, 8)?,
        })
    })
}

/// Returns the bytes of a NUL-terminated string as UTF-8, up to the terminator.
#[must_use]
pub fn c_str(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..len]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64, len: u64, kind: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&20u32.to_le_bytes());
        v.extend_from_slice(&base.to_le_bytes());
        v.extend_from_slice(&len.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v
    }

    #[test]
    fn header_checksum_sums_to_zero() {
        let sum = MULTIBOOT_HEADER_MAGIC
            .wrapping_add(MULTIBOOT_HEADER_FLAGS)
            .wrapping_add(MULTIBOOT_HEADER_CHECKSUM);
        assert_eq!(sum, 0);
    }

    #[test]
    fn memory_map_walks_entries() {
        let mut raw = entry(0, 0x9_fc00, 1);
        raw.extend(entry(0xf_0000, 0x1_0000, 2));
        raw.extend(entry(0x10_0000, 0x3f0_0000, 1));
        let map = MemoryMap::new(&raw);
        let regions: Vec<_> = map.iter().collect();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1].kind, MemoryKind::Reserved);
        assert_eq!(regions[2].end(), 0x400_0000);
        assert_eq!(map.available_end(), 0x400_0000);
    }

    #[test]
    fn truncated_memory_map_stops() {
        let mut raw = entry(0x10_0000, 0x1000, 1);
        raw.extend_from_slice(&[20, 0, 0, 0, 1, 2]);
        assert_eq!(MemoryMap::new(&raw).iter().count(), 1);
    }

    #[test]
    fn modules_and_strings() {
        let mut raw = Vec::new();
        for v in [0x20_0000u32, 0x20_3000, 0x1_0000, 0] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        let mods: Vec<_> = modules(&raw).collect();
        assert_eq!(mods.len(), 1);
        assert_eq!(mods[0].len(), 0x3000);
        assert_eq!(c_str(b"/bin/init\0junk"), "/bin/init");
        assert_eq!(c_str(b"no-terminator"), "no-terminator");
    }
}
