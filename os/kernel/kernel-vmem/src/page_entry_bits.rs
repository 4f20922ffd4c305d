use crate::PageFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 32-bit i386 page directory or page table entry.
///
/// Both levels share one layout; bit 7 is `PS` in a directory entry and
/// `PAT` in a table entry. The kernel never uses 4 MiB pages, so it stays 0.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS` / `PAT`      | Large page (PDE) / PAT index (PTE) |
/// | 8         | `G`               | Global (leaf only) |
/// | 9         | `owned` (AVL)     | Frame exclusively owned by this address space |
/// | 10–11     | AVL               | Free for OS use |
/// | 12–31     | `frame`           | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let mut e = PageEntryBits::new().with_present(true).with_writable(true);
/// e.set_physical_address(PhysicalAddress::new(0x0012_3000));
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write to a leaf.
    pub dirty: bool,

    /// Page Size in a PDE, PAT in a PTE (bit 7).
    pub large_page: bool,

    /// Global (G, bit 8). Only effective with `CR4.PGE`.
    pub global_translation: bool,

    /// OS-available bit 9: the referenced frame belongs to this address
    /// space alone. Freed on destroy, deep-copied on clone.
    pub owned: bool,

    /// OS-available (bits 10..=11).
    #[bits(2)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_frame_number(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_number() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.frame_number())
    }

    /// A present leaf for `frame` with the requested permissions.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, flags: PageFlags, owned: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.contains(PageFlags::WRITABLE))
            .with_user_access(flags.contains(PageFlags::USER))
            .with_owned(owned)
            .with_frame_number(frame.frame_number())
    }

    /// A directory entry linking `table`. Directory entries are always
    /// writable; the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalPage<Size4K>, user: bool, owned: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_owned(owned)
            .with_frame_number(table.frame_number())
    }

    /// The permissions of a leaf in [`PageFlags`] terms.
    #[inline]
    #[must_use]
    pub const fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.writable() {
            flags = flags.union(PageFlags::WRITABLE);
        }
        if self.user_access() {
            flags = flags.union(PageFlags::USER);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encoding() {
        let frame = PhysicalPage::from_frame_number(0x300);
        let e = PageEntryBits::leaf(frame, PageFlags::USER_RW, true);
        assert_eq!(e.into_bits(), 0x0030_0207);
        assert_eq!(e.frame(), frame);
        assert_eq!(e.page_flags(), PageFlags::USER_RW);
    }

    #[test]
    fn read_only_kernel_leaf() {
        let e = PageEntryBits::leaf(PhysicalPage::from_frame_number(1), PageFlags::empty(), false);
        assert!(e.present());
        assert!(!e.writable());
        assert!(!e.user_access());
        assert!(!e.owned());
    }
}
