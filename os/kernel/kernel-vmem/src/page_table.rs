//! # Page Directory / Page Table
//!
//! On i386 both paging levels are one 4 KiB frame of 1024 32-bit entries,
//! so a single [`PageTable`] type serves as either.

use crate::PageEntryBits;

/// Entries per directory or table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// A page directory or page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// Clear all entries to zero (all non-present).
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    /// Indices and values of all present entries in `range`.
    pub fn present_in(
        &self,
        range: core::ops::Range<usize>,
    ) -> impl Iterator<Item = (usize, PageEntryBits)> + '_ {
        range
            .map(|i| (i, self.entries[i]))
            .filter(|(_, e)| e.present())
    }
}
