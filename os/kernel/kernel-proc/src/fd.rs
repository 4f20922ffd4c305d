//! # File Descriptors
//!
//! A process holds a fixed number of descriptor slots, each naming an opaque
//! [`FileHandle`]. What a handle refers to is up to the I/O layer; this
//! table only tracks which slots are in use, inherits them across `fork`
//! and drops them on exit.

use kernel_info::process::MAX_FDS;

/// Opaque reference to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u32);

impl FileHandle {
    /// The debug console.
    pub const CONSOLE: Self = Self(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdTable {
    slots: [Option<FileHandle>; MAX_FDS],
}

impl FdTable {
    /// stdin, stdout and stderr all on the console.
    #[must_use]
    pub fn with_console() -> Self {
        let mut t = Self::default();
        t.slots[..3].fill(Some(FileHandle::CONSOLE));
        t
    }

    /// Put `handle` into the lowest free slot.
    pub fn install(&mut self, handle: FileHandle) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(handle);
        Some(fd)
    }

    #[must_use]
    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    pub fn close(&mut self, fd: usize) -> Option<FileHandle> {
        self.slots.get_mut(fd)?.take()
    }

    /// Close everything; returns how many slots were open.
    pub fn close_all(&mut self) -> usize {
        let open = self.open_count();
        self.slots.fill(None);
        open
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_slot_is_reused() {
        let mut t = FdTable::with_console();
        assert_eq!(t.install(FileHandle(7)), Some(3));
        assert_eq!(t.close(1), Some(FileHandle::CONSOLE));
        assert_eq!(t.install(FileHandle(8)), Some(1));
        assert_eq!(t.get(1), Some(FileHandle(8)));
        assert_eq!(t.get(MAX_FDS), None);
    }

    #[test]
    fn table_fills_up() {
        let mut t = FdTable::default();
        for _ in 0..MAX_FDS {
            assert!(t.install(FileHandle(1)).is_some());
        }
        assert_eq!(t.install(FileHandle(1)), None);
        assert_eq!(t.close_all(), MAX_FDS);
        assert_eq!(t.open_count(), 0);
    }
}
