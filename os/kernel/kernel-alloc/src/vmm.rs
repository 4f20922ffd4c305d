//! Virtual Memory Manager (VMM) for the kernel.
//!
//! [`Vmm`] owns the physical mapper, the frame allocator and the kernel
//! address space, and hands out user address spaces identified by their
//! [`RootPage`]. Every operation that takes a user address checks that it
//! lies inside the user range, so syscall and loader code can pass untrusted
//! addresses straight through.
//!
//! # Example
//! ```
//! use kernel_alloc::vmm::Vmm;
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_vmem::PageFlags;
//! use kernel_vmem::info::IDENTITY_MAP_MIN;
//! use kernel_vmem::sim::{ArenaFrames, FrameArena};
//!
//! let mut vmm = Vmm::new(FrameArena::with_frames(32), ArenaFrames::new(1, 32), IDENTITY_MAP_MIN)?;
//! let space = vmm.create_user_space()?;
//! let va = VirtualAddress::new(0x0804_8000);
//! vmm.map_user(space, va, 16, PageFlags::USER_RW)?;
//! vmm.copy_to_user(space, va, b"hello")?;
//! vmm.destroy_space(space);
//! # Ok::<(), kernel_alloc::vmm::VmmError>(())
//! ```

use kernel_info::memory::{PAGE_SIZE, USERSPACE_END, USERSPACE_START, is_user_range};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, PageFlags, PhysMapper, RootPage, VmemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Vmem(VmemError),
    #[error("{0} is not a user address")]
    NotUserAddress(VirtualAddress),
    #[error("string at {0} is not terminated")]
    Unterminated(VirtualAddress),
}

impl From<VmemError> for VmmError {
    fn from(value: VmemError) -> Self {
        match value {
            VmemError::OutOfFrames => Self::OutOfMemory,
            other => Self::Vmem(other),
        }
    }
}

/// Kernel virtual memory manager.
pub struct Vmm<M: PhysMapper, A: FrameAlloc> {
    mapper: M,
    frames: A,
    kernel: RootPage,
    identity_bytes: u32,
}

impl<M: PhysMapper, A: FrameAlloc> Vmm<M, A> {
    /// Build the kernel address space over `frames`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if the directory or an identity table cannot
    /// be allocated; the kernel cannot continue without it.
    pub fn new(mapper: M, mut frames: A, identity_bytes: u32) -> Result<Self, VmmError> {
        let kernel = AddressSpace::create_kernel(&mapper, &mut frames, identity_bytes)?.root_page();
        Ok(Self {
            mapper,
            frames,
            kernel,
            identity_bytes,
        })
    }

    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel
    }

    #[must_use]
    pub const fn identity_bytes(&self) -> u32 {
        self.identity_bytes
    }

    #[must_use]
    pub const fn frames(&self) -> &A {
        &self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }

    /// A handle on the space rooted at `root`.
    #[must_use]
    pub const fn space(&self, root: RootPage) -> AddressSpace<'_, M> {
        AddressSpace::from_root(&self.mapper, root)
    }

    /// A fresh user space sharing the kernel mappings.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`].
    pub fn create_user_space(&mut self) -> Result<RootPage, VmmError> {
        let kernel = AddressSpace::from_root(&self.mapper, self.kernel);
        Ok(AddressSpace::new_user(&kernel, &mut self.frames)?.root_page())
    }

    /// Deep copy of the space rooted at `root`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`]; nothing of the copy survives.
    pub fn clone_space(&mut self, root: RootPage) -> Result<RootPage, VmmError> {
        let space = AddressSpace::from_root(&self.mapper, root);
        Ok(space.clone_user(&mut self.frames)?.root_page())
    }

    /// Return every frame owned by the space. The kernel space is never freed.
    pub fn destroy_space(&mut self, root: RootPage) {
        if root == self.kernel {
            log::warn!("refusing to destroy the kernel address space");
            return;
        }
        AddressSpace::from_root(&self.mapper, root).destroy(&mut self.frames);
    }

    /// Make `root` the active address space.
    ///
    /// # Safety
    /// `root` must be the kernel space or a live space built by this manager.
    pub unsafe fn activate(&self, root: RootPage) {
        // SAFETY: every space built here carries the kernel identity map.
        unsafe { self.space(root).activate() }
    }

    /// Map zeroed, owned pages covering `[va, va + len)`, skipping pages that
    /// are already present. Returns the number of pages added.
    ///
    /// # Errors
    /// [`VmmError::NotUserAddress`] if the range leaves user space,
    /// [`VmmError::OutOfMemory`] if frames run out. Pages added before the
    /// failure stay mapped.
    pub fn map_user(
        &mut self,
        root: RootPage,
        va: VirtualAddress,
        len: u32,
        flags: PageFlags,
    ) -> Result<usize, VmmError> {
        Self::check_range(va, len)?;
        let space = AddressSpace::from_root(&self.mapper, root);
        Ok(space.map_anon_range(&mut self.frames, va, len, flags | PageFlags::USER)?)
    }

    /// Set the permissions of every mapped page in `[va, va + len)`.
    ///
    /// # Errors
    /// [`VmmError::NotUserAddress`] if the range leaves user space, or the
    /// first unmapped page.
    pub fn protect_user(
        &self,
        root: RootPage,
        va: VirtualAddress,
        len: u32,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        Self::check_range(va, len)?;
        let space = self.space(root);
        let mut page = va.align_down::<Size4K>();
        let end = va.as_u32() + len;
        while page.as_u32() < end {
            space.protect(page, flags | PageFlags::USER)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy `bytes` into user memory.
    ///
    /// # Errors
    /// [`VmmError::NotUserAddress`] or an unmapped page.
    pub fn copy_to_user(
        &self,
        root: RootPage,
        va: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), VmmError> {
        Self::check_range(va, Self::len32(va, bytes.len())?)?;
        Ok(self.space(root).write_bytes(va, bytes)?)
    }

    /// Copy user memory into `out`.
    ///
    /// # Errors
    /// [`VmmError::NotUserAddress`] or an unmapped page.
    pub fn copy_from_user(
        &self,
        root: RootPage,
        va: VirtualAddress,
        out: &mut [u8],
    ) -> Result<(), VmmError> {
        Self::check_range(va, Self::len32(va, out.len())?)?;
        Ok(self.space(root).read_bytes(va, out)?)
    }

    /// Zero `len` bytes of user memory.
    ///
    /// # Errors
    /// [`VmmError::NotUserAddress`] or an unmapped page.
    pub fn zero_user(&self, root: RootPage, va: VirtualAddress, len: u32) -> Result<(), VmmError> {
        Self::check_range(va, len)?;
        Ok(self.space(root).zero(va, len as usize)?)
    }

    /// Read a NUL-terminated string of at most `buf.len() - 1` bytes.
    /// Returns the bytes before the terminator.
    ///
    /// # Errors
    /// [`VmmError::Unterminated`] if no NUL fits into `buf`, or any error of
    /// [`copy_from_user`](Self::copy_from_user).
    pub fn read_user_str<'b>(
        &self,
        root: RootPage,
        va: VirtualAddress,
        buf: &'b mut [u8],
    ) -> Result<&'b [u8], VmmError> {
        let space = self.space(root);
        for i in 0..buf.len() {
            let at = va
                .checked_add(Self::len32(va, i)?)
                .ok_or(VmmError::NotUserAddress(va))?;
            Self::check_range(at, 1)?;
            let mut byte = [0u8];
            space.read_bytes(at, &mut byte)?;
            if byte[0] == 0 {
                return Ok(&buf[..i]);
            }
            buf[i] = byte[0];
        }
        Err(VmmError::Unterminated(va))
    }

    /// Check that `[va, va + len)` is mapped user memory, writable if asked.
    ///
    /// # Errors
    /// [`VmmError::NotUserAddress`] outside the user range or for a page
    /// without the required permission, [`VmemError::NotMapped`] for a hole.
    pub fn check_user(
        &self,
        root: RootPage,
        va: VirtualAddress,
        len: u32,
        write: bool,
    ) -> Result<(), VmmError> {
        Self::check_range(va, len)?;
        if len == 0 {
            return Ok(());
        }
        let space = self.space(root);
        let mut page = va.align_down::<Size4K>();
        let end = va.as_u32() + len;
        while page.as_u32() < end {
            let entry = space.entry(page).ok_or(VmemError::NotMapped(page))?;
            if !entry.user_access() || (write && !entry.writable()) {
                return Err(VmmError::NotUserAddress(page));
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    #[must_use]
    pub fn translate(&self, root: RootPage, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space(root).translate(va)
    }

    fn check_range(va: VirtualAddress, len: u32) -> Result<(), VmmError> {
        if is_user_range(va.as_u32(), len) {
            Ok(())
        } else {
            Err(VmmError::NotUserAddress(va))
        }
    }

    fn len32(va: VirtualAddress, len: usize) -> Result<u32, VmmError> {
        let max = USERSPACE_END.as_u32() - USERSPACE_START.as_u32();
        u32::try_from(len)
            .ok()
            .filter(|l| *l <= max)
            .ok_or(VmmError::NotUserAddress(va))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BitmapFrameAlloc;
    use kernel_info::memory::IDENTITY_MAP_MIN;
    use kernel_vmem::sim::FrameArena;

    const FRAMES: u32 = 64;
    const VA: VirtualAddress = VirtualAddress::new(0x0804_8000);

    fn vmm() -> Vmm<FrameArena, BitmapFrameAlloc<'static>> {
        let words = Box::leak(vec![0u64; BitmapFrameAlloc::storage_words(FRAMES)].into_boxed_slice());
        let mut frames = BitmapFrameAlloc::new(words, FRAMES);
        frames.mark_region_free(PhysicalAddress::new(PAGE_SIZE), (FRAMES - 1) * PAGE_SIZE);
        Vmm::new(FrameArena::with_frames(FRAMES as usize), frames, IDENTITY_MAP_MIN).unwrap()
    }

    #[test]
    fn user_space_lifecycle_returns_all_frames() {
        let mut vmm = vmm();
        let baseline = vmm.frames().stats().used_frames;

        let space = vmm.create_user_space().unwrap();
        assert_eq!(vmm.map_user(space, VA, 3 * PAGE_SIZE, PageFlags::USER_RW), Ok(3));
        let copy = vmm.clone_space(space).unwrap();
        assert!(vmm.frames().stats().used_frames > baseline);

        vmm.destroy_space(copy);
        vmm.destroy_space(space);
        assert_eq!(vmm.frames().stats().used_frames, baseline);

        // The kernel space survives a stray destroy.
        vmm.destroy_space(vmm.kernel_root());
        assert_eq!(vmm.frames().stats().used_frames, baseline);
    }

    #[test]
    fn rejects_kernel_addresses() {
        let mut vmm = vmm();
        let space = vmm.create_user_space().unwrap();
        let low = VirtualAddress::new(0x0010_0000);
        assert_eq!(
            vmm.map_user(space, low, PAGE_SIZE, PageFlags::USER_RW),
            Err(VmmError::NotUserAddress(low))
        );
        assert_eq!(vmm.copy_to_user(space, low, b"x"), Err(VmmError::NotUserAddress(low)));
        let top = VirtualAddress::new(0xBFFF_FFFF);
        assert_eq!(vmm.zero_user(space, top, 2), Err(VmmError::NotUserAddress(top)));
    }

    #[test]
    fn copies_across_page_boundaries() {
        let mut vmm = vmm();
        let space = vmm.create_user_space().unwrap();
        vmm.map_user(space, VA, 2 * PAGE_SIZE, PageFlags::USER_RW).unwrap();

        let at = VA + (PAGE_SIZE - 3);
        vmm.copy_to_user(space, at, b"boundary\0").unwrap();
        let mut out = [0u8; 8];
        vmm.copy_from_user(space, at, &mut out).unwrap();
        assert_eq!(&out, b"boundary");

        let mut buf = [0u8; 16];
        assert_eq!(vmm.read_user_str(space, at, &mut buf), Ok(&b"boundary"[..]));
        let mut small = [0u8; 4];
        assert_eq!(vmm.read_user_str(space, at, &mut small), Err(VmmError::Unterminated(at)));
    }

    #[test]
    fn check_user_requires_permissions() {
        let mut vmm = vmm();
        let space = vmm.create_user_space().unwrap();
        vmm.map_user(space, VA, PAGE_SIZE, PageFlags::USER_RO).unwrap();

        assert_eq!(vmm.check_user(space, VA, 16, false), Ok(()));
        assert_eq!(vmm.check_user(space, VA, 16, true), Err(VmmError::NotUserAddress(VA)));
        let next = VA + PAGE_SIZE;
        assert_eq!(
            vmm.check_user(space, VA + 10, PAGE_SIZE, false),
            Err(VmmError::Vmem(VmemError::NotMapped(next)))
        );
    }

    #[test]
    fn exhaustion_maps_to_out_of_memory() {
        let mut vmm = vmm();
        let space = vmm.create_user_space().unwrap();
        let free = vmm.frames().stats().free_frames;
        assert_eq!(
            vmm.map_user(space, VA, (free + 1) * PAGE_SIZE, PageFlags::USER_RW),
            Err(VmmError::OutOfMemory)
        );
    }
}
