//! # Address Space (i386, page-directory rooted)
//!
//! Helpers to build and manipulate a **single** virtual address space: the
//! tree rooted at one page directory.
//!
//! ## Highlights
//!
//! - [`AddressSpace::create_kernel`] builds the identity-mapped kernel space.
//! - [`AddressSpace::new_user`] makes a fresh space sharing the kernel's tables.
//! - [`AddressSpace::clone_user`] deep-copies all owned tables and frames.
//! - [`AddressSpace::destroy`] returns every owned frame to the allocator.
//! - [`AddressSpace::map_one`] / [`map_anon`](AddressSpace::map_anon) /
//!   [`unmap_one`](AddressSpace::unmap_one) / [`translate`](AddressSpace::translate)
//!   for single pages.
//! - [`AddressSpace::write_bytes`] / [`read_bytes`](AddressSpace::read_bytes) to
//!   move data into a space that need not be active.
//!
//! ## TLB
//!
//! A single-page change is followed by `invlpg` when the space is the active
//! one. Switching spaces reloads CR3, which flushes everything else.

use crate::page_table::ENTRIES_PER_TABLE;
use crate::{FrameAlloc, PageEntryBits, PageFlags, PageTable, PhysMapper, VmemError, invlpg};
use kernel_info::memory::{PAGE_SIZE, USERSPACE_END, USERSPACE_START};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress,
};

/// The page directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Handle to a single, concrete address space.
///
/// The handle does not own the directory in the Rust sense; dropping it
/// frees nothing. Ownership is expressed by calling [`destroy`](Self::destroy).
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

const FRAME_BYTES: usize = PAGE_SIZE as usize;

/// Bytes covered by one directory entry.
const DIRECTORY_SPAN: u32 = Size4M::SIZE;

/// Directory slots that may hold user tables.
const USER_DIR_RANGE: core::ops::Range<usize> =
    USERSPACE_START.directory_index()..USERSPACE_END.directory_index();

type Frame = [u8; FRAME_BYTES];

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// If you already know the root frame, wrap it.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the page directory.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Build the kernel address space: identity map `[0, identity_bytes)` with
    /// supervisor read/write pages.
    ///
    /// The tables are shared by every later address space and are not tagged
    /// as owned, so no clone or destroy ever copies or frees them.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if the directory or a table cannot be
    /// allocated. Frames taken so far are returned first.
    pub fn create_kernel<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        identity_bytes: u32,
    ) -> Result<Self, VmemError> {
        if identity_bytes % DIRECTORY_SPAN != 0 {
            return Err(VmemError::Misaligned(identity_bytes));
        }
        let space = Self::from_root(mapper, Self::alloc_zeroed_table(mapper, alloc)?);
        let tables = (identity_bytes / DIRECTORY_SPAN) as usize;
        let mut next_frame = 0u32;
        for pdi in 0..tables {
            let Some(table_frame) = alloc.alloc_4k() else {
                space.release_kernel_build(alloc, pdi);
                return Err(VmemError::OutOfFrames);
            };
            let table = space.table_mut(table_frame);
            for pti in 0..ENTRIES_PER_TABLE {
                let frame = PhysicalPage::from_frame_number(next_frame);
                table.set(pti, PageEntryBits::leaf(frame, PageFlags::KERNEL_RW, false));
                next_frame += 1;
            }
            space
                .directory()
                .set(pdi, PageEntryBits::table_link(table_frame, false, false));
        }
        log::debug!(
            "kernel address space at {} identity maps {} MiB",
            space.root.base(),
            identity_bytes >> 20
        );
        Ok(space)
    }

    /// Undo a partially built kernel space with `tables` tables linked.
    fn release_kernel_build<A: FrameAlloc>(&self, alloc: &mut A, tables: usize) {
        for pdi in 0..tables {
            alloc.free_4k(self.directory().get(pdi).frame());
        }
        alloc.free_4k(self.root);
    }

    /// A fresh, empty user address space that shares all of `kernel`'s mappings.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if the directory cannot be allocated.
    pub fn new_user<A: FrameAlloc>(
        kernel: &Self,
        alloc: &mut A,
    ) -> Result<Self, VmemError> {
        let space = Self::from_root(kernel.mapper, Self::alloc_zeroed_table(kernel.mapper, alloc)?);
        space.share_kernel_tables(kernel);
        Ok(space)
    }

    /// Copy every present, non-owned directory entry of `kernel`.
    fn share_kernel_tables(&self, kernel: &Self) {
        let src = kernel.directory();
        let dst = self.directory();
        for (i, e) in src.present_in(0..ENTRIES_PER_TABLE) {
            if !e.owned() {
                dst.set(i, e);
            }
        }
    }

    /// Full, eager duplicate of this space: owned tables and frames are copied
    /// byte for byte, shared kernel tables are linked as they are.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if any frame runs out. The partial copy is
    /// destroyed before returning, so nothing leaks.
    pub fn clone_user<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, VmemError> {
        let child = Self::from_root(self.mapper, Self::alloc_zeroed_table(self.mapper, alloc)?);
        child.share_kernel_tables(self);
        if let Err(e) = self.copy_owned_into(&child, alloc) {
            child.destroy(alloc);
            return Err(e);
        }
        log::debug!(
            "cloned address space {} into {} ({} owned frames)",
            self.root.base(),
            child.root.base(),
            child.owned_frames()
        );
        Ok(child)
    }

    fn copy_owned_into<A: FrameAlloc>(&self, child: &Self, alloc: &mut A) -> Result<(), VmemError> {
        for (pdi, pde) in self.directory().present_in(0..ENTRIES_PER_TABLE) {
            if !pde.owned() {
                continue;
            }
            let new_table = Self::alloc_zeroed_table(self.mapper, alloc)?;
            // Link first so that a later failure still frees this table.
            child.directory().set(
                pdi,
                PageEntryBits::table_link(new_table, pde.user_access(), true),
            );
            let src = self.table_mut(pde.frame());
            let dst = self.table_mut(new_table);
            for (pti, pte) in src.present_in(0..ENTRIES_PER_TABLE) {
                if !pte.owned() {
                    dst.set(pti, pte);
                    continue;
                }
                let frame = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
                self.frame_mut(frame).copy_from_slice(self.frame_mut(pte.frame()));
                dst.set(pti, PageEntryBits::leaf(frame, pte.page_flags(), true));
            }
        }
        Ok(())
    }

    /// Free every owned frame and table, then the directory itself.
    ///
    /// Shared kernel tables and non-owned leaves are left alone. The space
    /// must not be active.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let mut freed = 0usize;
        for (_, pde) in self.directory().present_in(0..ENTRIES_PER_TABLE) {
            if !pde.owned() {
                continue;
            }
            let table = self.table_mut(pde.frame());
            for (_, pte) in table.present_in(0..ENTRIES_PER_TABLE) {
                if pte.owned() {
                    alloc.free_4k(pte.frame());
                    freed += 1;
                }
            }
            alloc.free_4k(pde.frame());
            freed += 1;
        }
        alloc.free_4k(self.root);
        log::debug!(
            "destroyed address space {} ({} frames returned)",
            self.root.base(),
            freed + 1
        );
    }

    /// Load CR3 with this address space’s root.
    ///
    /// # Safety
    /// The kernel's identity range must be present in this space (true for
    /// every space built by this module), otherwise the next instruction
    /// fetch faults.
    #[inline]
    pub unsafe fn activate(&self) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            use kernel_registers::StoreRegisterUnsafe;
            use kernel_registers::cr3::Cr3;
            unsafe { Cr3::from_directory_phys(self.root.base(), false, false).store_unsafe() }
        }
    }

    /// Whether CR3 currently points at this space.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr3::Cr3;
        let cr3 = unsafe { Cr3::load_unsafe() };
        cr3.directory_phys() == self.root.base()
    }

    /// Off target nothing is ever loaded into CR3.
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        false
    }

    /// Map **one** 4 KiB page `va → frame` with `flags`, allocating the page
    /// table on demand. `owned` tags the frame as belonging to this space.
    ///
    /// # Errors
    /// - [`VmemError::Misaligned`] if `va` is not page aligned.
    /// - [`VmemError::KernelRange`] for a user page outside user space, or any
    ///   page whose table is shared with the kernel.
    /// - [`VmemError::AlreadyMapped`] if `va` already has a mapping.
    /// - [`VmemError::OutOfFrames`] if a new table cannot be allocated.
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageFlags,
        owned: bool,
    ) -> Result<(), VmemError> {
        if !va.is_aligned::<Size4K>() {
            return Err(VmemError::Misaligned(va.as_u32()));
        }
        let user = flags.contains(PageFlags::USER);
        if user && !USER_DIR_RANGE.contains(&va.directory_index()) {
            return Err(VmemError::KernelRange(va));
        }
        let table = self.ensure_table(alloc, va, user)?;
        if table.get(va.table_index()).present() {
            return Err(VmemError::AlreadyMapped(va));
        }
        table.set(va.table_index(), PageEntryBits::leaf(frame, flags, owned));
        if self.is_active() {
            invlpg(va);
        }
        Ok(())
    }

    /// Map a freshly allocated, zeroed, owned frame at `va`.
    ///
    /// # Errors
    /// As [`map_one`](Self::map_one). The frame is returned on failure.
    pub fn map_anon<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        flags: PageFlags,
    ) -> Result<PhysicalPage<Size4K>, VmemError> {
        let frame = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        self.frame_mut(frame).fill(0);
        if let Err(e) = self.map_one(alloc, va, frame, flags, true) {
            alloc.free_4k(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Map `[va, va + len)` page by page with fresh zeroed frames, skipping
    /// pages that are already mapped. Returns the number of pages added.
    ///
    /// # Errors
    /// As [`map_anon`](Self::map_anon). Pages mapped before the failure stay
    /// mapped and are reclaimed by [`destroy`](Self::destroy).
    pub fn map_anon_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        len: u32,
        flags: PageFlags,
    ) -> Result<usize, VmemError> {
        let start = va.align_down::<Size4K>();
        let end = va
            .checked_add(len)
            .and_then(VirtualAddress::align_up::<Size4K>)
            .ok_or(VmemError::KernelRange(va))?;
        let mut added = 0;
        let mut page = start;
        while page < end {
            if !self.is_mapped(page) {
                self.map_anon(alloc, page, flags)?;
                added += 1;
            }
            page += PAGE_SIZE;
        }
        Ok(added)
    }

    /// Unmap a single 4 KiB page and free its frame if owned.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if nothing is mapped at `va`,
    /// [`VmemError::KernelRange`] if the page lives in a shared kernel table.
    pub fn unmap_one<A: FrameAlloc>(&self, alloc: &mut A, va: VirtualAddress) -> Result<(), VmemError> {
        let pde = self.directory().get(va.directory_index());
        if !pde.present() {
            return Err(VmemError::NotMapped(va));
        }
        if !pde.owned() {
            return Err(VmemError::KernelRange(va));
        }
        let table = self.table_mut(pde.frame());
        let pte = table.get(va.table_index());
        if !pte.present() {
            return Err(VmemError::NotMapped(va));
        }
        table.set(va.table_index(), PageEntryBits::new());
        if self.is_active() {
            invlpg(va);
        }
        if pte.owned() {
            alloc.free_4k(pte.frame());
        }
        Ok(())
    }

    /// Replace the permissions of the page at `va`, keeping its frame and
    /// ownership.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if nothing is mapped at `va`,
    /// [`VmemError::KernelRange`] for pages in a shared kernel table or a
    /// user page outside user space.
    pub fn protect(&self, va: VirtualAddress, flags: PageFlags) -> Result<(), VmemError> {
        let pde = self.directory().get(va.directory_index());
        if !pde.present() {
            return Err(VmemError::NotMapped(va));
        }
        if !pde.owned()
            || (flags.contains(PageFlags::USER) && !USER_DIR_RANGE.contains(&va.directory_index()))
        {
            return Err(VmemError::KernelRange(va));
        }
        let table = self.table_mut(pde.frame());
        let pte = table.get(va.table_index());
        if !pte.present() {
            return Err(VmemError::NotMapped(va));
        }
        table.set(
            va.table_index(),
            PageEntryBits::leaf(pte.frame(), flags, pte.owned()),
        );
        if self.is_active() {
            invlpg(va);
        }
        Ok(())
    }

    /// The leaf entry for `va`, if present.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let pde = self.directory().get(va.directory_index());
        if !pde.present() {
            return None;
        }
        let pte = self.table_mut(pde.frame()).get(va.table_index());
        pte.present().then_some(pte)
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pte = self.entry(va)?;
        Some(pte.frame().join(va.offset::<Size4K>()))
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.entry(va).is_some()
    }

    /// Number of frames this space owns (tables and leaves, not the directory).
    #[must_use]
    pub fn owned_frames(&self) -> usize {
        self.directory()
            .present_in(0..ENTRIES_PER_TABLE)
            .filter(|(_, pde)| pde.owned())
            .map(|(_, pde)| {
                1 + self
                    .table_mut(pde.frame())
                    .present_in(0..ENTRIES_PER_TABLE)
                    .filter(|(_, pte)| pte.owned())
                    .count()
            })
            .sum()
    }

    /// Copy `bytes` to `va` through the physical frames backing it.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] at the first unmapped page; earlier pages
    /// are already written.
    pub fn write_bytes(&self, va: VirtualAddress, bytes: &[u8]) -> Result<(), VmemError> {
        self.for_each_chunk(va, bytes.len(), |frame, range, done| {
            frame[range.clone()].copy_from_slice(&bytes[done..done + range.len()]);
        })
    }

    /// Copy from `va` into `out`.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] at the first unmapped page.
    pub fn read_bytes(&self, va: VirtualAddress, out: &mut [u8]) -> Result<(), VmemError> {
        self.for_each_chunk(va, out.len(), |frame, range, done| {
            out[done..done + range.len()].copy_from_slice(&frame[range]);
        })
    }

    /// Zero `len` bytes at `va`.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] at the first unmapped page.
    pub fn zero(&self, va: VirtualAddress, len: usize) -> Result<(), VmemError> {
        self.for_each_chunk(va, len, |frame, range, _| frame[range].fill(0))
    }

    /// Walk `[va, va + len)` in page-bounded pieces. The callback gets the
    /// backing frame, the byte range within it and the bytes done so far.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(&mut Frame, core::ops::Range<usize>, usize),
    ) -> Result<(), VmemError> {
        let mut done = 0usize;
        while done < len {
            let offset = u32::try_from(done).map_err(|_| VmemError::KernelRange(va))?;
            let at = va.checked_add(offset).ok_or(VmemError::KernelRange(va))?;
            let pte = self.entry(at).ok_or(VmemError::NotMapped(at))?;
            let start = at.offset::<Size4K>().as_usize();
            let n = (FRAME_BYTES - start).min(len - done);
            f(self.frame_mut(pte.frame()), start..start + n, done);
            done += n;
        }
        Ok(())
    }

    /// Find or create the page table covering `va`.
    #[allow(clippy::mut_from_ref)]
    fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        user: bool,
    ) -> Result<&mut PageTable, VmemError> {
        let dir = self.directory();
        let pdi = va.directory_index();
        let pde = dir.get(pdi);
        if pde.present() {
            if !pde.owned() {
                return Err(VmemError::KernelRange(va));
            }
            if user && !pde.user_access() {
                dir.set(pdi, pde.with_user_access(true));
            }
            return Ok(self.table_mut(pde.frame()));
        }
        let frame = Self::alloc_zeroed_table(self.mapper, alloc)?;
        dir.set(pdi, PageEntryBits::table_link(frame, user, true));
        Ok(self.table_mut(frame))
    }

    fn alloc_zeroed_table<A: FrameAlloc>(mapper: &M, alloc: &mut A) -> Result<RootPage, VmemError> {
        let frame = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        // SAFETY: a freshly allocated frame is unaliased.
        unsafe { mapper.phys_to_mut::<PageTable>(frame.base()) }.zero();
        Ok(frame)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn directory(&self) -> &mut PageTable {
        self.table_mut(self.root)
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: page tables reachable from the root are only touched through
        // this handle, and callers never hold two references to one table.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn frame_mut(&self, frame: PhysicalPage<Size4K>) -> &mut Frame {
        // SAFETY: leaf frames are plain bytes.
        unsafe { self.mapper.phys_to_mut::<Frame>(frame.base()) }
    }
}
