//! Materialize `PT_LOAD` segments into a user address space.

use crate::header::{ElfView, Ph32};
use crate::{ElfError, FileSource};
use kernel_alloc::vmm::Vmm;
use kernel_info::memory::{PAGE_SIZE, is_user_range};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, PageFlags, PhysMapper, RootPage};

/// What survives a load: where to start and where the image ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// `e_entry`, unchanged.
    pub entry: VirtualAddress,
    /// First page boundary above every segment; the initial program break.
    pub image_end: VirtualAddress,
}

/// Validate the header and every loadable segment without touching memory.
///
/// # Errors
/// The first violation found; see [`ElfError`].
pub fn validate(bytes: &[u8]) -> Result<ElfView<'_>, ElfError> {
    let view = ElfView::parse(bytes)?;
    for ph in view.iter_pt_load() {
        check_segment(&ph, bytes)?;
    }
    Ok(view)
}

fn check_segment(ph: &Ph32, bytes: &[u8]) -> Result<(), ElfError> {
    ph.file_bytes(bytes)?;
    if ph.p_filesz > ph.p_memsz {
        return Err(ElfError::BadHeader);
    }
    if ph.p_memsz > 0 && !is_user_range(ph.p_vaddr.as_u32(), ph.p_memsz) {
        return Err(ElfError::SegmentOutOfRange(ph.p_vaddr));
    }
    if ph.p_align > 1
        && (!ph.p_align.is_power_of_two() || ph.p_vaddr.as_u32() % ph.p_align != ph.p_offset % ph.p_align)
    {
        return Err(ElfError::BadAlignment);
    }
    Ok(())
}

/// Load `bytes` into the user address space `root`.
///
/// Every segment is checked before the first page is mapped, so a malformed
/// image leaves `root` untouched. A mapping failure halfway (out of frames)
/// leaves the pages mapped so far in place; the caller owns the space and
/// decides whether to destroy it.
///
/// # Errors
/// Any validation [`ElfError`], or [`ElfError::Map`] when mapping fails.
pub fn load_image<M: PhysMapper, A: FrameAlloc>(
    vmm: &mut Vmm<M, A>,
    root: RootPage,
    bytes: &[u8],
) -> Result<LoadedImage, ElfError> {
    let view = validate(bytes)?;
    let mut image_end = 0u32;

    for ph in view.iter_pt_load() {
        if ph.p_memsz == 0 {
            continue;
        }
        let va = ph.p_vaddr;
        let flags = if ph.p_flags.write() {
            PageFlags::USER_RW
        } else {
            PageFlags::USER_RO
        };

        let added = vmm.map_user(root, va, ph.p_memsz, flags)?;
        if ph.p_flags.write() {
            // A page shared with an earlier read-only segment becomes writable.
            vmm.protect_user(root, va, ph.p_memsz, flags)?;
        }
        // Fresh pages are zero already; a page shared with an earlier segment
        // may not be, so clear the uninitialized tail explicitly.
        vmm.zero_user(root, va + ph.p_filesz, ph.p_memsz - ph.p_filesz)?;
        vmm.copy_to_user(root, va, ph.file_bytes(bytes)?)?;

        log::trace!(
            "segment {va}..{} ({} in file, {}, {added} new pages)",
            va + ph.p_memsz,
            ph.p_filesz,
            if ph.p_flags.write() { "rw" } else { "ro" }
        );
        image_end = image_end.max(va.as_u32() + ph.p_memsz);
    }

    let image_end = VirtualAddress::new(image_end)
        .align_up::<Size4K>()
        .ok_or(ElfError::SegmentOutOfRange(view.entry()))?;
    debug_assert!(image_end.as_u32().is_multiple_of(PAGE_SIZE));
    Ok(LoadedImage {
        entry: view.entry(),
        image_end,
    })
}

/// Read `path` through `files` and load it.
///
/// # Errors
/// [`ElfError::NotFound`] if the file does not exist, otherwise as
/// [`load_image`].
pub fn load_path<M: PhysMapper, A: FrameAlloc, F: FileSource + ?Sized>(
    vmm: &mut Vmm<M, A>,
    root: RootPage,
    files: &F,
    path: &str,
) -> Result<LoadedImage, ElfError> {
    let bytes = files.read(path).ok_or(ElfError::NotFound)?;
    load_image(vmm, root, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageBuilder;
    use kernel_info::memory::IDENTITY_MAP_MIN;
    use kernel_vmem::sim::{ArenaFrames, FrameArena};

    const CODE: u32 = 0x0804_8000;
    const DATA: u32 = 0x0804_A000;

    fn vmm() -> Vmm<FrameArena, ArenaFrames> {
        Vmm::new(FrameArena::with_frames(64), ArenaFrames::new(1, 64), IDENTITY_MAP_MIN).unwrap()
    }

    fn two_segment_image() -> Vec<u8> {
        ImageBuilder::new(CODE + 0x10)
            .code(CODE, &[0x90; 0x40])
            .data(DATA, b"initialized data", 0x1800)
            .build()
    }

    #[test]
    fn data_tail_is_zero_and_entry_is_unchanged() {
        let mut vmm = vmm();
        let root = vmm.create_user_space().unwrap();
        // Dirty the frames the loader is about to receive.
        let dirty = vmm.create_user_space().unwrap();
        vmm.map_user(dirty, VirtualAddress::new(CODE), 8 * PAGE_SIZE, PageFlags::USER_RW).unwrap();
        for i in 0..8 {
            let va = VirtualAddress::new(CODE + i * PAGE_SIZE);
            vmm.copy_to_user(dirty, va, &[0xEE; PAGE_SIZE as usize]).unwrap();
        }
        vmm.destroy_space(dirty);

        let image = two_segment_image();
        let loaded = load_image(&mut vmm, root, &image).unwrap();
        assert_eq!(loaded.entry, VirtualAddress::new(CODE + 0x10));
        assert_eq!(loaded.image_end, VirtualAddress::new(0x0804_C000));

        let mut head = [0u8; 16];
        vmm.copy_from_user(root, VirtualAddress::new(DATA), &mut head).unwrap();
        assert_eq!(&head, b"initialized data");

        let mut tail = vec![0xFFu8; 0x1800 - 16];
        vmm.copy_from_user(root, VirtualAddress::new(DATA + 16), &mut tail).unwrap();
        assert!(tail.iter().all(|b| *b == 0));

        let code = vmm.space(root).entry(VirtualAddress::new(CODE)).unwrap();
        assert!(code.user_access() && !code.writable());
        let data = vmm.space(root).entry(VirtualAddress::new(DATA + 0x1000)).unwrap();
        assert!(data.user_access() && data.writable());
    }

    #[test]
    fn truncated_segment_is_rejected_before_mapping() {
        let mut vmm = vmm();
        let root = vmm.create_user_space().unwrap();
        let mut image = two_segment_image();
        image.truncate(image.len() - 4);
        let used = vmm.frames().live();

        assert_eq!(load_image(&mut vmm, root, &image), Err(ElfError::SegmentOutOfFile));
        assert_eq!(vmm.frames().live(), used);
        assert!(!vmm.space(root).is_mapped(VirtualAddress::new(CODE)));
    }

    #[test]
    fn kernel_segment_is_rejected() {
        let mut vmm = vmm();
        let root = vmm.create_user_space().unwrap();
        let image = ImageBuilder::new(0x0010_0000)
            .code(CODE, &[0x90; 4])
            .code(0x0010_0000, &[0xCC; 4])
            .build();
        assert_eq!(
            load_image(&mut vmm, root, &image),
            Err(ElfError::SegmentOutOfRange(VirtualAddress::new(0x0010_0000)))
        );
        assert!(!vmm.space(root).is_mapped(VirtualAddress::new(CODE)));
    }

    #[test]
    fn shared_page_gets_union_permissions() {
        let mut vmm = vmm();
        let root = vmm.create_user_space().unwrap();
        let image = ImageBuilder::new(CODE)
            .code(CODE, &[0x90; 0x100])
            .data(CODE + 0x800, b"xy", 0x10)
            .build();
        load_image(&mut vmm, root, &image).unwrap();

        let e = vmm.space(root).entry(VirtualAddress::new(CODE)).unwrap();
        assert!(e.writable());
        let mut code = [0u8; 4];
        vmm.copy_from_user(root, VirtualAddress::new(CODE), &mut code).unwrap();
        assert_eq!(code, [0x90; 4]);
    }

    #[test]
    fn missing_file_is_not_found() {
        struct NoFiles;
        impl FileSource for NoFiles {
            fn read(&self, _path: &str) -> Option<&[u8]> {
                None
            }
        }
        let mut vmm = vmm();
        let root = vmm.create_user_space().unwrap();
        assert_eq!(load_path(&mut vmm, root, &NoFiles, "/bin/none"), Err(ElfError::NotFound));
    }

    #[test]
    fn out_of_frames_is_reported() {
        let mut vmm = Vmm::new(
            FrameArena::with_frames(16),
            ArenaFrames::new(1, 9),
            IDENTITY_MAP_MIN,
        )
        .unwrap();
        let root = vmm.create_user_space().unwrap();
        let image = ImageBuilder::new(CODE).data(CODE, b"", 16 * PAGE_SIZE).build();
        assert!(matches!(
            load_image(&mut vmm, root, &image),
            Err(ElfError::Map(kernel_alloc::vmm::VmmError::OutOfMemory))
        ));
    }
}
