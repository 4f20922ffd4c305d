//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame, `1` meaning allocated. Single frames are found by
//! a first-fit scan that skips fully used words; contiguous runs by a linear
//! scan for the first window of free bits. No free list is kept.
//!
//! The allocator starts with **every** frame used. Boot code then frees the
//! ranges the firmware reports as available (at or above 1 MiB and below the
//! identity cap) and re-marks the kernel image and the bitmap storage as
//! used. Anything the boot loader did not certify stays reserved forever.
//!
//! ```
//! use kernel_alloc::frame_alloc::BitmapFrameAlloc;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::FrameAlloc;
//!
//! let mut words = [0u64; 2];
//! let mut frames = BitmapFrameAlloc::new(&mut words, 128);
//! frames.mark_region_free(PhysicalAddress::new(0x1_0000), 0x4000);
//!
//! let f = frames.alloc_4k().unwrap();
//! assert_eq!(f.base(), PhysicalAddress::new(0x1_0000));
//! assert_eq!(frames.stats().free_frames, 3);
//! frames.free_4k(f);
//! ```

use kernel_info::boot::{MemoryKind, MemoryRegion};
use kernel_info::memory::{LOW_MEMORY_RESERVED, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;

const WORD_BITS: u32 = u64::BITS;

/// Aggregate allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub total_frames: u32,
    pub used_frames: u32,
    pub free_frames: u32,
}

impl FrameStats {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.total_frames) * u64::from(PAGE_SIZE)
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        u64::from(self.used_frames) * u64::from(PAGE_SIZE)
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        u64::from(self.free_frames) * u64::from(PAGE_SIZE)
    }
}

/// Bitmap allocator over frames `0..total_frames`.
///
/// The storage is borrowed so that it can live in a static at boot and in a
/// plain array in tests.
pub struct BitmapFrameAlloc<'a> {
    bits: &'a mut [u64],
    total_frames: u32,
    used: u32,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Number of `u64` words needed to track `total_frames` frames.
    #[must_use]
    pub const fn storage_words(total_frames: u32) -> usize {
        total_frames.div_ceil(WORD_BITS) as usize
    }

    /// A bitmap with every frame marked used.
    ///
    /// `total_frames` is cut down to what `bits` can hold.
    pub fn new(bits: &'a mut [u64], total_frames: u32) -> Self {
        let capacity = u32::try_from(bits.len())
            .unwrap_or(u32::MAX)
            .saturating_mul(WORD_BITS);
        let total_frames = total_frames.min(capacity);
        bits.fill(u64::MAX);
        Self {
            bits,
            total_frames,
            used: total_frames,
        }
    }

    /// Build the allocator from the firmware memory map.
    ///
    /// Only [`MemoryKind::Available`] ranges in `[1 MiB, usable_end)` are
    /// freed; `reserved` ranges (kernel image, bitmap storage, boot modules)
    /// are marked used afterwards.
    pub fn from_memory_map(
        bits: &'a mut [u64],
        regions: impl IntoIterator<Item = MemoryRegion> + Clone,
        usable_end: u32,
        reserved: &[(PhysicalAddress, u32)],
    ) -> Self {
        let top = regions
            .clone()
            .into_iter()
            .filter(|r| r.kind == MemoryKind::Available)
            .map(|r| r.end())
            .max()
            .unwrap_or(0)
            .min(u64::from(u32::MAX) + 1);
        let total = u32::try_from(top / u64::from(PAGE_SIZE)).unwrap_or(u32::MAX);
        let mut frames = Self::new(bits, total);
        if frames.total_frames < total {
            log::warn!(
                "frame bitmap holds {} of {} frames; the rest stays unused",
                frames.total_frames,
                total
            );
        }

        for region in regions {
            if region.kind != MemoryKind::Available {
                continue;
            }
            let start = region.base.max(u64::from(LOW_MEMORY_RESERVED));
            let end = region.end().min(u64::from(usable_end));
            if start >= end {
                continue;
            }
            // Both bounds fit in u32 here because usable_end does.
            #[allow(clippy::cast_possible_truncation)]
            frames.mark_region_free(PhysicalAddress::new(start as u32), (end - start) as u32);
        }
        for &(base, len) in reserved {
            frames.mark_region_used(base, len);
        }

        let stats = frames.stats();
        log::info!(
            "frame allocator: {} KiB total, {} KiB free, {} KiB reserved",
            stats.total_bytes() >> 10,
            stats.free_bytes() >> 10,
            stats.used_bytes() >> 10
        );
        frames
    }

    /// Allocate `count` physically contiguous frames; returns the first.
    ///
    /// `None` if no run of `count` free frames exists, or `count` is zero.
    pub fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalPage<Size4K>> {
        if count == 0 || count > self.total_frames - self.used {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame = 0;
        while frame < self.total_frames {
            let (word, bit) = Self::locate(frame);
            if bit == 0 && self.bits[word] == u64::MAX {
                run_len = 0;
                frame += WORD_BITS;
                continue;
            }
            if self.test(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count {
                        self.set(f);
                    }
                    self.used += count;
                    return Some(PhysicalPage::from_frame_number(run_start));
                }
            }
            frame += 1;
        }
        None
    }

    /// Return `count` frames starting at `first`.
    ///
    /// # Panics
    /// If any frame in the run is not allocated. The bitmap no longer matches
    /// reality at that point and nothing built on it can be trusted.
    pub fn free_contiguous(&mut self, first: PhysicalPage<Size4K>, count: u32) {
        let start = first.frame_number();
        for f in start..start.saturating_add(count) {
            self.free_frame(f);
        }
    }

    /// Mark every frame touched by `[base, base + len)` as used.
    pub fn mark_region_used(&mut self, base: PhysicalAddress, len: u32) {
        let first = base.as_u32() / PAGE_SIZE;
        let end = u64::from(base.as_u32()) + u64::from(len);
        let last = end.div_ceil(u64::from(PAGE_SIZE));
        let last = u32::try_from(last).unwrap_or(u32::MAX).min(self.total_frames);
        for f in first..last {
            if !self.test(f) {
                self.set(f);
                self.used += 1;
            }
        }
    }

    /// Mark every frame entirely inside `[base, base + len)` as free.
    pub fn mark_region_free(&mut self, base: PhysicalAddress, len: u32) {
        let first = base.as_u32().div_ceil(PAGE_SIZE);
        let end = u64::from(base.as_u32()) + u64::from(len);
        let last = u32::try_from(end / u64::from(PAGE_SIZE))
            .unwrap_or(u32::MAX)
            .min(self.total_frames);
        for f in first..last {
            if self.test(f) {
                self.clear(f);
                self.used -= 1;
            }
        }
    }

    /// Mark the frame holding `pa` as used.
    pub fn mark_used(&mut self, pa: PhysicalAddress) {
        self.mark_region_used(pa.align_down::<Size4K>(), PAGE_SIZE);
    }

    /// Whether `frame` is allocated. Frames beyond the bitmap count as used.
    #[must_use]
    pub fn is_used(&self, frame: PhysicalPage<Size4K>) -> bool {
        let n = frame.frame_number();
        n >= self.total_frames || self.test(n)
    }

    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            used_frames: self.used,
            free_frames: self.total_frames - self.used,
        }
    }

    fn free_frame(&mut self, n: u32) {
        assert!(
            n < self.total_frames && self.test(n),
            "frame {n:#x} freed but not allocated"
        );
        self.clear(n);
        self.used -= 1;
    }

    #[inline]
    const fn locate(frame: u32) -> (usize, u32) {
        ((frame / WORD_BITS) as usize, frame % WORD_BITS)
    }

    #[inline]
    fn test(&self, frame: u32) -> bool {
        let (w, b) = Self::locate(frame);
        self.bits[w] & (1 << b) != 0
    }

    #[inline]
    fn set(&mut self, frame: u32) {
        let (w, b) = Self::locate(frame);
        self.bits[w] |= 1 << b;
    }

    #[inline]
    fn clear(&mut self, frame: u32) {
        let (w, b) = Self::locate(frame);
        self.bits[w] &= !(1 << b);
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let (index, word) = self
            .bits
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)?;
        let frame = u32::try_from(index).ok()? * WORD_BITS + (!*word).trailing_zeros();
        if frame >= self.total_frames {
            return None;
        }
        self.set(frame);
        self.used += 1;
        Some(PhysicalPage::from_frame_number(frame))
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free_frame(frame.frame_number());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn region(base: u64, len: u64, kind: MemoryKind) -> MemoryRegion {
        MemoryRegion { base, len, kind }
    }

    #[test]
    fn starts_fully_used() {
        let mut words = [0u64; 4];
        let mut frames = BitmapFrameAlloc::new(&mut words, 200);
        assert_eq!(frames.stats().used_frames, 200);
        assert!(frames.alloc_4k().is_none());
        assert!(frames.alloc_contiguous(1).is_none());
    }

    #[test]
    fn used_count_tracks_live_allocations() {
        let mut words = [0u64; 4];
        let mut frames = BitmapFrameAlloc::new(&mut words, 256);
        frames.mark_region_free(PhysicalAddress::zero(), 256 * PAGE_SIZE);

        let mut live = Vec::new();
        let mut seen = HashSet::new();
        for round in 0..200u32 {
            if round % 3 == 2 {
                let f = live.swap_remove((round as usize * 7) % live.len());
                frames.free_4k(f);
                seen.remove(&f.frame_number());
            } else {
                let f = frames.alloc_4k().unwrap();
                assert!(seen.insert(f.frame_number()), "frame handed out twice");
                live.push(f);
            }
            assert_eq!(frames.stats().used_frames as usize, live.len());
        }
    }

    #[test]
    fn first_fit_reuses_lowest_free_frame() {
        let mut words = [0u64; 2];
        let mut frames = BitmapFrameAlloc::new(&mut words, 128);
        frames.mark_region_free(PhysicalAddress::new(0x40_000), 0x40_000);
        let a = frames.alloc_4k().unwrap();
        let b = frames.alloc_4k().unwrap();
        assert_eq!(b.frame_number(), a.frame_number() + 1);
        frames.free_4k(a);
        assert_eq!(frames.alloc_4k(), Some(a));
    }

    #[test]
    fn contiguous_skips_short_runs() {
        let mut words = [0u64; 2];
        let mut frames = BitmapFrameAlloc::new(&mut words, 128);
        // Free frames 2..4 and 10..20.
        frames.mark_region_free(PhysicalAddress::new(2 * PAGE_SIZE), 2 * PAGE_SIZE);
        frames.mark_region_free(PhysicalAddress::new(10 * PAGE_SIZE), 10 * PAGE_SIZE);

        let run = frames.alloc_contiguous(4).unwrap();
        assert_eq!(run.frame_number(), 10);
        assert_eq!(frames.stats().free_frames, 8);
        assert!(frames.alloc_contiguous(7).is_none());

        frames.free_contiguous(run, 4);
        assert_eq!(frames.stats().free_frames, 12);
        assert_eq!(frames.alloc_contiguous(10).unwrap().frame_number(), 10);
    }

    #[test]
    fn contiguous_run_may_cross_words() {
        let mut words = [0u64; 2];
        let mut frames = BitmapFrameAlloc::new(&mut words, 128);
        frames.mark_region_free(PhysicalAddress::new(60 * PAGE_SIZE), 8 * PAGE_SIZE);
        assert_eq!(frames.alloc_contiguous(8).unwrap().frame_number(), 60);
    }

    #[test]
    #[should_panic(expected = "freed but not allocated")]
    fn double_free_is_fatal() {
        let mut words = [0u64; 1];
        let mut frames = BitmapFrameAlloc::new(&mut words, 64);
        frames.mark_region_free(PhysicalAddress::zero(), 64 * PAGE_SIZE);
        let f = frames.alloc_4k().unwrap();
        frames.free_4k(f);
        frames.free_4k(f);
    }

    #[test]
    fn regions_round_conservatively() {
        let mut words = [0u64; 1];
        let mut frames = BitmapFrameAlloc::new(&mut words, 64);
        // Partial frames at either end are not freed.
        frames.mark_region_free(PhysicalAddress::new(0x0800), 0x3000);
        assert_eq!(frames.stats().free_frames, 2);
        let one = PhysicalPage::from_frame_number(1);
        assert!(!frames.is_used(one));

        // A single byte reserves the whole frame.
        frames.mark_region_used(PhysicalAddress::new(0x1FFF), 1);
        assert!(frames.is_used(one));
        assert_eq!(frames.stats().free_frames, 1);
        assert!(frames.is_used(PhysicalPage::from_frame_number(1000)));
    }

    #[test]
    fn memory_map_init_denies_by_default() {
        let map = [
            region(0, 0x9_F000, MemoryKind::Available),
            region(0xF_0000, 0x1_0000, MemoryKind::Reserved),
            region(0x10_0000, 0x1F0_0000, MemoryKind::Available),
            region(0x200_0000, 0x10_0000, MemoryKind::AcpiNvs),
            region(0x210_0000, 0x100_0000, MemoryKind::Available),
        ];
        let mut words = vec![0u64; BitmapFrameAlloc::storage_words(0x310_0000 / PAGE_SIZE)];
        let kernel = (PhysicalAddress::new(0x10_0000), 0x5_0000);
        let usable_end = 0x300_0000;
        let frames = BitmapFrameAlloc::from_memory_map(&mut words, map, usable_end, &[kernel]);

        let stats = frames.stats();
        assert_eq!(stats.total_frames, 0x310_0000 / PAGE_SIZE);
        // Low memory is never handed out even though it is reported available.
        assert!(frames.is_used(PhysicalPage::from_frame_number(0x10)));
        // Kernel image.
        assert!(frames.is_used(PhysicalPage::from_frame_number(0x120)));
        assert!(!frames.is_used(PhysicalPage::from_frame_number(0x150)));
        // The ACPI hole and everything above the identity cap.
        assert!(frames.is_used(PhysicalPage::from_frame_number(0x2000)));
        assert!(frames.is_used(PhysicalPage::from_frame_number(0x3000)));

        let free = (0x1F0_0000 - 0x5_0000) / PAGE_SIZE + (0x300_0000 - 0x210_0000) / PAGE_SIZE;
        assert_eq!(stats.free_frames, free);
        assert_eq!(stats.used_frames + stats.free_frames, stats.total_frames);
    }
}
