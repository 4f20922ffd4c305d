//! Simulated physical memory for host tests.
//!
//! [`FrameArena`] backs physical addresses `[0, frames * 4096)` with a host
//! buffer and implements [`PhysMapper`] over it. [`ArenaFrames`] is a
//! minimal [`FrameAlloc`] over the same range that tracks which frames are
//! live, so tests can assert exact leak freedom.

use crate::{FrameAlloc, PhysMapper};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

#[repr(C, align(4096))]
struct RawFrame([u8; 4096]);

/// Host memory standing in for physical RAM.
pub struct FrameArena {
    frames: Vec<UnsafeCell<RawFrame>>,
}

impl FrameArena {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(RawFrame([0; 4096]))).collect(),
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Bytes of simulated physical memory.
    #[must_use]
    pub fn bytes(&self) -> u32 {
        u32::try_from(self.frames.len() * 4096).unwrap_or(u32::MAX)
    }
}

impl PhysMapper for FrameArena {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = pa.page::<Size4K>().frame_number() as usize;
        let off = pa.offset::<Size4K>().as_usize();
        assert!(
            off + size_of::<T>() <= 4096,
            "simulated access at {pa} crosses a frame boundary"
        );
        let frame = self.frames[idx].get();
        // SAFETY: the caller promises `T` matches the bytes and is unaliased.
        unsafe { &mut *frame.cast::<u8>().add(off).cast::<T>() }
    }
}

/// Lowest-first frame allocator over `[first, end)` that remembers live frames.
pub struct ArenaFrames {
    free: BTreeSet<u32>,
    live: BTreeSet<u32>,
}

impl ArenaFrames {
    /// Frames `first..end` are available.
    #[must_use]
    pub fn new(first: u32, end: u32) -> Self {
        Self {
            free: (first..end).collect(),
            live: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Leave only `n` frames available.
    pub fn limit_to(&mut self, n: usize) {
        while self.free.len() > n {
            self.free.pop_last();
        }
    }
}

impl FrameAlloc for ArenaFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let n = self.free.pop_first()?;
        self.live.insert(n);
        Some(PhysicalPage::from_frame_number(n))
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        let n = frame.frame_number();
        assert!(self.live.remove(&n), "double free of frame {n:#x}");
        self.free.insert(n);
    }
}
