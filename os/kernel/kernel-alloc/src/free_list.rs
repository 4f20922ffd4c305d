//! First-fit free list with splitting and coalescing.

use core::alloc::Layout;
use core::ptr::{self, NonNull, null_mut};

/// Header stored at the beginning of every **free** block.
///
/// ```text
/// +----------------------+-------------------------+
/// | ListNode (header)    |      payload (size)     |
/// +----------------------+-------------------------+
/// ^ block_addr           ^ block_addr + size_of::<ListNode>()
/// ```
///
/// Free blocks are kept **sorted by address** so neighbours can be merged.
#[repr(C)]
struct ListNode {
    /// Payload bytes following this header.
    size: usize,
    next: *mut ListNode,
}

const HEADER: usize = size_of::<ListNode>();
const NODE_ALIGN: usize = align_of::<ListNode>();

#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

/// A first-fit, split-and-coalesce allocator over one contiguous region.
///
/// An allocation occupies `[payload - HEADER, payload + size)` where `size`
/// is rounded up to the header alignment; on free the header is rebuilt in
/// front of the payload and the block rejoins the list. A tail remainder too
/// small to hold a header is dropped.
///
/// # Invariants
/// - Free blocks do not overlap and lie inside the managed region.
/// - `head` is a sentinel; the first real block is `head.next`.
pub struct FreeListHeap {
    head: ListNode,
    size: usize,
    used: usize,
}

// SAFETY: the raw pointers only ever refer to the managed region, and the
// heap is only reached through a lock.
unsafe impl Send for FreeListHeap {}

impl Default for FreeListHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeListHeap {
    /// An empty heap that satisfies no allocation until [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ListNode {
                size: 0,
                next: null_mut(),
            },
            size: 0,
            used: 0,
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.size != 0
    }

    /// Hand `[start, start + size)` to the allocator.
    ///
    /// # Safety
    /// The range must be valid, writable, unused by anything else for the
    /// lifetime of the heap, and `start` aligned for a pointer-sized word.
    /// Must be called at most once.
    pub unsafe fn init(&mut self, start: usize, size: usize) {
        debug_assert!(start.is_multiple_of(NODE_ALIGN));
        debug_assert!(!self.is_initialized());
        if size < HEADER {
            return;
        }
        let node = start as *mut ListNode;
        // SAFETY: the caller hands over the range.
        unsafe { ptr::write(node, ListNode { size: size - HEADER, next: null_mut() }) };
        self.head.next = node;
        self.size = size;
    }

    /// Bytes handed out, including the per-allocation header.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Allocate a block for `layout`, or `None` if no free block fits.
    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let size = align_up(layout.size().max(1), NODE_ALIGN);
        let align = layout.align().max(NODE_ALIGN);
        let mut prev = &raw mut self.head;
        // SAFETY: every node reachable from `head` is a live free block.
        unsafe {
            let mut current = (*prev).next;
            while !current.is_null() {
                let block = current as usize;
                let region_end = block + HEADER + (*current).size;
                // Leave room for the rebuilt header in front of the payload,
                // either exactly at `block` or after a head remainder that can
                // stand on its own.
                let mut payload = align_up(block + HEADER, align);
                if payload != block + HEADER && payload - HEADER - block < HEADER {
                    payload = align_up(block + 2 * HEADER, align);
                }
                let alloc_end = payload.saturating_add(size);
                if alloc_end <= region_end {
                    (*prev).next = (*current).next;
                    let head_len = payload - HEADER - block;
                    let tail_len = region_end - alloc_end;
                    if tail_len >= HEADER {
                        self.insert(alloc_end, tail_len);
                    }
                    if head_len > 0 {
                        self.insert(block, head_len);
                    }
                    self.used += HEADER + size;
                    return NonNull::new(payload as *mut u8);
                }
                prev = current;
                current = (*current).next;
            }
        }
        None
    }

    /// Return a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr` and `layout` must be exactly those of a live allocation from
    /// this heap.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let size = align_up(layout.size().max(1), NODE_ALIGN);
        let block = ptr.as_ptr() as usize - HEADER;
        self.used = self.used.saturating_sub(HEADER + size);
        // SAFETY: per the contract the range was handed out by `allocate`.
        unsafe { self.insert(block, HEADER + size) };
    }

    /// Sum of the payload bytes of all free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut current = self.head.next;
        while !current.is_null() {
            // SAFETY: list nodes are live free blocks.
            unsafe {
                total += (*current).size;
                current = (*current).next;
            }
        }
        total
    }

    /// Insert `[addr, addr + len)` in address order and merge with neighbours.
    ///
    /// # Safety
    /// The range must be free, inside the heap and aligned for a node.
    unsafe fn insert(&mut self, addr: usize, len: usize) {
        debug_assert!(len >= HEADER);
        let mut prev = &raw mut self.head;
        unsafe {
            let mut next = (*prev).next;
            while !next.is_null() && (next as usize) < addr {
                prev = next;
                next = (*next).next;
            }
            let node = addr as *mut ListNode;
            ptr::write(node, ListNode { size: len - HEADER, next });
            (*prev).next = node;

            if !next.is_null() && addr + len == next as usize {
                (*node).size += HEADER + (*next).size;
                (*node).next = (*next).next;
            }
            if !ptr::eq(prev, &raw const self.head)
                && prev as usize + HEADER + (*prev).size == addr
            {
                (*prev).size += HEADER + (*node).size;
                (*prev).next = (*node).next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Arena([u8; 16 * 1024]);

    fn heap(arena: &mut Arena) -> FreeListHeap {
        let mut heap = FreeListHeap::new();
        unsafe { heap.init(arena.0.as_mut_ptr() as usize, arena.0.len()) };
        heap
    }

    #[test]
    fn uninitialized_heap_fails() {
        let mut heap = FreeListHeap::new();
        assert!(heap.allocate(Layout::new::<u64>()).is_none());
    }

    #[test]
    fn honours_alignment() {
        let mut arena = Box::new(Arena([0; 16 * 1024]));
        let mut heap = heap(&mut arena);
        for align in [1usize, 8, 16, 64, 256, 4096] {
            let layout = Layout::from_size_align(24, align).unwrap();
            let p = heap.allocate(layout).unwrap();
            assert!((p.as_ptr() as usize).is_multiple_of(align));
        }
    }

    #[test]
    fn freeing_everything_coalesces() {
        let mut arena = Box::new(Arena([0; 16 * 1024]));
        let mut heap = heap(&mut arena);
        let initial = heap.free_bytes();

        let layouts = [
            Layout::from_size_align(10, 1).unwrap(),
            Layout::from_size_align(100, 8).unwrap(),
            Layout::from_size_align(1000, 64).unwrap(),
            Layout::from_size_align(33, 16).unwrap(),
        ];
        let ptrs: Vec<_> = layouts.iter().map(|l| heap.allocate(*l).unwrap()).collect();
        assert!(heap.used() > 0);

        // Free out of order so both merge directions are taken.
        for i in [1, 3, 0, 2] {
            unsafe { heap.deallocate(ptrs[i], layouts[i]) };
        }
        assert_eq!(heap.free_bytes(), initial);
        assert_eq!(heap.used(), 0);

        // The whole region is one block again.
        let big = Layout::from_size_align(initial, 1).unwrap();
        assert!(heap.allocate(big).is_some());
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut arena = Box::new(Arena([0; 16 * 1024]));
        let mut heap = heap(&mut arena);
        let layout = Layout::from_size_align(40, 8).unwrap();
        let a = heap.allocate(layout).unwrap();
        let b = heap.allocate(layout).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0xAA, 40);
            b.as_ptr().write_bytes(0xBB, 40);
            assert_eq!(*a.as_ptr().add(39), 0xAA);
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo.as_ptr() as usize + 40 <= hi.as_ptr() as usize);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut arena = Box::new(Arena([0; 16 * 1024]));
        let mut heap = heap(&mut arena);
        let page = Layout::from_size_align(4096, 8).unwrap();
        let mut n = 0;
        while heap.allocate(page).is_some() {
            n += 1;
        }
        assert_eq!(n, 3);
    }
}
