//! One size class: a slab of equally sized blocks and its free list.
//!
//! # Algorithm
//!
//! Blocks are addressed by a zero-based [`BlockIndex`]; addresses only appear
//! at the allocator boundary ([`Pool::block_ptr`] and [`Geometry::index_of`]). The free list is an intrusive stack of indices:
//! the first four bytes of every free block hold the index of the next free
//! block, or [`NIL`] for the last one.
//!
//! ```text
//! head ─→ [3 | ...] ─→ [0 | ...] ─→ [5 | ...] ─→ NIL
//! ```
//!
//! - **Allocation** pops the head: the head becomes the popped block's link.
//! - **Free** pushes the block: its link becomes the current head and the
//!   block becomes the head. The most recently freed block is reused first.
//!
//! Both operations touch one block and a few counters, so they run in
//! constant time. An allocated block is never read or written by the pool.

use core::{ops::Range, ptr::NonNull};

use crate::{
    bitmap::Bitmap,
    layout::{LINK_SIZE, PoolPlan},
    stats::PoolCounters,
};

/// Link value terminating the free list.
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockIndex(u32);

impl BlockIndex {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) fn get(self) -> u32 {
        self.0
    }
}

/// Immutable placement of a pool; usable without holding the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    base: usize,
    block_size: usize,
    stride: usize,
    capacity: u32,
}

/// Why an address does not name a block of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unresolved {
    OutOfRange,
    Misaligned,
}

impl Geometry {
    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Address range covered by the pool's blocks.
    pub(crate) fn extent(&self) -> Range<usize> {
        self.base..self.base + self.stride * self.capacity as usize
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.extent().contains(&addr)
    }

    pub(crate) fn index_of(&self, addr: usize) -> Result<BlockIndex, Unresolved> {
        if !self.contains(addr) {
            return Err(Unresolved::OutOfRange);
        }
        let offset = addr - self.base;
        if !offset.is_multiple_of(self.stride) {
            return Err(Unresolved::Misaligned);
        }
        #[expect(clippy::cast_possible_truncation, reason = "offset lies within the extent")]
        let index = (offset / self.stride) as u32;
        Ok(BlockIndex(index))
    }
}

pub(crate) struct Pool {
    base: NonNull<u8>,
    geometry: Geometry,
    free_count: u32,
    head: u32,
    occupancy: Option<Bitmap>,
    double_frees: u32,
    pub(crate) counters: PoolCounters,
}

// The pool exclusively owns its region of the caller's buffer.
unsafe impl Send for Pool {}

impl Pool {
    /// Threads every block of the region into one ascending free list.
    ///
    /// This is the only pool operation whose cost grows with the number of
    /// blocks.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to `plan.align` and valid for reads and writes
    /// of `plan.stride * plan.capacity` bytes that nothing else uses while the
    /// pool exists.
    pub(crate) unsafe fn new(base: NonNull<u8>, plan: &PoolPlan, occupancy: Option<Bitmap>) -> Self {
        debug_assert!(plan.stride >= LINK_SIZE);
        debug_assert!(plan.capacity > 0 && plan.capacity < NIL);
        debug_assert!(base.addr().get().is_multiple_of(plan.align));

        let geometry = Geometry {
            base: base.addr().get(),
            block_size: plan.block_size,
            stride: plan.stride,
            capacity: plan.capacity,
        };
        let mut pool = Self {
            base,
            geometry,
            free_count: plan.capacity,
            head: 0,
            occupancy,
            double_frees: 0,
            counters: PoolCounters::default(),
        };
        for index in 0..plan.capacity {
            let next = if index + 1 == plan.capacity { NIL } else { index + 1 };
            pool.write_link(BlockIndex(index), next);
        }
        pool
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub(crate) fn free_count(&self) -> u32 {
        self.free_count
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.geometry.capacity - self.free_count
    }

    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    pub(crate) fn occupancy(&self) -> Option<&Bitmap> {
        self.occupancy.as_ref()
    }

    /// Number of frees rejected because the block was already free.
    pub(crate) fn double_frees(&self) -> u32 {
        self.double_frees
    }

    pub(crate) fn block_ptr(&self, index: BlockIndex) -> NonNull<u8> {
        debug_assert!(index.0 < self.geometry.capacity);
        unsafe { self.base.add(index.0 as usize * self.geometry.stride) }
    }

    /// Reads the link stored in a block without checking that it is free.
    ///
    /// The validator uses this to walk possibly corrupted lists.
    pub(crate) fn link(&self, index: BlockIndex) -> u32 {
        unsafe { self.block_ptr(index).cast::<u32>().read_unaligned() }
    }

    fn write_link(&mut self, index: BlockIndex, next: u32) {
        unsafe { self.block_ptr(index).cast::<u32>().write_unaligned(next) }
    }

    /// Takes the head of the free list.
    pub(crate) fn pop(&mut self) -> Option<BlockIndex> {
        if self.head == NIL {
            debug_assert_eq!(self.free_count, 0, "empty free list with free blocks");
            return None;
        }
        let index = BlockIndex(self.head);
        debug_assert!(index.0 < self.geometry.capacity, "free list head out of range");
        debug_assert!(self.free_count > 0, "free list longer than free count");

        self.head = self.link(index);
        self.free_count -= 1;
        if let Some(occupancy) = &mut self.occupancy {
            debug_assert!(!occupancy.is_set(index.0), "allocated block on the free list");
            occupancy.set(index.0);
        }
        Some(index)
    }

    /// Returns a block to the free list.
    ///
    /// Returns `false`, leaving the pool untouched, when the occupancy bitmap
    /// shows the block is already free. Without a bitmap a double free is not
    /// detected.
    pub(crate) fn push(&mut self, index: BlockIndex) -> bool {
        debug_assert!(index.0 < self.geometry.capacity);
        if let Some(occupancy) = &mut self.occupancy {
            if !occupancy.is_set(index.0) {
                self.double_frees += 1;
                return false;
            }
            occupancy.clear(index.0);
        }
        let head = self.head;
        self.write_link(index, head);
        self.head = index.0;
        self.free_count += 1;
        debug_assert!(self.free_count <= self.geometry.capacity, "free count exceeds capacity");
        true
    }
}
