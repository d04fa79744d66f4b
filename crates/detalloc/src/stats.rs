//! Statistics and worst-case cycle tracking.
//!
//! Per-pool counters live next to the free list and are updated under the
//! pool lock. Cycle totals and allocator-wide aggregates are atomics updated
//! after the lock is released, so the held-lock duration does not depend on
//! whether statistics are enabled.
//!
//! Peak fields are running maxima for the lifetime of the allocator; a reset
//! clears every other counter. Current usage describes outstanding blocks and
//! therefore also survives a reset.

use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;

use crate::{config::MAX_POOLS, pool::Geometry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolCounters {
    allocs: u64,
    frees: u64,
    failed_allocs: u64,
    current_usage: u64,
    peak_usage: u64,
}

impl PoolCounters {
    pub(crate) fn record_alloc(&mut self) {
        self.allocs += 1;
        self.current_usage += 1;
        self.peak_usage = self.peak_usage.max(self.current_usage);
    }

    pub(crate) fn record_free(&mut self) {
        self.frees += 1;
        self.current_usage = self.current_usage.saturating_sub(1);
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed_allocs += 1;
    }

    pub(crate) fn reset(&mut self) {
        self.allocs = 0;
        self.frees = 0;
        self.failed_allocs = 0;
    }
}

/// Cumulative cycles spent in one pool.
#[derive(Debug, Default)]
pub(crate) struct PoolCycles {
    alloc: AtomicU64,
    free: AtomicU64,
}

impl PoolCycles {
    pub(crate) fn add_alloc(&self, cycles: u64) {
        self.alloc.fetch_add(cycles, Ordering::Relaxed);
    }

    pub(crate) fn add_free(&self, cycles: u64) {
        self.free.fetch_add(cycles, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.alloc.store(0, Ordering::Relaxed);
        self.free.store(0, Ordering::Relaxed);
    }
}

/// Allocator-wide aggregates.
#[derive(Debug, Default)]
pub(crate) struct GlobalCounters {
    allocs: AtomicU64,
    frees: AtomicU64,
    failed_allocs: AtomicU64,
    current_usage: AtomicU64,
    peak_usage: AtomicU64,
    used_memory: AtomicU64,
    peak_memory: AtomicU64,
    wcet_alloc: AtomicU64,
    wcet_free: AtomicU64,
}

impl GlobalCounters {
    pub(crate) fn record_alloc(&self, block_size: usize, cycles: u64) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        let usage = self.current_usage.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_usage.fetch_max(usage, Ordering::Relaxed);
        let bytes = block_size as u64;
        let used = self.used_memory.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_memory.fetch_max(used, Ordering::Relaxed);
        self.wcet_alloc.fetch_max(cycles, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, block_size: usize, cycles: u64) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.current_usage.fetch_sub(1, Ordering::Relaxed);
        self.used_memory
            .fetch_sub(block_size as u64, Ordering::Relaxed);
        self.wcet_free.fetch_max(cycles, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, cycles: u64) {
        self.failed_allocs.fetch_add(1, Ordering::Relaxed);
        self.wcet_alloc.fetch_max(cycles, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.allocs,
            &self.frees,
            &self.failed_allocs,
            &self.wcet_alloc,
            &self.wcet_free,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of one pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub capacity: usize,
    pub free_blocks: usize,
    pub allocs: u64,
    pub frees: u64,
    pub failed_allocs: u64,
    /// Blocks currently handed out.
    pub current_usage: u64,
    /// Most blocks ever handed out at once.
    pub peak_usage: u64,
    /// Cycles spent in successful allocations.
    pub alloc_cycles: u64,
    /// Cycles spent in successful frees.
    pub free_cycles: u64,
}

impl PoolStats {
    pub(crate) fn collect(
        geometry: &Geometry,
        free_blocks: u32,
        counters: &PoolCounters,
        cycles: &PoolCycles,
    ) -> Self {
        Self {
            block_size: geometry.block_size(),
            capacity: geometry.capacity() as usize,
            free_blocks: free_blocks as usize,
            allocs: counters.allocs,
            frees: counters.frees,
            failed_allocs: counters.failed_allocs,
            current_usage: counters.current_usage,
            peak_usage: counters.peak_usage,
            alloc_cycles: cycles.alloc.load(Ordering::Relaxed),
            free_cycles: cycles.free.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn avg_alloc_cycles(&self) -> Option<u64> {
        self.alloc_cycles.checked_div(self.allocs)
    }

    #[must_use]
    pub fn avg_free_cycles(&self) -> Option<u64> {
        self.free_cycles.checked_div(self.frees)
    }
}

/// Snapshot of the whole allocator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Per-pool snapshots in ascending block-size order.
    pub pools: ArrayVec<PoolStats, MAX_POOLS>,
    /// Usable bytes over all pools.
    pub total_memory: usize,
    /// Usable bytes of outstanding blocks.
    pub used_memory: u64,
    pub peak_memory: u64,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub failed_allocs: u64,
    /// Blocks currently handed out.
    pub current_usage: u64,
    /// Most blocks ever handed out at once.
    pub peak_usage: u64,
    /// Worst observed cycle cost of one allocation.
    pub wcet_alloc_cycles: u64,
    /// Worst observed cycle cost of one free.
    pub wcet_free_cycles: u64,
}

impl Stats {
    pub(crate) fn collect(
        global: &GlobalCounters,
        total_memory: usize,
        pools: ArrayVec<PoolStats, MAX_POOLS>,
    ) -> Self {
        Self {
            pools,
            total_memory,
            used_memory: global.used_memory.load(Ordering::Relaxed),
            peak_memory: global.peak_memory.load(Ordering::Relaxed),
            total_allocs: global.allocs.load(Ordering::Relaxed),
            total_frees: global.frees.load(Ordering::Relaxed),
            failed_allocs: global.failed_allocs.load(Ordering::Relaxed),
            current_usage: global.current_usage.load(Ordering::Relaxed),
            peak_usage: global.peak_usage.load(Ordering::Relaxed),
            wcet_alloc_cycles: global.wcet_alloc.load(Ordering::Relaxed),
            wcet_free_cycles: global.wcet_free.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_counters_peak_survives_reset() {
        let mut counters = PoolCounters::default();
        counters.record_alloc();
        counters.record_alloc();
        counters.record_free();
        counters.record_failure();
        assert_eq!(counters.current_usage, 1);
        assert_eq!(counters.peak_usage, 2);

        counters.reset();
        assert_eq!(counters.allocs, 0);
        assert_eq!(counters.frees, 0);
        assert_eq!(counters.failed_allocs, 0);
        assert_eq!(counters.current_usage, 1);
        assert_eq!(counters.peak_usage, 2);
    }

    #[test]
    fn test_global_counters_track_wcet_and_memory() {
        let global = GlobalCounters::default();
        global.record_alloc(64, 120);
        global.record_alloc(256, 80);
        global.record_free(64, 30);
        global.record_failure(200);

        let stats = Stats::collect(&global, 1024, ArrayVec::new());
        assert_eq!(stats.total_allocs, 2);
        assert_eq!(stats.total_frees, 1);
        assert_eq!(stats.failed_allocs, 1);
        assert_eq!(stats.current_usage, 1);
        assert_eq!(stats.peak_usage, 2);
        assert_eq!(stats.used_memory, 256);
        assert_eq!(stats.peak_memory, 320);
        assert_eq!(stats.wcet_alloc_cycles, 200);
        assert_eq!(stats.wcet_free_cycles, 30);

        global.reset();
        let stats = Stats::collect(&global, 1024, ArrayVec::new());
        assert_eq!(stats.total_allocs, 0);
        assert_eq!(stats.wcet_alloc_cycles, 0);
        assert_eq!(stats.current_usage, 1);
        assert_eq!(stats.peak_usage, 2);
        assert_eq!(stats.peak_memory, 320);
    }

    #[test]
    fn test_average_cycles() {
        let stats = PoolStats {
            allocs: 4,
            alloc_cycles: 100,
            ..PoolStats::default()
        };
        assert_eq!(stats.avg_alloc_cycles(), Some(25));
        assert_eq!(stats.avg_free_cycles(), None);
    }
}
