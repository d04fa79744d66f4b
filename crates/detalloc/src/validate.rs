//! Integrity checks and diagnostic dumps.
//!
//! The validator walks every pool's free list from its head. It never runs on
//! the alloc/free path and costs time proportional to the number of free
//! blocks. Each pool is locked only while it is inspected, so a report taken
//! while other threads allocate may show transient mismatches.

use core::fmt;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    allocator::DetAllocator,
    config::MAX_POOLS,
    error::{ErrorKind, Result},
    pool::{BlockIndex, NIL, Pool},
};

bitflags! {
    /// Inconsistencies found in one pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PoolFaults: u8 {
        /// A free-list link names a block outside the pool.
        const OUT_OF_RANGE = 1 << 0;
        /// The free list does not terminate within `capacity` steps.
        const CYCLE = 1 << 1;
        /// The free list length differs from the free count.
        const COUNT_MISMATCH = 1 << 2;
        /// The clear bits of the occupancy bitmap differ from the free count.
        const BITMAP_MISMATCH = 1 << 3;
        /// A double free was rejected.
        const DOUBLE_FREE = 1 << 4;
    }
}

/// Findings for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub index: usize,
    pub block_size: usize,
    pub capacity: usize,
    pub free_count: usize,
    /// Free-list nodes visited before the walk ended.
    pub reachable: usize,
    /// Set bits of the occupancy bitmap, if validation is enabled.
    pub occupied: Option<usize>,
    pub double_frees: u32,
    pub faults: PoolFaults,
}

impl PoolReport {
    fn inspect(index: usize, pool: &Pool) -> Self {
        let capacity = pool.geometry().capacity();
        let free_count = pool.free_count();
        let mut faults = PoolFaults::empty();

        let mut reachable = 0;
        let mut cursor = pool.head();
        while cursor != NIL {
            if cursor >= capacity {
                faults |= PoolFaults::OUT_OF_RANGE;
                break;
            }
            if reachable == capacity {
                faults |= PoolFaults::CYCLE;
                break;
            }
            reachable += 1;
            cursor = pool.link(BlockIndex::new(cursor));
        }
        if reachable != free_count || free_count > capacity {
            faults |= PoolFaults::COUNT_MISMATCH;
        }

        let occupied = pool.occupancy().map(|bitmap| bitmap.count_set());
        // Stray bits past `capacity` also count, so `occupied` may exceed it.
        if occupied.is_some_and(|occupied| capacity.checked_sub(occupied) != Some(free_count)) {
            faults |= PoolFaults::BITMAP_MISMATCH;
        }
        if pool.double_frees() > 0 {
            faults |= PoolFaults::DOUBLE_FREE;
        }

        Self {
            index,
            block_size: pool.geometry().block_size(),
            capacity: capacity as usize,
            free_count: free_count as usize,
            reachable: reachable as usize,
            occupied: occupied.map(|occupied| occupied as usize),
            double_frees: pool.double_frees(),
            faults,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool {}: block_size={}, free={}/{}, reachable={}",
            self.index, self.block_size, self.free_count, self.capacity, self.reachable
        )?;
        if let Some(occupied) = self.occupied {
            write!(f, ", occupied={occupied}")?;
        }
        if self.double_frees > 0 {
            write!(f, ", double_frees={}", self.double_frees)?;
        }
        if self.is_ok() {
            write!(f, " ok")
        } else {
            write!(f, " FAULTS={:?}", self.faults)
        }
    }
}

/// Findings for every pool of an allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub pools: ArrayVec<PoolReport, MAX_POOLS>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.pools.iter().all(PoolReport::is_ok)
    }

    pub fn faulty_pools(&self) -> impl Iterator<Item = &PoolReport> {
        self.pools.iter().filter(|pool| !pool.is_ok())
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pool in &self.pools {
            writeln!(f, "{pool}")?;
        }
        Ok(())
    }
}

impl DetAllocator<'_> {
    /// Checks the consistency of every pool.
    ///
    /// Returns `false` if any pool is inconsistent or the allocator cannot be
    /// inspected. Each faulty pool is also reported to the error handler.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.validate_report().is_ok_and(|report| report.is_ok())
    }

    /// Inspects every pool, continuing past the first inconsistency.
    pub fn validate_report(&self) -> Result<ValidationReport> {
        let report = self.report(self.inspect_pools())?;
        for pool in report.faulty_pools() {
            error!("validation failed: {pool}");
            self.signal(
                ErrorKind::Corrupted,
                format_args!("validation failed: {pool}"),
            );
        }
        Ok(report)
    }

    fn inspect_pools(&self) -> Result<ValidationReport> {
        self.ensure_initialized()?;
        let mut report = ValidationReport::default();
        for index in 0..self.slots().len() {
            let pool = self.lock_pool(index)?;
            let pool_report = PoolReport::inspect(index, &pool);
            drop(pool);
            trace!("validated {pool_report}");
            report.pools.push(pool_report);
        }
        Ok(report)
    }

    /// Writes a human-readable dump of the configuration, statistics and
    /// validation findings.
    pub fn write_report<W>(&self, out: &mut W) -> fmt::Result
    where
        W: fmt::Write,
    {
        if !self.is_initialized() {
            return writeln!(out, "allocator not initialized");
        }
        let config = self.config();
        writeln!(
            out,
            "detalloc {}: pools={}, total_memory={}, align={}, flags={:?}",
            crate::version_string(),
            self.slots().len(),
            self.total_memory(),
            config.align,
            config.flags,
        )?;

        if config.enable_stats() {
            match self.get_stats() {
                Ok(stats) => {
                    writeln!(
                        out,
                        "usage: current={}, peak={}, used_memory={}, peak_memory={}",
                        stats.current_usage, stats.peak_usage, stats.used_memory, stats.peak_memory
                    )?;
                    writeln!(
                        out,
                        "operations: allocs={}, frees={}, failed={}, wcet_alloc={}, wcet_free={}",
                        stats.total_allocs,
                        stats.total_frees,
                        stats.failed_allocs,
                        stats.wcet_alloc_cycles,
                        stats.wcet_free_cycles
                    )?;
                    for (index, pool) in stats.pools.iter().enumerate() {
                        writeln!(
                            out,
                            "  pool {index}: block_size={}, in_use={}/{}, peak={}, allocs={}, frees={}, failed={}",
                            pool.block_size,
                            pool.current_usage,
                            pool.capacity,
                            pool.peak_usage,
                            pool.allocs,
                            pool.frees,
                            pool.failed_allocs,
                        )?;
                    }
                }
                Err(err) => writeln!(out, "statistics unavailable: {err}")?,
            }
        }

        match self.validate_report() {
            Ok(report) => {
                write!(out, "{report}")?;
                writeln!(
                    out,
                    "validation: {}",
                    if report.is_ok() { "ok" } else { "FAILED" }
                )
            }
            Err(err) => writeln!(out, "validation unavailable: {err}"),
        }
    }

    /// Emits [`write_report`](Self::write_report) through the log sink, one
    /// record per line.
    pub fn debug_print(&self) {
        let mut lines = LineLogger::default();
        // `LineLogger` never fails.
        let _ = self.write_report(&mut lines);
        lines.flush();
    }
}

/// Forwards complete lines to the log sink.
#[derive(Default)]
struct LineLogger {
    line: arrayvec::ArrayString<256>,
}

impl LineLogger {
    fn push(&mut self, s: &str) {
        for c in s.chars() {
            if self.line.try_push(c).is_err() {
                self.flush();
                self.line.push(c);
            }
        }
    }

    fn flush(&mut self) {
        if !self.line.is_empty() {
            info!("{}", self.line);
            self.line.clear();
        }
    }
}

impl fmt::Write for LineLogger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;
        while let Some((head, tail)) = rest.split_once('\n') {
            self.push(head);
            self.flush();
            rest = tail;
        }
        self.push(rest);
        Ok(())
    }
}
