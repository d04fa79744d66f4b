//! Allocator core: buffer partitioning, dispatch and lifecycle.
//!
//! # Examples
//!
//! ```
//! use detalloc::{Config, DetAllocator, ErrorKind, PoolConfig, required_size};
//!
//! let config = Config::from_pools(&[PoolConfig::new(64, 4)]).unwrap();
//! let mut buffer = vec![0_u8; required_size(&config).unwrap()];
//! let allocator = DetAllocator::init(&mut buffer, &config).unwrap();
//!
//! let blocks: Vec<_> = (0..4).map(|_| allocator.alloc(48).unwrap()).collect();
//! assert_eq!(allocator.alloc(48).unwrap_err().kind(), ErrorKind::PoolFull);
//!
//! // The most recently freed block is handed out first.
//! allocator.free(blocks[1].as_ptr()).unwrap();
//! assert_eq!(allocator.alloc(16).unwrap(), blocks[1]);
//! ```

use core::{marker::PhantomData, ptr::NonNull};

use arrayvec::ArrayVec;
use snafu::{OptionExt as _, ensure};
use spin::{Mutex, MutexGuard};

use crate::{
    bitmap::Bitmap,
    config::{Config, MAX_POOLS},
    cycles,
    error::{
        BufferTooSmallSnafu, ConcurrentAccessSnafu, DetError, DoubleFreeSnafu, ErrorKind,
        MisalignedPointerSnafu, NoSuitableClassSnafu, NotInitializedSnafu, PointerNotOwnedSnafu,
        PoolFullSnafu, Result, StatsDisabledSnafu,
    },
    layout::LayoutPlan,
    pool::{BlockIndex, Geometry, Pool, Unresolved},
    stats::{GlobalCounters, PoolCycles, PoolStats, Stats},
};

pub(crate) struct PoolSlot {
    pub(crate) geometry: Geometry,
    pub(crate) pool: Mutex<Pool>,
    pub(crate) cycles: PoolCycles,
}

/// A deterministic pool allocator over a caller-supplied buffer.
///
/// Every allocation and free completes in a bounded number of steps: at most
/// one list splice per configured pool, never a system call. The buffer stays
/// borrowed for the lifetime of the allocator and is left to the caller after
/// the allocator is dropped.
///
/// Blocks are handed out as raw pointers. The caller owns a block from
/// [`alloc`](Self::alloc) until it is passed to [`free`](Self::free); using it
/// afterwards is the caller's bug and is only detected (as a double free)
/// when [`AllocatorFlags::VALIDATION`](crate::AllocatorFlags::VALIDATION) is
/// set.
pub struct DetAllocator<'buf> {
    pools: ArrayVec<PoolSlot, MAX_POOLS>,
    config: Config,
    global: GlobalCounters,
    total_memory: usize,
    initialized: bool,
    _buffer: PhantomData<&'buf mut [u8]>,
}

impl core::fmt::Debug for DetAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DetAllocator")
            .field("pools", &self.pools.len())
            .field("total_memory", &self.total_memory)
            .field("initialized", &self.initialized)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'buf> DetAllocator<'buf> {
    /// Partitions `buffer` according to `config`.
    ///
    /// The buffer must hold at least [`required_size`](crate::required_size)
    /// bytes. This is the only operation whose cost grows with the total
    /// number of blocks.
    pub fn init(buffer: &'buf mut [u8], config: &Config) -> Result<Self> {
        let result = Self::partition(buffer, config);
        if let Err(err) = &result {
            notify(config, err);
        }
        result
    }

    fn partition(buffer: &'buf mut [u8], config: &Config) -> Result<Self> {
        let plan = LayoutPlan::new(config)?;
        let required = plan.required_size();
        let provided = buffer.len();
        ensure!(
            provided >= required,
            BufferTooSmallSnafu { required, provided }
        );

        let padding = buffer.as_ptr().align_offset(plan.base_align());
        let region = buffer
            .get_mut(padding..)
            .filter(|region| region.len() >= plan.span())
            .context(BufferTooSmallSnafu { required, provided })?;
        let base = NonNull::from(region).cast::<u8>();

        let mut pools = ArrayVec::new();
        let mut total_memory = 0;
        for pool_plan in plan.pools() {
            // Offsets come from the plan and lie within `region`.
            let occupancy = pool_plan.bitmap_offset.map(|offset| unsafe {
                Bitmap::new(base.add(offset).cast(), pool_plan.capacity)
            });
            let pool = unsafe { Pool::new(base.add(pool_plan.payload_offset), pool_plan, occupancy) };
            debug!(
                "pool {}: block_size={}, stride={}, capacity={}, extent={:#x?}",
                pools.len(),
                pool_plan.block_size,
                pool_plan.stride,
                pool_plan.capacity,
                pool.geometry().extent(),
            );
            total_memory += pool_plan.block_size * pool_plan.capacity as usize;
            pools.push(PoolSlot {
                geometry: *pool.geometry(),
                pool: Mutex::new(pool),
                cycles: PoolCycles::default(),
            });
        }

        info!(
            "allocator initialized: pools={}, total_memory={total_memory}, buffer={provided}, required={required}, flags={:?}",
            pools.len(),
            config.flags,
        );

        Ok(Self {
            pools,
            config: config.clone(),
            global: GlobalCounters::default(),
            total_memory,
            initialized: true,
            _buffer: PhantomData,
        })
    }

    /// Releases the allocator's bookkeeping.
    ///
    /// Every later operation fails with
    /// [`ErrorKind::NotInitialized`]. The buffer is not touched.
    pub fn destroy(&mut self) -> Result<()> {
        let result = self.ensure_initialized();
        if result.is_ok() {
            info!(
                "allocator destroyed: outstanding_blocks={}",
                self.pools
                    .iter_mut()
                    .map(|slot| slot.pool.get_mut().in_use())
                    .sum::<u32>()
            );
            self.pools.clear();
            self.initialized = false;
        }
        self.report(result)
    }
}

impl DetAllocator<'_> {
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Usable bytes over all pools.
    #[must_use]
    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    /// Allocates one block of at least `size` bytes.
    ///
    /// The smallest pool whose blocks fit `size` is tried first; when it is
    /// exhausted the next larger pools are tried in order. Fails with
    /// [`ErrorKind::InvalidParameter`] if no pool has blocks large enough and
    /// with [`ErrorKind::PoolFull`] if every fitting pool is exhausted.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(size, false)
    }

    /// Like [`alloc`](Self::alloc), then zeroes the first `size` bytes.
    pub fn calloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(size, true)
    }

    fn allocate(&self, size: usize, zeroed: bool) -> Result<NonNull<u8>> {
        let ptr = self.report(self.pop_block(size))?;
        if zeroed {
            // The block is at least `size` bytes and now owned by the caller.
            unsafe { ptr.write_bytes(0, size) };
        }
        self.config.hooks.on_alloc(ptr, size);
        Ok(ptr)
    }

    fn pop_block(&self, size: usize) -> Result<NonNull<u8>> {
        self.ensure_initialized()?;
        let first = self
            .pools
            .iter()
            .position(|slot| slot.geometry.block_size() >= size)
            .context(NoSuitableClassSnafu {
                size,
                largest: self.largest_block_size(),
            })?;

        let stats = self.config.enable_stats();
        let start = self.sample(stats);
        for (index, slot) in self.pools.iter().enumerate().skip(first) {
            let mut pool = self.lock_pool(index)?;
            let Some(block) = pool.pop() else {
                continue;
            };
            if stats {
                pool.counters.record_alloc();
            }
            let ptr = pool.block_ptr(block);
            drop(pool);

            if stats {
                let cycles = cycles::elapsed(start, self.sample(true));
                slot.cycles.add_alloc(cycles);
                self.global
                    .record_alloc(slot.geometry.block_size(), cycles);
            }
            return Ok(ptr);
        }

        if stats {
            let cycles = cycles::elapsed(start, self.sample(true));
            self.lock_pool(first)?.counters.record_failure();
            self.global.record_failure(cycles);
        }
        PoolFullSnafu {
            size,
            block_size: self.pools[first].geometry.block_size(),
        }
        .fail()
    }

    /// Returns a block to its pool.
    ///
    /// A null pointer is ignored. Pointers that do not name a block of this
    /// allocator fail with [`ErrorKind::InvalidPointer`]. With validation
    /// enabled, freeing a block that is already free fails with
    /// [`ErrorKind::Corrupted`] and leaves the pool untouched.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        self.report(self.push_block(ptr))?;
        self.config.hooks.on_free(ptr);
        Ok(())
    }

    fn push_block(&self, ptr: NonNull<u8>) -> Result<()> {
        self.ensure_initialized()?;
        let address = ptr.addr().get();
        let (index, block) = self.resolve(address)?;
        let slot = &self.pools[index];

        let stats = self.config.enable_stats();
        let start = self.sample(stats);
        let mut pool = self.lock_pool(index)?;
        ensure!(
            pool.push(block),
            DoubleFreeSnafu {
                address,
                pool: index,
                block: block.get(),
            }
        );
        if stats {
            pool.counters.record_free();
        }
        drop(pool);

        if stats {
            let cycles = cycles::elapsed(start, self.sample(true));
            slot.cycles.add_free(cycles);
            self.global.record_free(slot.geometry.block_size(), cycles);
        }
        Ok(())
    }

    /// Returns the block size of the pool owning `ptr`, or 0 if `ptr` does
    /// not name a block of this allocator.
    #[must_use]
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        if !self.initialized || ptr.is_null() {
            return 0;
        }
        self.resolve(ptr.addr())
            .map_or(0, |(index, _)| self.pools[index].geometry.block_size())
    }

    /// Returns a snapshot of the statistics.
    ///
    /// Fails with [`ErrorKind::InvalidParameter`] when statistics are
    /// disabled.
    pub fn get_stats(&self) -> Result<Stats> {
        self.report(self.collect_stats())
    }

    fn collect_stats(&self) -> Result<Stats> {
        self.ensure_initialized()?;
        ensure!(self.config.enable_stats(), StatsDisabledSnafu);
        let mut pools = ArrayVec::new();
        for (index, slot) in self.pools.iter().enumerate() {
            let pool = self.lock_pool(index)?;
            pools.push(PoolStats::collect(
                &slot.geometry,
                pool.free_count(),
                &pool.counters,
                &slot.cycles,
            ));
        }
        Ok(Stats::collect(&self.global, self.total_memory, pools))
    }

    /// Zeroes every counter except the peaks and the current usage.
    pub fn reset_stats(&self) -> Result<()> {
        self.report(self.clear_stats())
    }

    fn clear_stats(&self) -> Result<()> {
        self.ensure_initialized()?;
        for (index, slot) in self.pools.iter().enumerate() {
            self.lock_pool(index)?.counters.reset();
            slot.cycles.reset();
        }
        self.global.reset();
        info!("statistics reset");
        Ok(())
    }

    pub(crate) fn slots(&self) -> &[PoolSlot] {
        &self.pools
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        ensure!(self.initialized, NotInitializedSnafu);
        Ok(())
    }

    /// Locks one pool.
    ///
    /// Without [`AllocatorFlags::THREAD_SAFE`](crate::AllocatorFlags) the
    /// allocator is single-threaded by contract, so a held lock is reported
    /// instead of waited on.
    pub(crate) fn lock_pool(&self, index: usize) -> Result<MutexGuard<'_, Pool>> {
        let pool = &self.pools[index].pool;
        if self.config.thread_safe() {
            return Ok(pool.lock());
        }
        pool.try_lock()
            .context(ConcurrentAccessSnafu { pool: index })
    }

    fn resolve(&self, address: usize) -> Result<(usize, BlockIndex)> {
        for (index, slot) in self.pools.iter().enumerate() {
            match slot.geometry.index_of(address) {
                Ok(block) => return Ok((index, block)),
                Err(Unresolved::Misaligned) => {
                    return MisalignedPointerSnafu {
                        address,
                        pool: index,
                        stride: slot.geometry.stride(),
                    }
                    .fail();
                }
                Err(Unresolved::OutOfRange) => {}
            }
        }
        PointerNotOwnedSnafu { address }.fail()
    }

    fn largest_block_size(&self) -> usize {
        self.pools
            .last()
            .map_or(0, |slot| slot.geometry.block_size())
    }

    fn sample(&self, enabled: bool) -> u64 {
        if enabled { (self.config.cycle_counter)() } else { 0 }
    }

    /// Forwards a failed result to the log and the error handler.
    pub(crate) fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            notify(&self.config, err);
        }
        result
    }

    /// Invokes the error handler without an accompanying error value.
    pub(crate) fn signal(&self, kind: ErrorKind, message: core::fmt::Arguments<'_>) {
        if let Some(handler) = self.config.error_handler {
            handler(kind, message);
        }
    }
}

fn notify(config: &Config, err: &DetError) {
    let kind = err.kind();
    match kind {
        ErrorKind::PoolFull => debug!("{err}"),
        ErrorKind::Corrupted => error!("{err}"),
        _ => warn!("{err}"),
    }
    if let Some(handler) = config.error_handler {
        handler(kind, format_args!("{err}"));
    }
}
