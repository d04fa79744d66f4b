//! Allocator configuration.
//!
//! A [`Config`] lists the size classes ([`PoolConfig`]) the allocator carves
//! out of its buffer, plus allocator-wide [`AllocatorFlags`] and side
//! channels. Entries with a zero block size are unused slots and are ignored;
//! the remaining entries are used in ascending block-size order regardless of
//! the order they were listed in.
//!
//! # Examples
//!
//! ```
//! use detalloc::{AllocatorFlags, Config, PoolConfig};
//!
//! let config = Config::from_pools(&[
//!     PoolConfig::new(256, 8),
//!     PoolConfig::new(32, 64),
//!     PoolConfig::new(1024, 2).cache_aligned(),
//! ])
//! .unwrap()
//! .with_flags(AllocatorFlags::STATS | AllocatorFlags::VALIDATION);
//!
//! let sizes: Vec<_> = config.active_pools().iter().map(|p| p.block_size).collect();
//! assert_eq!(sizes, [32, 256, 1024]);
//! ```

use core::{fmt, str::FromStr};

use arrayvec::ArrayVec;
use bitflags::bitflags;
use snafu::ensure;

use crate::{
    cycles,
    error::{ErrorHandler, InvalidConfigSnafu, Result, TooManyPoolsSnafu},
    hooks::HookRegistry,
};

/// Maximum number of size classes in one allocator.
pub const MAX_POOLS: usize = 16;
/// Block size used by [`Config::default`].
pub const DEFAULT_BLOCK_SIZE: usize = 64;
/// Alignment of blocks in pools that are not cache aligned.
pub const DEFAULT_ALIGN: usize = 8;
/// Alignment of blocks in cache-aligned pools.
pub const CACHE_LINE_SIZE: usize = 64;
/// Placeholder block count of pools produced by [`suggest_config`].
pub const SUGGESTED_BLOCK_COUNT: usize = 32;

/// One size class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolConfig {
    /// Usable bytes per block. Zero marks an unused slot.
    pub block_size: usize,
    /// Number of blocks in the pool.
    pub num_blocks: usize,
    /// Align blocks to [`CACHE_LINE_SIZE`] instead of [`Config::align`].
    pub cache_aligned: bool,
}

impl PoolConfig {
    #[must_use]
    pub const fn new(block_size: usize, num_blocks: usize) -> Self {
        Self {
            block_size,
            num_blocks,
            cache_aligned: false,
        }
    }

    #[must_use]
    pub const fn cache_aligned(mut self) -> Self {
        self.cache_aligned = true;
        self
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.block_size != 0
    }
}

bitflags! {
    /// Allocator-wide feature switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocatorFlags: u8 {
        /// Count operations and track worst-case cycle costs.
        const STATS = 1 << 0;
        /// Keep an occupancy bitmap per pool and detect double frees.
        const VALIDATION = 1 << 1;
        /// Allow the allocator to be used from several threads at once.
        const THREAD_SAFE = 1 << 2;
    }
}

#[derive(Clone)]
pub struct Config {
    pub pools: ArrayVec<PoolConfig, MAX_POOLS>,
    /// Block alignment of pools that are not cache aligned. Power of two.
    pub align: usize,
    pub flags: AllocatorFlags,
    pub error_handler: Option<ErrorHandler>,
    /// Registry whose hooks observe this allocator.
    pub hooks: &'static HookRegistry,
    /// Monotonic counter sampled by the statistics subsystem.
    pub cycle_counter: fn() -> u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("pools", &self.pools)
            .field("align", &self.align)
            .field("flags", &self.flags)
            .field("error_handler", &self.error_handler.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    /// One pool of [`DEFAULT_BLOCK_SIZE`] bytes whose block count is left at
    /// zero for the caller to fill in.
    fn default() -> Self {
        let mut config = Self::new();
        config.pools.push(PoolConfig::new(DEFAULT_BLOCK_SIZE, 0));
        config
    }
}

impl Config {
    /// Creates a configuration without any pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: ArrayVec::new(),
            align: DEFAULT_ALIGN,
            flags: AllocatorFlags::empty(),
            error_handler: None,
            hooks: HookRegistry::global(),
            cycle_counter: cycles::read_cycle_counter,
        }
    }

    pub fn from_pools(pools: &[PoolConfig]) -> Result<Self> {
        let mut config = Self::new();
        for pool in pools {
            config.push_pool(*pool)?;
        }
        Ok(config)
    }

    pub fn push_pool(&mut self, pool: PoolConfig) -> Result<()> {
        self.pools.try_push(pool).map_err(|_| {
            TooManyPoolsSnafu {
                count: MAX_POOLS + 1,
                max: MAX_POOLS,
            }
            .build()
        })
    }

    #[must_use]
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: AllocatorFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: &'static HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_cycle_counter(mut self, counter: fn() -> u64) -> Self {
        self.cycle_counter = counter;
        self
    }

    #[must_use]
    pub fn enable_stats(&self) -> bool {
        self.flags.contains(AllocatorFlags::STATS)
    }

    #[must_use]
    pub fn enable_validation(&self) -> bool {
        self.flags.contains(AllocatorFlags::VALIDATION)
    }

    #[must_use]
    pub fn thread_safe(&self) -> bool {
        self.flags.contains(AllocatorFlags::THREAD_SAFE)
    }

    /// Returns the used pools sorted by ascending block size.
    #[must_use]
    pub fn active_pools(&self) -> ArrayVec<PoolConfig, MAX_POOLS> {
        let mut pools = self
            .pools
            .iter()
            .copied()
            .filter(PoolConfig::is_active)
            .collect::<ArrayVec<_, MAX_POOLS>>();
        pools.sort_unstable_by_key(|pool| pool.block_size);
        pools
    }

    /// Checks that the configuration describes a usable allocator.
    pub fn check(&self) -> Result<()> {
        ensure!(
            self.align.is_power_of_two(),
            InvalidConfigSnafu {
                reason: "alignment must be a power of two",
            }
        );
        let active = self.active_pools();
        ensure!(
            !active.is_empty(),
            InvalidConfigSnafu {
                reason: "no active pool",
            }
        );
        for pool in &active {
            ensure!(
                pool.num_blocks > 0,
                InvalidConfigSnafu {
                    reason: "active pool has no blocks",
                }
            );
            ensure!(
                u32::try_from(pool.num_blocks).is_ok_and(|n| n < u32::MAX),
                InvalidConfigSnafu {
                    reason: "pool block count exceeds the index range",
                }
            );
        }
        Ok(())
    }

    /// Returns a named preset.
    #[must_use]
    pub fn for_use_case(use_case: UseCase) -> Self {
        let (pools, align, cache_aligned_from): (&[(usize, usize)], usize, usize) = match use_case
        {
            // Low-latency audio: frames and small control messages, large
            // buffers on their own cache lines.
            UseCase::Audio => (
                &[(64, 256), (256, 128), (1024, 64), (4096, 16)],
                16,
                1024,
            ),
            // Control loops: sensor samples, state vectors, small matrices.
            UseCase::Robotics => (
                &[(32, 512), (128, 256), (512, 64), (2048, 16)],
                8,
                512,
            ),
            // Packet buffers: headers, small frames, MTU and jumbo frames.
            UseCase::Networking => (
                &[
                    (64, 1024),
                    (128, 1024),
                    (256, 512),
                    (512, 256),
                    (1536, 256),
                    (2048, 128),
                    (9216, 16),
                ],
                8,
                usize::MAX,
            ),
            // Minimal footprint.
            UseCase::Embedded => (&[(16, 64), (32, 32), (64, 16), (128, 8)], 4, usize::MAX),
        };

        let mut config = Self::new().with_align(align);
        for &(block_size, num_blocks) in pools {
            let mut pool = PoolConfig::new(block_size, num_blocks);
            if block_size >= cache_aligned_from {
                pool = pool.cache_aligned();
            }
            config.pools.push(pool);
        }
        config
    }
}

/// Named configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum UseCase {
    #[display("audio")]
    Audio,
    #[display("robotics")]
    Robotics,
    #[display("networking")]
    Networking,
    #[display("embedded")]
    Embedded,
}

impl UseCase {
    pub const ALL: [Self; 4] = [Self::Audio, Self::Robotics, Self::Networking, Self::Embedded];
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("unknown use case, expected one of: audio, robotics, networking, embedded")]
pub struct ParseUseCaseError;

impl FromStr for UseCase {
    type Err = ParseUseCaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|use_case| s.eq_ignore_ascii_case(use_case.name()))
            .ok_or(ParseUseCaseError)
    }
}

impl UseCase {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Robotics => "robotics",
            Self::Networking => "networking",
            Self::Embedded => "embedded",
        }
    }
}

/// Builds a configuration with one pool per distinct expected allocation size.
///
/// Sizes are deduplicated and sorted. While more than [`MAX_POOLS`] distinct
/// sizes remain, the closest pair of neighbouring sizes is merged into one
/// pool sized for the larger of the two (ties merge the smallest sizes
/// first). Every pool gets
/// [`SUGGESTED_BLOCK_COUNT`] blocks; tune the counts for the expected
/// concurrency before use.
pub fn suggest_config(sizes: &[usize]) -> Result<Config> {
    let mut distinct = ArrayVec::<usize, { MAX_POOLS + 1 }>::new();

    // Visit the distinct sizes in ascending order without sorting the input,
    // merging as soon as the set outgrows the pool limit.
    let mut previous = None;
    while let Some(size) = sizes
        .iter()
        .copied()
        .filter(|&size| size != 0 && previous.is_none_or(|prev| size > prev))
        .min()
    {
        previous = Some(size);
        distinct.push(size);
        if distinct.len() > MAX_POOLS {
            merge_closest(&mut distinct);
        }
    }

    ensure!(
        !distinct.is_empty(),
        InvalidConfigSnafu {
            reason: "no nonzero allocation size given",
        }
    );

    let mut config = Config::new();
    for size in distinct {
        config.push_pool(PoolConfig::new(size, SUGGESTED_BLOCK_COUNT))?;
    }
    Ok(config)
}

/// Removes the smaller element of the closest adjacent pair.
fn merge_closest<const N: usize>(sizes: &mut ArrayVec<usize, N>) {
    let Some(smaller) = sizes
        .windows(2)
        .enumerate()
        .min_by_key(|(_, pair)| pair[1] - pair[0])
        .map(|(index, _)| index)
    else {
        return;
    };
    sizes.remove(smaller);
}
