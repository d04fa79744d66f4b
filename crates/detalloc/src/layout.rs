//! Sizing engine.
//!
//! The caller's buffer is partitioned as follows, starting at the first
//! address aligned to the largest alignment in use:
//!
//! ```text
//! ┌──────────────────────────┬─────────┬───────────────┬─────────┬───────────────┐
//! │ header: occupancy bitmaps│ padding │ pool 0 blocks │ padding │ pool 1 blocks │ ...
//! │ (validation only)        │         │ stride * n0   │         │ stride * n1   │
//! └──────────────────────────┴─────────┴───────────────┴─────────┴───────────────┘
//! ```
//!
//! Pools appear in ascending block-size order. A block's stride is its block
//! size rounded up to the pool alignment, and never smaller than the
//! intrusive free-list link stored in free blocks. The required size adds
//! the worst-case padding needed to align an arbitrary buffer start, so any
//! buffer of at least that many bytes is accepted.

use arrayvec::ArrayVec;
use snafu::OptionExt as _;

use crate::{
    config::{CACHE_LINE_SIZE, Config, MAX_POOLS},
    error::{LayoutOverflowSnafu, Result},
};

/// Bytes of the next-free link kept in every free block.
pub(crate) const LINK_SIZE: usize = size_of::<u32>();

const BITMAP_WORD_SIZE: usize = size_of::<u64>();
const BITMAP_WORD_BITS: usize = u64::BITS as usize;

/// Placement of one pool relative to the aligned buffer base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolPlan {
    pub(crate) block_size: usize,
    pub(crate) capacity: u32,
    pub(crate) align: usize,
    pub(crate) stride: usize,
    pub(crate) bitmap_offset: Option<usize>,
    pub(crate) payload_offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct LayoutPlan {
    pools: ArrayVec<PoolPlan, MAX_POOLS>,
    base_align: usize,
    end: usize,
}

impl LayoutPlan {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        config.check()?;

        let active = config.active_pools();
        let validation = config.enable_validation();

        let mut base_align = BITMAP_WORD_SIZE.max(config.align);
        let mut offset = 0_usize;

        let mut bitmap_offsets = ArrayVec::<Option<usize>, MAX_POOLS>::new();
        for pool in &active {
            if validation {
                bitmap_offsets.push(Some(offset));
                let words = pool.num_blocks.div_ceil(BITMAP_WORD_BITS);
                offset = words
                    .checked_mul(BITMAP_WORD_SIZE)
                    .and_then(|bytes| offset.checked_add(bytes))
                    .context(LayoutOverflowSnafu)?;
            } else {
                bitmap_offsets.push(None);
            }
        }

        let mut pools = ArrayVec::new();
        for (pool, bitmap_offset) in active.iter().zip(bitmap_offsets) {
            let align = if pool.cache_aligned {
                CACHE_LINE_SIZE.max(config.align)
            } else {
                config.align
            };
            base_align = base_align.max(align);

            let stride = align_up(pool.block_size.max(LINK_SIZE), align).context(LayoutOverflowSnafu)?;
            let payload_offset = align_up(offset, align).context(LayoutOverflowSnafu)?;
            offset = stride
                .checked_mul(pool.num_blocks)
                .and_then(|bytes| payload_offset.checked_add(bytes))
                .context(LayoutOverflowSnafu)?;

            #[expect(clippy::cast_possible_truncation, reason = "checked by Config::check")]
            let capacity = pool.num_blocks as u32;
            pools.push(PoolPlan {
                block_size: pool.block_size,
                capacity,
                align,
                stride,
                bitmap_offset,
                payload_offset,
            });
        }

        // Reject layouts whose worst-case total does not fit.
        offset.checked_add(base_align - 1).context(LayoutOverflowSnafu)?;

        Ok(Self {
            pools,
            base_align,
            end: offset,
        })
    }

    pub(crate) fn pools(&self) -> &[PoolPlan] {
        &self.pools
    }

    /// Alignment of the address the layout is laid out from.
    pub(crate) fn base_align(&self) -> usize {
        self.base_align
    }

    /// Bytes needed past the aligned base.
    pub(crate) fn span(&self) -> usize {
        self.end
    }

    pub(crate) fn required_size(&self) -> usize {
        // Cannot overflow; checked in `new`.
        self.end + (self.base_align - 1)
    }
}

/// Returns the minimum buffer size that `config` can be initialized in.
///
/// # Examples
///
/// ```
/// use detalloc::{Config, PoolConfig, required_size};
///
/// let config = Config::from_pools(&[PoolConfig::new(64, 4)]).unwrap();
/// // 4 blocks of 64 bytes plus worst-case alignment padding.
/// assert_eq!(required_size(&config).unwrap(), 4 * 64 + 7);
/// ```
pub fn required_size(config: &Config) -> Result<usize> {
    Ok(LayoutPlan::new(config)?.required_size())
}

pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocatorFlags, PoolConfig};

    fn config(pools: &[PoolConfig]) -> Config {
        Config::from_pools(pools).unwrap()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(8, 8), Some(8));
        assert_eq!(align_up(65, 64), Some(128));
        assert_eq!(align_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_single_pool() {
        let plan = LayoutPlan::new(&config(&[PoolConfig::new(64, 4)])).unwrap();
        assert_eq!(plan.base_align(), 8);
        assert_eq!(plan.pools().len(), 1);
        let pool = plan.pools()[0];
        assert_eq!(pool.stride, 64);
        assert_eq!(pool.payload_offset, 0);
        assert_eq!(pool.bitmap_offset, None);
        assert_eq!(plan.span(), 256);
        assert_eq!(plan.required_size(), 263);
    }

    #[test]
    fn test_validation_adds_bitmap_header() {
        let config = config(&[PoolConfig::new(64, 4), PoolConfig::new(16, 100)])
            .with_flags(AllocatorFlags::VALIDATION);
        let plan = LayoutPlan::new(&config).unwrap();
        let pools = plan.pools();
        // Sorted: 16-byte pool first (2 bitmap words), then 64-byte pool (1 word).
        assert_eq!(pools[0].block_size, 16);
        assert_eq!(pools[0].bitmap_offset, Some(0));
        assert_eq!(pools[1].bitmap_offset, Some(16));
        assert_eq!(pools[0].payload_offset, 24);
        assert_eq!(pools[1].payload_offset, 24 + 16 * 100);
        assert_eq!(plan.span(), 24 + 16 * 100 + 64 * 4);
    }

    #[test]
    fn test_small_blocks_hold_a_link() {
        let plan = LayoutPlan::new(&config(&[PoolConfig::new(1, 10)]).with_align(1)).unwrap();
        assert_eq!(plan.pools()[0].stride, LINK_SIZE);
        assert_eq!(plan.pools()[0].block_size, 1);
    }

    #[test]
    fn test_cache_aligned_pool() {
        let plan = LayoutPlan::new(&config(&[
            PoolConfig::new(24, 3),
            PoolConfig::new(100, 2).cache_aligned(),
        ]))
        .unwrap();
        let pools = plan.pools();
        assert_eq!(plan.base_align(), CACHE_LINE_SIZE);
        assert_eq!(pools[0].stride, 24);
        assert_eq!(pools[1].align, CACHE_LINE_SIZE);
        assert_eq!(pools[1].stride, 128);
        assert_eq!(pools[1].payload_offset, 128);
        assert_eq!(plan.required_size(), 128 + 256 + 63);
    }

    #[test]
    fn test_overflow() {
        let err = required_size(&config(&[PoolConfig::new(usize::MAX / 2, 3)])).unwrap_err();
        assert!(matches!(err, crate::DetError::LayoutOverflow { .. }));

        let err = required_size(&config(&[PoolConfig::new(usize::MAX, 1)])).unwrap_err();
        assert!(err.kind().is_invalid_parameter());
    }

    #[test]
    fn test_invalid_config_has_no_size() {
        assert!(required_size(&Config::default()).is_err());
        assert!(required_size(&Config::new()).is_err());
    }
}
