//! Deterministic pool allocator for hard real-time systems.
//!
//! The allocator carves a caller-supplied buffer into a fixed set of size
//! classes ("pools") at initialization and never touches the operating system
//! afterwards. Allocation and free run in constant time: each is an O(1)
//! splice of an intrusive free list, plus at most one step per configured
//! pool when a request escalates to a larger class.
//!
//! # Components
//!
//! - [`Config`] and [`PoolConfig`] describe the size classes, with named
//!   presets ([`Config::for_use_case`]) and [`suggest_config`].
//! - [`required_size`] computes the exact buffer size for a configuration.
//! - [`DetAllocator`] owns the pools and serves
//!   [`alloc`](DetAllocator::alloc), [`calloc`](DetAllocator::calloc),
//!   [`free`](DetAllocator::free) and
//!   [`usable_size`](DetAllocator::usable_size).
//! - [`Stats`] snapshots per-pool counters and worst-case cycle costs when
//!   [`AllocatorFlags::STATS`] is set.
//! - [`DetAllocator::validate`] and [`DetAllocator::write_report`] check and
//!   dump the pools out of band.
//! - [`HookRegistry`] notifies observers of every allocation and free.
//!
//! # Usage
//!
//! ```rust
//! use detalloc::{AllocatorFlags, Config, DetAllocator, UseCase, required_size};
//!
//! let config = Config::for_use_case(UseCase::Robotics).with_flags(AllocatorFlags::STATS);
//! let mut buffer = vec![0_u8; required_size(&config).unwrap()];
//! let allocator = DetAllocator::init(&mut buffer, &config).unwrap();
//!
//! let state = allocator.calloc(96).unwrap();
//! assert_eq!(allocator.usable_size(state.as_ptr()), 128);
//! allocator.free(state.as_ptr()).unwrap();
//!
//! let stats = allocator.get_stats().unwrap();
//! assert_eq!((stats.total_allocs, stats.total_frees), (1, 1));
//! assert!(allocator.validate());
//! ```
//!
//! # Thread Safety
//!
//! Each pool has its own lock. With [`AllocatorFlags::THREAD_SAFE`] callers
//! on different threads contend only when they touch the same pool. Without
//! it the allocator must be used from one thread at a time; overlapping calls
//! are reported as [`ErrorKind::Corrupted`] instead of blocking.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod log;

mod allocator;
mod bitmap;
mod config;
pub mod cycles;
mod error;
mod hooks;
mod layout;
mod pool;
mod stats;
mod typed;
mod validate;

pub use self::{
    allocator::DetAllocator,
    config::{
        AllocatorFlags, CACHE_LINE_SIZE, Config, DEFAULT_ALIGN, DEFAULT_BLOCK_SIZE, MAX_POOLS,
        ParseUseCaseError, PoolConfig, SUGGESTED_BLOCK_COUNT, UseCase, suggest_config,
    },
    error::{DetError, ErrorHandler, ErrorKind, Result},
    hooks::{AllocHook, FreeHook, HookRegistry, set_alloc_hook, set_free_hook},
    layout::required_size,
    log::LogLevel,
    stats::{PoolStats, Stats},
    validate::{PoolFaults, PoolReport, ValidationReport},
};

const fn parse_version(s: &str) -> u32 {
    match u32::from_str_radix(s, 10) {
        Ok(value) => value,
        Err(_) => panic!("invalid package version"),
    }
}

pub const VERSION_MAJOR: u32 = parse_version(env!("CARGO_PKG_VERSION_MAJOR"));
pub const VERSION_MINOR: u32 = parse_version(env!("CARGO_PKG_VERSION_MINOR"));
pub const VERSION_PATCH: u32 = parse_version(env!("CARGO_PKG_VERSION_PATCH"));

/// Returns the library version as `"major.minor.patch"`.
#[must_use]
pub const fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
