//! Error taxonomy of the allocator.
//!
//! Every public operation reports failure through [`DetError`]. Each variant
//! maps onto exactly one [`ErrorKind`], the flat classification handed to the
//! optional error handler.

use core::fmt;

use snafu::Snafu;
use snafu_utils::{Located, Location};

/// Flat classification of allocator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::IsVariant)]
pub enum ErrorKind {
    /// Malformed configuration, buffer or request.
    #[display("invalid parameter")]
    InvalidParameter,
    /// The buffer cannot accommodate the configuration.
    #[display("out of memory")]
    OutOfMemory,
    /// No fitting pool has a free block.
    #[display("pool full")]
    PoolFull,
    /// The pointer is not owned by the allocator or not on a block boundary.
    #[display("invalid pointer")]
    InvalidPointer,
    /// An integrity check failed.
    #[display("corrupted")]
    Corrupted,
    /// The allocator has been destroyed.
    #[display("not initialized")]
    NotInitialized,
}

/// Notification side channel invoked with every reported error.
///
/// The handler observes failures; it never changes the value returned to the
/// caller.
pub type ErrorHandler = fn(ErrorKind, fmt::Arguments<'_>);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DetError {
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("too many pools: count={count}, max={max}"))]
    TooManyPools {
        count: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer layout overflows the address space"))]
    LayoutOverflow {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buffer too small: required={required}, provided={provided}"))]
    BufferTooSmall {
        required: usize,
        provided: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no size class fits the request: size={size}, largest_block={largest}"))]
    NoSuitableClass {
        size: usize,
        largest: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("all fitting pools are exhausted: size={size}, block_size={block_size}"))]
    PoolFull {
        size: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer is not owned by the allocator: address={address:#x}"))]
    PointerNotOwned {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "pointer is not on a block boundary: address={address:#x}, pool={pool}, stride={stride}"
    ))]
    MisalignedPointer {
        address: usize,
        pool: usize,
        stride: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "type alignment not satisfied by block: address={address:#x}, required_align={align}"
    ))]
    TypeAlignment {
        address: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("statistics are disabled for this allocator"))]
    StatsDisabled {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("double free detected: address={address:#x}, pool={pool}, block={block}"))]
    DoubleFree {
        address: usize,
        pool: usize,
        block: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("concurrent access to a non-thread-safe allocator: pool={pool}"))]
    ConcurrentAccess {
        pool: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocator is not initialized"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
}

impl DetError {
    /// Returns the flat classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. }
            | Self::TooManyPools { .. }
            | Self::LayoutOverflow { .. }
            | Self::NoSuitableClass { .. }
            | Self::TypeAlignment { .. }
            | Self::StatsDisabled { .. } => ErrorKind::InvalidParameter,
            Self::BufferTooSmall { .. } => ErrorKind::OutOfMemory,
            Self::PoolFull { .. } => ErrorKind::PoolFull,
            Self::PointerNotOwned { .. } | Self::MisalignedPointer { .. } => {
                ErrorKind::InvalidPointer
            }
            Self::DoubleFree { .. } | Self::ConcurrentAccess { .. } => ErrorKind::Corrupted,
            Self::NotInitialized { .. } => ErrorKind::NotInitialized,
        }
    }
}

impl Located for DetError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidConfig { location, .. }
            | Self::TooManyPools { location, .. }
            | Self::LayoutOverflow { location }
            | Self::BufferTooSmall { location, .. }
            | Self::NoSuitableClass { location, .. }
            | Self::PoolFull { location, .. }
            | Self::PointerNotOwned { location, .. }
            | Self::MisalignedPointer { location, .. }
            | Self::TypeAlignment { location, .. }
            | Self::StatsDisabled { location }
            | Self::DoubleFree { location, .. }
            | Self::ConcurrentAccess { location, .. }
            | Self::NotInitialized { location } => *location,
        }
    }
}

pub type Result<T, E = DetError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::ToString as _;

    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = BufferTooSmallSnafu {
            required: 128_usize,
            provided: 127_usize,
        }
        .build();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.kind().is_out_of_memory());

        let err = NoSuitableClassSnafu {
            size: 4096_usize,
            largest: 64_usize,
        }
        .build();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let err = DoubleFreeSnafu {
            address: 0x1000_usize,
            pool: 0_usize,
            block: 3_u32,
        }
        .build();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_display() {
        let err = PoolFullSnafu {
            size: 48_usize,
            block_size: 64_usize,
        }
        .build();
        assert_eq!(
            err.to_string(),
            "all fitting pools are exhausted: size=48, block_size=64"
        );
        assert_eq!(ErrorKind::InvalidPointer.to_string(), "invalid pointer");
    }

    #[test]
    fn test_location_is_captured() {
        let err = NotInitializedSnafu.build();
        assert!(err.location().file().ends_with("error.rs"));
    }
}
