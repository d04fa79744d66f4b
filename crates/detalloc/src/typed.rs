//! Typed allocation helpers.
//!
//! These size the request from the payload type. They never run `T`'s
//! destructor: the caller owns the value and drops it in place before
//! freeing the block if needed.

use core::ptr::NonNull;

use snafu::ensure;

use crate::{
    allocator::DetAllocator,
    error::{Result, TypeAlignmentSnafu},
};

impl DetAllocator<'_> {
    /// Allocates an uninitialized block sized for `T`.
    ///
    /// Fails with [`ErrorKind::InvalidParameter`](crate::ErrorKind) if the
    /// block returned is not aligned for `T`; the block is returned to its
    /// pool first.
    pub fn alloc_typed<T>(&self) -> Result<NonNull<T>> {
        let ptr = self.alloc(size_of::<T>())?;
        let address = ptr.addr().get();
        if let Err(err) = check_alignment::<T>(address) {
            self.free(ptr.as_ptr())?;
            return self.report(Err(err));
        }
        Ok(ptr.cast())
    }

    /// Allocates a block sized for `T` and moves `value` into it.
    ///
    /// # Examples
    ///
    /// ```
    /// use detalloc::{Config, DetAllocator, PoolConfig, required_size};
    ///
    /// let config = Config::from_pools(&[PoolConfig::new(16, 2)]).unwrap();
    /// let mut buffer = vec![0_u8; required_size(&config).unwrap()];
    /// let allocator = DetAllocator::init(&mut buffer, &config).unwrap();
    ///
    /// let mut slot = Some(allocator.new_value([1.0_f32, 2.0, 3.0]).unwrap());
    /// assert_eq!(unsafe { slot.unwrap().read() }, [1.0, 2.0, 3.0]);
    /// allocator.free_and_clear(&mut slot).unwrap();
    /// assert!(slot.is_none());
    /// ```
    pub fn new_value<T>(&self, value: T) -> Result<NonNull<T>> {
        let ptr = self.alloc_typed::<T>()?;
        // Sized and aligned for `T`, and owned by the caller from here on.
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    pub fn free_typed<T>(&self, ptr: NonNull<T>) -> Result<()> {
        self.free(ptr.cast::<u8>().as_ptr())
    }

    /// Frees the block in `slot`, if any, and empties the slot.
    ///
    /// The slot is left untouched when the free fails.
    pub fn free_and_clear<T>(&self, slot: &mut Option<NonNull<T>>) -> Result<()> {
        if let Some(ptr) = *slot {
            self.free_typed(ptr)?;
            *slot = None;
        }
        Ok(())
    }
}

fn check_alignment<T>(address: usize) -> Result<()> {
    let align = align_of::<T>();
    ensure!(
        address.is_multiple_of(align),
        TypeAlignmentSnafu { address, align }
    );
    Ok(())
}
