//! Allocation and free observers.
//!
//! A [`HookRegistry`] holds one allocation hook and one free hook. Each slot
//! is last-writer-wins: registering replaces the previous hook and `None`
//! clears it. Allocators dispatch to the registry named in their
//! [`Config`](crate::Config), which defaults to the process-wide registry
//! returned by [`HookRegistry::global`].
//!
//! Hooks run synchronously on the calling thread after the pool operation has
//! completed and its lock has been released, so a hook may itself allocate
//! from or free to the same allocator. Hooks observe; they cannot change the
//! result already produced for the caller.
//!
//! Registration is not ordered against concurrent allocations. Install hooks
//! before the allocator is shared between threads.

use core::{fmt, ptr::NonNull};

use spin::RwLock;

/// Called with the returned block and the requested size.
pub type AllocHook = &'static (dyn Fn(NonNull<u8>, usize) + Send + Sync);

/// Called with the block being returned to its pool.
pub type FreeHook = &'static (dyn Fn(NonNull<u8>) + Send + Sync);

static GLOBAL: HookRegistry = HookRegistry::new();

pub struct HookRegistry {
    alloc: RwLock<Option<AllocHook>>,
    free: RwLock<Option<FreeHook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("alloc", &self.alloc.read().is_some())
            .field("free", &self.free.read().is_some())
            .finish()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alloc: RwLock::new(None),
            free: RwLock::new(None),
        }
    }

    /// Returns the process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    pub fn set_alloc_hook(&self, hook: Option<AllocHook>) {
        *self.alloc.write() = hook;
    }

    pub fn set_free_hook(&self, hook: Option<FreeHook>) {
        *self.free.write() = hook;
    }

    pub(crate) fn on_alloc(&self, ptr: NonNull<u8>, size: usize) {
        let hook = *self.alloc.read();
        if let Some(hook) = hook {
            hook(ptr, size);
        }
    }

    pub(crate) fn on_free(&self, ptr: NonNull<u8>) {
        let hook = *self.free.read();
        if let Some(hook) = hook {
            hook(ptr);
        }
    }
}

/// Registers the allocation hook of the process-wide registry.
pub fn set_alloc_hook(hook: Option<AllocHook>) {
    GLOBAL.set_alloc_hook(hook);
}

/// Registers the free hook of the process-wide registry.
pub fn set_free_hook(hook: Option<FreeHook>) {
    GLOBAL.set_free_hook(hook);
}
