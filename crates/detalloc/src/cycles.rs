//! Cycle counter and memory barrier primitives.
//!
//! The statistics subsystem samples [`read_cycle_counter`] around every
//! pool-level operation. The counter is only required to be monotonic on the
//! sampling thread; its unit is architecture dependent.

use core::sync::atomic::{self, AtomicU64, Ordering};

static SOFTWARE_TICKS: AtomicU64 = AtomicU64::new(0);

/// Reads the architecture cycle counter.
///
/// Falls back to [`software_ticks`] on targets without a user-readable
/// counter.
#[inline]
#[must_use]
#[cfg_attr(
    target_arch = "x86_64",
    expect(unused_unsafe, reason = "`_rdtsc` is safe on recent toolchains")
)]
pub fn read_cycle_counter() -> u64 {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            unsafe { core::arch::x86_64::_rdtsc() }
        } else if #[cfg(target_arch = "aarch64")] {
            let value: u64;
            unsafe {
                core::arch::asm!(
                    "mrs {}, cntvct_el0",
                    out(reg) value,
                    options(nomem, nostack, preserves_flags),
                );
            }
            value
        } else if #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))] {
            let value: usize;
            unsafe {
                core::arch::asm!("rdcycle {}", out(reg) value, options(nomem, nostack));
            }
            value as u64
        } else {
            software_ticks()
        }
    }
}

/// A strictly increasing process-wide tick.
#[inline]
pub fn software_ticks() -> u64 {
    SOFTWARE_TICKS.fetch_add(1, Ordering::Relaxed)
}

/// Issues a full hardware memory barrier.
#[inline]
pub fn memory_barrier() {
    atomic::fence(Ordering::SeqCst);
}

/// Number of cycles between two samples of the same counter.
#[inline]
#[must_use]
pub fn elapsed(start: u64, end: u64) -> u64 {
    end.saturating_sub(start)
}
