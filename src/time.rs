//! Time and delay functions
//!
//! Busy-wait delays on the x86 TSC, plus the bounded polling loop the host
//! controller code uses to wait on register bits and descriptor state.

use core::sync::atomic::{AtomicU64, Ordering};

/// TSC cycles per microsecond (2 GHz until the platform calibrates)
static TSC_CYCLES_PER_US: AtomicU64 = AtomicU64::new(2000);

/// Record the calibrated TSC frequency in Hz
pub fn set_tsc_frequency(hz: u64) {
    let cycles_per_us = (hz / 1_000_000).max(1);
    TSC_CYCLES_PER_US.store(cycles_per_us, Ordering::Relaxed);
    log::debug!("TSC: {} cycles/us", cycles_per_us);
}

/// Read the time stamp counter
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn rdtsc() -> u64 {
    // SAFETY: RDTSC has no side effects and is available on every x86_64 CPU.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Monotonic tick source for targets without a TSC
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn rdtsc() -> u64 {
    static TICKS: AtomicU64 = AtomicU64::new(0);
    TICKS.fetch_add(1, Ordering::Relaxed)
}

/// Spin-wait for approximately `us` microseconds
#[inline]
pub fn delay_us(us: u64) {
    let cycles = us.saturating_mul(TSC_CYCLES_PER_US.load(Ordering::Relaxed));
    let start = rdtsc();
    while rdtsc().wrapping_sub(start) < cycles {
        core::hint::spin_loop();
    }
}

/// Spin-wait for approximately `ms` milliseconds
#[inline]
pub fn delay_ms(ms: u64) {
    delay_us(ms.saturating_mul(1000));
}

/// Poll `condition` until it holds or `timeout_us` worth of stalls elapsed
///
/// The condition is checked `timeout_us / interval_us + 1` times with a
/// `stall(interval_us)` between checks, so a zero timeout still checks once.
/// Returns `true` if the condition was met.
pub fn poll_with_stall<S, F>(stall: S, timeout_us: u64, interval_us: u64, mut condition: F) -> bool
where
    S: Fn(u64),
    F: FnMut() -> bool,
{
    let interval_us = interval_us.max(1);
    let rounds = timeout_us / interval_us + 1;

    for _ in 0..rounds {
        if condition() {
            return true;
        }
        stall(interval_us);
    }
    false
}
