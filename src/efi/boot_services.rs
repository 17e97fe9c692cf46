//! Boot Services subset for drivers
//!
//! CrabEFI has no timer interrupts, so the task priority level is pure
//! bookkeeping: raising it marks a critical section, and asynchronous work is
//! driven by explicit polling rather than event notification.

use core::sync::atomic::{AtomicUsize, Ordering};

use r_efi::efi::{self, Tpl};

use crate::time;

/// Services a driver needs from the firmware core
pub trait BootServices {
    /// Busy-wait for at least `microseconds`
    fn stall(&self, microseconds: u64);

    /// Raise the task priority level, returning the previous one
    fn raise_tpl(&self, new_tpl: Tpl) -> Tpl;

    /// Restore a task priority level returned by `raise_tpl`
    fn restore_tpl(&self, old_tpl: Tpl);
}

/// Boot services backed by the TSC delay loop and a TPL counter
pub struct FirmwareServices {
    tpl: AtomicUsize,
}

impl FirmwareServices {
    pub const fn new() -> Self {
        Self {
            tpl: AtomicUsize::new(efi::TPL_APPLICATION),
        }
    }

    /// Current task priority level
    pub fn current_tpl(&self) -> Tpl {
        self.tpl.load(Ordering::Relaxed)
    }
}

impl Default for FirmwareServices {
    fn default() -> Self {
        Self::new()
    }
}

impl BootServices for FirmwareServices {
    fn stall(&self, microseconds: u64) {
        time::delay_us(microseconds);
    }

    fn raise_tpl(&self, new_tpl: Tpl) -> Tpl {
        let old = self.tpl.load(Ordering::Relaxed);
        if new_tpl < old {
            log::warn!("BS.RaiseTpl({}) below current {}", new_tpl, old);
        }
        self.tpl.store(new_tpl.max(old), Ordering::Relaxed);
        old
    }

    fn restore_tpl(&self, old_tpl: Tpl) {
        log::trace!("BS.RestoreTpl({})", old_tpl);
        self.tpl.store(old_tpl, Ordering::Relaxed);
    }
}
