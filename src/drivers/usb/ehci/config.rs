//! EHCI driver tunables

/// Timing and sizing knobs for one EHCI controller instance
///
/// The defaults match what firmware USB stacks have converged on; platforms
/// with slow BIOS hand-off or unusual hubs can stretch them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhciConfig {
    /// Stall between polls of descriptor or register state, in microseconds
    pub sync_poll_interval_us: u64,
    /// Budget for register handshakes (halt, run, schedule enable, doorbell)
    pub generic_timeout_ms: u64,
    /// Budget for a host controller reset to self-clear
    pub reset_timeout_ms: u64,
    /// Settle time after powering root ports
    pub root_port_recovery_ms: u64,
    /// Number of 500 us polls waiting for the BIOS to release the controller
    pub legacy_handoff_polls: u32,
    /// Pages in each descriptor pool block
    pub mem_default_pages: usize,
    /// Period at which the platform should call `monitor_async_requests`
    pub async_poll_interval_ms: u64,
}

impl Default for EhciConfig {
    fn default() -> Self {
        Self {
            sync_poll_interval_us: 1,
            generic_timeout_ms: 10,
            reset_timeout_ms: 1000,
            root_port_recovery_ms: 20,
            legacy_handoff_polls: 40,
            mem_default_pages: 16,
            async_poll_interval_ms: 50,
        }
    }
}

impl EhciConfig {
    pub fn with_sync_poll_interval_us(mut self, us: u64) -> Self {
        self.sync_poll_interval_us = us.max(1);
        self
    }

    pub fn with_generic_timeout_ms(mut self, ms: u64) -> Self {
        self.generic_timeout_ms = ms;
        self
    }

    pub fn with_reset_timeout_ms(mut self, ms: u64) -> Self {
        self.reset_timeout_ms = ms;
        self
    }

    pub fn with_root_port_recovery_ms(mut self, ms: u64) -> Self {
        self.root_port_recovery_ms = ms;
        self
    }

    pub fn with_legacy_handoff_polls(mut self, polls: u32) -> Self {
        self.legacy_handoff_polls = polls;
        self
    }

    pub fn with_mem_default_pages(mut self, pages: usize) -> Self {
        self.mem_default_pages = pages.max(1);
        self
    }

    pub fn with_async_poll_interval_ms(mut self, ms: u64) -> Self {
        self.async_poll_interval_ms = ms;
        self
    }
}
