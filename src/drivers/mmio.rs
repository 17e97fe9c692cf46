//! Memory-Mapped I/O (MMIO) Register Abstraction
//!
//! Volatile register access for a BAR window through tock-registers, with
//! bounds checking in debug builds.

use core::ptr::NonNull;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, WriteOnly};

/// A memory-mapped register window.
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: MmioRegion only contains a pointer to device register space that
// stays mapped for the firmware's lifetime; each device owns its own window.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Create a region covering `[base, base + size)`.
    ///
    /// Returns `None` for a null base (an unassigned BAR).
    ///
    /// # Safety
    ///
    /// The caller must ensure the range is mapped device memory (or, in
    /// tests, live memory) that outlives the region.
    pub unsafe fn new(base: u64, size: usize) -> Option<Self> {
        let base = NonNull::new(base as *mut u8)?;
        Some(Self { base, size })
    }

    /// Get the base address of this MMIO region.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Size of the window in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if an access at the given offset and size is within bounds.
    #[inline]
    fn check_bounds(&self, offset: u64, access_size: usize) {
        debug_assert!(
            (offset as usize).saturating_add(access_size) <= self.size,
            "MMIO access out of bounds: offset={:#x}, access_size={}, region_size={:#x}",
            offset,
            access_size,
            self.size
        );
    }

    /// Read an 8-bit register at the given offset.
    #[inline]
    pub fn read8(&self, offset: u64) -> u8 {
        self.check_bounds(offset, 1);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const ReadOnly<u8>) };
        reg.get()
    }

    /// Read a 32-bit register at the given offset.
    #[inline]
    pub fn read32(&self, offset: u64) -> u32 {
        self.check_bounds(offset, 4);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const ReadOnly<u32>) };
        reg.get()
    }

    /// Write a 32-bit register at the given offset.
    #[inline]
    pub fn write32(&self, offset: u64, value: u32) {
        self.check_bounds(offset, 4);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const WriteOnly<u32>) };
        reg.set(value);
    }

    /// Read-modify-write a 32-bit register at the given offset.
    #[inline]
    pub fn modify32<F>(&self, offset: u64, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let old = self.read32(offset);
        self.write32(offset, f(old));
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
