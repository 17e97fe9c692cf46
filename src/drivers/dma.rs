//! DMA buffer allocation and bus-master mapping
//!
//! Host controller drivers never assume that the address the CPU uses for a
//! buffer is the address the device must be programmed with. Every buffer a
//! device touches is allocated and mapped through [`DmaOps`], which reports
//! the device-visible address for the lifetime of the mapping.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;
use core::sync::atomic::{Ordering, fence};

/// Size of a DMA page
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes`
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Direction of a bus-master mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOperation {
    /// Device reads system memory
    BusMasterRead,
    /// Device writes system memory
    BusMasterWrite,
    /// Memory shared by CPU and device for its whole lifetime
    CommonBuffer,
}

/// DMA service errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No memory or mapping resources left
    OutOfResources,
    /// Operation not supported by this mapper
    Unsupported,
    /// The mapping hardware reported a failure
    DeviceError,
}

/// A live bus-master mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapping {
    /// Address the device must use
    pub device_address: u64,
    /// Host address the mapping was created for
    pub host_address: usize,
    /// Number of bytes actually mapped (may be less than requested)
    pub len: usize,
    pub operation: DmaOperation,
}

/// DMA allocation and mapping services
pub trait DmaOps {
    /// Allocate `pages` zeroed, page-aligned pages suitable for DMA.
    fn allocate_buffer(&mut self, pages: usize) -> Result<NonNull<u8>, DmaError>;

    /// Release pages obtained from [`DmaOps::allocate_buffer`].
    ///
    /// # Safety
    ///
    /// `host` must come from `allocate_buffer` with the same page count and
    /// must no longer be mapped or referenced.
    unsafe fn free_buffer(&mut self, host: NonNull<u8>, pages: usize);

    /// Map `len` bytes at `host` for device access.
    ///
    /// # Safety
    ///
    /// The memory must stay valid until the mapping is passed to `unmap`.
    unsafe fn map(
        &mut self,
        operation: DmaOperation,
        host: NonNull<u8>,
        len: usize,
    ) -> Result<DmaMapping, DmaError>;

    /// Tear down a mapping, making device writes visible to the CPU.
    fn unmap(&mut self, mapping: DmaMapping) -> Result<(), DmaError>;

    /// Flush posted writes to memory shared with devices.
    fn flush(&mut self) {
        fence(Ordering::SeqCst);
    }
}

/// Cache line size (typically 64 bytes on modern x86)
const CACHE_LINE_SIZE: usize = 64;

/// Write back and invalidate a memory range so CPU and device agree on it
#[inline]
fn flush_cache_range(addr: usize, size: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = addr & !(CACHE_LINE_SIZE - 1);
        let end = (addr + size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);

        for line in (start..end).step_by(CACHE_LINE_SIZE) {
            unsafe {
                core::arch::asm!(
                    "clflush [{}]",
                    in(reg) line,
                    options(nostack, preserves_flags)
                );
            }
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = (addr, size, CACHE_LINE_SIZE);

    fence(Ordering::SeqCst);
}

/// DMA for identity-mapped firmware: bus address == host address
///
/// Buffers come from the global allocator. When `below_4g` is set, any
/// buffer landing above 4 GiB is released and the allocation fails, and
/// mappings that reach past 4 GiB are refused since there is no bounce
/// buffer to fall back on.
pub struct IdentityDma {
    below_4g: bool,
    live_mappings: usize,
}

impl IdentityDma {
    pub const fn new(below_4g: bool) -> Self {
        Self {
            below_4g,
            live_mappings: 0,
        }
    }

    /// Number of mappings not yet unmapped
    pub fn live_mappings(&self) -> usize {
        self.live_mappings
    }

    fn layout(pages: usize) -> Option<Layout> {
        Layout::from_size_align(pages.checked_mul(PAGE_SIZE)?, PAGE_SIZE).ok()
    }
}

impl DmaOps for IdentityDma {
    fn allocate_buffer(&mut self, pages: usize) -> Result<NonNull<u8>, DmaError> {
        if pages == 0 {
            return Err(DmaError::OutOfResources);
        }
        let layout = Self::layout(pages).ok_or(DmaError::OutOfResources)?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(DmaError::OutOfResources)?;

        if self.below_4g && (ptr.as_ptr() as u64 + layout.size() as u64) > 0x1_0000_0000 {
            log::debug!("DMA: buffer at {:#x} is above 4GB", ptr.as_ptr() as usize);
            unsafe { dealloc(ptr.as_ptr(), layout) };
            return Err(DmaError::OutOfResources);
        }
        Ok(ptr)
    }

    unsafe fn free_buffer(&mut self, host: NonNull<u8>, pages: usize) {
        if let Some(layout) = Self::layout(pages) {
            dealloc(host.as_ptr(), layout);
        }
    }

    unsafe fn map(
        &mut self,
        operation: DmaOperation,
        host: NonNull<u8>,
        len: usize,
    ) -> Result<DmaMapping, DmaError> {
        let host_address = host.as_ptr() as usize;
        if self.below_4g && (host_address as u64).saturating_add(len as u64) > 0x1_0000_0000 {
            log::debug!("DMA: mapping at {:#x} is above 4GB", host_address);
            return Err(DmaError::OutOfResources);
        }
        if operation != DmaOperation::BusMasterWrite {
            flush_cache_range(host_address, len);
        }
        self.live_mappings += 1;
        Ok(DmaMapping {
            device_address: host_address as u64,
            host_address,
            len,
            operation,
        })
    }

    fn unmap(&mut self, mapping: DmaMapping) -> Result<(), DmaError> {
        if mapping.operation != DmaOperation::BusMasterRead {
            flush_cache_range(mapping.host_address, mapping.len);
        }
        self.live_mappings = self.live_mappings.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn test_identity_mapping_uses_host_address() {
        let mut dma = IdentityDma::new(false);
        let buf = dma.allocate_buffer(2).unwrap();
        assert_eq!(buf.as_ptr() as usize % PAGE_SIZE, 0);

        let mapping = unsafe { dma.map(DmaOperation::CommonBuffer, buf, 2 * PAGE_SIZE) }.unwrap();
        assert_eq!(mapping.device_address, buf.as_ptr() as u64);
        assert_eq!(mapping.len, 2 * PAGE_SIZE);
        assert_eq!(dma.live_mappings(), 1);

        dma.unmap(mapping).unwrap();
        assert_eq!(dma.live_mappings(), 0);
        unsafe { dma.free_buffer(buf, 2) };
    }

    #[test]
    fn test_low_only_mapper_refuses_high_buffers() {
        let high = NonNull::new(0x1_0000_0000usize as *mut u8).unwrap();
        let straddling = NonNull::new(0xFFFF_F000usize as *mut u8).unwrap();

        let mut dma = IdentityDma::new(true);
        for host in [high, straddling] {
            let result = unsafe { dma.map(DmaOperation::BusMasterWrite, host, 2 * PAGE_SIZE) };
            assert_eq!(result, Err(DmaError::OutOfResources));
        }
        assert_eq!(dma.live_mappings(), 0);

        let mut dma = IdentityDma::new(false);
        let mapping = unsafe { dma.map(DmaOperation::BusMasterWrite, high, PAGE_SIZE) }.unwrap();
        assert_eq!(mapping.device_address, 0x1_0000_0000);
    }
}
