//! Per-function PCI I/O
//!
//! [`PciIo`] is what a PCI device driver sees of its function: BAR-relative
//! register access, its own configuration space, and DMA. [`PciDeviceIo`]
//! implements it for firmware, on top of a [`PciAccess`] mechanism and a
//! [`DmaOps`] mapper.

use core::ptr::NonNull;

use super::{PciAccess, PciAddress, find_capability_with, memory_bar};
use crate::drivers::dma::{DmaError, DmaMapping, DmaOperation, DmaOps};
use crate::drivers::mmio::MmioRegion;

/// Register, configuration and DMA access for one PCI function
pub trait PciIo: DmaOps {
    /// Read a 32-bit register in memory BAR `bar`
    fn mem_read32(&self, bar: u8, offset: u64) -> u32;

    /// Write a 32-bit register in memory BAR `bar`
    fn mem_write32(&self, bar: u8, offset: u64, value: u32);

    fn mem_read8(&self, bar: u8, offset: u64) -> u8 {
        let shift = (offset & 0x3) * 8;
        (self.mem_read32(bar, offset & !0x3) >> shift) as u8
    }

    fn config_read32(&self, offset: u16) -> u32;

    fn config_write32(&self, offset: u16, value: u32);

    fn config_read8(&self, offset: u16) -> u8 {
        let shift = (offset & 0x3) * 8;
        (self.config_read32(offset & !0x3) >> shift) as u8
    }

    /// Configuration offset of standard capability `cap_id`
    fn find_capability(&self, cap_id: u8) -> Option<u8> {
        find_capability_with(|offset| self.config_read32(offset), cap_id)
    }
}

/// Firmware implementation of [`PciIo`]
pub struct PciDeviceIo<A: PciAccess, D: DmaOps> {
    access: A,
    address: PciAddress,
    bars: [Option<MmioRegion>; 6],
    dma: D,
}

impl<A: PciAccess, D: DmaOps> PciDeviceIo<A, D> {
    pub fn new(access: A, address: PciAddress, dma: D) -> Self {
        Self {
            access,
            address,
            bars: [None; 6],
            dma,
        }
    }

    /// Decode memory BAR `index` and make `size` bytes of it accessible
    ///
    /// # Safety
    ///
    /// The BAR must be assigned and its `size` bytes mapped for MMIO.
    pub unsafe fn map_bar(&mut self, index: u8, size: usize) -> Option<MmioRegion> {
        let base = memory_bar(&self.access, self.address, index)?;
        let region = MmioRegion::new(base, size)?;
        self.bars[index as usize] = Some(region);
        log::debug!(
            "PCI {}: BAR{} at {:#x} ({:#x} bytes) via {}",
            self.address,
            index,
            base,
            size,
            self.access.name()
        );
        Some(region)
    }

    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// Enable memory decoding and bus mastering for this function
    pub fn enable(&self) {
        super::enable_device(&self.access, self.address);
    }

    pub fn dma(&self) -> &D {
        &self.dma
    }

    fn bar(&self, bar: u8) -> Option<&MmioRegion> {
        let region = self.bars.get(bar as usize)?.as_ref();
        if region.is_none() {
            log::error!("PCI {}: BAR{} accessed before it was mapped", self.address, bar);
        }
        region
    }
}

impl<A: PciAccess, D: DmaOps> DmaOps for PciDeviceIo<A, D> {
    fn allocate_buffer(&mut self, pages: usize) -> Result<NonNull<u8>, DmaError> {
        self.dma.allocate_buffer(pages)
    }

    unsafe fn free_buffer(&mut self, host: NonNull<u8>, pages: usize) {
        self.dma.free_buffer(host, pages)
    }

    unsafe fn map(
        &mut self,
        operation: DmaOperation,
        host: NonNull<u8>,
        len: usize,
    ) -> Result<DmaMapping, DmaError> {
        self.dma.map(operation, host, len)
    }

    fn unmap(&mut self, mapping: DmaMapping) -> Result<(), DmaError> {
        self.dma.unmap(mapping)
    }

    fn flush(&mut self) {
        self.dma.flush()
    }
}

impl<A: PciAccess, D: DmaOps> PciIo for PciDeviceIo<A, D> {
    fn mem_read32(&self, bar: u8, offset: u64) -> u32 {
        self.bar(bar).map_or(0xFFFF_FFFF, |r| r.read32(offset))
    }

    fn mem_write32(&self, bar: u8, offset: u64, value: u32) {
        if let Some(region) = self.bar(bar) {
            region.write32(offset, value);
        }
    }

    fn mem_read8(&self, bar: u8, offset: u64) -> u8 {
        self.bar(bar).map_or(0xFF, |r| r.read8(offset))
    }

    fn config_read32(&self, offset: u16) -> u32 {
        self.access.read32(self.address, offset)
    }

    fn config_write32(&self, offset: u16, value: u32) {
        self.access.write32(self.address, offset, value)
    }
}
