//! PCI Configuration Space Access
//!
//! - **ECAM**: memory-mapped PCIe extended config space, 4096 bytes per function.

use super::PciAddress;

/// Read/write access to PCI configuration space
///
/// Only the 32-bit accessors are mechanism specific; narrower accesses are
/// derived from them.
pub trait PciAccess {
    fn read32(&self, addr: PciAddress, offset: u16) -> u32;

    fn write32(&self, addr: PciAddress, offset: u16, value: u32);

    fn read16(&self, addr: PciAddress, offset: u16) -> u16 {
        let shift = (offset & 0x02) * 8;
        (self.read32(addr, offset & !0x3) >> shift) as u16
    }

    fn write16(&self, addr: PciAddress, offset: u16, value: u16) {
        let aligned = offset & !0x3;
        let shift = (offset & 0x02) * 8;
        let current = self.read32(addr, aligned) & !(0xFFFF_u32 << shift);
        self.write32(addr, aligned, current | ((value as u32) << shift));
    }

    fn read8(&self, addr: PciAddress, offset: u16) -> u8 {
        let shift = (offset & 0x03) * 8;
        (self.read32(addr, offset & !0x3) >> shift) as u8
    }

    fn write8(&self, addr: PciAddress, offset: u16, value: u8) {
        let aligned = offset & !0x3;
        let shift = (offset & 0x03) * 8;
        let current = self.read32(addr, aligned) & !(0xFF_u32 << shift);
        self.write32(addr, aligned, current | ((value as u32) << shift));
    }

    /// Name of this access method (for logging)
    fn name(&self) -> &'static str;
}

// ============================================================================
// PCIe ECAM Access (Memory-Mapped)
// ============================================================================

/// PCIe Enhanced Configuration Access Mechanism
pub struct EcamAccess {
    base: u64,
}

impl EcamAccess {
    /// `base` is the physical address of the ECAM window (from MCFG or
    /// coreboot tables).
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    /// base | bus << 20 | device << 15 | function << 12 | offset
    fn ecam_address(&self, addr: PciAddress, offset: u16) -> u64 {
        debug_assert!(offset <= 0xFFF, "ECAM offset {:#x} out of range", offset);
        self.base
            | ((addr.bus as u64) << 20)
            | ((addr.device as u64) << 15)
            | ((addr.function as u64) << 12)
            | ((offset as u64) & 0xFFC)
    }
}

impl PciAccess for EcamAccess {
    fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
        let ptr = self.ecam_address(addr, offset) as *const u32;
        // SAFETY: the ECAM window is mapped and the access is dword aligned.
        unsafe { core::ptr::read_volatile(ptr) }
    }

    fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
        let ptr = self.ecam_address(addr, offset) as *mut u32;
        // SAFETY: the ECAM window is mapped and the access is dword aligned.
        unsafe { core::ptr::write_volatile(ptr, value) }
    }

    fn name(&self) -> &'static str {
        "PCIe ECAM"
    }
}
