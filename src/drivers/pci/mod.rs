//! PCI configuration space helpers
//!
//! Addressing, capability-list walking and BAR decoding for a single PCI
//! function. Enumeration is done by the payload; drivers receive the
//! function's address and an access method.

pub mod access;
pub mod io;

pub use access::{EcamAccess, PciAccess};
pub use io::{PciDeviceIo, PciIo};

/// Standard configuration header offsets
pub mod config {
    pub const VENDOR_ID: u16 = 0x00;
    pub const COMMAND: u16 = 0x04;
    pub const BAR0: u16 = 0x10;
    pub const CAPABILITIES_PTR: u16 = 0x34;
}

/// Command register bits
pub mod command {
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// Status register: capability list present
const STATUS_CAP_LIST: u16 = 1 << 4;

/// Invalid vendor ID (no device present)
const INVALID_VENDOR_ID: u16 = 0xFFFF;

/// PCI device location (Bus:Device.Function)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Check whether a function responds at `addr`
pub fn is_present<A: PciAccess + ?Sized>(access: &A, addr: PciAddress) -> bool {
    access.read16(addr, config::VENDOR_ID) != INVALID_VENDOR_ID
}

/// Walk the standard capability list looking for `cap_id`
///
/// Returns the configuration offset of the capability header.
pub fn find_capability<A: PciAccess + ?Sized>(
    access: &A,
    addr: PciAddress,
    cap_id: u8,
) -> Option<u8> {
    find_capability_with(|offset| access.read32(addr, offset), cap_id)
}

/// Capability list walk over any dword-wide config space reader
pub fn find_capability_with<F>(read32: F, cap_id: u8) -> Option<u8>
where
    F: Fn(u16) -> u32,
{
    let status = (read32(config::COMMAND) >> 16) as u16;
    if status & STATUS_CAP_LIST == 0 {
        return None;
    }

    let mut offset = (read32(config::CAPABILITIES_PTR) as u8) & 0xFC;
    // The list lives in the first 256 bytes; 48 entries is the most that fit.
    for _ in 0..48 {
        if offset < 0x40 {
            return None;
        }
        let header = read32(offset as u16);
        if header as u8 == cap_id {
            return Some(offset);
        }
        offset = ((header >> 8) as u8) & 0xFC;
    }
    None
}

/// Decode a memory BAR, returning its base address
///
/// 64-bit BARs consume the following BAR slot for the high half. I/O BARs
/// and unassigned BARs yield `None`.
pub fn memory_bar<A: PciAccess + ?Sized>(access: &A, addr: PciAddress, index: u8) -> Option<u64> {
    if index >= 6 {
        return None;
    }
    let offset = config::BAR0 + index as u16 * 4;
    let low = access.read32(addr, offset);
    if low & 0x1 != 0 {
        return None;
    }

    let base = match (low >> 1) & 0x3 {
        0b00 => (low & !0xF) as u64,
        0b10 if index < 5 => {
            let high = access.read32(addr, offset + 4);
            ((high as u64) << 32) | (low & !0xF) as u64
        }
        _ => return None,
    };
    (base != 0).then_some(base)
}

/// Enable memory decoding and bus mastering
pub fn enable_device<A: PciAccess + ?Sized>(access: &A, addr: PciAddress) {
    let cmd = access.read16(addr, config::COMMAND);
    access.write16(
        addr,
        config::COMMAND,
        cmd | command::MEMORY_SPACE | command::BUS_MASTER,
    );
    log::debug!("PCI {}: command {:#06x} -> bus master enabled", addr, cmd);
}
