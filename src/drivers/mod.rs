//! Hardware drivers for CrabEFI
//!
//! Only the pieces the USB 2.0 host controller stack depends on live here:
//! register windows, PCI function access, DMA mapping, and the USB drivers.

pub mod dma;
pub mod mmio;
pub mod pci;
pub mod usb;
