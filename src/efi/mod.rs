//! UEFI environment services consumed by CrabEFI drivers
//!
//! Drivers only need a small slice of boot services (stall and task priority
//! handling), so they are expressed as a trait the payload implements.

pub mod boot_services;

pub use boot_services::{BootServices, FirmwareServices};
pub use r_efi::efi::{Status, TPL_APPLICATION, TPL_CALLBACK, TPL_HIGH_LEVEL, TPL_NOTIFY, Tpl};
