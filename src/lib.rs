//! CrabEFI EHCI - USB 2.0 host controller transfer scheduling for CrabEFI
//!
//! This library contains the EHCI core used by the CrabEFI payload: the DMA
//! descriptor pool, queue head / transfer descriptor construction, the
//! asynchronous and periodic schedules, and the polling transfer engine that
//! backs control, bulk and interrupt transfers.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]
// USB/hardware APIs often require many parameters
#![allow(clippy::too_many_arguments)]

extern crate alloc;

pub mod drivers;
pub mod efi;
pub mod logger;
pub mod time;
