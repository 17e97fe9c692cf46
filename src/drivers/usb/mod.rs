//! USB host controller support
//!
//! # Architecture
//!
//! - `controller`: transfer, port and state types shared with the USB bus layer
//! - `ehci`: the USB 2.0 host controller driver

pub mod controller;
pub mod ehci;

pub use controller::{
    DeviceRequest, HcCapability, HcState, PortFeature, PortStatus, ResetAttributes, Transfer,
    TransferDirection, TransferError, Translator, UsbError, UsbResult, UsbSpeed,
};
pub use ehci::{EhciConfig, EhciController};
