//! USB host controller abstraction types
//!
//! Types shared between host controller drivers and the USB bus layer that
//! drives them: speeds, setup packets, transfer outcomes, root-hub port
//! status and controller state. Numeric encodings follow the UEFI
//! USB2_HC_PROTOCOL so values can cross the firmware boundary unchanged.

use bitflags::bitflags;
use r_efi::efi;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

// ============================================================================
// USB Speed
// ============================================================================

/// USB device speed, in UEFI encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UsbSpeed {
    /// Full speed (12 Mbps)
    Full = 0,
    /// Low speed (1.5 Mbps)
    Low = 1,
    /// High speed (480 Mbps)
    High = 2,
    /// Super speed (5 Gbps), never valid on a USB 2.0 controller
    Super = 3,
}

impl UsbSpeed {
    pub fn from_efi(speed: u8) -> Option<Self> {
        match speed {
            0 => Some(UsbSpeed::Full),
            1 => Some(UsbSpeed::Low),
            2 => Some(UsbSpeed::High),
            3 => Some(UsbSpeed::Super),
            _ => None,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// bmRequestType values
pub mod req_type {
    pub const DIR_OUT: u8 = 0x00;
    pub const DIR_IN: u8 = 0x80;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const RCPT_DEVICE: u8 = 0x00;
    pub const RCPT_INTERFACE: u8 = 0x01;
    pub const RCPT_ENDPOINT: u8 = 0x02;
}

/// Standard bRequest codes
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// USB setup packet (8 bytes, little-endian on the wire)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DeviceRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: U16,
    pub index: U16,
    pub length: U16,
}

impl DeviceRequest {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }
}

/// Data stage direction of a control transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
    /// No data stage
    NoData,
}

/// Transaction translator routing for a low/full-speed device behind a
/// high-speed hub
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Translator {
    pub hub_address: u8,
    pub port_number: u8,
}

// ============================================================================
// Errors and Results
// ============================================================================

/// USB host controller error status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Malformed caller arguments; nothing was touched
    InvalidParameter,
    /// Descriptor pool or DMA mapping exhausted
    OutOfResources,
    /// Polling budget ran out before the hardware finished
    Timeout,
    /// The hardware reported a transfer or controller error
    DeviceError,
    /// Operation not provided by this controller
    Unsupported,
    /// No such transfer registered
    NotFound,
}

impl From<UsbError> for efi::Status {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            UsbError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            UsbError::Timeout => efi::Status::TIMEOUT,
            UsbError::DeviceError => efi::Status::DEVICE_ERROR,
            UsbError::Unsupported => efi::Status::UNSUPPORTED,
            UsbError::NotFound => efi::Status::NOT_FOUND,
        }
    }
}

impl From<crate::drivers::dma::DmaError> for UsbError {
    fn from(err: crate::drivers::dma::DmaError) -> Self {
        use crate::drivers::dma::DmaError;
        match err {
            DmaError::OutOfResources => UsbError::OutOfResources,
            DmaError::Unsupported => UsbError::Unsupported,
            DmaError::DeviceError => UsbError::DeviceError,
        }
    }
}

impl core::fmt::Display for UsbError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            UsbError::InvalidParameter => "invalid parameter",
            UsbError::OutOfResources => "out of resources",
            UsbError::Timeout => "timeout",
            UsbError::DeviceError => "device error",
            UsbError::Unsupported => "unsupported",
            UsbError::NotFound => "not found",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Transfer condition bitmask (EFI_USB_ERR_*); empty means no error
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsbResult: u32 {
        const NOT_EXECUTED = 0x01;
        const STALL = 0x02;
        const BUFFER = 0x04;
        const BABBLE = 0x08;
        const NAK = 0x10;
        const CRC = 0x20;
        const TIMEOUT = 0x40;
        const BIT_STUFF = 0x80;
        const SYSTEM = 0x100;
    }
}

impl UsbResult {
    pub const NO_ERROR: Self = Self::empty();

    pub fn is_ok(self) -> bool {
        self.is_empty()
    }
}

/// Outcome of a transfer that reached the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transfer {
    /// Bytes moved in the data stage
    pub completed: usize,
    /// Condition bits decoded from the descriptors
    pub result: UsbResult,
    /// Data toggle the endpoint expects next
    pub data_toggle: u8,
}

/// A failed transfer: the status plus whatever the hardware reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferError {
    pub error: UsbError,
    pub transfer: Transfer,
}

impl TransferError {
    pub fn new(error: UsbError, transfer: Transfer) -> Self {
        Self { error, transfer }
    }
}

impl From<UsbError> for TransferError {
    fn from(error: UsbError) -> Self {
        Self {
            error,
            transfer: Transfer::default(),
        }
    }
}

// ============================================================================
// Root Hub
// ============================================================================

/// Port status bits (USB_PORT_STAT_*)
pub mod port_status {
    pub const CONNECTION: u16 = 0x0001;
    pub const ENABLE: u16 = 0x0002;
    pub const SUSPEND: u16 = 0x0004;
    pub const OVERCURRENT: u16 = 0x0008;
    pub const RESET: u16 = 0x0010;
    pub const POWER: u16 = 0x0100;
    pub const LOW_SPEED: u16 = 0x0200;
    pub const HIGH_SPEED: u16 = 0x0400;
    pub const OWNER: u16 = 0x2000;
}

/// Port status change bits (USB_PORT_STAT_C_*)
pub mod port_change {
    pub const CONNECTION: u16 = 0x0001;
    pub const ENABLE: u16 = 0x0002;
    pub const SUSPEND: u16 = 0x0004;
    pub const OVERCURRENT: u16 = 0x0008;
    pub const RESET: u16 = 0x0010;
}

/// Root hub port status and change bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    pub status: u16,
    pub change: u16,
}

/// Root hub port features (EFI_USB_PORT_FEATURE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortFeature {
    Enable = 1,
    Suspend = 2,
    Reset = 4,
    Power = 8,
    Owner = 13,
    ConnectChange = 16,
    EnableChange = 17,
    SuspendChange = 18,
    OverCurrentChange = 19,
    ResetChange = 20,
}

impl PortFeature {
    pub fn from_efi(value: u8) -> Option<Self> {
        Some(match value {
            1 => PortFeature::Enable,
            2 => PortFeature::Suspend,
            4 => PortFeature::Reset,
            8 => PortFeature::Power,
            13 => PortFeature::Owner,
            16 => PortFeature::ConnectChange,
            17 => PortFeature::EnableChange,
            18 => PortFeature::SuspendChange,
            19 => PortFeature::OverCurrentChange,
            20 => PortFeature::ResetChange,
            _ => return None,
        })
    }
}

// ============================================================================
// Controller State
// ============================================================================

/// Host controller state (EFI_USB_HC_STATE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcState {
    Halt,
    Operational,
    Suspend,
}

/// Reset attributes (EFI_USB_HC_RESET_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetAttributes {
    Global,
    HostController,
    GlobalWithDebug,
    HostControllerWithDebug,
}

impl ResetAttributes {
    pub fn from_efi(bits: u16) -> Option<Self> {
        match bits {
            0x0001 => Some(ResetAttributes::Global),
            0x0002 => Some(ResetAttributes::HostController),
            0x0004 => Some(ResetAttributes::GlobalWithDebug),
            0x0008 => Some(ResetAttributes::HostControllerWithDebug),
            _ => None,
        }
    }
}

/// Host controller capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcCapability {
    pub max_speed: UsbSpeed,
    pub port_count: u8,
    pub is_64bit_capable: bool,
}
