//! EHCI register and descriptor field definitions
//!
//! Register bitfields are used through `LocalRegisterCopy` on values read via
//! PCI I/O, and the same machinery encodes the hardware descriptor dwords.
//!
//! # References
//! - Intel EHCI for Universal Serial Bus, revision 1.0, sections 2 and 3

use tock_registers::register_bitfields;

// ============================================================================
// Capability Registers
// ============================================================================

/// CAPLENGTH register offset (8-bit)
pub const CAP_CAPLENGTH: u64 = 0x00;
/// HCSPARAMS register offset
pub const CAP_HCSPARAMS: u64 = 0x04;
/// HCCPARAMS register offset
pub const CAP_HCCPARAMS: u64 = 0x08;

register_bitfields! [
    u32,
    /// Structural Parameters
    pub HCSPARAMS [
        /// Number of root ports
        N_PORTS OFFSET(0) NUMBITS(4) [],
        /// Port Power Control: ports have power switches
        PPC OFFSET(4) NUMBITS(1) [],
        /// Debug port number (1-based, 0 = none)
        DEBUG_N OFFSET(20) NUMBITS(4) []
    ],

    /// Capability Parameters
    pub HCCPARAMS [
        /// 64-bit Addressing Capability
        AC64 OFFSET(0) NUMBITS(1) [],
        /// EHCI Extended Capabilities Pointer (config space offset)
        EECP OFFSET(8) NUMBITS(8) []
    ]
];

// ============================================================================
// Operational Registers
// ============================================================================

pub const OP_USBCMD: u64 = 0x00;
pub const OP_USBSTS: u64 = 0x04;
pub const OP_USBINTR: u64 = 0x08;
pub const OP_FRINDEX: u64 = 0x0C;
pub const OP_CTRLDSSEGMENT: u64 = 0x10;
pub const OP_PERIODICLISTBASE: u64 = 0x14;
pub const OP_ASYNCLISTADDR: u64 = 0x18;
pub const OP_CONFIGFLAG: u64 = 0x40;
/// PORTSC for port 0; each further port is 4 bytes on
pub const OP_PORTSC_BASE: u64 = 0x44;

/// Offset of PORTSC for 0-based `port`
#[inline]
pub const fn op_portsc(port: u8) -> u64 {
    OP_PORTSC_BASE + 4 * port as u64
}

/// USBSTS interrupt status bits that are write-1-to-clear
pub const USBSTS_INTACK_MASK: u32 = 0x003F;

register_bitfields! [
    u32,
    /// USB Command
    pub USBCMD [
        /// Run/Stop
        RS OFFSET(0) NUMBITS(1) [],
        /// Host Controller Reset
        HCRESET OFFSET(1) NUMBITS(1) [],
        /// Periodic Schedule Enable
        PSE OFFSET(4) NUMBITS(1) [],
        /// Asynchronous Schedule Enable
        ASE OFFSET(5) NUMBITS(1) [],
        /// Interrupt on Async Advance Doorbell
        IAAD OFFSET(6) NUMBITS(1) []
    ],

    /// USB Status
    pub USBSTS [
        /// Host System Error
        HSE OFFSET(4) NUMBITS(1) [],
        /// Interrupt on Async Advance
        IAA OFFSET(5) NUMBITS(1) [],
        /// HC Halted
        HCHALTED OFFSET(12) NUMBITS(1) [],
        /// Periodic Schedule Status
        PSS OFFSET(14) NUMBITS(1) [],
        /// Asynchronous Schedule Status
        ASS OFFSET(15) NUMBITS(1) []
    ],

    /// Configure Flag
    pub CONFIGFLAG [
        /// Route all ports to this controller
        CF OFFSET(0) NUMBITS(1) []
    ],

    /// Port Status and Control
    pub PORTSC [
        /// Current Connect Status
        CCS OFFSET(0) NUMBITS(1) [],
        /// Connect Status Change (RWC)
        CSC OFFSET(1) NUMBITS(1) [],
        /// Port Enabled
        PE OFFSET(2) NUMBITS(1) [],
        /// Port Enable Change (RWC)
        PEC OFFSET(3) NUMBITS(1) [],
        /// Over-current Active
        OCA OFFSET(4) NUMBITS(1) [],
        /// Over-current Change (RWC)
        OCC OFFSET(5) NUMBITS(1) [],
        /// Force Port Resume
        FPR OFFSET(6) NUMBITS(1) [],
        /// Suspend
        SUSPEND OFFSET(7) NUMBITS(1) [],
        /// Port Reset
        PR OFFSET(8) NUMBITS(1) [],
        /// Line Status
        LS OFFSET(10) NUMBITS(2) [
            SE0 = 0,
            KState = 1,
            JState = 2
        ],
        /// Port Power
        PP OFFSET(12) NUMBITS(1) [],
        /// Port Owner (1 = companion controller)
        PO OFFSET(13) NUMBITS(1) []
    ]
];

/// PORTSC change bits (write-1-to-clear)
pub const PORTSC_CHANGE_MASK: u32 = (1 << 1) | (1 << 3) | (1 << 5);

// ============================================================================
// PCI Configuration Space Extensions
// ============================================================================

/// Debug port PCI capability ID
pub const DEBUG_PORT_CAP_ID: u8 = 0x0A;

register_bitfields! [
    u32,
    /// USBLEGSUP extended capability (config space at EECP)
    pub USBLEGSUP [
        CAP_ID OFFSET(0) NUMBITS(8) [],
        HC_BIOS_OWNED OFFSET(16) NUMBITS(1) [],
        HC_OS_OWNED OFFSET(24) NUMBITS(1) []
    ],

    /// Debug port capability header (config space)
    pub DEBUG_PORT_CAP [
        /// Offset of the debug port registers in the BAR
        REG_OFFSET OFFSET(16) NUMBITS(13) [],
        /// BAR holding the registers, 1 = BAR0
        BAR OFFSET(29) NUMBITS(3) []
    ],

    /// Debug port control/status register (MMIO)
    pub DEBUG_PORT_CTRL [
        IN_USE OFFSET(10) NUMBITS(1) [],
        OWNER OFFSET(30) NUMBITS(1) []
    ]
];

// ============================================================================
// Descriptor Fields
// ============================================================================

/// Entries in the periodic frame list
pub const FRAME_LIST_LEN: usize = 1024;
/// Transaction error budget programmed into each qTD
pub const QTD_MAX_ERR: u32 = 3;
/// NAK counter reload for asynchronous queue heads
pub const QH_NAK_RELOAD: u32 = 3;
/// Buffer pointers per qTD
pub const QTD_MAX_BUFFER: usize = 5;
/// Bytes covered by one qTD buffer pointer
pub const QTD_BUF_LEN: usize = 4096;
pub const QTD_BUF_MASK: u64 = 0xFFF;
/// Largest transfer one qTD can describe
pub const QTD_MAX_LEN: usize = QTD_BUF_LEN * QTD_MAX_BUFFER;

/// Link pointer terminate bit
pub const LINK_TERMINATE: u32 = 1;
/// Link pointer type: queue head
pub const LINK_TYPE_QH: u32 = 1 << 1;

/// High-speed interrupt endpoints start in microframe 0
pub const HS_INT_SMASK: u32 = 0x01;
/// Split interrupt transactions start in microframe 1
pub const SPLIT_INT_SMASK: u32 = 0x02;
/// ... and complete in microframes 3, 4 and 5
pub const SPLIT_INT_CMASK: u32 = 0x38;

register_bitfields! [
    u32,
    /// qTD token (also the QH overlay token)
    pub QTD_TOKEN [
        /// Ping state / error (OUT high-speed)
        PING OFFSET(0) NUMBITS(1) [],
        /// Split transaction state
        SPLIT_STATE OFFSET(1) NUMBITS(1) [],
        MISSED_UFRAME OFFSET(2) NUMBITS(1) [],
        XACT_ERR OFFSET(3) NUMBITS(1) [],
        BABBLE OFFSET(4) NUMBITS(1) [],
        BUFFER_ERR OFFSET(5) NUMBITS(1) [],
        HALTED OFFSET(6) NUMBITS(1) [],
        ACTIVE OFFSET(7) NUMBITS(1) [],
        /// The whole status byte
        STATUS OFFSET(0) NUMBITS(8) [],
        PID OFFSET(8) NUMBITS(2) [
            Out = 0,
            In = 1,
            Setup = 2
        ],
        /// Error counter
        CERR OFFSET(10) NUMBITS(2) [],
        /// Current buffer page
        C_PAGE OFFSET(12) NUMBITS(3) [],
        /// Interrupt on complete
        IOC OFFSET(15) NUMBITS(1) [],
        TOTAL_BYTES OFFSET(16) NUMBITS(15) [],
        /// Data toggle
        DT OFFSET(31) NUMBITS(1) []
    ],

    /// QH endpoint characteristics (dword 1)
    pub QH_EP_CHARS [
        DEVICE_ADDRESS OFFSET(0) NUMBITS(7) [],
        ENDPOINT OFFSET(8) NUMBITS(4) [],
        EPS OFFSET(12) NUMBITS(2) [
            Full = 0,
            Low = 1,
            High = 2
        ],
        /// Data toggle comes from the qTD
        DTC OFFSET(14) NUMBITS(1) [],
        /// Head of the reclamation list
        HEAD OFFSET(15) NUMBITS(1) [],
        MAX_PACKET OFFSET(16) NUMBITS(11) [],
        /// Control endpoint that is not high speed
        CTRL_EP OFFSET(27) NUMBITS(1) [],
        NAK_RELOAD OFFSET(28) NUMBITS(4) []
    ],

    /// QH endpoint capabilities (dword 2)
    pub QH_EP_CAPS [
        SMASK OFFSET(0) NUMBITS(8) [],
        CMASK OFFSET(8) NUMBITS(8) [],
        HUB_ADDRESS OFFSET(16) NUMBITS(7) [],
        PORT_NUMBER OFFSET(23) NUMBITS(7) [],
        MULT OFFSET(30) NUMBITS(2) []
    ]
];
