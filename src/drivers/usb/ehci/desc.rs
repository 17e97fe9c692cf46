//! EHCI hardware descriptors
//!
//! A queue head (QH) or transfer descriptor (qTD) is a hardware-defined
//! record followed by a few software fields, allocated from the DMA pool.
//! The controller reads and writes the hardware part at any time, so every
//! access to it is volatile and goes through the [`QhPtr`] / [`QtdPtr`]
//! handles. Links between descriptors in the hardware part are always bus
//! addresses (or the terminate bit), never host pointers.

use core::ptr::{self, NonNull, addr_of, addr_of_mut};

use tock_registers::LocalRegisterCopy;

use super::regs::{LINK_TERMINATE, LINK_TYPE_QH, QH_EP_CAPS, QH_EP_CHARS, QTD_MAX_BUFFER, QTD_TOKEN};

/// qTD token value
pub type Token = LocalRegisterCopy<u32, QTD_TOKEN::Register>;
/// QH endpoint characteristics value
pub type EpChars = LocalRegisterCopy<u32, QH_EP_CHARS::Register>;
/// QH endpoint capabilities value
pub type EpCaps = LocalRegisterCopy<u32, QH_EP_CAPS::Register>;

/// Packet identifier of a qTD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

impl Pid {
    pub fn from_token(token: Token) -> Pid {
        match token.read(QTD_TOKEN::PID) {
            0 => Pid::Out,
            1 => Pid::In,
            _ => Pid::Setup,
        }
    }
}

/// Link pointer to a qTD, or terminate
#[inline]
pub fn qtd_link(bus: Option<u64>) -> u32 {
    match bus {
        Some(addr) => (addr as u32) & !0x1F,
        None => LINK_TERMINATE,
    }
}

/// Horizontal link pointer to a QH
#[inline]
pub fn qh_link(bus: u64) -> u32 {
    ((bus as u32) & !0x1F) | LINK_TYPE_QH
}

/// Bus address carried by a link pointer, if it does not terminate
#[inline]
pub fn link_target(link: u32) -> Option<u32> {
    (link & LINK_TERMINATE == 0).then_some(link & !0x1F)
}

// ============================================================================
// Hardware Layouts
// ============================================================================

/// qTD as the controller sees it (EHCI 3.5)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QtdHw {
    pub next_qtd: u32,
    pub alt_next: u32,
    pub token: u32,
    pub page: [u32; QTD_MAX_BUFFER],
    pub page_high: [u32; QTD_MAX_BUFFER],
}

/// QH as the controller sees it (EHCI 3.6); the overlay mirrors a qTD
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QhHw {
    pub horizon_link: u32,
    pub ep_chars: u32,
    pub ep_caps: u32,
    pub cur_qtd: u32,
    pub overlay: QtdHw,
}

/// Transfer descriptor: hardware record plus software bookkeeping
#[repr(C, align(32))]
pub struct Qtd {
    hw: QtdHw,
    /// Next qTD of the same transfer, in software order
    next: Option<QtdPtr>,
    /// Host address of the data this qTD covers (0 when none)
    data: usize,
    /// Bytes this qTD was built to move
    data_len: usize,
}

/// Queue head: hardware record plus software bookkeeping
#[repr(C, align(32))]
pub struct Qh {
    hw: QhHw,
    /// Next QH in the periodic tree
    next: Option<QhPtr>,
    /// First qTD of the transfer
    qtds: Option<QtdPtr>,
    /// Polling interval in frames (power of two)
    interval: usize,
}

// ============================================================================
// Handles
// ============================================================================

/// Handle to a live qTD in pool memory
///
/// Handles are created only for pool allocations holding an initialized
/// `Qtd` and must not be used once the descriptor is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QtdPtr(NonNull<Qtd>);

/// Handle to a live QH in pool memory, with the same rules as [`QtdPtr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QhPtr(NonNull<Qh>);

macro_rules! vread {
    ($handle:expr, $($field:tt)+) => {
        // SAFETY: the handle points at a live, initialized descriptor.
        unsafe { ptr::read_volatile(addr_of!((*$handle.0.as_ptr()).$($field)+)) }
    };
}

macro_rules! vwrite {
    ($handle:expr, $value:expr, $($field:tt)+) => {
        // SAFETY: the handle points at a live, initialized descriptor.
        unsafe { ptr::write_volatile(addr_of_mut!((*$handle.0.as_ptr()).$($field)+), $value) }
    };
}

impl QtdPtr {
    /// Initialize a freshly allocated, zeroed qTD
    ///
    /// # Safety
    ///
    /// `mem` must be pool memory sized and aligned for a `Qtd`.
    pub(super) unsafe fn init(mem: NonNull<Qtd>, data: usize, data_len: usize) -> Self {
        ptr::write(
            mem.as_ptr(),
            Qtd {
                hw: QtdHw {
                    next_qtd: LINK_TERMINATE,
                    alt_next: LINK_TERMINATE,
                    ..QtdHw::default()
                },
                next: None,
                data,
                data_len,
            },
        );
        Self(mem)
    }

    #[inline]
    pub fn as_non_null(self) -> NonNull<Qtd> {
        self.0
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr() as *const u8
    }

    pub fn token(self) -> Token {
        Token::new(vread!(self, hw.token))
    }

    pub fn set_token(self, token: Token) {
        vwrite!(self, token.get(), hw.token);
    }

    pub fn next_qtd(self) -> u32 {
        vread!(self, hw.next_qtd)
    }

    pub fn set_next_qtd(self, link: u32) {
        vwrite!(self, link, hw.next_qtd);
    }

    pub fn alt_next(self) -> u32 {
        vread!(self, hw.alt_next)
    }

    pub fn set_alt_next(self, link: u32) {
        vwrite!(self, link, hw.alt_next);
    }

    pub fn page(self, index: usize) -> u64 {
        let low = vread!(self, hw.page[index]);
        let high = vread!(self, hw.page_high[index]);
        ((high as u64) << 32) | low as u64
    }

    pub fn set_page(self, index: usize, bus: u64) {
        vwrite!(self, bus as u32, hw.page[index]);
        vwrite!(self, (bus >> 32) as u32, hw.page_high[index]);
    }

    /// Copy of the hardware part
    pub fn hw(self) -> QtdHw {
        vread!(self, hw)
    }

    pub fn next(self) -> Option<QtdPtr> {
        vread!(self, next)
    }

    pub fn set_next(self, next: Option<QtdPtr>) {
        vwrite!(self, next, next);
    }

    pub fn data(self) -> usize {
        vread!(self, data)
    }

    pub fn data_len(self) -> usize {
        vread!(self, data_len)
    }

    /// Iterate a software qTD chain starting at `self`
    pub fn chain(first: Option<QtdPtr>) -> impl Iterator<Item = QtdPtr> {
        core::iter::successors(first, |qtd| qtd.next())
    }
}

impl QhPtr {
    /// Initialize a freshly allocated, zeroed QH
    ///
    /// # Safety
    ///
    /// `mem` must be pool memory sized and aligned for a `Qh`.
    pub(super) unsafe fn init(mem: NonNull<Qh>, interval: usize) -> Self {
        ptr::write(
            mem.as_ptr(),
            Qh {
                hw: QhHw {
                    horizon_link: LINK_TERMINATE,
                    overlay: QtdHw {
                        next_qtd: LINK_TERMINATE,
                        alt_next: LINK_TERMINATE,
                        ..QtdHw::default()
                    },
                    ..QhHw::default()
                },
                next: None,
                qtds: None,
                interval,
            },
        );
        Self(mem)
    }

    #[inline]
    pub fn as_non_null(self) -> NonNull<Qh> {
        self.0
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr() as *const u8
    }

    pub fn horizon_link(self) -> u32 {
        vread!(self, hw.horizon_link)
    }

    pub fn set_horizon_link(self, link: u32) {
        vwrite!(self, link, hw.horizon_link);
    }

    pub fn ep_chars(self) -> EpChars {
        EpChars::new(vread!(self, hw.ep_chars))
    }

    pub fn set_ep_chars(self, chars: EpChars) {
        vwrite!(self, chars.get(), hw.ep_chars);
    }

    pub fn ep_caps(self) -> EpCaps {
        EpCaps::new(vread!(self, hw.ep_caps))
    }

    pub fn set_ep_caps(self, caps: EpCaps) {
        vwrite!(self, caps.get(), hw.ep_caps);
    }

    pub fn cur_qtd(self) -> u32 {
        vread!(self, hw.cur_qtd)
    }

    pub fn set_cur_qtd(self, link: u32) {
        vwrite!(self, link, hw.cur_qtd);
    }

    pub fn overlay_token(self) -> Token {
        Token::new(vread!(self, hw.overlay.token))
    }

    pub fn set_overlay_token(self, token: Token) {
        vwrite!(self, token.get(), hw.overlay.token);
    }

    pub fn overlay_next(self) -> u32 {
        vread!(self, hw.overlay.next_qtd)
    }

    pub fn set_overlay_next(self, link: u32) {
        vwrite!(self, link, hw.overlay.next_qtd);
    }

    pub fn set_overlay_alt_next(self, link: u32) {
        vwrite!(self, link, hw.overlay.alt_next);
    }

    /// Zero the overlay buffer pointers
    pub fn clear_overlay_pages(self) {
        for index in 0..QTD_MAX_BUFFER {
            vwrite!(self, 0, hw.overlay.page[index]);
            vwrite!(self, 0, hw.overlay.page_high[index]);
        }
    }

    /// Copy of the hardware part
    pub fn hw(self) -> QhHw {
        vread!(self, hw)
    }

    pub fn next_qh(self) -> Option<QhPtr> {
        vread!(self, next)
    }

    pub fn set_next_qh(self, next: Option<QhPtr>) {
        vwrite!(self, next, next);
    }

    pub fn qtds(self) -> Option<QtdPtr> {
        vread!(self, qtds)
    }

    pub fn set_qtds(self, first: Option<QtdPtr>) {
        vwrite!(self, first, qtds);
    }

    pub fn interval(self) -> usize {
        vread!(self, interval)
    }
}
