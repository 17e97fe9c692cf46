//! Descriptor factory: qTDs, queue heads and USB request blocks
//!
//! An [`Urb`] owns one queue head and the qTD chain hanging off it, plus the
//! DMA mappings of the request and data buffers the chain points at. It is
//! built unlinked; the schedule code links it, the executor polls it, and it
//! must be unlinked again before [`Urb::free`].

use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;

use super::desc::{EpCaps, EpChars, Pid, Qh, QhPtr, Qtd, QtdPtr, Token, qtd_link};
use super::mem::MemPool;
use super::regs::{
    FRAME_LIST_LEN, HS_INT_SMASK, LINK_TERMINATE, QH_EP_CAPS, QH_EP_CHARS, QH_NAK_RELOAD,
    QTD_BUF_LEN, QTD_BUF_MASK, QTD_MAX_BUFFER, QTD_MAX_ERR, QTD_TOKEN, SPLIT_INT_CMASK,
    SPLIT_INT_SMASK,
};
use crate::drivers::dma::{DmaMapping, DmaOperation, DmaOps};
use crate::drivers::usb::controller::{
    DeviceRequest, TransferDirection, Translator, UsbError, UsbResult, UsbSpeed,
};

/// Kind of transfer an endpoint is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
    SyncInterrupt,
    AsyncInterrupt,
}

impl TransferKind {
    fn is_interrupt(self) -> bool {
        matches!(self, Self::SyncInterrupt | Self::AsyncInterrupt)
    }
}

/// Everything a queue head needs to know about its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub dev_addr: u8,
    /// Endpoint number without the direction bit
    pub ep_num: u8,
    /// `In` or `Out`
    pub direction: TransferDirection,
    pub speed: UsbSpeed,
    pub max_packet: usize,
    pub hub_addr: u8,
    pub hub_port: u8,
    pub toggle: u8,
    pub kind: TransferKind,
    /// Polling interval in frames, a power of two
    pub poll_rate: usize,
}

impl Endpoint {
    /// Describe endpoint `ep_addr` (direction in bit 7) of device `dev_addr`
    ///
    /// `translator` supplies the split-transaction hub for low/full-speed
    /// devices and is ignored for high-speed ones.
    pub fn new(
        dev_addr: u8,
        ep_addr: u8,
        speed: UsbSpeed,
        max_packet: usize,
        translator: Option<Translator>,
        toggle: u8,
        kind: TransferKind,
        interval: usize,
    ) -> Self {
        let (hub_addr, hub_port) = match (speed, translator) {
            (UsbSpeed::High, _) | (_, None) => (0, 0),
            (_, Some(tt)) => (tt.hub_address, tt.port_number),
        };
        Self {
            dev_addr,
            ep_num: ep_addr & 0x0F,
            direction: if ep_addr & 0x80 != 0 {
                TransferDirection::In
            } else {
                TransferDirection::Out
            },
            speed,
            max_packet,
            hub_addr,
            hub_port,
            toggle,
            kind,
            poll_rate: convert_poll_rate(interval),
        }
    }

    #[inline]
    fn is_in(&self) -> bool {
        self.direction == TransferDirection::In
    }
}

/// Round a polling interval down to a power of two frame count
///
/// Zero polls every frame; nothing polls less often than the frame list wraps.
pub fn convert_poll_rate(interval: usize) -> usize {
    if interval == 0 {
        return 1;
    }
    let rate = 1usize << (usize::BITS - 1 - interval.leading_zeros());
    rate.min(FRAME_LIST_LEN)
}

fn speed_field(speed: UsbSpeed) -> u32 {
    match speed {
        UsbSpeed::Full => 0,
        UsbSpeed::Low => 1,
        _ => 2,
    }
}

// ============================================================================
// qTD / QH construction
// ============================================================================

/// Allocate a qTD moving up to `data_len` bytes of `data` (host, bus)
///
/// The qTD reaches at most five 4 KiB pages from the start address. When it
/// cannot hold everything, its length is cut to whole packets so the next
/// qTD starts on a packet boundary.
pub fn create_qtd<D: DmaOps + ?Sized>(
    pool: &mut MemPool,
    dma: &mut D,
    data: Option<(usize, u64)>,
    data_len: usize,
    pid: Pid,
    toggle: u8,
    max_packet: usize,
) -> Result<QtdPtr, UsbError> {
    let mem = pool.allocate_typed::<Qtd, _>(dma)?;

    let mut len = 0;
    let mut pages = [0u64; QTD_MAX_BUFFER];
    if let Some((_, bus)) = data {
        let mut cursor = bus;
        for page in pages.iter_mut() {
            *page = cursor;
            let this_len = QTD_BUF_LEN - (cursor & QTD_BUF_MASK) as usize;
            if len + this_len >= data_len {
                len = data_len;
                break;
            }
            len += this_len;
            cursor += this_len as u64;
        }
        if len < data_len {
            len -= len % max_packet.max(1);
        }
    }

    // SAFETY: fresh pool allocation of a Qtd
    let qtd = unsafe { QtdPtr::init(mem, data.map_or(0, |(host, _)| host), len) };
    if data.is_some() {
        for (index, page) in pages.iter().enumerate() {
            qtd.set_page(index, *page);
        }
    }

    let mut token = Token::new(0);
    token.write(
        QTD_TOKEN::ACTIVE::SET
            + QTD_TOKEN::PID.val(pid as u32)
            + QTD_TOKEN::CERR.val(QTD_MAX_ERR)
            + QTD_TOKEN::TOTAL_BYTES.val(len as u32)
            + QTD_TOKEN::DT.val(toggle as u32 & 1),
    );
    qtd.set_token(token);
    Ok(qtd)
}

/// Allocate and encode the queue head for `ep`
pub fn create_qh<D: DmaOps + ?Sized>(
    pool: &mut MemPool,
    dma: &mut D,
    ep: &Endpoint,
) -> Result<QhPtr, UsbError> {
    let mem = pool.allocate_typed::<Qh, _>(dma)?;
    // SAFETY: fresh pool allocation of a Qh
    let qh = unsafe { QhPtr::init(mem, ep.poll_rate) };

    let mut chars = EpChars::new(0);
    chars.write(
        QH_EP_CHARS::DEVICE_ADDRESS.val(ep.dev_addr as u32)
            + QH_EP_CHARS::ENDPOINT.val(ep.ep_num as u32)
            + QH_EP_CHARS::EPS.val(speed_field(ep.speed))
            + QH_EP_CHARS::MAX_PACKET.val(ep.max_packet as u32)
            + QH_EP_CHARS::NAK_RELOAD.val(QH_NAK_RELOAD),
    );
    let mut caps = EpCaps::new(0);
    caps.write(
        QH_EP_CAPS::HUB_ADDRESS.val(ep.hub_addr as u32)
            + QH_EP_CAPS::PORT_NUMBER.val(ep.hub_port as u32)
            + QH_EP_CAPS::MULT.val(1),
    );
    let mut status = Token::new(0);
    status.write(QTD_TOKEN::DT.val(ep.toggle as u32 & 1));
    if ep.speed != UsbSpeed::High {
        status.modify(QTD_TOKEN::SPLIT_STATE::SET);
    }

    match ep.kind {
        TransferKind::Control => {
            // Control transfers take the toggle from each qTD
            chars.modify(QH_EP_CHARS::DTC::SET);
            if ep.speed != UsbSpeed::High {
                chars.modify(QH_EP_CHARS::CTRL_EP::SET);
            }
        }
        kind if kind.is_interrupt() => {
            // Interrupt endpoints are polled at most once a frame
            chars.modify(QH_EP_CHARS::NAK_RELOAD.val(0));
            if ep.speed == UsbSpeed::High {
                caps.modify(QH_EP_CAPS::SMASK.val(HS_INT_SMASK));
            } else {
                caps.modify(
                    QH_EP_CAPS::SMASK.val(SPLIT_INT_SMASK) + QH_EP_CAPS::CMASK.val(SPLIT_INT_CMASK),
                );
            }
        }
        _ => {
            if ep.speed == UsbSpeed::High && !ep.is_in() {
                status.modify(QTD_TOKEN::PING::SET);
            }
        }
    }

    qh.set_ep_chars(chars);
    qh.set_ep_caps(caps);
    qh.set_overlay_token(status);
    Ok(qh)
}

/// Free a software qTD chain
pub fn free_qtds<D: DmaOps + ?Sized>(pool: &mut MemPool, dma: &mut D, first: Option<QtdPtr>) {
    let mut next = first;
    while let Some(qtd) = next {
        next = qtd.next();
        pool.free_typed(dma, qtd.as_non_null());
    }
}

// ============================================================================
// URB
// ============================================================================

/// Map exactly `len` bytes or nothing
unsafe fn map_exact<D: DmaOps + ?Sized>(
    dma: &mut D,
    operation: DmaOperation,
    host: NonNull<u8>,
    len: usize,
) -> Result<DmaMapping, UsbError> {
    let mapping = dma.map(operation, host, len)?;
    if mapping.len != len {
        log::error!(
            "EHCI: mapped {:#x} of {:#x} bytes at {:#x}",
            mapping.len,
            len,
            host.as_ptr() as usize
        );
        let _ = dma.unmap(mapping);
        return Err(UsbError::OutOfResources);
    }
    Ok(mapping)
}

/// One transfer request: queue head, qTD chain and buffer mappings
pub struct Urb {
    pub ep: Endpoint,
    qh: QhPtr,
    request: Option<DmaMapping>,
    data: Option<NonNull<u8>>,
    data_map: Option<DmaMapping>,
    data_len: usize,
    /// Outcome of the last [`super::EhciController::check_urb_result`]
    pub result: UsbResult,
    pub completed: usize,
    pub data_toggle: u8,
}

impl Urb {
    /// Build a request for `ep`
    ///
    /// # Safety
    ///
    /// `request` and the `data_len` bytes at `data` must stay valid, and must
    /// not be touched by the CPU while linked, until the URB is freed.
    pub unsafe fn create<D: DmaOps + ?Sized>(
        pool: &mut MemPool,
        dma: &mut D,
        short_read_stop: QtdPtr,
        ep: Endpoint,
        request: Option<NonNull<DeviceRequest>>,
        data: Option<NonNull<u8>>,
        data_len: usize,
    ) -> Result<Self, UsbError> {
        let qh = create_qh(pool, dma, &ep)?;
        let mut urb = Self {
            ep,
            qh,
            request: None,
            data: data.filter(|_| data_len > 0),
            data_map: None,
            data_len,
            result: UsbResult::NO_ERROR,
            completed: 0,
            data_toggle: 0,
        };

        match urb.map_and_build(pool, dma, short_read_stop, request) {
            Ok(()) => Ok(urb),
            Err(err) => {
                urb.free(pool, dma);
                Err(err)
            }
        }
    }

    unsafe fn map_and_build<D: DmaOps + ?Sized>(
        &mut self,
        pool: &mut MemPool,
        dma: &mut D,
        short_read_stop: QtdPtr,
        request: Option<NonNull<DeviceRequest>>,
    ) -> Result<(), UsbError> {
        if let Some(request) = request {
            self.request = Some(map_exact(
                dma,
                DmaOperation::BusMasterRead,
                request.cast(),
                size_of::<DeviceRequest>(),
            )?);
        }
        if let Some(data) = self.data {
            let operation = if self.ep.is_in() {
                DmaOperation::BusMasterWrite
            } else {
                DmaOperation::BusMasterRead
            };
            self.data_map = Some(map_exact(dma, operation, data, self.data_len)?);
        }

        let mut chain = Vec::new();
        if let Err(err) = self.build_qtds(pool, dma, short_read_stop, &mut chain) {
            for qtd in chain {
                pool.free_typed(dma, QtdPtr::as_non_null(qtd));
            }
            return Err(err);
        }

        for pair in chain.windows(2) {
            let bus = pool.device_address(pair[1].as_ptr(), size_of::<Qtd>());
            pair[0].set_next(Some(pair[1]));
            pair[0].set_next_qtd(qtd_link(Some(bus)));
        }
        let first = *chain.first().ok_or(UsbError::InvalidParameter)?;
        let bus = pool.device_address(first.as_ptr(), size_of::<Qtd>());
        self.qh.set_qtds(Some(first));
        self.qh.set_overlay_next(qtd_link(Some(bus)));
        Ok(())
    }

    /// Create the qTDs in execution order into `chain`
    fn build_qtds<D: DmaOps + ?Sized>(
        &self,
        pool: &mut MemPool,
        dma: &mut D,
        short_read_stop: QtdPtr,
        chain: &mut Vec<QtdPtr>,
    ) -> Result<(), UsbError> {
        let ep = &self.ep;
        let mut alt_next = if ep.is_in() {
            qtd_link(Some(
                pool.device_address(short_read_stop.as_ptr(), size_of::<Qtd>()),
            ))
        } else {
            LINK_TERMINATE
        };
        let mut toggle = 0;

        if ep.kind == TransferKind::Control {
            let request = self.request.ok_or(UsbError::InvalidParameter)?;
            let setup = create_qtd(
                pool,
                dma,
                Some((request.host_address, request.device_address)),
                size_of::<DeviceRequest>(),
                Pid::Setup,
                0,
                ep.max_packet,
            )?;
            chain.push(setup);

            // Status runs opposite to the data stage, IN when there is none
            let pid = if ep.is_in() { Pid::Out } else { Pid::In };
            let status = create_qtd(pool, dma, None, 0, pid, 1, ep.max_packet)?;
            chain.push(status);

            if ep.is_in() {
                alt_next = qtd_link(Some(pool.device_address(status.as_ptr(), size_of::<Qtd>())));
            }
            toggle = 1;
        }

        let pid = if ep.is_in() { Pid::In } else { Pid::Out };
        if let (Some(data), Some(map)) = (self.data, self.data_map) {
            let host = data.as_ptr() as usize;
            let mut len = 0;
            while len < self.data_len {
                let qtd = create_qtd(
                    pool,
                    dma,
                    Some((host + len, map.device_address + len as u64)),
                    self.data_len - len,
                    pid,
                    toggle,
                    ep.max_packet,
                )?;
                chain.push(qtd);
                qtd.set_alt_next(alt_next);

                let this_len = qtd.data_len();
                if this_len == 0 {
                    return Err(UsbError::InvalidParameter);
                }
                // An odd packet count flips the toggle for the next qTD
                if this_len.div_ceil(ep.max_packet.max(1)) % 2 == 1 {
                    toggle ^= 1;
                }
                len += this_len;
            }
        }

        if ep.kind == TransferKind::Control {
            let status = chain.remove(1);
            chain.push(status);
        }
        Ok(())
    }

    /// Release the queue head, its qTDs and the buffer mappings
    ///
    /// The queue head must already be unlinked from both schedules.
    pub fn free<D: DmaOps + ?Sized>(self, pool: &mut MemPool, dma: &mut D) {
        if let Some(mapping) = self.request {
            let _ = dma.unmap(mapping);
        }
        if let Some(mapping) = self.data_map {
            let _ = dma.unmap(mapping);
        }
        free_qtds(pool, dma, self.qh.qtds());
        pool.free_typed(dma, self.qh.as_non_null());
    }

    pub fn qh(&self) -> QhPtr {
        self.qh
    }

    /// qTDs in execution order
    pub fn qtds(&self) -> impl Iterator<Item = QtdPtr> + use<> {
        QtdPtr::chain(self.qh.qtds())
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn data(&self) -> Option<NonNull<u8>> {
        self.data
    }

    /// Bus address the data buffer is currently mapped at
    pub fn data_device_address(&self) -> Option<u64> {
        self.data_map.map(|m| m.device_address)
    }

    /// Unmap and map the data buffer again for device writes
    ///
    /// Unmapping is what makes the device's writes visible to the CPU on
    /// platforms with bounce buffers or non-coherent caches.
    pub fn remap_data<D: DmaOps + ?Sized>(&mut self, dma: &mut D) -> Result<(), UsbError> {
        let (Some(data), Some(mapping)) = (self.data, self.data_map) else {
            return Ok(());
        };
        dma.unmap(mapping).map_err(|_| UsbError::DeviceError)?;
        self.data_map = None;

        // SAFETY: the buffer is owned by the request until it is freed
        let mapping = unsafe { map_exact(dma, DmaOperation::BusMasterWrite, data, self.data_len) }
            .map_err(|_| UsbError::DeviceError)?;
        self.data_map = Some(mapping);
        Ok(())
    }
}
