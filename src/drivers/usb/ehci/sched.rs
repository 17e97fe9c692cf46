//! Asynchronous and periodic schedules
//!
//! The asynchronous schedule is a ring anchored at a permanent reclamation
//! head; control and bulk queue heads are linked right after it one at a
//! time. The periodic schedule is the 1024-entry frame list. Each slot
//! starts a chain of interrupt queue heads ordered by descending interval
//! that always ends in the permanent `period_one` queue head, so chains for
//! different slots share their tails like a binary tree.
//!
//! Frame list entries and horizontal links hold bus addresses. The host side
//! of each chain is followed through the software `next_qh` links and the
//! `frame_host` shadow of the frame list.

use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{Ordering, fence};

use super::EhciController;
use super::desc::{Pid, Qh, QhPtr, Qtd, QtdPtr, qh_link};
use super::hc::UsbSts;
use super::mem::MemPool;
use super::regs::*;
use super::urb::{Endpoint, TransferKind, create_qh, create_qtd};
use crate::drivers::dma::{DmaMapping, DmaOperation, DmaOps, PAGE_SIZE};
use crate::drivers::pci::PciIo;
use crate::drivers::usb::controller::{UsbError, UsbSpeed};
use crate::efi::BootServices;

/// Schedule memory owned by a running controller
pub(super) struct Schedule {
    pub pool: MemPool,
    frame_list: NonNull<u32>,
    frame_map: DmaMapping,
    /// Host view of the first queue head of each frame
    frame_host: Vec<QhPtr>,
    /// Halted qTD that IN transfers fall into on a short packet
    pub short_read_stop: QtdPtr,
    /// Tail of every frame's chain
    pub period_one: QhPtr,
    /// Permanent head of the asynchronous ring
    pub reclaim_head: QhPtr,
}

impl Schedule {
    fn qh_bus(&self, qh: QhPtr) -> u64 {
        self.pool.device_address(qh.as_ptr(), size_of::<Qh>())
    }

    pub fn qtd_bus(&self, qtd: QtdPtr) -> u64 {
        self.pool.device_address(qtd.as_ptr(), size_of::<Qtd>())
    }

    fn set_frame(&mut self, index: usize, link: u32, first: QhPtr) {
        // SAFETY: index < FRAME_LIST_LEN and the list is one mapped page
        unsafe { ptr::write_volatile(self.frame_list.as_ptr().add(index), link) };
        self.frame_host[index] = first;
    }

    /// Raw frame list entry
    #[cfg(test)]
    pub fn frame(&self, index: usize) -> u32 {
        // SAFETY: as in `set_frame`
        unsafe { ptr::read_volatile(self.frame_list.as_ptr().add(index)) }
    }

    /// Queue heads reachable from frame `index`, in hardware order
    #[cfg(test)]
    pub fn frame_chain(&self, index: usize) -> impl Iterator<Item = QhPtr> {
        core::iter::successors(Some(self.frame_host[index]), |qh| qh.next_qh())
    }

    #[cfg(test)]
    pub fn frame_list_address(&self) -> u64 {
        self.frame_map.device_address
    }
}

/// Create the short-read stop qTD and the two permanent queue heads
fn create_helpers<D: DmaOps + ?Sized>(
    pool: &mut MemPool,
    dma: &mut D,
) -> Result<(QtdPtr, QhPtr, QhPtr), UsbError> {
    let short_read_stop = create_qtd(pool, dma, None, 0, Pid::In, 0, 64)?;
    let mut token = short_read_stop.token();
    token.modify(QTD_TOKEN::STATUS.val(0) + QTD_TOKEN::HALTED::SET);
    short_read_stop.set_token(token);

    let ep = Endpoint::new(0, 0x81, UsbSpeed::High, 64, None, 0, TransferKind::Bulk, 1);
    let mut heads = [None; 2];
    for head in heads.iter_mut() {
        let qh = create_qh(pool, dma, &ep)?;
        let mut chars = qh.ep_chars();
        chars.modify(QH_EP_CHARS::HEAD::SET);
        qh.set_ep_chars(chars);
        let mut status = qh.overlay_token();
        status.modify(QTD_TOKEN::STATUS.val(0) + QTD_TOKEN::HALTED::SET);
        qh.set_overlay_token(status);
        *head = Some(qh);
    }
    let [Some(period_one), Some(reclaim_head)] = heads else {
        return Err(UsbError::OutOfResources);
    };
    Ok((short_read_stop, period_one, reclaim_head))
}

impl<P: PciIo, B: BootServices> EhciController<P, B> {
    /// Allocate the frame list, descriptor pool and permanent descriptors
    pub(super) fn init_sched(&mut self) -> Result<(), UsbError> {
        let frame_bytes = FRAME_LIST_LEN * size_of::<u32>();
        let pages = frame_bytes.div_ceil(PAGE_SIZE);
        let frame_list = self.pci_io.allocate_buffer(pages)?;

        // SAFETY: the buffer stays allocated until `free_sched` unmaps it
        let frame_map = match unsafe {
            self.pci_io
                .map(DmaOperation::CommonBuffer, frame_list, frame_bytes)
        } {
            Ok(map) if map.len == frame_bytes => map,
            Ok(map) => {
                let _ = self.pci_io.unmap(map);
                unsafe { self.pci_io.free_buffer(frame_list, pages) };
                return Err(UsbError::OutOfResources);
            }
            Err(err) => {
                unsafe { self.pci_io.free_buffer(frame_list, pages) };
                return Err(err.into());
            }
        };

        let frame_bus = frame_map.device_address;
        let release_frame = |pci_io: &mut P| {
            let _ = pci_io.unmap(frame_map);
            unsafe { pci_io.free_buffer(frame_list, pages) };
        };

        // Without AC64 every descriptor address is 32 bits wide
        let segment = (frame_bus >> 32) as u32;
        if segment != 0 && !self.hcc_params.is_set(HCCPARAMS::AC64) {
            log::error!("EHCI: frame list at bus {:#x} is above 4 GiB", frame_bus);
            release_frame(&mut self.pci_io);
            return Err(UsbError::OutOfResources);
        }

        self.write_op(OP_PERIODICLISTBASE, frame_bus as u32);
        self.write_op(OP_CTRLDSSEGMENT, segment);

        let mut pool = match MemPool::new(
            &mut self.pci_io,
            segment,
            self.config.mem_default_pages,
        ) {
            Ok(pool) => pool,
            Err(err) => {
                release_frame(&mut self.pci_io);
                return Err(err);
            }
        };

        let (short_read_stop, period_one, reclaim_head) =
            match create_helpers(&mut pool, &mut self.pci_io) {
                Ok(helpers) => helpers,
                Err(err) => {
                    pool.destroy(&mut self.pci_io);
                    release_frame(&mut self.pci_io);
                    return Err(err);
                }
            };

        let mut sched = Schedule {
            pool,
            frame_list: frame_list.cast(),
            frame_map,
            frame_host: vec![period_one; FRAME_LIST_LEN],
            short_read_stop,
            period_one,
            reclaim_head,
        };

        let period_link = qh_link(sched.qh_bus(period_one));
        for index in 0..FRAME_LIST_LEN {
            sched.set_frame(index, period_link, period_one);
        }

        // The reclamation head starts as a ring of one
        let head_bus = sched.qh_bus(reclaim_head);
        reclaim_head.set_horizon_link(qh_link(head_bus));
        fence(Ordering::SeqCst);
        self.write_op(OP_ASYNCLISTADDR, head_bus as u32);

        log::debug!(
            "EHCI: frame list at bus {:#x}, async head at {:#x}",
            frame_bus,
            head_bus
        );
        self.sched = Some(sched);
        Ok(())
    }

    /// Detach the schedule from the controller and release its memory
    pub(super) fn free_sched(&mut self) {
        self.write_op(OP_PERIODICLISTBASE, 0);
        self.write_op(OP_ASYNCLISTADDR, 0);

        let Some(mut sched) = self.sched.take() else {
            return;
        };
        sched
            .pool
            .free_typed(&mut self.pci_io, sched.period_one.as_non_null());
        sched
            .pool
            .free_typed(&mut self.pci_io, sched.reclaim_head.as_non_null());
        sched
            .pool
            .free_typed(&mut self.pci_io, sched.short_read_stop.as_non_null());
        sched.pool.destroy(&mut self.pci_io);

        let pages = sched.frame_map.len.div_ceil(PAGE_SIZE);
        let _ = self.pci_io.unmap(sched.frame_map);
        // SAFETY: unmapped above and no longer referenced by the controller
        unsafe { self.pci_io.free_buffer(sched.frame_list.cast(), pages) };
    }

    // ------------------------------------------------------------------------
    // Asynchronous schedule
    // ------------------------------------------------------------------------

    /// Link `qh` right after the reclamation head
    ///
    /// Only one queue head is linked at a time.
    pub(super) fn link_qh_to_async(&mut self, qh: QhPtr) {
        let Some(sched) = self.sched.as_ref() else {
            return;
        };
        let head = sched.reclaim_head;

        qh.set_next_qh(head.next_qh());
        qh.set_horizon_link(head.horizon_link());
        head.set_next_qh(Some(qh));
        fence(Ordering::SeqCst);
        head.set_horizon_link(qh_link(sched.qh_bus(qh)));
        log::trace!("EHCI: linked QH {:#x} to async ring", sched.qh_bus(qh));
    }

    /// Unlink `qh` from the asynchronous ring and wait until the controller
    /// has let go of it
    pub(super) fn unlink_qh_from_async(&mut self, qh: QhPtr) {
        let Some(sched) = self.sched.as_ref() else {
            return;
        };
        let head = sched.reclaim_head;

        head.set_next_qh(qh.next_qh());
        qh.set_next_qh(None);
        head.set_horizon_link(qh_link(sched.qh_bus(head)));
        fence(Ordering::SeqCst);

        if let Err(err) = self.set_and_wait_door_bell(self.generic_timeout_us()) {
            log::error!("EHCI: async advance doorbell not acknowledged: {}", err);
        }
    }

    /// Ring the async advance doorbell and acknowledge only IAA
    pub(super) fn set_and_wait_door_bell(&self, timeout_us: u64) -> Result<(), UsbError> {
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::IAAD::SET));
        let result = self.wait_op(OP_USBSTS, timeout_us, |sts| {
            UsbSts::new(sts).is_set(USBSTS::IAA)
        });

        // The other status bits are write-1-to-clear too; leave them alone
        let mut sts = UsbSts::new(self.read_op(OP_USBSTS) & !USBSTS_INTACK_MASK);
        sts.modify(USBSTS::IAA::SET);
        self.write_op(OP_USBSTS, sts.get());
        result
    }

    // ------------------------------------------------------------------------
    // Periodic schedule
    // ------------------------------------------------------------------------

    /// Link interrupt queue head `qh` into every frame its interval covers
    pub(super) fn link_qh_to_period(&mut self, qh: QhPtr) {
        let Some(sched) = self.sched.as_mut() else {
            return;
        };
        let interval = qh.interval().max(1);
        let link = qh_link(sched.qh_bus(qh));

        for index in (0..FRAME_LIST_LEN).step_by(interval) {
            let mut prev = None;
            let mut next = sched.frame_host[index];

            while next.interval() > interval {
                let Some(after) = next.next_qh() else { break };
                prev = Some(next);
                next = after;
            }

            // Linked already through a chain shared with an earlier frame
            if next == qh {
                continue;
            }

            if next.interval() == interval {
                // Same interval: slot in right after it, which every later
                // frame using `next` shares
                qh.set_next_qh(next.next_qh());
                qh.set_horizon_link(next.horizon_link());
                fence(Ordering::SeqCst);
                next.set_next_qh(Some(qh));
                next.set_horizon_link(link);
                break;
            }

            if qh.next_qh().is_none() {
                qh.set_next_qh(Some(next));
                qh.set_horizon_link(qh_link(sched.qh_bus(next)));
                fence(Ordering::SeqCst);
            }

            match prev {
                None => sched.set_frame(index, link, qh),
                Some(prev) => {
                    prev.set_next_qh(Some(qh));
                    prev.set_horizon_link(link);
                }
            }
        }
        log::trace!(
            "EHCI: linked QH {:#x} to periodic schedule, interval {}",
            sched.qh_bus(qh),
            interval
        );
    }

    /// Remove `qh` from every frame chain it is part of
    pub(super) fn unlink_qh_from_period(&mut self, qh: QhPtr) {
        let Some(sched) = self.sched.as_mut() else {
            return;
        };
        let interval = qh.interval().max(1);

        for index in (0..FRAME_LIST_LEN).step_by(interval) {
            let mut prev = None;
            let mut this = Some(sched.frame_host[index]);
            while let Some(current) = this {
                if current == qh {
                    break;
                }
                prev = Some(current);
                this = current.next_qh();
            }

            // Gone already through a shared chain
            if this.is_none() {
                continue;
            }

            match prev {
                None => {
                    let next = qh.next_qh().unwrap_or(sched.period_one);
                    sched.set_frame(index, qh.horizon_link(), next);
                }
                Some(prev) => {
                    prev.set_next_qh(qh.next_qh());
                    prev.set_horizon_link(qh.horizon_link());
                }
            }
        }
        fence(Ordering::SeqCst);
        log::trace!("EHCI: unlinked QH {:#x} from periodic schedule", sched.qh_bus(qh));
    }
}
