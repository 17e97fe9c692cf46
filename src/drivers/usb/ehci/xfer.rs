//! Transfer execution and asynchronous interrupt polling
//!
//! A synchronous transfer is linked, polled through [`check_urb_result`]
//! until it finishes or its budget runs out, and unlinked again by the
//! caller. Asynchronous interrupt transfers stay linked in the periodic
//! schedule; [`EhciController::monitor_async_requests`] harvests their data,
//! re-arms them and runs their callbacks.
//!
//! [`check_urb_result`]: EhciController::check_urb_result

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{Ordering, fence};

use super::debug::dump_qh;
use super::desc::{Pid, Token, qtd_link};
use super::regs::*;
use super::urb::Urb;
use super::{EHC_TPL, EhciController};
use crate::drivers::pci::PciIo;
use crate::drivers::usb::controller::{TransferDirection, UsbError, UsbResult};
use crate::efi::BootServices;

/// Called with the received bytes and the transfer result
///
/// The controller is handed back so the callback can cancel or resubmit
/// transfers. On error the data slice is empty.
pub type AsyncCallback<P, B> = Box<dyn FnMut(&mut EhciController<P, B>, &[u8], UsbResult)>;

/// A linked asynchronous interrupt transfer
pub(super) struct AsyncIntTransfer<P: PciIo, B: BootServices> {
    pub id: u64,
    pub urb: Urb,
    /// Receive buffer the URB's data mapping points into
    pub buffer: Box<[u8]>,
    /// Taken out while it runs
    pub callback: Option<AsyncCallback<P, B>>,
}

impl<P: PciIo, B: BootServices> EhciController<P, B> {
    /// Decode the qTD chain of `urb` into its result fields
    ///
    /// Returns `true` once the transfer is finished, successfully or not.
    pub(super) fn check_urb_result(&self, urb: &mut Urb) -> bool {
        urb.completed = 0;
        urb.result = UsbResult::NO_ERROR;
        let mut finished = true;

        match self.sched.as_ref() {
            Some(sched) if !self.is_halted() && !self.is_sys_error() => {
                let short_read_stop = qtd_link(Some(sched.qtd_bus(sched.short_read_stop)));

                for qtd in urb.qtds() {
                    let token = qtd.token();

                    if token.is_set(QTD_TOKEN::HALTED) {
                        let babble = token.is_set(QTD_TOKEN::BABBLE);
                        let buffer = token.is_set(QTD_TOKEN::BUFFER_ERR);
                        let xact = token.is_set(QTD_TOKEN::XACT_ERR);

                        log::debug!("EHCI: qTD halted, token {:#010x}", token.get());
                        if babble {
                            urb.result |= UsbResult::BABBLE;
                        }
                        if buffer {
                            urb.result |= UsbResult::BUFFER;
                        }
                        if xact && token.read(QTD_TOKEN::CERR) == 0 {
                            urb.result |= UsbResult::TIMEOUT;
                        }
                        if !(babble || buffer || xact) {
                            urb.result |= UsbResult::STALL;
                        }
                        break;
                    }

                    if token.is_set(QTD_TOKEN::ACTIVE) {
                        urb.result |= UsbResult::NOT_EXECUTED;
                        finished = false;
                        break;
                    }

                    let pid = Pid::from_token(token);
                    let remaining = token.read(QTD_TOKEN::TOTAL_BYTES) as usize;
                    if pid != Pid::Setup {
                        urb.completed += qtd.data_len().saturating_sub(remaining);
                    }

                    // A short IN packet ends a bulk or interrupt transfer;
                    // control transfers carry on with their status stage
                    if remaining != 0 && pid == Pid::In {
                        log::trace!("EHCI: short packet, {} bytes left", remaining);
                        if qtd.alt_next() == short_read_stop {
                            break;
                        }
                    }
                }
            }
            _ => urb.result |= UsbResult::SYSTEM,
        }

        urb.data_toggle = urb.qh().overlay_token().read(QTD_TOKEN::DT) as u8;
        finished
    }

    /// Poll `urb` until it finishes or `timeout_ms` expires (0 waits forever)
    pub(super) fn exec_transfer(&self, urb: &mut Urb, timeout_ms: u64) -> Result<(), UsbError> {
        let interval = self.config.sync_poll_interval_us.max(1);
        let loops = (timeout_ms > 0).then(|| timeout_ms.saturating_mul(1000) / interval + 1);

        let mut finished = false;
        let mut round = 0u64;
        while loops.is_none_or(|limit| round < limit) {
            finished = self.check_urb_result(urb);
            if finished {
                break;
            }
            self.boot.stall(interval);
            round += 1;
        }

        if !finished {
            log::error!("EHCI: transfer not finished in {} ms", timeout_ms);
            dump_qh(urb.qh(), "timed out", true);
            return Err(UsbError::Timeout);
        }
        if !urb.result.is_ok() {
            log::error!("EHCI: transfer failed, result {:?}", urb.result);
            dump_qh(urb.qh(), "failed", true);
            return Err(UsbError::DeviceError);
        }
        Ok(())
    }

    /// Release an unlinked URB to the descriptor pool
    pub(super) fn free_urb(&mut self, urb: Urb) {
        match self.sched.as_mut() {
            Some(sched) => urb.free(&mut sched.pool, &mut self.pci_io),
            None => log::warn!("EHCI: freeing a request without a schedule"),
        }
    }

    // ------------------------------------------------------------------------
    // Asynchronous interrupt transfers
    // ------------------------------------------------------------------------

    /// Cancel the transfer polling `ep_num` of `dev_addr`
    ///
    /// Returns the data toggle the endpoint expects next.
    pub(super) fn del_async_int_transfer(
        &mut self,
        dev_addr: u8,
        ep_num: u8,
        direction: TransferDirection,
    ) -> Result<u8, UsbError> {
        let index = self
            .async_int
            .iter()
            .position(|t| {
                let ep = &t.urb.ep;
                ep.dev_addr == dev_addr && ep.ep_num == ep_num && ep.direction == direction
            })
            .ok_or(UsbError::NotFound)?;

        let mut transfer = self.async_int.remove(index);
        self.check_urb_result(&mut transfer.urb);
        let toggle = transfer.urb.data_toggle;

        self.unlink_qh_from_period(transfer.urb.qh());
        self.free_urb(transfer.urb);
        log::debug!(
            "EHCI: cancelled async interrupt transfer on device {} endpoint {}",
            dev_addr,
            ep_num
        );
        Ok(toggle)
    }

    /// Cancel every asynchronous interrupt transfer
    pub(super) fn del_all_async_int_transfers(&mut self) {
        while let Some(transfer) = self.async_int.pop() {
            self.unlink_qh_from_period(transfer.urb.qh());
            self.free_urb(transfer.urb);
        }
    }

    /// Re-arm a finished interrupt transfer for its next poll
    ///
    /// Transfers that ended in error are left halted.
    fn update_async_request(&self, urb: &mut Urb) {
        if !urb.result.is_ok() {
            return;
        }
        let Some(sched) = self.sched.as_ref() else {
            return;
        };
        let data = urb.data().map(|d| d.as_ptr() as usize);
        let data_bus = urb.data_device_address();

        for qtd in urb.qtds() {
            let mut token = qtd.token();
            token.modify(
                QTD_TOKEN::STATUS.val(0)
                    + QTD_TOKEN::ACTIVE::SET
                    + QTD_TOKEN::CERR.val(QTD_MAX_ERR)
                    + QTD_TOKEN::C_PAGE.val(0)
                    + QTD_TOKEN::TOTAL_BYTES.val(qtd.data_len() as u32),
            );

            // The buffer may have moved when it was mapped again
            if let (Some(host), Some(bus), true) = (data, data_bus, qtd.data_len() > 0) {
                let start = bus + (qtd.data() - host) as u64;
                qtd.set_page(0, start);
                for page in 1..QTD_MAX_BUFFER {
                    qtd.set_page(page, (start & !QTD_BUF_MASK) + (page * QTD_BUF_LEN) as u64);
                }
            }
            qtd.set_token(token);
        }

        let qh = urb.qh();
        let first = urb.qtds().next().map(|qtd| sched.qtd_bus(qtd));
        let mut overlay = Token::new(0);
        overlay.write(QTD_TOKEN::DT.val(qh.overlay_token().read(QTD_TOKEN::DT)));
        qh.set_cur_qtd(qtd_link(first));
        qh.set_overlay_next(qtd_link(first));
        qh.set_overlay_alt_next(LINK_TERMINATE);
        qh.clear_overlay_pages();
        fence(Ordering::SeqCst);
        qh.set_overlay_token(overlay);
    }

    /// Harvest finished asynchronous interrupt transfers
    ///
    /// Each finished transfer is re-armed if it succeeded and its callback
    /// runs at the caller's priority with a copy of the received bytes.
    /// Platforms call this every `async_poll_interval_ms`.
    pub fn monitor_async_requests(&mut self) {
        let old_tpl = self.boot.raise_tpl(EHC_TPL);
        let ids: Vec<u64> = self.async_int.iter().map(|t| t.id).collect();

        for id in ids {
            // Earlier callbacks may have cancelled this one
            let Some(index) = self.async_int.iter().position(|t| t.id == id) else {
                continue;
            };
            let mut transfer = self.async_int.remove(index);

            if !self.check_urb_result(&mut transfer.urb) {
                self.async_int.insert(index, transfer);
                continue;
            }

            if let Err(err) = transfer.urb.remap_data(&mut self.pci_io) {
                log::error!("EHCI: failed to remap async interrupt buffer: {}", err);
            }

            let completed = transfer.urb.completed;
            let data = if transfer.urb.result.is_ok() && completed <= transfer.buffer.len() {
                transfer.buffer[..completed].to_vec()
            } else {
                Vec::new()
            };
            let result = transfer.urb.result;

            self.update_async_request(&mut transfer.urb);
            let callback = transfer.callback.take();
            self.async_int.insert(index, transfer);

            let Some(mut callback) = callback else {
                continue;
            };
            self.boot.restore_tpl(old_tpl);
            callback(self, &data, result);
            self.boot.raise_tpl(EHC_TPL);

            if let Some(transfer) = self.async_int.iter_mut().find(|t| t.id == id) {
                transfer.callback = Some(callback);
            }
        }

        self.boot.restore_tpl(old_tpl);
    }
}
