//! EHCI (USB 2.0) Host Controller Driver
//!
//! This module drives an EHCI controller purely by polling. Control and bulk
//! transfers run one at a time through the asynchronous schedule; interrupt
//! transfers go through the periodic schedule, either synchronously or as
//! long-lived asynchronous transfers re-armed by
//! [`EhciController::monitor_async_requests`].
//!
//! # Layout
//!
//! - `regs`: capability, operational and descriptor bitfields
//! - `mem`: DMA descriptor pool
//! - `desc`: QH / qTD layouts and handles
//! - `urb`: descriptor factory
//! - `sched`: asynchronous ring and periodic frame list
//! - `xfer`: completion checks, the poll loop and async interrupt upkeep
//! - `hc`: register access, controller lifecycle, BIOS hand-off
//!
//! # Example
//!
//! ```ignore
//! let mut ehci = EhciController::new(pci_io, FirmwareServices::new(), EhciConfig::default())?;
//! let request = DeviceRequest::new(req_type::DIR_IN, request::GET_DESCRIPTOR, 0x0100, 0, 18);
//! let mut desc = [0u8; 18];
//! let done = ehci.control_transfer(0, UsbSpeed::High, 64, &request,
//!     TransferDirection::In, Some(&mut desc), 100, None)?;
//! ```

mod config;
mod debug;
mod desc;
mod hc;
mod mem;
mod regs;
mod sched;
#[cfg(test)]
pub(crate) mod testing;
mod urb;
mod xfer;

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use r_efi::efi::{self, Tpl};
use tock_registers::fields::Field;

pub use config::EhciConfig;
pub use xfer::AsyncCallback;

use self::hc::{DebugPort, EHC_BAR_INDEX, HccParams, HcsParams, PortSc};
use self::regs::*;
use self::sched::Schedule;
use self::urb::{Endpoint, TransferKind, Urb};
use self::xfer::AsyncIntTransfer;
use crate::drivers::pci::PciIo;
use crate::drivers::usb::controller::{
    DeviceRequest, HcCapability, HcState, PortFeature, PortStatus, ResetAttributes, Transfer,
    TransferDirection, TransferError, Translator, UsbError, UsbResult, UsbSpeed, port_change,
    port_status,
};
use crate::efi::BootServices;

/// Priority held while the driver touches registers or the schedule
pub(crate) const EHC_TPL: Tpl = efi::TPL_NOTIFY;

/// EHCI host controller
pub struct EhciController<P: PciIo, B: BootServices> {
    pci_io: P,
    boot: B,
    config: EhciConfig,
    /// Offset of the operational registers in BAR0
    cap_len: u8,
    hcs_params: HcsParams,
    hcc_params: HccParams,
    debug_port: Option<DebugPort>,
    /// Present while the controller owns schedule memory
    sched: Option<Schedule>,
    /// Asynchronous interrupt transfers, newest first
    async_int: Vec<AsyncIntTransfer<P, B>>,
    next_async_id: u64,
}

impl<P: PciIo, B: BootServices> EhciController<P, B> {
    /// Bring up the controller behind `pci_io`
    ///
    /// Unless a debugger owns the debug port, the controller is claimed from
    /// BIOS and reset first. On return both schedules are running.
    pub fn new(pci_io: P, boot: B, config: EhciConfig) -> Result<Self, UsbError> {
        let cap_len = pci_io.mem_read8(EHC_BAR_INDEX, CAP_CAPLENGTH);
        let hcs_params = HcsParams::new(pci_io.mem_read32(EHC_BAR_INDEX, CAP_HCSPARAMS));
        let hcc_params = HccParams::new(pci_io.mem_read32(EHC_BAR_INDEX, CAP_HCCPARAMS));

        let mut controller = Self {
            pci_io,
            boot,
            config,
            cap_len,
            hcs_params,
            hcc_params,
            debug_port: None,
            sched: None,
            async_int: Vec::new(),
            next_async_id: 0,
        };

        log::info!(
            "EHCI: caplength {:#x}, {} ports, 64-bit: {}",
            cap_len,
            controller.port_count(),
            hcc_params.is_set(HCCPARAMS::AC64)
        );

        controller.debug_port = controller.detect_debug_port();
        if !controller.is_debug_port_in_use(None) {
            controller.clear_legacy_support();
            if let Err(err) = controller.reset_hc(controller.reset_timeout_us()) {
                log::error!("EHCI: failed to reset the controller: {}", err);
                return Err(err);
            }
        }

        if let Err(err) = controller.init_hc() {
            log::error!("EHCI: failed to initialize the controller: {}", err);
            return Err(err);
        }
        Ok(controller)
    }

    pub fn config(&self) -> &EhciConfig {
        &self.config
    }

    /// Maximum speed, root port count and 64-bit DMA support
    pub fn capability(&self) -> HcCapability {
        HcCapability {
            max_speed: UsbSpeed::High,
            port_count: self.port_count(),
            is_64bit_capable: self.hcc_params.is_set(HCCPARAMS::AC64),
        }
    }

    // ========================================================================
    // Controller State
    // ========================================================================

    /// Reset the controller and rebuild its schedule
    ///
    /// Every asynchronous interrupt transfer is cancelled. Nothing happens
    /// while a debugger owns the debug port.
    pub fn reset(&mut self, attributes: ResetAttributes) -> Result<(), UsbError> {
        let old_tpl = self.boot.raise_tpl(EHC_TPL);

        let result = match attributes {
            ResetAttributes::Global | ResetAttributes::HostController => self.reset_controller(),
            ResetAttributes::GlobalWithDebug | ResetAttributes::HostControllerWithDebug => {
                Err(UsbError::Unsupported)
            }
        };

        self.boot.restore_tpl(old_tpl);
        log::debug!("EHCI: reset {:?}: {:?}", attributes, result);
        result
    }

    fn reset_controller(&mut self) -> Result<(), UsbError> {
        if self.is_debug_port_in_use(None) {
            return Ok(());
        }

        if !self.is_halted() && self.halt_hc(self.generic_timeout_us()).is_err() {
            return Err(UsbError::DeviceError);
        }

        // Clean up the asynchronous transfers currently in the periodic list
        self.del_all_async_int_transfers();
        self.ack_all_interrupts();
        self.free_sched();

        self.reset_hc(self.reset_timeout_us())?;
        self.init_hc()
    }

    pub fn state(&self) -> HcState {
        let old_tpl = self.boot.raise_tpl(EHC_TPL);
        let state = if self.is_halted() {
            HcState::Halt
        } else {
            HcState::Operational
        };
        self.boot.restore_tpl(old_tpl);
        state
    }

    /// Halt or run the controller; suspend is not supported
    pub fn set_state(&mut self, state: HcState) -> Result<(), UsbError> {
        if self.state() == state {
            return Ok(());
        }

        let old_tpl = self.boot.raise_tpl(EHC_TPL);
        let result = match state {
            HcState::Halt => self.halt_hc(self.generic_timeout_us()),
            HcState::Operational => {
                if self.is_sys_error() || !self.is_halted() {
                    // Run/Stop may only be set on a halted controller
                    Err(UsbError::DeviceError)
                } else {
                    self.run_hc(self.generic_timeout_us())
                }
            }
            HcState::Suspend => Err(UsbError::Unsupported),
        };
        self.boot.restore_tpl(old_tpl);

        log::debug!("EHCI: set state {:?}: {:?}", state, result);
        result
    }

    // ========================================================================
    // Root Hub
    // ========================================================================

    fn check_port(&self, port: u8) -> Result<(), UsbError> {
        if port >= self.port_count() {
            return Err(UsbError::InvalidParameter);
        }
        Ok(())
    }

    /// Status and change bits of 0-based root `port`
    pub fn root_hub_port_status(&self, port: u8) -> Result<PortStatus, UsbError> {
        self.check_port(port)?;
        let old_tpl = self.boot.raise_tpl(EHC_TPL);

        let mut status = PortStatus::default();
        if self.is_debug_port_in_use(Some(port)) {
            self.boot.restore_tpl(old_tpl);
            return Ok(status);
        }

        let portsc = PortSc::new(self.read_op(op_portsc(port)));

        if portsc.read(PORTSC::LS) & 0b01 != 0 {
            status.status |= port_status::LOW_SPEED;
        } else if portsc.is_set(PORTSC::PE) {
            status.status |= port_status::HIGH_SPEED;
        }

        const STATUS_MAP: [(Field<u32, PORTSC::Register>, u16); 7] = [
            (PORTSC::CCS, port_status::CONNECTION),
            (PORTSC::PE, port_status::ENABLE),
            (PORTSC::SUSPEND, port_status::SUSPEND),
            (PORTSC::OCA, port_status::OVERCURRENT),
            (PORTSC::PR, port_status::RESET),
            (PORTSC::PP, port_status::POWER),
            (PORTSC::PO, port_status::OWNER),
        ];
        const CHANGE_MAP: [(Field<u32, PORTSC::Register>, u16); 3] = [
            (PORTSC::CSC, port_change::CONNECTION),
            (PORTSC::PEC, port_change::ENABLE),
            (PORTSC::OCC, port_change::OVERCURRENT),
        ];
        for (field, bit) in STATUS_MAP {
            if portsc.is_set(field) {
                status.status |= bit;
            }
        }
        for (field, bit) in CHANGE_MAP {
            if portsc.is_set(field) {
                status.change |= bit;
            }
        }

        self.boot.restore_tpl(old_tpl);
        Ok(status)
    }

    /// Current PORTSC of `port` with the write-1-to-clear change bits masked
    fn portsc_for_write(&self, port: u8) -> PortSc {
        PortSc::new(self.read_op(op_portsc(port)) & !PORTSC_CHANGE_MASK)
    }

    pub fn set_root_hub_port_feature(
        &mut self,
        port: u8,
        feature: PortFeature,
    ) -> Result<(), UsbError> {
        self.check_port(port)?;
        let old_tpl = self.boot.raise_tpl(EHC_TPL);

        let offset = op_portsc(port);
        let mut portsc = self.portsc_for_write(port);
        let result = match feature {
            PortFeature::Enable => {
                portsc.modify(PORTSC::PE::SET);
                self.write_op(offset, portsc.get());
                Ok(())
            }
            PortFeature::Suspend => {
                portsc.modify(PORTSC::SUSPEND::SET);
                self.write_op(offset, portsc.get());
                Ok(())
            }
            PortFeature::Reset => {
                // Port reset needs a running controller
                let running = if self.is_halted() {
                    self.run_hc(self.generic_timeout_us())
                } else {
                    Ok(())
                };
                match running {
                    Ok(()) => {
                        portsc.modify(PORTSC::PR::SET + PORTSC::PE::CLEAR);
                        self.write_op(offset, portsc.get());
                        Ok(())
                    }
                    Err(err) => {
                        log::error!("EHCI: failed to run the controller for port reset");
                        Err(err)
                    }
                }
            }
            PortFeature::Power => {
                if self.hcs_params.is_set(HCSPARAMS::PPC) {
                    portsc.modify(PORTSC::PP::SET);
                    self.write_op(offset, portsc.get());
                }
                Ok(())
            }
            PortFeature::Owner => {
                portsc.modify(PORTSC::PO::SET);
                self.write_op(offset, portsc.get());
                Ok(())
            }
            _ => Err(UsbError::InvalidParameter),
        };

        self.boot.restore_tpl(old_tpl);
        log::debug!("EHCI: set port {} feature {:?}: {:?}", port, feature, result);
        result
    }

    pub fn clear_root_hub_port_feature(
        &mut self,
        port: u8,
        feature: PortFeature,
    ) -> Result<(), UsbError> {
        self.check_port(port)?;
        let old_tpl = self.boot.raise_tpl(EHC_TPL);

        let offset = op_portsc(port);
        let mut portsc = self.portsc_for_write(port);
        let write = |value: PortSc| self.write_op(offset, value.get());

        let result = match feature {
            PortFeature::Enable => {
                portsc.modify(PORTSC::PE::CLEAR);
                write(portsc);
                Ok(())
            }
            PortFeature::Suspend => {
                portsc.modify(PORTSC::FPR::CLEAR);
                write(portsc);
                Ok(())
            }
            PortFeature::Reset => {
                portsc.modify(PORTSC::PR::CLEAR);
                write(portsc);
                // Reset is over once the hardware drops PR
                self.wait_op(offset, self.generic_timeout_us(), |value| {
                    !PortSc::new(value).is_set(PORTSC::PR)
                })
            }
            PortFeature::Owner => {
                portsc.modify(PORTSC::PO::CLEAR);
                write(portsc);
                Ok(())
            }
            PortFeature::ConnectChange => {
                portsc.modify(PORTSC::CSC::SET);
                write(portsc);
                Ok(())
            }
            PortFeature::EnableChange => {
                portsc.modify(PORTSC::PEC::SET);
                write(portsc);
                Ok(())
            }
            PortFeature::OverCurrentChange => {
                portsc.modify(PORTSC::OCC::SET);
                write(portsc);
                Ok(())
            }
            PortFeature::Power => {
                if self.hcs_params.is_set(HCSPARAMS::PPC) {
                    portsc.modify(PORTSC::PP::CLEAR);
                    write(portsc);
                }
                Ok(())
            }
            PortFeature::SuspendChange | PortFeature::ResetChange => Ok(()),
        };

        self.boot.restore_tpl(old_tpl);
        log::debug!("EHCI: clear port {} feature {:?}: {:?}", port, feature, result);
        result
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Build, run and retire one synchronous transfer
    ///
    /// # Safety
    ///
    /// `request` and the `data_len` bytes at `data` must stay valid for the
    /// whole call.
    unsafe fn run_sync(
        &mut self,
        ep: Endpoint,
        request: Option<NonNull<DeviceRequest>>,
        data: Option<NonNull<u8>>,
        data_len: usize,
        timeout_ms: u64,
    ) -> Result<Transfer, TransferError> {
        let old_tpl = self.boot.raise_tpl(EHC_TPL);
        let result = unsafe { self.submit_sync(ep, request, data, data_len, timeout_ms) };
        self.boot.restore_tpl(old_tpl);
        result
    }

    unsafe fn submit_sync(
        &mut self,
        ep: Endpoint,
        request: Option<NonNull<DeviceRequest>>,
        data: Option<NonNull<u8>>,
        data_len: usize,
        timeout_ms: u64,
    ) -> Result<Transfer, TransferError> {
        let mut transfer = Transfer {
            completed: 0,
            result: UsbResult::SYSTEM,
            data_toggle: ep.toggle,
        };

        if self.is_halted() || self.is_sys_error() {
            log::error!("EHCI: controller is halted or in error");
            self.ack_all_interrupts();
            return Err(TransferError::new(UsbError::DeviceError, transfer));
        }
        self.ack_all_interrupts();

        let Some(sched) = self.sched.as_mut() else {
            return Err(TransferError::new(UsbError::DeviceError, transfer));
        };
        let short_read_stop = sched.short_read_stop;
        let created = unsafe {
            Urb::create(
                &mut sched.pool,
                &mut self.pci_io,
                short_read_stop,
                ep,
                request,
                data,
                data_len,
            )
        };
        let mut urb = match created {
            Ok(urb) => urb,
            Err(err) => {
                log::error!("EHCI: failed to create request: {}", err);
                return Err(TransferError::new(UsbError::OutOfResources, transfer));
            }
        };

        let periodic = ep.kind == TransferKind::SyncInterrupt;
        if periodic {
            self.link_qh_to_period(urb.qh());
        } else {
            self.link_qh_to_async(urb.qh());
        }
        let status = self.exec_transfer(&mut urb, timeout_ms);
        if periodic {
            self.unlink_qh_from_period(urb.qh());
        } else {
            self.unlink_qh_from_async(urb.qh());
        }

        transfer = Transfer {
            completed: urb.completed,
            result: urb.result,
            data_toggle: urb.data_toggle,
        };
        self.ack_all_interrupts();
        self.free_urb(urb);
        self.pci_io.flush();

        match status {
            Ok(()) => Ok(transfer),
            Err(err) => Err(TransferError::new(err, transfer)),
        }
    }

    /// Run a control transfer on endpoint 0 of `dev_addr`
    ///
    /// `data` must be present and non-empty unless `direction` is
    /// [`TransferDirection::NoData`]. A `timeout_ms` of 0 waits forever.
    pub fn control_transfer(
        &mut self,
        dev_addr: u8,
        speed: UsbSpeed,
        max_packet: usize,
        request: &DeviceRequest,
        direction: TransferDirection,
        data: Option<&mut [u8]>,
        timeout_ms: u64,
        translator: Option<Translator>,
    ) -> Result<Transfer, TransferError> {
        let data = data.filter(|d| !d.is_empty());
        match (direction, &data) {
            (TransferDirection::NoData, Some(_)) => return Err(UsbError::InvalidParameter.into()),
            (TransferDirection::In | TransferDirection::Out, None) => {
                return Err(UsbError::InvalidParameter.into());
            }
            _ => {}
        }
        if speed == UsbSpeed::Super
            || !matches!(max_packet, 8 | 16 | 32 | 64)
            || (speed == UsbSpeed::Low && max_packet != 8)
        {
            return Err(UsbError::InvalidParameter.into());
        }

        let ep_addr = if direction == TransferDirection::In { 0x80 } else { 0 };
        let ep = Endpoint::new(
            dev_addr,
            ep_addr,
            speed,
            max_packet,
            translator,
            0,
            TransferKind::Control,
            0,
        );
        let (ptr, len) = match data {
            Some(buf) => (NonNull::new(buf.as_mut_ptr()), buf.len()),
            None => (None, 0),
        };

        // SAFETY: the request and data borrows outlive the call
        let result =
            unsafe { self.run_sync(ep, Some(NonNull::from(request)), ptr, len, timeout_ms) };
        if let Err(err) = &result {
            log::error!(
                "EHCI: control transfer to device {} failed: {}, result {:?}",
                dev_addr,
                err.error,
                err.transfer.result
            );
        }
        result
    }

    /// Run a bulk transfer on `ep_addr` (direction in bit 7)
    ///
    /// `data_toggle` is updated with the toggle the endpoint expects next,
    /// also when the transfer fails after reaching the hardware.
    pub fn bulk_transfer(
        &mut self,
        dev_addr: u8,
        ep_addr: u8,
        speed: UsbSpeed,
        max_packet: usize,
        data: &mut [u8],
        data_toggle: &mut u8,
        timeout_ms: u64,
        translator: Option<Translator>,
    ) -> Result<Transfer, TransferError> {
        if data.is_empty()
            || *data_toggle > 1
            || matches!(speed, UsbSpeed::Low | UsbSpeed::Super)
            || (speed == UsbSpeed::Full && max_packet > 64)
            || (speed == UsbSpeed::High && max_packet > 512)
        {
            return Err(UsbError::InvalidParameter.into());
        }

        let ep = Endpoint::new(
            dev_addr,
            ep_addr,
            speed,
            max_packet,
            translator,
            *data_toggle,
            TransferKind::Bulk,
            0,
        );
        // SAFETY: `data` is borrowed for the whole call
        let result = unsafe {
            self.run_sync(ep, None, NonNull::new(data.as_mut_ptr()), data.len(), timeout_ms)
        };

        *data_toggle = match &result {
            Ok(transfer) => transfer.data_toggle,
            Err(err) => err.transfer.data_toggle,
        };
        if let Err(err) = &result {
            log::error!(
                "EHCI: bulk transfer on {}:{:#04x} failed: {}, result {:?}",
                dev_addr,
                ep_addr,
                err.error,
                err.transfer.result
            );
        }
        result
    }

    /// Poll interrupt endpoint `ep_addr` once and wait for the result
    pub fn sync_interrupt_transfer(
        &mut self,
        dev_addr: u8,
        ep_addr: u8,
        speed: UsbSpeed,
        max_packet: usize,
        data: &mut [u8],
        data_toggle: &mut u8,
        timeout_ms: u64,
        translator: Option<Translator>,
    ) -> Result<Transfer, TransferError> {
        if data.is_empty()
            || *data_toggle > 1
            || speed == UsbSpeed::Super
            || (speed == UsbSpeed::Low && max_packet != 8)
            || (speed == UsbSpeed::Full && max_packet > 64)
            || (speed == UsbSpeed::High && max_packet > 3072)
        {
            return Err(UsbError::InvalidParameter.into());
        }

        let ep = Endpoint::new(
            dev_addr,
            ep_addr,
            speed,
            max_packet,
            translator,
            *data_toggle,
            TransferKind::SyncInterrupt,
            1,
        );
        // SAFETY: `data` is borrowed for the whole call
        let result = unsafe {
            self.run_sync(ep, None, NonNull::new(data.as_mut_ptr()), data.len(), timeout_ms)
        };

        *data_toggle = match &result {
            Ok(transfer) => transfer.data_toggle,
            Err(err) => err.transfer.data_toggle,
        };
        if let Err(err) = &result {
            log::error!(
                "EHCI: interrupt transfer on {}:{:#04x} failed: {}, result {:?}",
                dev_addr,
                ep_addr,
                err.error,
                err.transfer.result
            );
        }
        result
    }

    /// Start or cancel polling of IN interrupt endpoint `ep_addr`
    ///
    /// With `is_new` a transfer of `data_len` bytes is linked at `interval`
    /// frames (1..=255, rounded down to a power of two) and `callback` runs
    /// from [`monitor_async_requests`] each time it completes. Without it,
    /// the existing transfer for the endpoint is cancelled and
    /// `data_toggle` receives the toggle the endpoint expects next.
    ///
    /// [`monitor_async_requests`]: EhciController::monitor_async_requests
    pub fn async_interrupt_transfer(
        &mut self,
        dev_addr: u8,
        ep_addr: u8,
        speed: UsbSpeed,
        max_packet: usize,
        is_new: bool,
        data_toggle: &mut u8,
        interval: usize,
        data_len: usize,
        translator: Option<Translator>,
        callback: Option<AsyncCallback<P, B>>,
    ) -> Result<(), UsbError> {
        if ep_addr & 0x80 == 0 || speed == UsbSpeed::Super {
            return Err(UsbError::InvalidParameter);
        }
        if is_new && (data_len == 0 || *data_toggle > 1 || !(1..=255).contains(&interval)) {
            return Err(UsbError::InvalidParameter);
        }

        let old_tpl = self.boot.raise_tpl(EHC_TPL);

        if !is_new {
            let result = self.del_async_int_transfer(
                dev_addr,
                ep_addr & 0x0F,
                TransferDirection::In,
            );
            if let Ok(toggle) = result {
                *data_toggle = toggle;
            }
            self.boot.restore_tpl(old_tpl);
            return result.map(|_| ());
        }

        let result = self.start_async_int_transfer(
            Endpoint::new(
                dev_addr,
                ep_addr,
                speed,
                max_packet,
                translator,
                *data_toggle,
                TransferKind::AsyncInterrupt,
                interval,
            ),
            data_len,
            callback,
        );
        self.boot.restore_tpl(old_tpl);
        result
    }

    fn start_async_int_transfer(
        &mut self,
        ep: Endpoint,
        data_len: usize,
        callback: Option<AsyncCallback<P, B>>,
    ) -> Result<(), UsbError> {
        if self.is_halted() || self.is_sys_error() {
            log::error!("EHCI: controller is halted or in error");
            self.ack_all_interrupts();
            return Err(UsbError::DeviceError);
        }
        self.ack_all_interrupts();

        let Some(sched) = self.sched.as_mut() else {
            return Err(UsbError::DeviceError);
        };
        let mut buffer = vec![0u8; data_len].into_boxed_slice();
        let short_read_stop = sched.short_read_stop;

        // SAFETY: the buffer moves into the transfer entry together with the
        // URB, and its heap allocation does not move with it
        let created = unsafe {
            Urb::create(
                &mut sched.pool,
                &mut self.pci_io,
                short_read_stop,
                ep,
                None,
                NonNull::new(buffer.as_mut_ptr()),
                data_len,
            )
        };
        let urb = match created {
            Ok(urb) => urb,
            Err(err) => {
                log::error!("EHCI: failed to create async interrupt request: {}", err);
                return Err(UsbError::OutOfResources);
            }
        };

        self.link_qh_to_period(urb.qh());
        let id = self.next_async_id;
        self.next_async_id += 1;
        self.async_int.insert(
            0,
            AsyncIntTransfer {
                id,
                urb,
                buffer,
                callback,
            },
        );
        log::debug!(
            "EHCI: polling device {} endpoint {} every {} frames",
            ep.dev_addr,
            ep.ep_num,
            ep.poll_rate
        );
        Ok(())
    }

    /// Isochronous transfers are not supported
    pub fn isochronous_transfer(
        &mut self,
        _dev_addr: u8,
        _ep_addr: u8,
        _speed: UsbSpeed,
        _max_packet: usize,
        _data: &mut [u8],
        _translator: Option<Translator>,
    ) -> Result<Transfer, TransferError> {
        Err(UsbError::Unsupported.into())
    }

    /// Asynchronous isochronous transfers are not supported
    pub fn async_isochronous_transfer(
        &mut self,
        _dev_addr: u8,
        _ep_addr: u8,
        _speed: UsbSpeed,
        _max_packet: usize,
        _data_len: usize,
        _translator: Option<Translator>,
    ) -> Result<(), UsbError> {
        Err(UsbError::Unsupported)
    }

    /// Stop the controller before the OS takes over
    pub fn shutdown(&mut self) {
        log::debug!("EHCI: shutting down");
        if let Err(err) = self.halt_hc(self.generic_timeout_us()) {
            log::warn!("EHCI: controller did not halt: {}", err);
        }
        if let Err(err) = self.reset_hc(self.reset_timeout_us()) {
            log::warn!("EHCI: controller reset did not complete: {}", err);
        }
        self.write_op(OP_CONFIGFLAG, 0);
    }
}

impl<P: PciIo, B: BootServices> Drop for EhciController<P, B> {
    fn drop(&mut self) {
        if !self.is_debug_port_in_use(None) && !self.is_halted() {
            let _ = self.halt_hc(self.generic_timeout_us());
        }
        self.del_all_async_int_transfers();
        self.free_sched();
    }
}
