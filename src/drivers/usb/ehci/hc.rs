//! Controller register access and lifecycle
//!
//! Halting, running, resetting and initializing the controller, the BIOS
//! ownership hand-off, and debug port detection. Every wait here is bounded
//! and stalls through boot services between polls.

use tock_registers::LocalRegisterCopy;

use super::EhciController;
use super::regs::*;
use crate::drivers::pci::PciIo;
use crate::drivers::usb::controller::UsbError;
use crate::efi::BootServices;
use crate::time;

/// Operational registers live in BAR0
pub(super) const EHC_BAR_INDEX: u8 = 0;

pub(super) type UsbCmd = LocalRegisterCopy<u32, USBCMD::Register>;
pub(super) type UsbSts = LocalRegisterCopy<u32, USBSTS::Register>;
pub(super) type PortSc = LocalRegisterCopy<u32, PORTSC::Register>;
pub(super) type HcsParams = LocalRegisterCopy<u32, HCSPARAMS::Register>;
pub(super) type HccParams = LocalRegisterCopy<u32, HCCPARAMS::Register>;

/// Where the USB debug port registers are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DebugPort {
    /// 1-based root port number
    pub port: u8,
    pub bar: u8,
    pub offset: u64,
}

impl<P: PciIo, B: BootServices> EhciController<P, B> {
    // ------------------------------------------------------------------------
    // Register access
    // ------------------------------------------------------------------------

    pub(super) fn read_op(&self, offset: u64) -> u32 {
        self.pci_io
            .mem_read32(EHC_BAR_INDEX, self.cap_len as u64 + offset)
    }

    pub(super) fn write_op(&self, offset: u64, value: u32) {
        self.pci_io
            .mem_write32(EHC_BAR_INDEX, self.cap_len as u64 + offset, value);
    }

    pub(super) fn usbcmd(&self) -> UsbCmd {
        UsbCmd::new(self.read_op(OP_USBCMD))
    }

    pub(super) fn usbsts(&self) -> UsbSts {
        UsbSts::new(self.read_op(OP_USBSTS))
    }

    pub(super) fn modify_usbcmd(&self, f: impl FnOnce(&mut UsbCmd)) {
        let mut cmd = self.usbcmd();
        f(&mut cmd);
        self.write_op(OP_USBCMD, cmd.get());
    }

    /// Poll `condition` on operational register `offset` for `timeout_us`
    pub(super) fn wait_op<F>(
        &self,
        offset: u64,
        timeout_us: u64,
        condition: F,
    ) -> Result<(), UsbError>
    where
        F: Fn(u32) -> bool,
    {
        let met = time::poll_with_stall(
            |us| self.boot.stall(us),
            timeout_us,
            self.config.sync_poll_interval_us,
            || condition(self.read_op(offset)),
        );
        if met { Ok(()) } else { Err(UsbError::Timeout) }
    }

    pub(super) fn is_halted(&self) -> bool {
        self.usbsts().is_set(USBSTS::HCHALTED)
    }

    pub(super) fn is_sys_error(&self) -> bool {
        self.usbsts().is_set(USBSTS::HSE)
    }

    /// Clear every pending interrupt status bit
    pub(super) fn ack_all_interrupts(&self) {
        self.write_op(OP_USBSTS, USBSTS_INTACK_MASK);
    }

    pub(super) fn generic_timeout_us(&self) -> u64 {
        self.config.generic_timeout_ms.saturating_mul(1000)
    }

    pub(super) fn reset_timeout_us(&self) -> u64 {
        self.config.reset_timeout_ms.saturating_mul(1000)
    }

    pub(super) fn port_count(&self) -> u8 {
        self.hcs_params.read(HCSPARAMS::N_PORTS) as u8
    }

    // ------------------------------------------------------------------------
    // Run state
    // ------------------------------------------------------------------------

    /// Clear Run/Stop and wait for HCHalted
    pub(super) fn halt_hc(&self, timeout_us: u64) -> Result<(), UsbError> {
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::RS::CLEAR));
        self.wait_op(OP_USBSTS, timeout_us, |sts| {
            UsbSts::new(sts).is_set(USBSTS::HCHALTED)
        })
    }

    /// Set Run/Stop and wait for HCHalted to clear
    pub(super) fn run_hc(&self, timeout_us: u64) -> Result<(), UsbError> {
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::RS::SET));
        self.wait_op(OP_USBSTS, timeout_us, |sts| {
            !UsbSts::new(sts).is_set(USBSTS::HCHALTED)
        })
    }

    /// Reset the controller, halting it first if needed
    pub(super) fn reset_hc(&self, timeout_us: u64) -> Result<(), UsbError> {
        if !self.is_halted() {
            self.halt_hc(timeout_us)?;
        }
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::HCRESET::SET));
        self.wait_op(OP_USBCMD, timeout_us, |cmd| {
            !UsbCmd::new(cmd).is_set(USBCMD::HCRESET)
        })
    }

    fn enable_period_schedule(&self, timeout_us: u64) -> Result<(), UsbError> {
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::PSE::SET));
        self.wait_op(OP_USBSTS, timeout_us, |sts| UsbSts::new(sts).is_set(USBSTS::PSS))
    }

    fn enable_async_schedule(&self, timeout_us: u64) -> Result<(), UsbError> {
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::ASE::SET));
        self.wait_op(OP_USBSTS, timeout_us, |sts| UsbSts::new(sts).is_set(USBSTS::ASS))
    }

    /// Build the schedule and bring a halted controller into operation
    pub(super) fn init_hc(&mut self) -> Result<(), UsbError> {
        if self.sched.is_some() {
            self.free_sched();
        }
        self.init_sched()?;

        // No interrupts; everything is polled
        self.write_op(OP_USBINTR, 0);
        self.modify_usbcmd(|cmd| cmd.modify(USBCMD::RS::SET));

        if self.hcs_params.is_set(HCSPARAMS::PPC) {
            for port in 0..self.port_count() {
                // Keep the change bits so the bus driver still sees connects
                let mut portsc = PortSc::new(self.read_op(op_portsc(port)) & !PORTSC_CHANGE_MASK);
                portsc.modify(PORTSC::PP::SET);
                self.write_op(op_portsc(port), portsc.get());
            }
        }

        self.boot
            .stall(self.config.root_port_recovery_ms.saturating_mul(1000));

        let mut flag =
            LocalRegisterCopy::<u32, CONFIGFLAG::Register>::new(self.read_op(OP_CONFIGFLAG));
        flag.modify(CONFIGFLAG::CF::SET);
        self.write_op(OP_CONFIGFLAG, flag.get());

        let timeout = self.generic_timeout_us();
        if let Err(err) = self.enable_period_schedule(timeout) {
            log::error!("EHCI: failed to enable the periodic schedule");
            return Err(err);
        }
        if let Err(err) = self.enable_async_schedule(timeout) {
            log::error!("EHCI: failed to enable the asynchronous schedule");
            return Err(err);
        }

        log::info!("EHCI: controller running, {} root ports", self.port_count());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Platform hand-off
    // ------------------------------------------------------------------------

    /// Claim the controller from BIOS through the USBLEGSUP semaphore
    ///
    /// A BIOS that does not answer within the poll budget is ignored.
    pub(super) fn clear_legacy_support(&self) {
        let eecp = self.hcc_params.read(HCCPARAMS::EECP) as u16;
        if eecp < 0x40 {
            return;
        }

        let mut legsup =
            LocalRegisterCopy::<u32, USBLEGSUP::Register>::new(self.pci_io.config_read32(eecp));
        if legsup.read(USBLEGSUP::CAP_ID) != 0x01 {
            log::debug!("EHCI: no USBLEGSUP capability at {:#x}", eecp);
            return;
        }
        log::trace!(
            "EHCI: USBLEGSUP {:#010x}, USBLEGCTLSTS {:#010x}",
            legsup.get(),
            self.pci_io.config_read32(eecp + 4)
        );

        legsup.modify(USBLEGSUP::HC_OS_OWNED::SET);
        self.pci_io.config_write32(eecp, legsup.get());

        let mut released = false;
        for _ in 0..self.config.legacy_handoff_polls {
            self.boot.stall(500);
            let value =
                LocalRegisterCopy::<u32, USBLEGSUP::Register>::new(self.pci_io.config_read32(eecp));
            if value.is_set(USBLEGSUP::HC_OS_OWNED) && !value.is_set(USBLEGSUP::HC_BIOS_OWNED) {
                released = true;
                break;
            }
        }

        if released {
            log::debug!("EHCI: BIOS released the controller");
        } else {
            log::warn!("EHCI: BIOS did not release the controller");
        }
    }

    /// Locate the debug port from its PCI capability
    pub(super) fn detect_debug_port(&self) -> Option<DebugPort> {
        let port = self.hcs_params.read(HCSPARAMS::DEBUG_N) as u8;
        if port == 0 {
            return None;
        }
        let cap = self.pci_io.find_capability(DEBUG_PORT_CAP_ID)?;
        let header = LocalRegisterCopy::<u32, DEBUG_PORT_CAP::Register>::new(
            self.pci_io.config_read32(cap as u16),
        );
        let bar = header.read(DEBUG_PORT_CAP::BAR) as u8;
        if bar == 0 {
            return None;
        }
        let debug = DebugPort {
            port,
            bar: bar - 1,
            offset: header.read(DEBUG_PORT_CAP::REG_OFFSET) as u64,
        };
        log::debug!(
            "EHCI: debug port on root port {} (BAR{} + {:#x})",
            debug.port,
            debug.bar,
            debug.offset
        );
        Some(debug)
    }

    /// Whether a debugger owns the debug port
    ///
    /// With `port` (0-based) the answer is limited to that root port.
    pub(super) fn is_debug_port_in_use(&self, port: Option<u8>) -> bool {
        let Some(debug) = self.debug_port else {
            return false;
        };
        if port.is_some_and(|p| p + 1 != debug.port) {
            return false;
        }
        let ctrl = LocalRegisterCopy::<u32, DEBUG_PORT_CTRL::Register>::new(
            self.pci_io.mem_read32(debug.bar, debug.offset),
        );
        ctrl.is_set(DEBUG_PORT_CTRL::IN_USE) && ctrl.is_set(DEBUG_PORT_CTRL::OWNER)
    }
}
