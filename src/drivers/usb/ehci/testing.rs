//! Host-side fakes for exercising the EHCI driver
//!
//! `FakeDma` hands out page-aligned heap memory and synthetic bus addresses
//! that differ from the host addresses, so any place that programs a host
//! pointer into hardware shows up as a broken walk. `FakePciIo` models the
//! capability, operational and debug-port registers plus configuration space,
//! and carries a small schedule walker that executes qTDs against a scripted
//! device. `FakeBoot` counts stalls, tracks TPL and can run a hook on every
//! stall, which is how the walker advances while the driver polls.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell, RefMut};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use r_efi::efi::{self, Tpl};

use super::desc::{EpChars, Pid, QhHw, QtdHw, Token, link_target};
use super::regs::*;
use super::{EhciConfig, EhciController};
use crate::drivers::dma::{DmaError, DmaMapping, DmaOperation, DmaOps, PAGE_SIZE};
use crate::drivers::pci::PciIo;
use crate::drivers::usb::controller::UsbSpeed;
use crate::efi::BootServices;

// ============================================================================
// DMA
// ============================================================================

/// DMA mapper with synthetic, non-identity bus addresses
pub struct FakeDma {
    segment: u32,
    forced_segment: Option<u32>,
    short_maps: bool,
    maps_left: Option<usize>,
    fail_allocations: bool,
    next_low: u64,
    allocations: Vec<(usize, usize)>,
    mappings: Vec<DmaMapping>,
}

impl FakeDma {
    pub fn new() -> Self {
        Self::with_segment(0)
    }

    /// Map everything into 4 GiB segment `segment`
    pub fn with_segment(segment: u32) -> Self {
        Self {
            segment,
            forced_segment: None,
            short_maps: false,
            maps_left: None,
            fail_allocations: false,
            next_low: 0x1000_0000,
            allocations: Vec::new(),
            mappings: Vec::new(),
        }
    }

    /// Place the next mapping in `segment`
    pub fn force_next_segment(&mut self, segment: u32) {
        self.forced_segment = Some(segment);
    }

    /// Map only half of every requested range
    pub fn set_short_maps(&mut self, short: bool) {
        self.short_maps = short;
    }

    /// Let `count` more maps succeed, then fail every map
    pub fn fail_maps_after(&mut self, count: usize) {
        self.maps_left = Some(count);
    }

    pub fn set_fail_allocations(&mut self, fail: bool) {
        self.fail_allocations = fail;
    }

    /// Host address behind a live mapping
    pub fn bus_to_host(&self, bus: u64) -> Option<*mut u8> {
        self.mappings
            .iter()
            .find(|m| bus >= m.device_address && bus < m.device_address + m.len as u64)
            .map(|m| (m.host_address + (bus - m.device_address) as usize) as *mut u8)
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.mappings.len()
    }

    pub fn mappings(&self) -> &[DmaMapping] {
        &self.mappings
    }

    /// Page count of the allocation starting at `host`
    pub fn allocation_pages(&self, host: *const u8) -> Option<usize> {
        self.allocations
            .iter()
            .find(|(addr, _)| *addr == host as usize)
            .map(|(_, pages)| *pages)
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap()
    }
}

impl DmaOps for FakeDma {
    fn allocate_buffer(&mut self, pages: usize) -> Result<NonNull<u8>, DmaError> {
        if self.fail_allocations || pages == 0 {
            return Err(DmaError::OutOfResources);
        }
        let mem = unsafe { alloc_zeroed(Self::layout(pages)) };
        let mem = NonNull::new(mem).ok_or(DmaError::OutOfResources)?;
        self.allocations.push((mem.as_ptr() as usize, pages));
        Ok(mem)
    }

    unsafe fn free_buffer(&mut self, host: NonNull<u8>, pages: usize) {
        let index = self
            .allocations
            .iter()
            .position(|&(addr, n)| addr == host.as_ptr() as usize && n == pages)
            .expect("free of unknown DMA buffer");
        self.allocations.remove(index);
        dealloc(host.as_ptr(), Self::layout(pages));
    }

    unsafe fn map(
        &mut self,
        operation: DmaOperation,
        host: NonNull<u8>,
        len: usize,
    ) -> Result<DmaMapping, DmaError> {
        if let Some(left) = self.maps_left.as_mut() {
            if *left == 0 {
                return Err(DmaError::OutOfResources);
            }
            *left -= 1;
        }

        let host_address = host.as_ptr() as usize;
        let offset = (host_address % PAGE_SIZE) as u64;
        let span = (offset as usize + len).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let segment = self.forced_segment.take().unwrap_or(self.segment);
        let base = self.next_low;
        // Leave a hole between mappings so overruns do not land in a neighbour
        self.next_low += (span + PAGE_SIZE) as u64;

        let mapping = DmaMapping {
            device_address: ((segment as u64) << 32) | (base + offset),
            host_address,
            len: if self.short_maps && len > 1 { len / 2 } else { len },
            operation,
        };
        self.mappings.push(mapping);
        Ok(mapping)
    }

    fn unmap(&mut self, mapping: DmaMapping) -> Result<(), DmaError> {
        let index = self
            .mappings
            .iter()
            .position(|m| *m == mapping)
            .ok_or(DmaError::DeviceError)?;
        self.mappings.remove(index);
        Ok(())
    }
}

// ============================================================================
// Scripted device
// ============================================================================

/// One transaction as seen on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub dev: u8,
    pub ep: u8,
    pub pid: Pid,
    pub toggle: u8,
    /// Bytes offered (OUT/SETUP) or requested (IN)
    pub len: usize,
}

/// Device handshake for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// IN: number of bytes returned; OUT/SETUP: accepted
    Ack(usize),
    Nak,
    Stall,
    XactErr,
    Babble,
}

pub type Device = Box<dyn FnMut(&Packet, &mut [u8]) -> Reply>;

enum Outcome {
    Complete,
    Short,
    Nak,
    Halted,
}

// ============================================================================
// PCI I/O
// ============================================================================

/// Capability register length of the fake controller
pub const CAP_LEN: u64 = 0x20;
/// Extended capability pointer (USBLEGSUP)
pub const EECP: u16 = 0x68;
/// PCI capability holding the debug port description
pub const DEBUG_CAP: u16 = 0x58;
/// Debug port registers inside BAR0
pub const DEBUG_REGS: u64 = 0xA0;
const BAR0_LEN: usize = 0x100;
const MAX_PORTS: usize = 15;

/// Shape of the fake controller
#[derive(Debug, Clone, Copy)]
pub struct FakeHcConfig {
    pub ports: u8,
    pub ppc: bool,
    pub ac64: bool,
    pub segment: u32,
    /// 1-based debug port number
    pub debug_port: Option<u8>,
    pub debug_in_use: bool,
    pub bios_owned: bool,
}

impl Default for FakeHcConfig {
    fn default() -> Self {
        Self {
            ports: 4,
            ppc: true,
            ac64: false,
            segment: 0,
            debug_port: None,
            debug_in_use: false,
            bios_owned: false,
        }
    }
}

/// Register file, configuration space and DMA of the fake controller
pub struct FakeHcState {
    pub dma: FakeDma,
    pub bar0: [u32; BAR0_LEN / 4],
    pub config: [u32; 64],
    /// BAR0 writes as (offset, value)
    pub writes: Vec<(u64, u32)>,
    /// Transactions the walker issued
    pub packets: Vec<Packet>,
    pub port_speed: [Option<UsbSpeed>; MAX_PORTS],
    /// Run/Stop changes never reach HCHALTED
    pub stuck_halted: bool,
    pub stuck_running: bool,
    /// HCRESET never self-clears
    pub reset_sticks: bool,
    /// IAAD is never acknowledged
    pub doorbell_ignored: bool,
    /// BIOS keeps its ownership semaphore
    pub bios_holds: bool,
    device: Option<Device>,
}

impl FakeHcState {
    fn op(&self, offset: u64) -> u32 {
        self.bar0[((CAP_LEN + offset) / 4) as usize]
    }

    fn set_op(&mut self, offset: u64, value: u32) {
        self.bar0[((CAP_LEN + offset) / 4) as usize] = value;
    }

    fn ports(&self) -> usize {
        (self.bar0[(CAP_HCSPARAMS / 4) as usize] & 0xF) as usize
    }

    fn segment(&self) -> u64 {
        (self.op(OP_CTRLDSSEGMENT) as u64) << 32
    }

    fn write_bar0(&mut self, offset: u64, value: u32) {
        self.writes.push((offset, value));
        if offset < CAP_LEN {
            return;
        }
        if offset >= DEBUG_REGS {
            self.bar0[(offset / 4) as usize] = value;
            return;
        }

        let op = offset - CAP_LEN;
        match op {
            OP_USBCMD => self.write_usbcmd(value),
            OP_USBSTS => {
                let sts = self.op(OP_USBSTS) & !(value & USBSTS_INTACK_MASK);
                self.set_op(OP_USBSTS, sts);
            }
            _ if op >= OP_PORTSC_BASE && op < op_portsc(self.ports() as u8) => {
                self.write_portsc(((op - OP_PORTSC_BASE) / 4) as usize, value);
            }
            _ => self.set_op(op, value),
        }
    }

    fn write_usbcmd(&mut self, value: u32) {
        const RS: u32 = 1 << 0;
        const HCRESET: u32 = 1 << 1;
        const PSE: u32 = 1 << 4;
        const ASE: u32 = 1 << 5;
        const IAAD: u32 = 1 << 6;
        const IAA: u32 = 1 << 5;
        const HALTED: u32 = 1 << 12;
        const PSS: u32 = 1 << 14;
        const ASS: u32 = 1 << 15;

        if value & HCRESET != 0 {
            for op in [
                OP_USBINTR,
                OP_FRINDEX,
                OP_CTRLDSSEGMENT,
                OP_PERIODICLISTBASE,
                OP_ASYNCLISTADDR,
                OP_CONFIGFLAG,
            ] {
                self.set_op(op, 0);
            }
            for port in 0..self.ports() {
                let keep = self.op(op_portsc(port as u8)) & (1 | (3 << 10));
                self.set_op(op_portsc(port as u8), keep);
            }
            self.set_op(OP_USBSTS, HALTED);
            self.set_op(OP_USBCMD, if self.reset_sticks { HCRESET } else { 0 });
            return;
        }

        let mut sts = self.op(OP_USBSTS);
        if value & RS != 0 && !self.stuck_halted {
            sts &= !HALTED;
        }
        if value & RS == 0 && !self.stuck_running {
            sts |= HALTED;
        }
        sts = if value & PSE != 0 { sts | PSS } else { sts & !PSS };
        sts = if value & ASE != 0 { sts | ASS } else { sts & !ASS };

        let mut cmd = value;
        if value & IAAD != 0 && !self.doorbell_ignored {
            sts |= IAA;
            cmd &= !IAAD;
        }
        self.set_op(OP_USBSTS, sts);
        self.set_op(OP_USBCMD, cmd);
    }

    fn write_portsc(&mut self, port: usize, value: u32) {
        const CCS: u32 = 1 << 0;
        const PE: u32 = 1 << 2;
        const OCA: u32 = 1 << 4;
        const PR: u32 = 1 << 8;
        const LS: u32 = 3 << 10;
        const WRITABLE: u32 = (1 << 6) | (1 << 7) | PR | (1 << 12) | (1 << 13);

        let offset = op_portsc(port as u8);
        let old = self.op(offset);
        let change = old & PORTSC_CHANGE_MASK & !(value & PORTSC_CHANGE_MASK);
        let mut new = (old & (CCS | OCA | LS)) | change | (value & WRITABLE);

        // Software can only disable a port
        if old & PE != 0 && value & PE != 0 {
            new |= PE;
        }
        if value & PR != 0 {
            new &= !PE;
        }
        if old & PR != 0 && value & PR == 0 && old & CCS != 0 {
            if self.port_speed[port] == Some(UsbSpeed::High) {
                new |= PE;
            }
        }
        self.set_op(offset, new);
    }

    fn write_config(&mut self, offset: u16, value: u32) {
        let mut value = value;
        if offset == EECP && value & (1 << 24) != 0 && !self.bios_holds {
            value &= !(1 << 16);
        }
        self.config[(offset / 4) as usize] = value;
    }

    // ------------------------------------------------------------------------
    // Schedule walker
    // ------------------------------------------------------------------------

    fn run_schedules(&mut self, device: &mut dyn FnMut(&Packet, &mut [u8]) -> Reply) {
        let sts = self.op(OP_USBSTS);
        if sts & (1 << 12) != 0 {
            return;
        }
        let segment = self.segment();

        if sts & (1 << 14) != 0 {
            let frindex = self.op(OP_FRINDEX);
            self.set_op(OP_FRINDEX, (frindex + 8) & 0x3FFF);
            let base = segment | self.op(OP_PERIODICLISTBASE) as u64;
            if let Some(list) = self.dma.bus_to_host(base) {
                let frame = (frindex >> 3) as usize % FRAME_LIST_LEN;
                let mut link = unsafe { ptr::read_volatile((list as *const u32).add(frame)) };
                for _ in 0..64 {
                    let Some(addr) = link_target(link) else { break };
                    let Some(host) = self.process_qh(segment | addr as u64, device) else {
                        break;
                    };
                    link = unsafe { ptr::read_volatile(host).horizon_link };
                }
            }
        }

        if sts & (1 << 15) != 0 {
            let head = segment | self.op(OP_ASYNCLISTADDR) as u64;
            let mut qh = head;
            for _ in 0..64 {
                let Some(host) = self.process_qh(qh, device) else { break };
                let link = unsafe { ptr::read_volatile(host).horizon_link };
                let Some(next) = link_target(link) else { break };
                qh = segment | next as u64;
                if qh == head {
                    break;
                }
            }
        }
    }

    /// Advance one queue head as far as the device lets it
    fn process_qh(
        &mut self,
        qh_bus: u64,
        device: &mut dyn FnMut(&Packet, &mut [u8]) -> Reply,
    ) -> Option<*mut QhHw> {
        let qh = self.dma.bus_to_host(qh_bus)? as *mut QhHw;
        let segment = self.segment();

        for _ in 0..32 {
            let mut hw = unsafe { ptr::read_volatile(qh) };
            let overlay = Token::new(hw.overlay.token);
            if overlay.is_set(QTD_TOKEN::HALTED) {
                break;
            }

            if !overlay.is_set(QTD_TOKEN::ACTIVE) {
                let Some(next) = link_target(hw.overlay.next_qtd) else { break };
                let Some(host) = self.dma.bus_to_host(segment | next as u64) else { break };
                let qtd = unsafe { ptr::read_volatile(host as *const QtdHw) };
                let mut token = Token::new(qtd.token);
                if !token.is_set(QTD_TOKEN::ACTIVE) {
                    break;
                }
                if !EpChars::new(hw.ep_chars).is_set(QH_EP_CHARS::DTC) {
                    token.modify(QTD_TOKEN::DT.val(overlay.read(QTD_TOKEN::DT)));
                }
                hw.cur_qtd = next;
                hw.overlay = QtdHw {
                    token: token.get(),
                    ..qtd
                };
            }

            let outcome = self.execute(&mut hw, device);
            if let Outcome::Short = outcome {
                if link_target(hw.overlay.alt_next).is_some() {
                    hw.overlay.next_qtd = hw.overlay.alt_next;
                }
            }

            if let Some(qtd) = self.dma.bus_to_host(segment | hw.cur_qtd as u64) {
                let qtd = qtd as *mut QtdHw;
                unsafe {
                    let mut written = ptr::read_volatile(qtd);
                    written.token = hw.overlay.token;
                    ptr::write_volatile(qtd, written);
                }
            }
            unsafe { ptr::write_volatile(qh, hw) };

            match outcome {
                Outcome::Complete | Outcome::Short => continue,
                Outcome::Nak | Outcome::Halted => break,
            }
        }
        Some(qh)
    }

    /// Run the transaction in the overlay to completion, NAK or error
    fn execute(
        &mut self,
        hw: &mut QhHw,
        device: &mut dyn FnMut(&Packet, &mut [u8]) -> Reply,
    ) -> Outcome {
        let chars = EpChars::new(hw.ep_chars);
        let max_packet = (chars.read(QH_EP_CHARS::MAX_PACKET) as usize).max(1);
        let dev = chars.read(QH_EP_CHARS::DEVICE_ADDRESS) as u8;
        let ep = chars.read(QH_EP_CHARS::ENDPOINT) as u8;
        let mut token = Token::new(hw.overlay.token);
        let pid = Pid::from_token(token);
        let mut remaining = token.read(QTD_TOKEN::TOTAL_BYTES) as usize;
        let mut toggle = token.read(QTD_TOKEN::DT) as u8;

        let outcome = loop {
            let chunk = remaining.min(max_packet);
            let mut buf = vec![0u8; chunk];
            if pid != Pid::In {
                self.copy_buffer(&mut hw.overlay, &mut buf, false);
            }
            let packet = Packet {
                dev,
                ep,
                pid,
                toggle,
                len: chunk,
            };
            self.packets.push(packet);

            match device(&packet, &mut buf) {
                Reply::Ack(n) => {
                    let n = if pid == Pid::In { n.min(chunk) } else { chunk };
                    if pid == Pid::In {
                        self.copy_buffer(&mut hw.overlay, &mut buf[..n], true);
                    }
                    remaining -= n;
                    toggle ^= 1;
                    if n < chunk {
                        break Outcome::Short;
                    }
                    if remaining == 0 {
                        break Outcome::Complete;
                    }
                }
                Reply::Nak => {
                    if pid != Pid::In {
                        self.rewind_buffer(&mut hw.overlay, chunk);
                    }
                    break Outcome::Nak;
                }
                Reply::Stall => {
                    token.modify(QTD_TOKEN::HALTED::SET);
                    break Outcome::Halted;
                }
                Reply::XactErr => {
                    token.modify(
                        QTD_TOKEN::HALTED::SET + QTD_TOKEN::XACT_ERR::SET + QTD_TOKEN::CERR.val(0),
                    );
                    break Outcome::Halted;
                }
                Reply::Babble => {
                    token.modify(QTD_TOKEN::HALTED::SET + QTD_TOKEN::BABBLE::SET);
                    break Outcome::Halted;
                }
            }
        };

        token.modify(
            QTD_TOKEN::TOTAL_BYTES.val(remaining as u32)
                + QTD_TOKEN::DT.val(toggle as u32)
                + QTD_TOKEN::C_PAGE.val(Token::new(hw.overlay.token).read(QTD_TOKEN::C_PAGE)),
        );
        if !matches!(outcome, Outcome::Nak) {
            token.modify(QTD_TOKEN::ACTIVE::CLEAR);
        }
        hw.overlay.token = token.get();
        outcome
    }

    /// Move bytes between `data` and the overlay buffer, advancing its cursor
    fn copy_buffer(&mut self, overlay: &mut QtdHw, data: &mut [u8], to_memory: bool) {
        let mut token = Token::new(overlay.token);
        let mut done = 0;
        while done < data.len() {
            let page = token.read(QTD_TOKEN::C_PAGE) as usize;
            let offset = (overlay.page[0] & 0xFFF) as usize;
            let base =
                ((overlay.page_high[page] as u64) << 32) | (overlay.page[page] & !0xFFF) as u64;
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            let host = self
                .dma
                .bus_to_host(base + offset as u64)
                .expect("walker touched unmapped memory");
            unsafe {
                if to_memory {
                    ptr::copy_nonoverlapping(data[done..].as_ptr(), host, n);
                } else {
                    ptr::copy_nonoverlapping(host, data[done..].as_mut_ptr(), n);
                }
            }
            done += n;
            let next = offset + n;
            if next == PAGE_SIZE {
                token.modify(QTD_TOKEN::C_PAGE.val(page as u32 + 1));
                overlay.page[0] &= !0xFFF;
            } else {
                overlay.page[0] = (overlay.page[0] & !0xFFF) | next as u32;
            }
        }
        overlay.token = token.get();
    }

    fn rewind_buffer(&mut self, overlay: &mut QtdHw, len: usize) {
        let mut token = Token::new(overlay.token);
        let mut pos = token.read(QTD_TOKEN::C_PAGE) as usize * PAGE_SIZE
            + (overlay.page[0] & 0xFFF) as usize;
        pos -= len;
        token.modify(QTD_TOKEN::C_PAGE.val((pos / PAGE_SIZE) as u32));
        overlay.page[0] = (overlay.page[0] & !0xFFF) | (pos % PAGE_SIZE) as u32;
        overlay.token = token.get();
    }
}

/// Shared handle to the fake controller
#[derive(Clone)]
pub struct FakePciIo {
    state: Rc<RefCell<FakeHcState>>,
}

impl FakePciIo {
    pub fn new(config: FakeHcConfig) -> Self {
        let mut bar0 = [0u32; BAR0_LEN / 4];
        bar0[0] = 0x0100_0000 | CAP_LEN as u32;
        bar0[(CAP_HCSPARAMS / 4) as usize] = config.ports as u32
            | (config.ppc as u32) << 4
            | (config.debug_port.unwrap_or(0) as u32) << 20;
        bar0[(CAP_HCCPARAMS / 4) as usize] = config.ac64 as u32 | (EECP as u32) << 8;

        let mut pci_config = [0u32; 64];
        pci_config[0] = 0x24cd_8086;
        pci_config[2] = 0x0c03_2000;
        pci_config[4] = 0xfeb0_0000;
        if config.debug_port.is_some() {
            pci_config[1] = (1 << 4) << 16;
            pci_config[0x34 / 4] = DEBUG_CAP as u32;
            pci_config[(DEBUG_CAP / 4) as usize] =
                DEBUG_PORT_CAP_ID as u32 | (DEBUG_REGS as u32) << 16 | 1 << 29;
        }
        pci_config[(EECP / 4) as usize] = 0x01 | (config.bios_owned as u32) << 16;

        let mut state = FakeHcState {
            dma: FakeDma::with_segment(config.segment),
            bar0,
            config: pci_config,
            writes: Vec::new(),
            packets: Vec::new(),
            port_speed: [None; MAX_PORTS],
            stuck_halted: false,
            stuck_running: false,
            reset_sticks: false,
            doorbell_ignored: false,
            bios_holds: false,
            device: None,
        };
        state.set_op(OP_USBSTS, 1 << 12);
        if config.debug_in_use {
            state.bar0[(DEBUG_REGS / 4) as usize] = (1 << 10) | (1 << 30);
        }

        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn state(&self) -> RefMut<'_, FakeHcState> {
        self.state.borrow_mut()
    }

    pub fn op_reg(&self, offset: u64) -> u32 {
        self.state.borrow().op(offset)
    }

    pub fn set_op_reg(&self, offset: u64, value: u32) {
        self.state.borrow_mut().set_op(offset, value);
    }

    /// Values written to operational register `offset`, in order
    pub fn op_writes(&self, offset: u64) -> Vec<u32> {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|(o, _)| *o == CAP_LEN + offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }

    /// Attach a device of `speed` to 0-based root `port`
    pub fn connect(&self, port: u8, speed: UsbSpeed) {
        let mut st = self.state.borrow_mut();
        let offset = op_portsc(port);
        let mut value = st.op(offset) | 0x1 | 0x2;
        if speed == UsbSpeed::Low {
            value |= 1 << 10;
        }
        st.set_op(offset, value);
        st.port_speed[port as usize] = Some(speed);
    }

    pub fn set_device<F>(&self, device: F)
    where
        F: FnMut(&Packet, &mut [u8]) -> Reply + 'static,
    {
        self.state.borrow_mut().device = Some(Box::new(device));
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.state.borrow().packets.clone()
    }

    /// One pass of the controller over both schedules
    pub fn step(&self) {
        let mut st = self.state.borrow_mut();
        let Some(mut device) = st.device.take() else {
            return;
        };
        st.run_schedules(&mut *device);
        st.device = Some(device);
    }

    /// Run `frames` periodic frames
    pub fn run_frames(&self, frames: usize) {
        for _ in 0..frames {
            self.step();
        }
    }

    pub fn bus_to_host(&self, bus: u64) -> Option<*mut u8> {
        self.state.borrow().dma.bus_to_host(bus)
    }

    pub fn live_mappings(&self) -> usize {
        self.state.borrow().dma.live_mappings()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().dma.live_allocations()
    }
}

impl DmaOps for FakePciIo {
    fn allocate_buffer(&mut self, pages: usize) -> Result<NonNull<u8>, DmaError> {
        self.state.borrow_mut().dma.allocate_buffer(pages)
    }

    unsafe fn free_buffer(&mut self, host: NonNull<u8>, pages: usize) {
        self.state.borrow_mut().dma.free_buffer(host, pages)
    }

    unsafe fn map(
        &mut self,
        operation: DmaOperation,
        host: NonNull<u8>,
        len: usize,
    ) -> Result<DmaMapping, DmaError> {
        self.state.borrow_mut().dma.map(operation, host, len)
    }

    fn unmap(&mut self, mapping: DmaMapping) -> Result<(), DmaError> {
        self.state.borrow_mut().dma.unmap(mapping)
    }
}

impl PciIo for FakePciIo {
    fn mem_read32(&self, bar: u8, offset: u64) -> u32 {
        let st = self.state.borrow();
        match st.bar0.get((offset / 4) as usize) {
            Some(value) if bar == 0 => *value,
            _ => 0xFFFF_FFFF,
        }
    }

    fn mem_write32(&self, bar: u8, offset: u64, value: u32) {
        if bar == 0 && (offset as usize) < BAR0_LEN {
            self.state.borrow_mut().write_bar0(offset, value);
        }
    }

    fn config_read32(&self, offset: u16) -> u32 {
        self.state
            .borrow()
            .config
            .get((offset / 4) as usize)
            .copied()
            .unwrap_or(0xFFFF_FFFF)
    }

    fn config_write32(&self, offset: u16, value: u32) {
        if offset < 0x100 {
            self.state.borrow_mut().write_config(offset & !0x3, value);
        }
    }
}

// ============================================================================
// Boot services
// ============================================================================

struct BootInner {
    stalls: Cell<u64>,
    stalled_us: Cell<u64>,
    tpl: Cell<Tpl>,
    max_tpl: Cell<Tpl>,
    hook: RefCell<Option<Box<dyn FnMut()>>>,
}

/// Boot services that count stalls and optionally drive the fake controller
#[derive(Clone)]
pub struct FakeBoot {
    inner: Rc<BootInner>,
}

impl FakeBoot {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(BootInner {
                stalls: Cell::new(0),
                stalled_us: Cell::new(0),
                tpl: Cell::new(efi::TPL_APPLICATION),
                max_tpl: Cell::new(efi::TPL_APPLICATION),
                hook: RefCell::new(None),
            }),
        }
    }

    /// Boot services whose stalls advance `pci`'s schedules
    pub fn driving(pci: &FakePciIo) -> Self {
        let boot = Self::new();
        let pci = pci.clone();
        boot.set_stall_hook(move || pci.step());
        boot
    }

    pub fn set_stall_hook<F: FnMut() + 'static>(&self, hook: F) {
        *self.inner.hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn stalls(&self) -> u64 {
        self.inner.stalls.get()
    }

    pub fn stalled_us(&self) -> u64 {
        self.inner.stalled_us.get()
    }

    pub fn tpl(&self) -> Tpl {
        self.inner.tpl.get()
    }

    pub fn max_tpl(&self) -> Tpl {
        self.inner.max_tpl.get()
    }
}

impl BootServices for FakeBoot {
    fn stall(&self, microseconds: u64) {
        self.inner.stalls.set(self.inner.stalls.get() + 1);
        self.inner
            .stalled_us
            .set(self.inner.stalled_us.get() + microseconds);
        let hook = self.inner.hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook();
            *self.inner.hook.borrow_mut() = Some(hook);
        }
    }

    fn raise_tpl(&self, new_tpl: Tpl) -> Tpl {
        let old = self.inner.tpl.replace(new_tpl);
        self.inner.max_tpl.set(self.inner.max_tpl.get().max(new_tpl));
        old
    }

    fn restore_tpl(&self, old_tpl: Tpl) {
        self.inner.tpl.set(old_tpl);
    }
}

// ============================================================================
// Controller
// ============================================================================

pub type TestController = EhciController<FakePciIo, FakeBoot>;

/// Bring up a controller on a fresh fake whose schedules advance on every stall
pub fn running_controller(config: FakeHcConfig) -> (TestController, FakePciIo, FakeBoot) {
    let pci = FakePciIo::new(config);
    let boot = FakeBoot::driving(&pci);
    let ehci = EhciController::new(pci.clone(), boot.clone(), EhciConfig::default())
        .expect("controller bring-up");
    (ehci, pci, boot)
}
