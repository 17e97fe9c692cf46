//! Descriptor dumps for failed transfers

use super::desc::{Pid, QhPtr, QtdHw, QtdPtr, Token};
use super::regs::{QH_EP_CAPS, QH_EP_CHARS, QTD_TOKEN};

fn pid_name(token: Token) -> &'static str {
    match Pid::from_token(token) {
        Pid::Out => "OUT",
        Pid::In => "IN",
        Pid::Setup => "SETUP",
    }
}

fn dump_token(prefix: &str, hw: &QtdHw) {
    let token = Token::new(hw.token);
    log::trace!(
        "{}next {:#010x} alt {:#010x} {} toggle {} cerr {} total {} page {} status {:#04x}{}{}",
        prefix,
        hw.next_qtd,
        hw.alt_next,
        pid_name(token),
        token.read(QTD_TOKEN::DT),
        token.read(QTD_TOKEN::CERR),
        token.read(QTD_TOKEN::TOTAL_BYTES),
        token.read(QTD_TOKEN::C_PAGE),
        token.read(QTD_TOKEN::STATUS),
        if token.is_set(QTD_TOKEN::ACTIVE) { " active" } else { "" },
        if token.is_set(QTD_TOKEN::HALTED) { " halted" } else { "" },
    );
}

fn dump_pages(prefix: &str, hw: &QtdHw) {
    for (index, (low, high)) in hw.page.iter().zip(hw.page_high.iter()).enumerate() {
        log::trace!("{}page[{}] {:#010x}:{:08x}", prefix, index, high, low);
    }
}

/// Log one qTD
pub(super) fn dump_qtd(qtd: QtdPtr, msg: &str) {
    let hw = qtd.hw();
    log::trace!("{} qTD {:p}, {} bytes", msg, qtd.as_ptr(), qtd.data_len());
    dump_token("  ", &hw);
    dump_pages("  ", &hw);
}

/// Log a queue head, its overlay and optionally its qTDs
pub(super) fn dump_qh(qh: QhPtr, msg: &str, dump_qtds: bool) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    let hw = qh.hw();
    let chars = super::desc::EpChars::new(hw.ep_chars);
    let caps = super::desc::EpCaps::new(hw.ep_caps);

    log::trace!("{} QH {:p}, interval {}", msg, qh.as_ptr(), qh.interval());
    log::trace!(
        "  horizon {:#010x} cur {:#010x} dev {} ep {} speed {} max packet {} dtc {} head {}",
        hw.horizon_link,
        hw.cur_qtd,
        chars.read(QH_EP_CHARS::DEVICE_ADDRESS),
        chars.read(QH_EP_CHARS::ENDPOINT),
        chars.read(QH_EP_CHARS::EPS),
        chars.read(QH_EP_CHARS::MAX_PACKET),
        chars.read(QH_EP_CHARS::DTC),
        chars.read(QH_EP_CHARS::HEAD),
    );
    log::trace!(
        "  smask {:#04x} cmask {:#04x} hub {} port {}",
        caps.read(QH_EP_CAPS::SMASK),
        caps.read(QH_EP_CAPS::CMASK),
        caps.read(QH_EP_CAPS::HUB_ADDRESS),
        caps.read(QH_EP_CAPS::PORT_NUMBER),
    );
    dump_token("  overlay ", &hw.overlay);

    if dump_qtds {
        for qtd in QtdPtr::chain(qh.qtds()) {
            dump_qtd(qtd, "  ");
        }
    }
}
