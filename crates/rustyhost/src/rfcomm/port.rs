//! RFCOMM port control block, the per-DLCI state machine and the data path

use super::constants::*;
use super::frame::{MuxCommand, MuxFrame, PnParams, RfcommFrame};
use super::manager::{Notify, RfcTimer, RfcommManager};
use super::types::*;
use crate::bearer::SendStatus;
use crate::gap::BdAddr;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;

/// What the port timer is currently guarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortTimerKind {
    /// SABME or DISC awaiting UA
    T1,
    /// PN, MSC or RPN awaiting a response
    T2,
}

/// Events driving the port state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortEvent {
    /// Multiplexer is up, start negotiating
    OpenReq,
    CloseReq,
    PnInd(PnParams),
    PnCnf(PnParams),
    /// SABME on the DLCI
    EstabInd,
    /// UA on the DLCI
    EstabCnf,
    /// DISC on the DLCI
    RelInd,
    DmInd,
    MscInd {
        signals: u8,
        break_duration: Option<u8>,
    },
    MscCnf,
    RpnInd(Option<(PortSettings, u16)>),
    RpnCnf(Option<(PortSettings, u16)>),
    RlsInd(u8),
    DataInd {
        info: Vec<u8>,
        credits: Option<u8>,
    },
    Timeout,
}

/// Port control block
pub(crate) struct Port {
    pub handle: PortHandle,
    pub state: PortState,
    pub is_server: bool,
    pub scn: u8,
    pub dlci: u8,
    pub uuid: u16,
    pub psm: u16,
    pub security_flags: u16,
    pub peer: Option<BdAddr>,
    pub mux: Option<usize>,

    /// Local receive MTU as configured
    pub mtu: u16,
    /// Negotiated frame size for sending
    pub peer_mtu: u16,

    pub credit_tx: u16,
    pub credit_rx: u16,
    /// Peer cannot accept data right now
    pub peer_fc: bool,
    /// FC bit from the peer's last MSC (TS 07.10 flow control only)
    pub msc_fc: bool,
    /// Local receive side asked the peer to stop
    pub user_fc: bool,
    /// FC bit we last signalled in an MSC
    pub fc_signalled: bool,

    pub rx_queue: VecDeque<Vec<u8>>,
    pub rx_queue_size: usize,
    pub tx_queue: VecDeque<Vec<u8>>,
    pub tx_queue_size: usize,
    pub congestion_reported: bool,

    pub event_mask: PortEvents,
    pub line_status: LineStatus,
    pub local_signals: ModemSignals,
    pub peer_signals: ModemSignals,
    pub settings: PortSettings,

    pub mgmt_callback: Option<PortMgmtCallback>,
    pub event_callback: Option<PortEventCallback>,
    pub data_callback: Option<PortDataCallback>,

    pub close_pending: bool,
    /// Application closed the port; a server does not go back to listening
    pub user_closed: bool,
    pub msc_ind_received: bool,
    pub msc_cnf_received: bool,
    pub connected_reported: bool,
    /// RPN sent as part of opening, awaiting the peer's answer
    pub rpn_pending: Option<u16>,
    pub timer_kind: Option<PortTimerKind>,
}

impl Port {
    pub fn new(handle: PortHandle, params: &OpenPortParams, mtu: u16) -> Self {
        let dlci = params.scn << 1;
        Self {
            handle,
            state: PortState::Opening,
            is_server: params.is_server,
            scn: params.scn,
            dlci,
            uuid: params.uuid,
            psm: params.psm,
            security_flags: params.security_flags,
            peer: params.peer,
            mux: None,
            mtu,
            peer_mtu: mtu,
            credit_tx: 0,
            credit_rx: 0,
            peer_fc: false,
            msc_fc: false,
            user_fc: false,
            fc_signalled: false,
            rx_queue: VecDeque::new(),
            rx_queue_size: 0,
            tx_queue: VecDeque::new(),
            tx_queue_size: 0,
            congestion_reported: false,
            event_mask: params.event_mask,
            line_status: LineStatus::empty(),
            local_signals: ModemSignals::DTR_DSR | ModemSignals::RTS_CTS | ModemSignals::DCD,
            peer_signals: ModemSignals::empty(),
            settings: PortSettings::default(),
            mgmt_callback: params.mgmt_callback.clone(),
            event_callback: params.event_callback.clone(),
            data_callback: None,
            close_pending: false,
            user_closed: false,
            msc_ind_received: false,
            msc_cnf_received: false,
            connected_reported: false,
            rpn_pending: None,
            timer_kind: None,
        }
    }

    /// Drop all per-connection state so a server can listen again
    pub fn reset_for_listen(&mut self) {
        self.state = PortState::Opening;
        self.mux = None;
        self.peer = None;
        self.dlci = self.scn << 1;
        self.peer_mtu = self.mtu;
        self.credit_tx = 0;
        self.credit_rx = 0;
        self.peer_fc = false;
        self.msc_fc = false;
        self.user_fc = false;
        self.fc_signalled = false;
        self.rx_queue.clear();
        self.rx_queue_size = 0;
        self.tx_queue.clear();
        self.tx_queue_size = 0;
        self.congestion_reported = false;
        self.line_status = LineStatus::empty();
        self.peer_signals = ModemSignals::empty();
        self.close_pending = false;
        self.msc_ind_received = false;
        self.msc_cnf_received = false;
        self.connected_reported = false;
        self.rpn_pending = None;
        self.timer_kind = None;
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            handle: self.handle,
            state: self.state,
            dlci: self.dlci,
            is_server: self.is_server,
            peer: self.peer,
            psm: self.psm,
            security_flags: self.security_flags,
            mtu: self.mtu,
            peer_mtu: self.peer_mtu,
            credit_tx: self.credit_tx,
            credit_rx: self.credit_rx,
            peer_fc: self.peer_fc,
            user_fc: self.user_fc,
            rx_queue_size: self.rx_queue_size,
            rx_queue_frames: self.rx_queue.len(),
            tx_queue_size: self.tx_queue_size,
            line_status: self.line_status,
            local_signals: self.local_signals,
            peer_signals: self.peer_signals,
        }
    }

    /// Credits that can be handed to the peer right now
    fn owed_credits(&self, max: u16) -> u16 {
        if self.user_fc {
            0
        } else {
            max.saturating_sub(self.credit_rx)
        }
    }
}

/// Clamp a peer-proposed frame size into the legal range
fn negotiate_mtu(local: u16, proposed: u16) -> u16 {
    local.min(proposed.clamp(RFCOMM_MIN_MTU, RFCOMM_MAX_MTU))
}

impl RfcommManager {
    pub(crate) fn port(&self, handle: PortHandle) -> Option<&Port> {
        let index = (handle.0 as usize).checked_sub(1)?;
        self.ports.get(index).and_then(|p| p.as_ref())
    }

    pub(crate) fn port_mut(&mut self, handle: PortHandle) -> Option<&mut Port> {
        let index = (handle.0 as usize).checked_sub(1)?;
        self.ports.get_mut(index).and_then(|p| p.as_mut())
    }

    pub(crate) fn ports_on_mux(&self, mux: usize) -> Vec<PortHandle> {
        self.ports
            .iter()
            .flatten()
            .filter(|p| p.mux == Some(mux))
            .map(|p| p.handle)
            .collect()
    }

    fn flow(&self, handle: PortHandle) -> FlowMode {
        self.port(handle)
            .and_then(|p| p.mux)
            .and_then(|m| self.mcb(m))
            .map(|m| m.flow)
            .unwrap_or(FlowMode::Undefined)
    }

    /// Bind a listening server port to an inbound DLCI
    pub(crate) fn attach_server_port(&mut self, mux: usize, dlci: u8) -> Option<PortHandle> {
        let (peer, l2cap_mtu) = self.mcb(mux).map(|m| (m.peer, m.l2cap_mtu))?;
        let scn = dlci >> 1;
        let handle = self
            .ports
            .iter()
            .flatten()
            .find(|p| p.is_server && p.mux.is_none() && p.state == PortState::Opening && p.scn == scn)
            .map(|p| p.handle)?;

        let credits = self.config.credits_rx_max;
        let port = self.port_mut(handle)?;
        port.mux = Some(mux);
        port.dlci = dlci;
        port.peer = Some(peer);
        port.credit_rx = credits;
        let frame_limit = l2cap_mtu.saturating_sub(RFCOMM_DATA_OVERHEAD + RFCOMM_FCS_LEN);
        if frame_limit >= RFCOMM_MIN_MTU && port.mtu > frame_limit {
            port.mtu = frame_limit;
        }
        port.peer_mtu = port.mtu;

        if let Some(mcb) = self.mcb_mut(mux) {
            mcb.ports.insert(dlci, handle);
        }
        self.mux_stop_timer(mux);
        debug!("{} accepted DLCI {} from {}", handle, dlci, peer);
        Some(handle)
    }

    fn port_start_timer(&mut self, handle: PortHandle, kind: PortTimerKind) {
        let timeout = match kind {
            PortTimerKind::T1 => self.config.t1_timeout,
            PortTimerKind::T2 => self.config.t2_timeout,
        };
        if let Some(port) = self.port_mut(handle) {
            port.timer_kind = Some(kind);
            self.timers.arm(RfcTimer::Port(handle), timeout);
        }
    }

    fn port_stop_timer(&mut self, handle: PortHandle) {
        if let Some(port) = self.port_mut(handle) {
            port.timer_kind = None;
        }
        self.timers.cancel(&RfcTimer::Port(handle));
    }

    /// Queue an event notification, honouring the port's event mask
    pub(crate) fn port_notify(&mut self, handle: PortHandle, events: PortEvents) {
        let Some(port) = self.port(handle) else {
            return;
        };
        let events = events & port.event_mask;
        if events.is_empty() {
            return;
        }
        if let Some(callback) = port.event_callback.clone() {
            self.pending.push(Notify::Event(callback, handle, events));
        }
    }

    fn port_notify_mgmt(&mut self, handle: PortHandle, status: PortStatus) {
        if let Some(callback) = self.port(handle).and_then(|p| p.mgmt_callback.clone()) {
            self.pending.push(Notify::Mgmt(callback, handle, status));
        }
    }

    /// Send a frame on this port's DLCI
    fn port_send_frame(&mut self, handle: PortHandle, build: impl FnOnce(u8, bool) -> RfcommFrame, is_command: bool) -> SendStatus {
        let Some((mux, dlci)) = self.port(handle).and_then(|p| p.mux.map(|m| (m, p.dlci))) else {
            return SendStatus::Failed;
        };
        let Some(cr) = self.mcb(mux).map(|m| m.cr(is_command)) else {
            return SendStatus::Failed;
        };
        self.mux_send_frame(mux, build(dlci, cr))
    }

    fn port_send_mux_command(&mut self, handle: PortHandle, frame: MuxFrame) {
        if let Some(mux) = self.port(handle).and_then(|p| p.mux) {
            self.mux_send_command(mux, frame);
        }
    }

    fn port_send_msc(&mut self, handle: PortHandle, is_command: bool, break_duration: Option<u8>) {
        let Some(port) = self.port(handle) else {
            return;
        };
        let fc = self.flow(handle) == FlowMode::Ts710 && port.user_fc;
        let command = MuxCommand::Msc {
            dlci: port.dlci,
            signals: port.local_signals.to_msc(fc),
            break_duration,
        };
        if let Some(port) = self.port_mut(handle) {
            port.fc_signalled = fc;
        }
        let frame = if is_command {
            MuxFrame::command(command)
        } else {
            MuxFrame::response(command)
        };
        self.port_send_mux_command(handle, frame);
        if is_command {
            self.port_start_timer(handle, PortTimerKind::T2);
        }
    }

    /// Port state machine
    pub(crate) fn port_event(&mut self, handle: PortHandle, event: PortEvent) {
        let Some(state) = self.port(handle).map(|p| p.state) else {
            return;
        };
        trace!("{} state {:?} event {:?}", handle, state, event);

        match state {
            PortState::Idle => {}
            PortState::Opening => self.port_sm_opening(handle, event),
            PortState::ParamNeg => self.port_sm_param_neg(handle, event),
            PortState::EstablishWait => self.port_sm_establish_wait(handle, event),
            PortState::Opened => self.port_sm_opened(handle, event),
            PortState::Closing => self.port_sm_closing(handle, event),
        }
    }

    fn port_sm_opening(&mut self, handle: PortHandle, event: PortEvent) {
        match event {
            PortEvent::OpenReq => {
                if self.port(handle).map(|p| p.close_pending).unwrap_or(false) {
                    self.port_closed(handle, PortStatus::Closed);
                    return;
                }
                self.port_send_pn_command(handle);
            }
            PortEvent::PnInd(pn) => {
                self.port_answer_pn(handle, pn);
                if let Some(port) = self.port_mut(handle) {
                    port.state = PortState::ParamNeg;
                }
            }
            PortEvent::EstabInd => self.port_accept_dlc(handle),
            PortEvent::CloseReq => {
                let listening = self
                    .port(handle)
                    .map(|p| p.is_server && p.mux.is_none())
                    .unwrap_or(false);
                if listening {
                    self.release_port(handle);
                } else if let Some(port) = self.port_mut(handle) {
                    port.close_pending = true;
                }
            }
            PortEvent::DmInd => self.port_closed(handle, PortStatus::StartFailed),
            PortEvent::RelInd => {
                self.port_send_frame(handle, RfcommFrame::dm, false);
            }
            other => trace!("{} ignoring {:?} while opening", handle, other),
        }
    }

    fn port_sm_param_neg(&mut self, handle: PortHandle, event: PortEvent) {
        match event {
            PortEvent::PnCnf(pn) => {
                self.port_stop_timer(handle);
                if self.port(handle).map(|p| p.close_pending).unwrap_or(false) {
                    self.port_closed(handle, PortStatus::Closed);
                    return;
                }
                self.port_apply_pn_response(handle, pn);
                self.port_send_frame(handle, RfcommFrame::sabme, true);
                if let Some(port) = self.port_mut(handle) {
                    port.state = PortState::EstablishWait;
                }
                self.port_start_timer(handle, PortTimerKind::T1);
            }
            PortEvent::PnInd(pn) => self.port_answer_pn(handle, pn),
            PortEvent::EstabInd => self.port_accept_dlc(handle),
            PortEvent::DmInd => {
                self.port_stop_timer(handle);
                self.port_closed(handle, PortStatus::StartFailed);
            }
            PortEvent::CloseReq => {
                let is_server = self.port(handle).map(|p| p.is_server).unwrap_or(false);
                if is_server {
                    self.port_send_frame(handle, RfcommFrame::dm, false);
                    self.port_closed(handle, PortStatus::Closed);
                } else if let Some(port) = self.port_mut(handle) {
                    port.close_pending = true;
                }
            }
            PortEvent::Timeout => self.port_timeout(handle),
            other => trace!("{} ignoring {:?} during negotiation", handle, other),
        }
    }

    fn port_sm_establish_wait(&mut self, handle: PortHandle, event: PortEvent) {
        match event {
            PortEvent::EstabCnf => {
                self.port_stop_timer(handle);
                if self.port(handle).map(|p| p.close_pending).unwrap_or(false) {
                    self.port_start_disc(handle);
                    return;
                }
                self.port_opened(handle);
            }
            PortEvent::DmInd => {
                self.port_stop_timer(handle);
                self.port_closed(handle, PortStatus::StartFailed);
            }
            PortEvent::CloseReq => {
                if let Some(port) = self.port_mut(handle) {
                    port.close_pending = true;
                }
            }
            PortEvent::Timeout => self.port_timeout(handle),
            other => trace!("{} ignoring {:?} awaiting UA", handle, other),
        }
    }

    fn port_sm_opened(&mut self, handle: PortHandle, event: PortEvent) {
        match event {
            PortEvent::DataInd { info, credits } => self.port_data_ind(handle, info, credits),
            PortEvent::MscInd {
                signals,
                break_duration,
            } => self.port_msc_ind(handle, signals, break_duration),
            PortEvent::MscCnf => {
                let waiting_open = self
                    .port(handle)
                    .map(|p| !p.msc_cnf_received)
                    .unwrap_or(false);
                if self.port(handle).and_then(|p| p.timer_kind) == Some(PortTimerKind::T2) {
                    self.port_stop_timer(handle);
                }
                if waiting_open {
                    if let Some(port) = self.port_mut(handle) {
                        port.msc_cnf_received = true;
                    }
                    self.port_check_connected(handle);
                }
            }
            PortEvent::RpnInd(settings) => self.port_rpn_ind(handle, settings),
            PortEvent::RpnCnf(settings) => self.port_rpn_cnf(handle, settings),
            PortEvent::RlsInd(status) => {
                let Some(dlci) = self.port_mut(handle).map(|port| {
                    port.line_status |= LineStatus::from_rls(status);
                    port.dlci
                }) else {
                    return;
                };
                self.port_send_mux_command(
                    handle,
                    MuxFrame::response(MuxCommand::Rls { dlci, status }),
                );
                if LineStatus::from_rls(status) != LineStatus::empty() {
                    self.port_notify(handle, PortEvents::ERR);
                }
            }
            PortEvent::PnInd(pn) => self.port_answer_pn(handle, pn),
            PortEvent::RelInd => {
                self.port_send_frame(handle, RfcommFrame::ua, false);
                self.port_closed(handle, PortStatus::Closed);
            }
            PortEvent::DmInd => self.port_closed(handle, PortStatus::Closed),
            PortEvent::CloseReq => self.port_start_disc(handle),
            PortEvent::Timeout => self.port_timeout(handle),
            other => trace!("{} ignoring {:?} while open", handle, other),
        }
    }

    fn port_sm_closing(&mut self, handle: PortHandle, event: PortEvent) {
        match event {
            PortEvent::EstabCnf | PortEvent::DmInd | PortEvent::Timeout => {
                self.port_stop_timer(handle);
                self.port_closed(handle, PortStatus::Closed);
            }
            PortEvent::RelInd => {
                self.port_send_frame(handle, RfcommFrame::ua, false);
                self.port_stop_timer(handle);
                self.port_closed(handle, PortStatus::Closed);
            }
            other => trace!("{} ignoring {:?} while closing", handle, other),
        }
    }

    fn port_timeout(&mut self, handle: PortHandle) {
        warn!("{} peer did not answer", handle);
        match self.port(handle).and_then(|p| p.mux) {
            Some(mux) => self.mux_fail(mux, PortStatus::PeerTimeout),
            None => self.port_closed(handle, PortStatus::PeerTimeout),
        }
    }

    fn port_send_pn_command(&mut self, handle: PortHandle) {
        let flow = self.flow(handle);
        let credits = self.config.credits_rx_max;
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        let credit_flow = flow != FlowMode::Ts710;
        if credit_flow {
            port.credit_rx = credits;
        }
        let pn = PnParams {
            dlci: port.dlci,
            cl: if credit_flow {
                RFCOMM_PN_CONV_LAYER_CBFC_I
            } else {
                RFCOMM_PN_CONV_LAYER_TYPE_1
            },
            priority: RFCOMM_PN_PRIORITY_0,
            t1: 0,
            mtu: port.mtu,
            n2: 0,
            k: if credit_flow { credits.min(RFCOMM_K_MAX as u16) as u8 } else { 0 },
        };
        port.state = PortState::ParamNeg;
        let mux = port.mux;

        if let Some(mux) = mux {
            self.mux_send_pn(mux, true, pn);
        }
        self.port_start_timer(handle, PortTimerKind::T2);
    }

    /// Responder side of parameter negotiation
    fn port_answer_pn(&mut self, handle: PortHandle, pn: PnParams) {
        let flow = self.flow(handle);
        let credits = self.config.credits_rx_max;
        let Some(port) = self.port_mut(handle) else {
            return;
        };

        // Once open the frame size is fixed; echo what was agreed
        if port.state != PortState::Opened {
            port.peer_mtu = negotiate_mtu(port.mtu, pn.mtu);
        }
        let credit_flow = flow == FlowMode::Credit;
        if credit_flow && port.state != PortState::Opened {
            port.credit_tx = pn.k as u16;
            port.credit_rx = credits;
            port.peer_fc = port.credit_tx == 0;
        }

        let response = PnParams {
            dlci: pn.dlci,
            cl: if credit_flow {
                RFCOMM_PN_CONV_LAYER_CBFC_R
            } else {
                RFCOMM_PN_CONV_LAYER_TYPE_1
            },
            priority: pn.priority,
            t1: 0,
            mtu: port.peer_mtu,
            n2: 0,
            k: if credit_flow { port.credit_rx.min(RFCOMM_K_MAX as u16) as u8 } else { 0 },
        };
        info!(
            "{} PN dlci {} mtu {} -> {} flow {:?}",
            handle, pn.dlci, pn.mtu, response.mtu, flow
        );

        if let Some(mux) = port.mux {
            self.mux_send_pn(mux, false, response);
        }
    }

    fn port_apply_pn_response(&mut self, handle: PortHandle, pn: PnParams) {
        let flow = self.flow(handle);
        let Some(port) = self.port_mut(handle) else {
            return;
        };

        let expected_cl = match flow {
            FlowMode::Credit => RFCOMM_PN_CONV_LAYER_CBFC_R,
            _ => RFCOMM_PN_CONV_LAYER_TYPE_1,
        };
        if pn.cl != expected_cl {
            // Some stacks answer with an unexpected convergence layer; carry on
            debug!("{} PN response cl {:#04x}, expected {:#04x}", handle, pn.cl, expected_cl);
        }

        port.peer_mtu = negotiate_mtu(port.mtu, pn.mtu);
        if flow == FlowMode::Credit {
            port.credit_tx = pn.k as u16;
            port.peer_fc = port.credit_tx == 0;
        }
        info!(
            "{} negotiated mtu {} credits {}",
            handle, port.peer_mtu, port.credit_tx
        );
    }

    /// Peer opened the DLC on a server port
    fn port_accept_dlc(&mut self, handle: PortHandle) {
        self.port_send_frame(handle, RfcommFrame::ua, false);
        self.port_opened(handle);
    }

    fn port_opened(&mut self, handle: PortHandle) {
        let flow = self.flow(handle);
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        port.state = PortState::Opened;
        if flow == FlowMode::Credit {
            port.peer_fc = port.credit_tx == 0;
        }
        let send_rpn = !port.is_server
            && (port.uuid == UUID_SERVCLASS_DIALUP_NETWORKING || port.uuid == UUID_SERVCLASS_FAX);
        info!("{} DLCI {} opened", handle, port.dlci);

        self.port_notify_mgmt(handle, PortStatus::Success);
        if send_rpn {
            self.port_send_rpn(handle, RPN_PM_MASK);
        } else {
            self.port_send_msc(handle, true, None);
        }
    }

    fn port_send_rpn(&mut self, handle: PortHandle, mask: u16) {
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        port.rpn_pending = Some(mask);
        let command = MuxCommand::Rpn {
            dlci: port.dlci,
            settings: Some((port.settings, mask)),
        };
        self.port_send_mux_command(handle, MuxFrame::command(command));
        self.port_start_timer(handle, PortTimerKind::T2);
    }

    fn port_check_connected(&mut self, handle: PortHandle) {
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        if port.msc_ind_received && port.msc_cnf_received && !port.connected_reported {
            port.connected_reported = true;
            self.port_notify(handle, PortEvents::CONNECTED);
        }
    }

    fn port_msc_ind(&mut self, handle: PortHandle, signals: u8, break_duration: Option<u8>) {
        let flow = self.flow(handle);
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        let (new_signals, fc) = ModemSignals::from_msc(signals);
        let changed = port.peer_signals ^ new_signals;
        port.peer_signals = new_signals;
        port.msc_ind_received = true;

        let mut events = PortEvents::empty();
        if changed.contains(ModemSignals::RTS_CTS) {
            events |= PortEvents::CTS;
        }
        if changed.contains(ModemSignals::DTR_DSR) {
            events |= PortEvents::DSR;
        }
        if changed.contains(ModemSignals::DCD) {
            events |= PortEvents::RLSD;
        }
        if changed.contains(ModemSignals::RI) && new_signals.contains(ModemSignals::RI) {
            events |= PortEvents::RING;
        }
        if break_duration.is_some() {
            events |= PortEvents::BREAK;
        }

        let mut unblocked = false;
        if flow == FlowMode::Ts710 {
            unblocked = port.msc_fc && !fc;
            port.msc_fc = fc;
            port.peer_fc = fc;
        }
        let dlci = port.dlci;

        self.port_send_mux_command(
            handle,
            MuxFrame::response(MuxCommand::Msc {
                dlci,
                signals,
                break_duration,
            }),
        );
        self.port_notify(handle, events);
        self.port_check_connected(handle);
        if unblocked {
            self.port_try_send(handle);
        }
    }

    fn port_rpn_ind(&mut self, handle: PortHandle, requested: Option<(PortSettings, u16)>) {
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        let reply = match requested {
            None => (port.settings, RPN_PM_MASK),
            Some((settings, mask)) => {
                let rx_char1 = port.settings.rx_char1;
                port.settings = PortSettings { rx_char1, ..settings };
                (settings, mask)
            }
        };
        let dlci = port.dlci;
        self.port_send_mux_command(
            handle,
            MuxFrame::response(MuxCommand::Rpn {
                dlci,
                settings: Some(reply),
            }),
        );
    }

    fn port_rpn_cnf(&mut self, handle: PortHandle, reply: Option<(PortSettings, u16)>) {
        let Some(requested) = self.port_mut(handle).and_then(|p| p.rpn_pending.take()) else {
            return;
        };
        self.port_stop_timer(handle);

        let accepted = reply.map(|(_, mask)| mask).unwrap_or(0);
        if accepted & requested != requested {
            warn!(
                "{} peer rejected port settings (asked {:#06x}, got {:#06x})",
                handle, requested, accepted
            );
            self.port_notify_mgmt(handle, PortStatus::PortNegFailed);
            self.port_start_disc(handle);
            return;
        }

        let first = self.port(handle).map(|p| !p.msc_cnf_received).unwrap_or(false);
        if first {
            self.port_send_msc(handle, true, None);
        }
    }

    fn port_start_disc(&mut self, handle: PortHandle) {
        if let Some(port) = self.port_mut(handle) {
            port.state = PortState::Closing;
            port.tx_queue.clear();
            port.tx_queue_size = 0;
        }
        self.port_send_frame(handle, RfcommFrame::disc, true);
        let timeout = self.config.disc_timeout;
        if let Some(port) = self.port_mut(handle) {
            port.timer_kind = Some(PortTimerKind::T1);
            self.timers.arm(RfcTimer::Port(handle), timeout);
        }
    }

    /// The DLC is gone. Report `status`, then free the port or put a server
    /// back to listening.
    pub(crate) fn port_closed(&mut self, handle: PortHandle, status: PortStatus) {
        self.port_stop_timer(handle);
        let Some(port) = self.port(handle) else {
            return;
        };
        let was_open = matches!(port.state, PortState::Opened | PortState::Closing);
        let mux = port.mux;
        let dlci = port.dlci;

        if was_open && status != PortStatus::Closed {
            self.port_line_failed(handle);
        }
        self.port_notify_mgmt(handle, status);
        self.port_notify(handle, PortEvents::CLOSED);

        if let Some(mux) = mux {
            if let Some(mcb) = self.mcb_mut(mux) {
                if mcb.ports.get(&dlci) == Some(&handle) {
                    mcb.ports.remove(&dlci);
                }
            }
        }

        let relisten = self
            .port(handle)
            .map(|p| p.is_server && !p.user_closed)
            .unwrap_or(false);
        if relisten {
            if let Some(port) = self.port_mut(handle) {
                port.reset_for_listen();
            }
            debug!("{} listening again", handle);
        } else {
            self.release_port(handle);
        }

        if let Some(mux) = mux {
            self.mux_check_idle(mux);
        }
    }

    /// Connection lost underneath an open port
    fn port_line_failed(&mut self, handle: PortHandle) {
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        let lost = port.peer_signals;
        port.peer_signals = ModemSignals::empty();
        port.line_status |= LineStatus::FAILED;

        let mut events = PortEvents::ERR;
        if lost.contains(ModemSignals::RTS_CTS) {
            events |= PortEvents::CTS;
        }
        if lost.contains(ModemSignals::DTR_DSR) {
            events |= PortEvents::DSR;
        }
        if lost.contains(ModemSignals::DCD) {
            events |= PortEvents::RLSD;
        }
        self.port_notify(handle, events);
    }

    pub(crate) fn release_port(&mut self, handle: PortHandle) {
        self.timers.cancel(&RfcTimer::Port(handle));
        if let Some(index) = (handle.0 as usize).checked_sub(1) {
            if let Some(slot) = self.ports.get_mut(index) {
                if slot.take().is_some() {
                    debug!("{} released", handle);
                }
            }
        }
    }

    // Data path

    fn port_data_ind(&mut self, handle: PortHandle, info: Vec<u8>, credits: Option<u8>) {
        let flow = self.flow(handle);
        if let Some(credits) = credits {
            self.port_add_credits(handle, credits);
        }
        if info.is_empty() {
            return;
        }

        let critical_bytes = self.config.rx_critical_bytes;
        let critical_frames = self.config.rx_critical_frames;
        let high_watermark = self.config.rx_high_watermark;
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        if flow == FlowMode::Credit {
            port.credit_rx = port.credit_rx.saturating_sub(1);
        }

        if let Some(callback) = port.data_callback.clone() {
            self.pending.push(Notify::Data(callback, handle, info));
            self.port_flow_control_peer(handle);
            return;
        }

        if port.rx_queue_size + info.len() > critical_bytes
            || port.rx_queue.len() + 1 > critical_frames
        {
            warn!(
                "{} receive queue full ({} bytes), dropping {} bytes",
                handle,
                port.rx_queue_size,
                info.len()
            );
            port.line_status |= LineStatus::OVERRUN;
            let dlci = port.dlci;
            self.port_send_mux_command(
                handle,
                MuxFrame::command(MuxCommand::Rls {
                    dlci,
                    status: LineStatus::OVERRUN.to_rls(),
                }),
            );
            self.port_notify(handle, PortEvents::ERR | PortEvents::OVERRUN);
            return;
        }

        let mut events = PortEvents::RXCHAR;
        if let Some(flag) = port.settings.rx_char1 {
            if info.contains(&flag) {
                events |= PortEvents::RXFLAG;
            }
        }
        port.rx_queue_size += info.len();
        port.rx_queue.push_back(info);
        if port.rx_queue_size > high_watermark && !port.user_fc {
            debug!("{} receive queue above high watermark", handle);
            port.user_fc = true;
        }

        self.port_notify(handle, events);
        self.port_flow_control_peer(handle);
    }

    /// Tell the peer about our receive state: credits or an MSC FC bit
    pub(crate) fn port_flow_control_peer(&mut self, handle: PortHandle) {
        let flow = self.flow(handle);
        let credits_max = self.config.credits_rx_max;
        let credits_low = self.config.credits_rx_low;
        let Some(port) = self.port(handle) else {
            return;
        };
        if port.state != PortState::Opened {
            return;
        }

        match flow {
            FlowMode::Credit => {
                let owed = port.owed_credits(credits_max);
                if owed > 0 && port.credit_rx <= credits_low {
                    let give = owed.min(u8::MAX as u16);
                    if let Some(port) = self.port_mut(handle) {
                        port.credit_rx += give;
                    }
                    trace!("{} granting {} credits", handle, give);
                    self.port_send_frame(
                        handle,
                        |dlci, cr| RfcommFrame::uih(dlci, cr, Vec::new(), Some(give as u8)),
                        true,
                    );
                }
            }
            FlowMode::Ts710 => {
                if port.user_fc != port.fc_signalled {
                    self.port_send_msc(handle, true, None);
                }
            }
            FlowMode::Undefined => {}
        }
    }

    fn port_add_credits(&mut self, handle: PortHandle, credits: u8) {
        let Some(port) = self.port_mut(handle) else {
            return;
        };
        port.credit_tx = port.credit_tx.saturating_add(credits as u16);
        port.peer_fc = port.credit_tx == 0;
        trace!("{} received {} credits, now {}", handle, credits, port.credit_tx);
        self.port_try_send(handle);
    }

    /// Move queued frames to the multiplexer while the peer can take them
    pub(crate) fn port_try_send(&mut self, handle: PortHandle) {
        let flow = self.flow(handle);
        let credits_max = self.config.credits_rx_max;
        let mut sent_any = false;

        loop {
            let Some(port) = self.port(handle) else {
                return;
            };
            if port.state != PortState::Opened || port.tx_queue.is_empty() || port.peer_fc {
                break;
            }
            let Some(mux) = port.mux else {
                break;
            };
            let Some(mcb) = self.mcb(mux) else {
                break;
            };
            if !mcb.peer_ready {
                break;
            }
            if mcb.congested {
                if !port.congestion_reported {
                    if let Some(port) = self.port_mut(handle) {
                        port.congestion_reported = true;
                    }
                    self.port_notify(handle, PortEvents::CONGESTED);
                }
                break;
            }

            let Some(port) = self.port_mut(handle) else {
                return;
            };
            let Some(data) = port.tx_queue.pop_front() else {
                break;
            };
            port.tx_queue_size -= data.len();

            let mut credits = None;
            if flow == FlowMode::Credit {
                port.credit_tx = port.credit_tx.saturating_sub(1);
                port.peer_fc = port.credit_tx == 0;
                let owed = port.owed_credits(credits_max).min(u8::MAX as u16);
                if owed > 0 {
                    port.credit_rx += owed;
                    credits = Some(owed as u8);
                }
            }

            let status = self.port_send_frame(
                handle,
                move |dlci, cr| RfcommFrame::uih(dlci, cr, data, credits),
                true,
            );
            sent_any = true;
            if status == SendStatus::Congested {
                if let Some(port) = self.port_mut(handle) {
                    port.congestion_reported = true;
                }
                self.port_notify(handle, PortEvents::CONGESTED);
                break;
            }
        }

        if sent_any && self.port(handle).map(|p| p.tx_queue.is_empty()).unwrap_or(false) {
            self.port_notify(handle, PortEvents::TXEMPTY);
        }
    }

    /// Queue application data for sending, segmented to the negotiated frame size
    pub(crate) fn port_write(&mut self, handle: PortHandle, data: &[u8]) -> PortResult<usize> {
        let tx_critical = self.config.tx_critical_bytes;
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        if port.state != PortState::Opened {
            return Err(PortError::NotOpened);
        }
        if data.is_empty() {
            return Ok(0);
        }
        if port.tx_queue_size + data.len() > tx_critical {
            warn!("{} transmit queue full", handle);
            return Err(PortError::TxQueueFull);
        }

        let frame_size = port.peer_mtu.max(1) as usize;
        for chunk in data.chunks(frame_size) {
            port.tx_queue.push_back(chunk.to_vec());
        }
        port.tx_queue_size += data.len();

        self.port_try_send(handle);
        Ok(data.len())
    }

    /// Copy received data into `buf`, consuming it from the receive queue
    pub(crate) fn port_read(&mut self, handle: PortHandle, buf: &mut [u8]) -> PortResult<usize> {
        let low_watermark = self.config.rx_low_watermark;
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;

        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = port.rx_queue.front_mut() else {
                break;
            };
            let take = front.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&front[..take]);
            copied += take;
            if take == front.len() {
                port.rx_queue.pop_front();
            } else {
                front.drain(..take);
            }
        }
        port.rx_queue_size -= copied;

        if port.user_fc && port.rx_queue_size < low_watermark {
            debug!("{} receive queue drained, resuming peer", handle);
            port.user_fc = false;
            self.port_flow_control_peer(handle);
        }
        Ok(copied)
    }

    pub(crate) fn port_set_modem_signals(&mut self, handle: PortHandle, signals: ModemSignals) -> PortResult<()> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        if port.local_signals == signals {
            return Ok(());
        }
        port.local_signals = signals;
        if port.state == PortState::Opened {
            self.port_send_msc(handle, true, None);
        }
        Ok(())
    }

    pub(crate) fn port_send_break(&mut self, handle: PortHandle, duration: u8) -> PortResult<()> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        if port.state != PortState::Opened {
            return Err(PortError::NotOpened);
        }
        self.port_send_msc(handle, true, Some(duration.min(0x0F)));
        Ok(())
    }

    pub(crate) fn port_set_settings(&mut self, handle: PortHandle, settings: PortSettings) -> PortResult<()> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        let line_changed = PortSettings {
            rx_char1: None,
            ..port.settings
        } != PortSettings {
            rx_char1: None,
            ..settings
        };
        port.settings = settings;
        if port.state == PortState::Opened && line_changed {
            self.port_send_rpn(handle, RPN_PM_MASK);
        }
        Ok(())
    }
}
