//! RFCOMM multiplexer control block and its state machine

use super::constants::*;
use super::frame::{MuxCommand, MuxFrame, PnParams, RfcommFrame};
use super::manager::{RfcTimer, RfcommManager};
use super::port::PortEvent;
use super::types::*;
use crate::bearer::{BearerId, SendStatus};
use crate::gap::BdAddr;
use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, VecDeque};

/// What the single multiplexer timer is currently guarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuxTimerKind {
    /// SABME or DISC on DLCI 0 awaiting UA
    T1,
    /// No port activity
    Inactivity,
}

/// Events driving the multiplexer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MuxEvent {
    StartReq,
    ConnCnf,
    ConnInd,
    SabmeInd,
    UaInd,
    DmInd,
    DiscInd,
    CloseReq,
    Timeout,
    L2capClosed,
}

/// Multiplexer control block, one per peer
#[derive(Debug)]
pub(crate) struct Mcb {
    pub peer: BdAddr,
    pub psm: u16,
    pub bearer: Option<BearerId>,
    pub local_cid: u16,
    pub l2cap_mtu: u16,
    pub state: MuxState,
    pub is_initiator: bool,
    pub flow: FlowMode,
    /// Cleared by FCOFF, set by FCON
    pub peer_ready: bool,
    /// DLCI to port handle
    pub ports: BTreeMap<u8, PortHandle>,
    /// Frames the bearer refused while congested
    pub tx_queue: VecDeque<Vec<u8>>,
    pub congested: bool,
    /// Ports were queued while the multiplexer was shutting down
    pub restart_required: bool,
    pub timer_kind: Option<MuxTimerKind>,
}

impl Mcb {
    pub fn new(peer: BdAddr, psm: u16) -> Self {
        Self {
            peer,
            psm,
            bearer: None,
            local_cid: 0,
            l2cap_mtu: crate::bearer::BR_EDR_MIN_MTU,
            state: MuxState::Idle,
            is_initiator: false,
            flow: FlowMode::Undefined,
            peer_ready: true,
            ports: BTreeMap::new(),
            tx_queue: VecDeque::new(),
            congested: false,
            restart_required: false,
            timer_kind: None,
        }
    }

    /// C/R bit for a frame we send
    pub fn cr(&self, is_command: bool) -> bool {
        self.is_initiator == is_command
    }
}

impl RfcommManager {
    pub(crate) fn mcb(&self, mux: usize) -> Option<&Mcb> {
        self.muxes.get(mux).and_then(|m| m.as_ref())
    }

    pub(crate) fn mcb_mut(&mut self, mux: usize) -> Option<&mut Mcb> {
        self.muxes.get_mut(mux).and_then(|m| m.as_mut())
    }

    pub(crate) fn find_mux_by_peer(&self, peer: &BdAddr) -> Option<usize> {
        self.muxes
            .iter()
            .position(|m| m.as_ref().map(|m| m.peer == *peer).unwrap_or(false))
    }

    pub(crate) fn find_mux_by_bearer(&self, id: BearerId) -> Option<usize> {
        self.muxes
            .iter()
            .position(|m| m.as_ref().and_then(|m| m.bearer) == Some(id))
    }

    pub(crate) fn alloc_mux(&mut self, peer: BdAddr, psm: u16) -> PortResult<usize> {
        if let Some(slot) = self.muxes.iter().position(|m| m.is_none()) {
            self.muxes[slot] = Some(Mcb::new(peer, psm));
            return Ok(slot);
        }
        if self.muxes.len() < self.config.max_muxes {
            self.muxes.push(Some(Mcb::new(peer, psm)));
            return Ok(self.muxes.len() - 1);
        }
        warn!("no free multiplexer for {}", peer);
        Err(PortError::NoResources)
    }

    fn release_mux(&mut self, mux: usize) {
        self.timers.cancel(&RfcTimer::Mux(mux));
        if let Some(mcb) = self.muxes.get_mut(mux).and_then(|m| m.take()) {
            info!("RFCOMM multiplexer to {} released", mcb.peer);
        }
    }

    pub(crate) fn mux_start_timer(&mut self, mux: usize, kind: MuxTimerKind) {
        let timeout = match kind {
            MuxTimerKind::T1 => self.config.t1_timeout,
            MuxTimerKind::Inactivity => {
                let initial = self
                    .mcb(mux)
                    .map(|m| m.ports.is_empty() && m.state != MuxState::Connected)
                    .unwrap_or(false);
                if initial {
                    self.config.mcb_init_inactivity
                } else {
                    self.config.mcb_release_inactivity
                }
            }
        };
        self.mux_start_timer_for(mux, kind, timeout);
    }

    pub(crate) fn mux_start_timer_for(
        &mut self,
        mux: usize,
        kind: MuxTimerKind,
        timeout: std::time::Duration,
    ) {
        if let Some(mcb) = self.mcb_mut(mux) {
            mcb.timer_kind = Some(kind);
            self.timers.arm(RfcTimer::Mux(mux), timeout);
        }
    }

    pub(crate) fn mux_stop_timer(&mut self, mux: usize) {
        if let Some(mcb) = self.mcb_mut(mux) {
            mcb.timer_kind = None;
        }
        self.timers.cancel(&RfcTimer::Mux(mux));
    }

    /// Hand one frame to the bearer, queueing it while the channel is congested
    pub(crate) fn mux_send_frame(&mut self, mux: usize, frame: RfcommFrame) -> SendStatus {
        let bytes = frame.serialize();
        let bearer = self.bearer.clone();
        let Some(mcb) = self.mcb_mut(mux) else {
            return SendStatus::Failed;
        };
        let Some(id) = mcb.bearer else {
            return SendStatus::Failed;
        };

        if mcb.congested || !mcb.tx_queue.is_empty() {
            mcb.tx_queue.push_back(bytes);
            return SendStatus::Congested;
        }

        trace!("RFCOMM tx {:?} dlci {} ({} bytes)", frame.frame_type, frame.dlci, bytes.len());
        match bearer.send(id, &bytes) {
            SendStatus::Ok => SendStatus::Ok,
            SendStatus::Congested => {
                debug!("RFCOMM bearer {} congested", id);
                mcb.congested = true;
                mcb.tx_queue.push_back(bytes);
                SendStatus::Congested
            }
            SendStatus::Failed => {
                error!("RFCOMM bearer {} rejected frame", id);
                SendStatus::Failed
            }
        }
    }

    /// Send a multiplexer command or response on DLCI 0
    pub(crate) fn mux_send_command(&mut self, mux: usize, frame: MuxFrame) {
        let Some(cr) = self.mcb(mux).map(|m| m.cr(true)) else {
            return;
        };
        let info = frame.serialize();
        self.mux_send_frame(mux, RfcommFrame::uih(RFCOMM_MX_DLCI, cr, info, None));
    }

    pub(crate) fn mux_send_pn(&mut self, mux: usize, is_command: bool, pn: PnParams) {
        let frame = if is_command {
            MuxFrame::command(MuxCommand::Pn(pn))
        } else {
            MuxFrame::response(MuxCommand::Pn(pn))
        };
        self.mux_send_command(mux, frame);
    }

    /// Drain frames queued during congestion
    pub(crate) fn mux_flush(&mut self, mux: usize) {
        let bearer = self.bearer.clone();
        let Some(mcb) = self.mcb_mut(mux) else {
            return;
        };
        let Some(id) = mcb.bearer else {
            return;
        };

        mcb.congested = false;
        while let Some(bytes) = mcb.tx_queue.pop_front() {
            match bearer.send(id, &bytes) {
                SendStatus::Ok => {}
                SendStatus::Congested => {
                    mcb.tx_queue.push_front(bytes);
                    mcb.congested = true;
                    return;
                }
                SendStatus::Failed => {
                    error!("RFCOMM bearer {} failed while flushing", id);
                    mcb.tx_queue.clear();
                    return;
                }
            }
        }
    }

    /// Multiplexer state machine
    pub(crate) fn mux_event(&mut self, mux: usize, event: MuxEvent) {
        let Some(state) = self.mcb(mux).map(|m| m.state) else {
            return;
        };
        debug!("RFCOMM mux {} state {:?} event {:?}", mux, state, event);

        match (state, event) {
            (MuxState::Idle, MuxEvent::StartReq) => self.mux_connect(mux),

            (MuxState::Idle, MuxEvent::ConnInd) => {
                if let Some(mcb) = self.mcb_mut(mux) {
                    mcb.is_initiator = false;
                    mcb.state = MuxState::Configured;
                }
                self.mux_start_timer(mux, MuxTimerKind::Inactivity);
            }

            (MuxState::WaitConnCnf, MuxEvent::ConnCnf) => {
                let Some(cr) = self.mcb_mut(mux).map(|mcb| {
                    mcb.state = MuxState::SabmeWaitUa;
                    mcb.cr(true)
                }) else {
                    return;
                };
                self.mux_send_frame(mux, RfcommFrame::sabme(RFCOMM_MX_DLCI, cr));
                self.mux_start_timer(mux, MuxTimerKind::T1);
            }

            (MuxState::Configured, MuxEvent::SabmeInd) => {
                let Some(cr) = self.mcb_mut(mux).map(|mcb| {
                    mcb.state = MuxState::Connected;
                    mcb.cr(false)
                }) else {
                    return;
                };
                self.mux_send_frame(mux, RfcommFrame::ua(RFCOMM_MX_DLCI, cr));
                self.mux_stop_timer(mux);
                info!("RFCOMM multiplexer connected (responder)");

                // Client ports opened while we waited for the peer's SABME
                let idle = self.mcb(mux).map(|m| m.ports.is_empty()).unwrap_or(true);
                if idle {
                    self.mux_start_timer_for(
                        mux,
                        MuxTimerKind::Inactivity,
                        self.config.mcb_init_inactivity,
                    );
                } else {
                    self.mux_connected(mux);
                }
            }

            (MuxState::SabmeWaitUa, MuxEvent::UaInd) => {
                self.mux_stop_timer(mux);
                if let Some(mcb) = self.mcb_mut(mux) {
                    mcb.state = MuxState::Connected;
                }
                info!("RFCOMM multiplexer connected (initiator)");
                self.mux_connected(mux);
            }

            (MuxState::SabmeWaitUa, MuxEvent::DmInd)
            | (MuxState::SabmeWaitUa, MuxEvent::DiscInd) => {
                warn!("peer refused RFCOMM multiplexer");
                self.mux_fail(mux, PortStatus::StartFailed);
            }

            (MuxState::Connected, MuxEvent::DiscInd) => {
                if let Some(cr) = self.mcb(mux).map(|m| m.cr(false)) {
                    self.mux_send_frame(mux, RfcommFrame::ua(RFCOMM_MX_DLCI, cr));
                }
                self.mux_fail(mux, PortStatus::Closed);
            }

            (MuxState::Connected, MuxEvent::CloseReq) => {
                let Some(cr) = self.mcb_mut(mux).map(|mcb| {
                    mcb.state = MuxState::DiscWaitUa;
                    mcb.cr(true)
                }) else {
                    return;
                };
                self.mux_send_frame(mux, RfcommFrame::disc(RFCOMM_MX_DLCI, cr));
                let timeout = self.config.disc_timeout;
                self.mux_start_timer_for(mux, MuxTimerKind::T1, timeout);
            }

            (MuxState::DiscWaitUa, MuxEvent::UaInd)
            | (MuxState::DiscWaitUa, MuxEvent::DmInd)
            | (MuxState::DiscWaitUa, MuxEvent::Timeout)
            | (MuxState::DiscWaitUa, MuxEvent::L2capClosed) => self.mux_closed_normally(mux),

            (MuxState::DiscWaitUa, MuxEvent::SabmeInd) => {
                // Peer wants the multiplexer back; let the close finish first
                if let Some(cr) = self.mcb(mux).map(|m| m.cr(false)) {
                    self.mux_send_frame(mux, RfcommFrame::dm(RFCOMM_MX_DLCI, cr));
                }
            }

            (MuxState::Connected, MuxEvent::Timeout) | (MuxState::Configured, MuxEvent::Timeout) => {
                let kind = self.mcb(mux).and_then(|m| m.timer_kind);
                match kind {
                    Some(MuxTimerKind::Inactivity) if state == MuxState::Connected => {
                        self.mux_event(mux, MuxEvent::CloseReq)
                    }
                    Some(MuxTimerKind::Inactivity) => self.mux_closed_normally(mux),
                    _ => self.mux_fail(mux, PortStatus::PeerTimeout),
                }
            }

            (MuxState::WaitConnCnf, MuxEvent::Timeout) | (MuxState::SabmeWaitUa, MuxEvent::Timeout) => {
                self.mux_fail(mux, PortStatus::PeerTimeout)
            }

            (MuxState::WaitConnCnf, MuxEvent::L2capClosed) => {
                self.mux_fail(mux, PortStatus::StartFailed)
            }

            (_, MuxEvent::L2capClosed) => self.mux_fail(mux, PortStatus::PeerConnectionFailed),

            (_, MuxEvent::DiscInd) => {
                if let Some(cr) = self.mcb(mux).map(|m| m.cr(false)) {
                    self.mux_send_frame(mux, RfcommFrame::dm(RFCOMM_MX_DLCI, cr));
                }
            }

            (state, event) => {
                trace!("RFCOMM mux ignoring {:?} in {:?}", event, state);
            }
        }
    }

    fn mux_connect(&mut self, mux: usize) {
        let Some((peer, psm)) = self.mcb(mux).map(|m| (m.peer, m.psm)) else {
            return;
        };
        match self.bearer.connect(peer, psm) {
            Ok(id) => {
                if let Some(mcb) = self.mcb_mut(mux) {
                    mcb.is_initiator = true;
                    mcb.bearer = Some(id);
                    mcb.state = MuxState::WaitConnCnf;
                }
                self.mux_start_timer(mux, MuxTimerKind::T1);
                debug!("RFCOMM connecting to {} on bearer {}", peer, id);
            }
            Err(e) => {
                warn!("RFCOMM L2CAP connect to {} failed: {}", peer, e);
                self.mux_fail(mux, PortStatus::StartFailed);
            }
        }
    }

    /// Multiplexer reached CONNECTED: negotiate every queued port
    fn mux_connected(&mut self, mux: usize) {
        let queued: Vec<PortHandle> = self
            .mcb(mux)
            .map(|m| m.ports.values().copied().collect())
            .unwrap_or_default();

        for handle in queued {
            if self.port(handle).map(|p| p.state) == Some(PortState::Opening) {
                self.port_event(handle, PortEvent::OpenReq);
            }
        }
        self.mux_check_idle(mux);
    }

    /// Start the inactivity timer once no port uses the multiplexer
    pub(crate) fn mux_check_idle(&mut self, mux: usize) {
        let Some(mcb) = self.mcb(mux) else {
            return;
        };
        if mcb.state != MuxState::Connected || !mcb.ports.is_empty() {
            return;
        }
        let timeout = self.config.mcb_release_inactivity;
        self.mux_start_timer_for(mux, MuxTimerKind::Inactivity, timeout);
    }

    /// Abnormal multiplexer termination: every attached port reports `status`
    pub(crate) fn mux_fail(&mut self, mux: usize, status: PortStatus) {
        let ports = self.ports_on_mux(mux);
        for handle in ports {
            self.port_closed(handle, status);
        }
        self.mux_disconnect_bearer(mux);
        self.release_mux(mux);
    }

    fn mux_closed_normally(&mut self, mux: usize) {
        let restart = self
            .mcb(mux)
            .map(|m| m.restart_required && !m.ports.is_empty())
            .unwrap_or(false);
        self.mux_disconnect_bearer(mux);

        if restart {
            // Ports were opened while closing; bring the multiplexer back up
            if let Some(mcb) = self.mcb_mut(mux) {
                mcb.state = MuxState::Idle;
                mcb.bearer = None;
                mcb.flow = FlowMode::Undefined;
                mcb.restart_required = false;
                mcb.tx_queue.clear();
                mcb.congested = false;
            }
            self.mux_event(mux, MuxEvent::StartReq);
            return;
        }

        let ports = self.ports_on_mux(mux);
        for handle in ports {
            self.port_closed(handle, PortStatus::Closed);
        }
        self.release_mux(mux);
    }

    fn mux_disconnect_bearer(&mut self, mux: usize) {
        if let Some(id) = self.mcb_mut(mux).and_then(|m| m.bearer.take()) {
            self.bearer.disconnect(id);
        }
    }

    /// Handle a multiplexer command or response received on DLCI 0
    pub(crate) fn mux_process_command(&mut self, mux: usize, frame: MuxFrame) {
        let is_command = frame.is_command;
        match frame.command {
            MuxCommand::Pn(pn) => self.mux_process_pn(mux, is_command, pn),

            MuxCommand::Msc {
                dlci,
                signals,
                break_duration,
            } => {
                let Some(handle) = self.mcb(mux).and_then(|m| m.ports.get(&dlci).copied()) else {
                    debug!("MSC for unknown DLCI {}", dlci);
                    return;
                };
                if is_command {
                    self.port_event(
                        handle,
                        PortEvent::MscInd {
                            signals,
                            break_duration,
                        },
                    );
                } else {
                    self.port_event(handle, PortEvent::MscCnf);
                }
            }

            MuxCommand::Rpn { dlci, settings } => {
                let handle = self.mcb(mux).and_then(|m| m.ports.get(&dlci).copied());
                match (handle, is_command) {
                    (Some(handle), true) => self.port_event(handle, PortEvent::RpnInd(settings)),
                    (Some(handle), false) => self.port_event(handle, PortEvent::RpnCnf(settings)),
                    (None, true) => {
                        // Port negotiation may precede DLC setup; answer with defaults
                        let reply = MuxCommand::Rpn {
                            dlci,
                            settings: Some(match settings {
                                Some((requested, mask)) => (requested, mask),
                                None => (PortSettings::default(), RPN_PM_MASK),
                            }),
                        };
                        self.mux_send_command(mux, MuxFrame::response(reply));
                    }
                    (None, false) => {}
                }
            }

            MuxCommand::Rls { dlci, status } => {
                if !is_command {
                    return;
                }
                if let Some(handle) = self.mcb(mux).and_then(|m| m.ports.get(&dlci).copied()) {
                    self.port_event(handle, PortEvent::RlsInd(status));
                }
            }

            MuxCommand::Test(pattern) => {
                if is_command {
                    self.mux_send_command(mux, MuxFrame::response(MuxCommand::Test(pattern)));
                }
            }

            MuxCommand::Fcon | MuxCommand::Fcoff => {
                if !is_command {
                    return;
                }
                let ready = frame.command == MuxCommand::Fcon;
                if let Some(mcb) = self.mcb_mut(mux) {
                    mcb.peer_ready = ready;
                }
                debug!("RFCOMM peer aggregate flow {}", if ready { "on" } else { "off" });
                self.mux_send_command(mux, MuxFrame::response(frame.command));
                if ready {
                    for handle in self.ports_on_mux(mux) {
                        self.port_try_send(handle);
                    }
                }
            }

            MuxCommand::Cld => {
                if is_command {
                    self.mux_send_command(mux, MuxFrame::response(MuxCommand::Cld));
                    self.mux_fail(mux, PortStatus::Closed);
                }
            }

            MuxCommand::Nsc { command_type } => {
                warn!("peer does not support RFCOMM command {:#04x}", command_type);
            }

            MuxCommand::Psc | MuxCommand::Unknown(_) => {
                if is_command {
                    let command_type = match frame.command {
                        MuxCommand::Unknown(code) => code,
                        _ => RFCOMM_MX_PSC | RFCOMM_CR_MASK | RFCOMM_EA,
                    };
                    self.mux_send_command(
                        mux,
                        MuxFrame::response(MuxCommand::Nsc { command_type }),
                    );
                }
            }
        }
    }

    fn mux_process_pn(&mut self, mux: usize, is_command: bool, pn: PnParams) {
        let Some(mcb) = self.mcb_mut(mux) else {
            return;
        };

        // Flow control is chosen once per multiplexer
        if mcb.flow == FlowMode::Undefined {
            let credit_cl = if is_command {
                RFCOMM_PN_CONV_LAYER_CBFC_I
            } else {
                RFCOMM_PN_CONV_LAYER_CBFC_R
            };
            mcb.flow = if pn.cl == credit_cl {
                FlowMode::Credit
            } else {
                FlowMode::Ts710
            };
            info!("RFCOMM multiplexer flow control {:?}", mcb.flow);
        }

        let existing = mcb.ports.get(&pn.dlci).copied();
        if is_command {
            let handle = existing.or_else(|| self.attach_server_port(mux, pn.dlci));
            match handle {
                Some(handle) => self.port_event(handle, PortEvent::PnInd(pn)),
                None => {
                    debug!("PN for DLCI {} with no listener", pn.dlci);
                    if let Some(cr) = self.mcb(mux).map(|m| m.cr(false)) {
                        self.mux_send_frame(mux, RfcommFrame::dm(pn.dlci, cr));
                    }
                    self.mux_check_idle(mux);
                }
            }
        } else if let Some(handle) = existing {
            self.port_event(handle, PortEvent::PnCnf(pn));
        }
    }
}
