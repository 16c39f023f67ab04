//! RFCOMM manager: port API, bearer events and timer processing

use super::constants::*;
use super::frame::{FrameType, MuxFrame, RfcommFrame};
use super::mux::{Mcb, MuxEvent};
use super::port::{Port, PortEvent};
use super::types::*;
use crate::bearer::{Bearer, BearerDescriptor, BearerId, RFCOMM_PSM};
use crate::gap::BdAddr;
use crate::timer::TimerQueue;
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RfcTimer {
    Mux(usize),
    Port(PortHandle),
}

/// Callback invocation queued while the manager state is being updated
pub(crate) enum Notify {
    Mgmt(PortMgmtCallback, PortHandle, PortStatus),
    Event(PortEventCallback, PortHandle, PortEvents),
    Data(PortDataCallback, PortHandle, Vec<u8>),
}

/// RFCOMM multiplexers and ports for all peers
pub struct RfcommManager {
    pub(crate) config: RfcommConfig,
    pub(crate) bearer: Arc<dyn Bearer>,
    pub(crate) muxes: Vec<Option<Mcb>>,
    pub(crate) ports: Vec<Option<Port>>,
    pub(crate) timers: TimerQueue<RfcTimer>,
    pub(crate) pending: Vec<Notify>,
    last_scn: u8,
}

impl RfcommManager {
    pub fn new(config: RfcommConfig, bearer: Arc<dyn Bearer>) -> Self {
        Self {
            config,
            bearer,
            muxes: Vec::new(),
            ports: Vec::new(),
            timers: TimerQueue::new(),
            pending: Vec::new(),
            last_scn: 0,
        }
    }

    pub fn config(&self) -> &RfcommConfig {
        &self.config
    }

    /// Reserve a server channel number not used by any server port
    pub fn allocate_scn(&mut self) -> Option<u8> {
        for step in 1..=RFCOMM_MAX_SCN {
            let scn = (self.last_scn + step - 1) % RFCOMM_MAX_SCN + 1;
            let in_use = self.ports.iter().flatten().any(|p| p.is_server && p.scn == scn);
            if !in_use {
                self.last_scn = scn;
                return Some(scn);
            }
        }
        None
    }

    /// Open a server or client port.
    ///
    /// A client port starts the multiplexer to the peer if none is running.
    /// The management callback reports `Success` once the DLC is open.
    pub fn open_port(&mut self, params: OpenPortParams) -> PortResult<PortHandle> {
        if params.scn == 0 || params.scn > RFCOMM_MAX_SCN {
            return Err(PortError::InvalidParameter(format!("scn {}", params.scn)));
        }

        let result = if params.is_server {
            self.open_server_port(&params)
        } else {
            self.open_client_port(&params)
        };
        self.dispatch();
        result
    }

    fn alloc_port(&mut self, params: &OpenPortParams) -> PortResult<PortHandle> {
        let mtu = match params.mtu {
            0 => self.config.default_mtu,
            mtu => mtu.clamp(RFCOMM_MIN_MTU, RFCOMM_MAX_MTU),
        };
        let index = match self.ports.iter().position(|p| p.is_none()) {
            Some(index) => index,
            None if self.ports.len() < self.config.max_ports => {
                self.ports.push(None);
                self.ports.len() - 1
            }
            None => {
                warn!("no free RFCOMM port");
                return Err(PortError::NoResources);
            }
        };
        let handle = PortHandle(index as u16 + 1);
        self.ports[index] = Some(Port::new(handle, params, mtu));
        Ok(handle)
    }

    fn open_server_port(&mut self, params: &OpenPortParams) -> PortResult<PortHandle> {
        let handle = self.alloc_port(params)?;
        info!("{} listening on scn {}", handle, params.scn);
        Ok(handle)
    }

    fn open_client_port(&mut self, params: &OpenPortParams) -> PortResult<PortHandle> {
        let peer = params
            .peer
            .ok_or_else(|| PortError::InvalidParameter("client port without peer".into()))?;

        let existing = self.find_mux_by_peer(&peer);
        // The responder side of a multiplexer uses the odd DLCI of a channel
        let direction = match existing.and_then(|m| self.mcb(m)) {
            Some(mcb) if !mcb.is_initiator && mcb.state != MuxState::Idle => 1,
            _ => 0,
        };
        let dlci = (params.scn << 1) | direction;

        if let Some(mcb) = existing.and_then(|m| self.mcb(m)) {
            if mcb.ports.contains_key(&dlci) {
                return Err(PortError::AlreadyOpened(dlci));
            }
        }

        let mux = match existing {
            Some(mux) => mux,
            None => self.alloc_mux(peer, params.psm)?,
        };
        let handle = match self.alloc_port(params) {
            Ok(handle) => handle,
            Err(e) => {
                if existing.is_none() {
                    self.muxes[mux] = None;
                }
                return Err(e);
            }
        };

        let (state, l2cap_mtu) = match self.mcb_mut(mux) {
            Some(mcb) => {
                mcb.ports.insert(dlci, handle);
                (mcb.state, mcb.l2cap_mtu)
            }
            None => return Err(PortError::StartFailed("multiplexer vanished".into())),
        };
        if let Some(port) = self.port_mut(handle) {
            port.mux = Some(mux);
            port.dlci = dlci;
            let frame_limit = l2cap_mtu.saturating_sub(RFCOMM_DATA_OVERHEAD + RFCOMM_FCS_LEN);
            if state == MuxState::Connected && frame_limit >= RFCOMM_MIN_MTU && port.mtu > frame_limit {
                port.mtu = frame_limit;
            }
        }
        info!("{} opening DLCI {} to {}", handle, dlci, peer);

        match state {
            MuxState::Idle => self.mux_event(mux, MuxEvent::StartReq),
            MuxState::Connected => {
                self.mux_stop_timer(mux);
                self.port_event(handle, PortEvent::OpenReq);
            }
            MuxState::DiscWaitUa => {
                if let Some(mcb) = self.mcb_mut(mux) {
                    mcb.restart_required = true;
                }
            }
            // Still coming up; the port is negotiated once the multiplexer connects
            _ => {}
        }

        if self.port(handle).is_none() {
            return Err(PortError::StartFailed(format!("could not reach {}", peer)));
        }
        Ok(handle)
    }

    /// Close a port. The management callback reports `Closed` once the DLC is down.
    pub fn close_port(&mut self, handle: PortHandle) -> PortResult<()> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        port.user_closed = true;
        port.event_callback = None;
        port.data_callback = None;
        debug!("{} close requested in {:?}", handle, port.state);
        self.port_event(handle, PortEvent::CloseReq);
        self.dispatch();
        Ok(())
    }

    pub fn write_data(&mut self, handle: PortHandle, data: &[u8]) -> PortResult<usize> {
        let result = self.port_write(handle, data);
        self.dispatch();
        result
    }

    pub fn read_data(&mut self, handle: PortHandle, buf: &mut [u8]) -> PortResult<usize> {
        let result = self.port_read(handle, buf);
        self.dispatch();
        result
    }

    /// Bytes and frames waiting in the receive queue
    pub fn rx_queue_count(&self, handle: PortHandle) -> PortResult<(usize, usize)> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        Ok((port.rx_queue_size, port.rx_queue.len()))
    }

    pub fn remote_addr(&self, handle: PortHandle) -> PortResult<BdAddr> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        if port.state != PortState::Opened {
            return Err(PortError::NotOpened);
        }
        port.peer.ok_or(PortError::NotOpened)
    }

    /// Negotiated frame size for sending
    pub fn remote_mtu(&self, handle: PortHandle) -> PortResult<u16> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        if port.state != PortState::Opened {
            return Err(PortError::NotOpened);
        }
        Ok(port.peer_mtu)
    }

    pub fn l2cap_cid(&self, handle: PortHandle) -> PortResult<u16> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        port.mux
            .and_then(|m| self.mcb(m))
            .map(|m| m.local_cid)
            .ok_or(PortError::NotOpened)
    }

    /// Deliver received data straight to `callback` instead of queueing it
    pub fn set_data_callback(&mut self, handle: PortHandle, callback: Option<PortDataCallback>) -> PortResult<()> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        port.data_callback = callback;
        Ok(())
    }

    pub fn set_event_callback(&mut self, handle: PortHandle, callback: Option<PortEventCallback>) -> PortResult<()> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        port.event_callback = callback;
        Ok(())
    }

    pub fn set_event_mask(&mut self, handle: PortHandle, mask: PortEvents) -> PortResult<()> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        port.event_mask = mask;
        Ok(())
    }

    pub fn set_modem_signals(&mut self, handle: PortHandle, signals: ModemSignals) -> PortResult<()> {
        let result = self.port_set_modem_signals(handle, signals);
        self.dispatch();
        result
    }

    /// Peer's modem signals and the accumulated line status
    pub fn modem_status(&self, handle: PortHandle) -> PortResult<(ModemSignals, LineStatus)> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        Ok((port.peer_signals, port.line_status))
    }

    /// Signal a break of `duration` times 200 ms
    pub fn send_break(&mut self, handle: PortHandle, duration: u8) -> PortResult<()> {
        let result = self.port_send_break(handle, duration);
        self.dispatch();
        result
    }

    pub fn port_settings(&self, handle: PortHandle) -> PortResult<PortSettings> {
        let port = self.port(handle).ok_or(PortError::BadHandle(handle.0))?;
        Ok(port.settings)
    }

    pub fn set_port_settings(&mut self, handle: PortHandle, settings: PortSettings) -> PortResult<()> {
        let result = self.port_set_settings(handle, settings);
        self.dispatch();
        result
    }

    /// Drop queued data in either direction
    pub fn purge_port(&mut self, handle: PortHandle, rx: bool, tx: bool) -> PortResult<()> {
        let low_watermark = self.config.rx_low_watermark;
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        if rx {
            port.rx_queue.clear();
            port.rx_queue_size = 0;
        }
        if tx {
            port.tx_queue.clear();
            port.tx_queue_size = 0;
        }
        if rx && port.user_fc && port.rx_queue_size < low_watermark {
            port.user_fc = false;
            self.port_flow_control_peer(handle);
        }
        self.dispatch();
        Ok(())
    }

    /// Clear the line status error flags, returning what was set
    pub fn clear_line_status(&mut self, handle: PortHandle) -> PortResult<LineStatus> {
        let port = self
            .port_mut(handle)
            .ok_or(PortError::BadHandle(handle.0))?;
        let status = port.line_status;
        port.line_status = LineStatus::empty();
        Ok(status)
    }

    pub fn port_info(&self, handle: PortHandle) -> Option<PortInfo> {
        self.port(handle).map(|p| p.info())
    }

    pub fn mux_state(&self, peer: &BdAddr) -> Option<MuxState> {
        self.find_mux_by_peer(peer)
            .and_then(|m| self.mcb(m))
            .map(|m| m.state)
    }

    pub fn mux_flow(&self, peer: &BdAddr) -> Option<FlowMode> {
        self.find_mux_by_peer(peer)
            .and_then(|m| self.mcb(m))
            .map(|m| m.flow)
    }

    // Bearer events

    /// An L2CAP channel came up, either one we asked for or an inbound one
    pub fn on_bearer_connected(&mut self, desc: &BearerDescriptor) {
        if let Some(mux) = self.find_mux_by_bearer(desc.id) {
            if let Some(mcb) = self.mcb_mut(mux) {
                mcb.local_cid = desc.local_cid;
                mcb.l2cap_mtu = desc.mtu;
            }
            self.mux_stop_timer(mux);
            self.mux_event(mux, MuxEvent::ConnCnf);
            self.dispatch();
            return;
        }

        if desc.psm != Some(RFCOMM_PSM) {
            return;
        }
        if self.find_mux_by_peer(&desc.peer).is_some() {
            warn!("second RFCOMM channel from {}, rejecting", desc.peer);
            self.bearer.disconnect(desc.id);
            return;
        }
        match self.alloc_mux(desc.peer, RFCOMM_PSM) {
            Ok(mux) => {
                if let Some(mcb) = self.mcb_mut(mux) {
                    mcb.bearer = Some(desc.id);
                    mcb.local_cid = desc.local_cid;
                    mcb.l2cap_mtu = desc.mtu;
                }
                info!("inbound RFCOMM channel from {} on bearer {}", desc.peer, desc.id);
                self.mux_event(mux, MuxEvent::ConnInd);
            }
            Err(_) => self.bearer.disconnect(desc.id),
        }
        self.dispatch();
    }

    pub fn on_bearer_disconnected(&mut self, id: BearerId) {
        if let Some(mux) = self.find_mux_by_bearer(id) {
            if let Some(mcb) = self.mcb_mut(mux) {
                // Already gone; nothing to disconnect
                mcb.bearer = None;
            }
            info!("RFCOMM bearer {} closed", id);
            self.mux_event(mux, MuxEvent::L2capClosed);
            self.dispatch();
        }
    }

    pub fn on_bearer_congestion(&mut self, id: BearerId, congested: bool) {
        let Some(mux) = self.find_mux_by_bearer(id) else {
            return;
        };
        if congested {
            if let Some(mcb) = self.mcb_mut(mux) {
                mcb.congested = true;
            }
            return;
        }

        self.mux_flush(mux);
        if self.mcb(mux).map(|m| m.congested).unwrap_or(true) {
            return;
        }
        for handle in self.ports_on_mux(mux) {
            let reported = self
                .port_mut(handle)
                .map(|p| std::mem::replace(&mut p.congestion_reported, false))
                .unwrap_or(false);
            if reported {
                self.port_notify(handle, PortEvents::UNCONGESTED);
            }
            self.port_try_send(handle);
        }
        self.dispatch();
    }

    /// One L2CAP SDU carrying one RFCOMM frame
    pub fn on_bearer_data(&mut self, id: BearerId, data: &[u8]) {
        let Some(mux) = self.find_mux_by_bearer(id) else {
            debug!("RFCOMM data on unknown bearer {}", id);
            return;
        };
        let credit_flow = self.mcb(mux).map(|m| m.flow == FlowMode::Credit).unwrap_or(false);
        let frame = match RfcommFrame::parse(data, credit_flow) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping bad RFCOMM frame: {} ({})", e, hex::encode(data));
                return;
            }
        };
        trace!("RFCOMM rx {:?} dlci {}", frame.frame_type, frame.dlci);

        if frame.dlci == RFCOMM_MX_DLCI {
            self.process_mux_frame(mux, frame);
        } else {
            self.process_dlc_frame(mux, frame);
        }
        self.dispatch();
    }

    fn process_mux_frame(&mut self, mux: usize, frame: RfcommFrame) {
        match frame.frame_type {
            FrameType::Sabme => self.mux_event(mux, MuxEvent::SabmeInd),
            FrameType::Ua => self.mux_event(mux, MuxEvent::UaInd),
            FrameType::Dm => self.mux_event(mux, MuxEvent::DmInd),
            FrameType::Disc => self.mux_event(mux, MuxEvent::DiscInd),
            FrameType::Uih => {
                if self.mcb(mux).map(|m| m.state) != Some(MuxState::Connected) {
                    debug!("multiplexer command before the multiplexer is up");
                    return;
                }
                match MuxFrame::parse(&frame.info) {
                    Ok(command) => self.mux_process_command(mux, command),
                    Err(e) => warn!("bad multiplexer command: {}", e),
                }
            }
        }
    }

    fn process_dlc_frame(&mut self, mux: usize, frame: RfcommFrame) {
        let Some(mcb) = self.mcb(mux) else {
            return;
        };
        if mcb.state != MuxState::Connected {
            debug!("DLCI {} frame before the multiplexer is up", frame.dlci);
            return;
        }
        let responder_cr = mcb.cr(false);
        let existing = mcb.ports.get(&frame.dlci).copied();

        let handle = match (existing, frame.frame_type) {
            (Some(handle), _) => handle,
            (None, FrameType::Sabme) => match self.attach_server_port(mux, frame.dlci) {
                Some(handle) => handle,
                None => {
                    debug!("SABME for DLCI {} with no listener", frame.dlci);
                    self.mux_send_frame(mux, RfcommFrame::dm(frame.dlci, responder_cr));
                    self.mux_check_idle(mux);
                    return;
                }
            },
            (None, FrameType::Disc) | (None, FrameType::Uih) => {
                self.mux_send_frame(mux, RfcommFrame::dm(frame.dlci, responder_cr));
                return;
            }
            (None, _) => return,
        };

        let event = match frame.frame_type {
            FrameType::Sabme => PortEvent::EstabInd,
            FrameType::Ua => PortEvent::EstabCnf,
            FrameType::Dm => PortEvent::DmInd,
            FrameType::Disc => PortEvent::RelInd,
            FrameType::Uih => PortEvent::DataInd {
                info: frame.info,
                credits: frame.credits,
            },
        };
        self.port_event(handle, event);
    }

    /// Fire every timer due at `now`
    pub fn process_timeouts(&mut self, now: Instant) {
        for timer in self.timers.expired(now) {
            match timer {
                RfcTimer::Mux(mux) => {
                    let kind = self.mcb(mux).and_then(|m| m.timer_kind);
                    debug!("RFCOMM mux {} timer {:?} expired", mux, kind);
                    self.mux_event(mux, MuxEvent::Timeout);
                }
                RfcTimer::Port(handle) => {
                    if let Some(port) = self.port_mut(handle) {
                        port.timer_kind = None;
                    }
                    self.port_event(handle, PortEvent::Timeout);
                }
            }
        }
        self.dispatch();
    }

    /// Earliest pending timer, for the caller's event loop
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run the callbacks queued by the last operation
    fn dispatch(&mut self) {
        for notify in std::mem::take(&mut self.pending) {
            match notify {
                Notify::Mgmt(callback, handle, status) => {
                    if let Ok(mut callback) = callback.lock() {
                        callback(handle, status);
                    } else {
                        error!("{} management callback poisoned", handle);
                    }
                }
                Notify::Event(callback, handle, events) => {
                    if let Ok(mut callback) = callback.lock() {
                        callback(handle, events);
                    }
                }
                Notify::Data(callback, handle, data) => {
                    if let Ok(mut callback) = callback.lock() {
                        callback(handle, &data);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RfcommManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RfcommManager")
            .field("muxes", &self.muxes.iter().flatten().count())
            .field("ports", &self.ports.iter().flatten().count())
            .finish()
    }
}

