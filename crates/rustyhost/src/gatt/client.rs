//! GATT Client implementation
//!
//! One transport control block (TCB) exists per connected peer and owns the
//! peer's ATT bearer plus any EATT bearers. Every app operation becomes a
//! client control block (CLCB) queued on one of those bearers. A bearer
//! carries at most one outstanding request; the response, or the response
//! timeout, retires it and the next queued CLCB goes out.
//!
//! Multi-PDU procedures (discovery, long reads, long writes) keep their
//! progress in the CLCB and rebuild the next request from it, so a CLCB
//! stays at the head of its bearer queue until the whole procedure ends.

use super::types::*;
use crate::att::*;
use crate::bearer::{Bearer, BearerDescriptor, BearerId, SendStatus, EATT_PSM, LE_MIN_MTU};
use crate::gap::BdAddr;
use crate::smp::CsrkSigner;
use crate::timer::TimerQueue;
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Maximum number of registered applications
pub const GATT_MAX_APPS: usize = 32;

/// Callback type for GATT events
pub type GattEventCallback = Arc<Mutex<dyn FnMut(GattEvent) + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ClcbId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GattTimer {
    Response(ClcbId),
    /// Apps did not confirm an indication on this link in time
    IndicationAck(u8),
}

/// Procedure state carried by a CLCB
#[derive(Debug)]
enum Procedure {
    Mtu {
        mtu: u16,
    },
    Discover {
        kind: DiscoveryType,
        start: u16,
        end: u16,
        /// Include declaration whose 128-bit UUID is being read:
        /// (declaration handle, included start, included end)
        pending_include: Option<(u16, u16, u16)>,
    },
    Read {
        handle: u16,
        value: Vec<u8>,
    },
    ReadByUuid {
        start: u16,
        end: u16,
        uuid: Uuid,
    },
    ReadMultiple {
        handles: Vec<u16>,
        variable: bool,
    },
    ReadPartial {
        handle: u16,
        offset: u16,
    },
    Write {
        handle: u16,
        value: Vec<u8>,
        kind: WriteType,
    },
    LongWrite {
        handle: u16,
        value: Vec<u8>,
        /// Bytes the server has acknowledged
        offset: usize,
        /// Length of the prepare write in flight
        chunk: usize,
        /// Set once the prepared queue must be cancelled
        failure: Option<GattStatus>,
    },
    Prepare {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
    },
    Execute {
        commit: bool,
    },
}

impl Procedure {
    fn operation(&self) -> GattOperation {
        match self {
            Procedure::Mtu { .. } => GattOperation::Config,
            Procedure::Discover { .. }
            | Procedure::Read { .. }
            | Procedure::ReadByUuid { .. }
            | Procedure::ReadMultiple { .. }
            | Procedure::ReadPartial { .. } => GattOperation::Read,
            Procedure::Write { .. } | Procedure::LongWrite { .. } | Procedure::Prepare { .. } => {
                GattOperation::Write
            }
            Procedure::Execute { .. } => GattOperation::ExecuteWrite,
        }
    }
}

/// Client control block: one app operation
#[derive(Debug)]
struct Clcb {
    id: ClcbId,
    conn_id: ConnId,
    bearer: BearerId,
    procedure: Procedure,
    retry_count: u8,
    /// Request built for this CLCB and not yet answered
    request: Option<ClientPdu>,
}

/// What a response does to its procedure
enum Flow {
    /// Send the next request of the same procedure
    Continue,
    Done(GattStatus, OperationData),
}

#[derive(Debug)]
struct AttBearer {
    id: BearerId,
    eatt: bool,
    payload_size: u16,
    queue: VecDeque<ClcbId>,
    in_flight: Option<ClcbId>,
    congested: bool,
}

impl AttBearer {
    fn new(id: BearerId, eatt: bool, payload_size: u16) -> Self {
        Self {
            id,
            eatt,
            payload_size,
            queue: VecDeque::new(),
            in_flight: None,
            congested: false,
        }
    }

    fn load(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }
}

/// Transport control block: one peer link
#[derive(Debug)]
struct Tcb {
    idx: u8,
    peer: BdAddr,
    /// The fixed ATT bearer comes first
    bearers: Vec<AttBearer>,
    /// Largest MTU any app asked for
    max_user_mtu: u16,
    mtu_exchanged: bool,
    /// Apps yet to confirm the current indication
    ind_count: usize,
    ind_bearer: Option<BearerId>,
}

impl Tcb {
    fn bearer(&self, id: BearerId) -> Option<&AttBearer> {
        self.bearers.iter().find(|b| b.id == id)
    }

    fn bearer_mut(&mut self, id: BearerId) -> Option<&mut AttBearer> {
        self.bearers.iter_mut().find(|b| b.id == id)
    }

    fn att_bearer(&self) -> Option<&AttBearer> {
        self.bearers.iter().find(|b| !b.eatt)
    }
}

/// GATT client engine
pub struct GattClient {
    config: GattConfig,
    bearer: Arc<dyn Bearer>,
    /// Registered apps in registration order
    apps: Vec<(GattIf, GattEventCallback)>,
    tcbs: HashMap<u8, Tcb>,
    bearer_map: HashMap<BearerId, u8>,
    clcbs: HashMap<ClcbId, Clcb>,
    next_clcb: u32,
    signers: HashMap<BdAddr, CsrkSigner>,
    timers: TimerQueue<GattTimer>,
    pending: Vec<(GattIf, GattEvent)>,
}

impl GattClient {
    /// Create a new GATT client
    pub fn new(config: GattConfig, bearer: Arc<dyn Bearer>) -> Self {
        Self {
            config,
            bearer,
            apps: Vec::new(),
            tcbs: HashMap::new(),
            bearer_map: HashMap::new(),
            clcbs: HashMap::new(),
            next_clcb: 1,
            signers: HashMap::new(),
            timers: TimerQueue::new(),
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    /// Register an application; its callback receives every event for it
    pub fn register_app<F>(&mut self, callback: F) -> GattResult<GattIf>
    where
        F: FnMut(GattEvent) + Send + 'static,
    {
        if self.apps.len() >= GATT_MAX_APPS {
            return Err(GattError::NoResources);
        }
        let gatt_if = (1..=GATT_MAX_APPS as u8)
            .map(GattIf)
            .find(|candidate| self.apps.iter().all(|(id, _)| id != candidate))
            .ok_or(GattError::NoResources)?;
        self.apps.push((gatt_if, Arc::new(Mutex::new(callback))));
        debug!("GATT: registered app {}", gatt_if);
        Ok(gatt_if)
    }

    /// Remove an application and drop its queued operations
    pub fn unregister_app(&mut self, gatt_if: GattIf) -> GattResult<()> {
        let pos = self
            .apps
            .iter()
            .position(|(id, _)| *id == gatt_if)
            .ok_or(GattError::UnknownApp(gatt_if))?;
        self.apps.remove(pos);

        let in_flight: Vec<ClcbId> = self
            .tcbs
            .values()
            .flat_map(|tcb| tcb.bearers.iter().filter_map(|b| b.in_flight))
            .collect();
        // An operation already on the air finishes; its completion is dropped
        let dropped: Vec<ClcbId> = self
            .clcbs
            .values()
            .filter(|clcb| clcb.conn_id.gatt_if() == gatt_if && !in_flight.contains(&clcb.id))
            .map(|clcb| clcb.id)
            .collect();
        for tcb in self.tcbs.values_mut() {
            for bearer in tcb.bearers.iter_mut() {
                bearer.queue.retain(|id| !dropped.contains(id));
            }
        }
        for id in dropped {
            self.clcbs.remove(&id);
        }
        debug!("GATT: unregistered app {}", gatt_if);
        Ok(())
    }

    /// Key used to sign writes to a peer
    pub fn set_signing_key(&mut self, peer: BdAddr, signer: CsrkSigner) {
        self.signers.insert(peer, signer);
    }

    /// Connection identifier an app uses for a peer
    pub fn conn_id(&self, gatt_if: GattIf, peer: &BdAddr) -> Option<ConnId> {
        if !self.has_app(gatt_if) {
            return None;
        }
        self.tcbs
            .values()
            .find(|tcb| tcb.peer == *peer)
            .map(|tcb| ConnId::new(gatt_if, tcb.idx))
    }

    /// Payload size of the fixed ATT bearer
    pub fn payload_size(&self, conn_id: ConnId) -> Option<u16> {
        self.tcbs
            .get(&conn_id.tcb_idx())
            .and_then(|tcb| tcb.att_bearer())
            .map(|b| b.payload_size)
    }

    /// MTU the link layer data length should accommodate once an exchange
    /// has completed
    pub fn data_length_hint(&self, peer: &BdAddr) -> Option<u16> {
        self.tcbs
            .values()
            .find(|tcb| tcb.peer == *peer && tcb.mtu_exchanged)
            .map(|tcb| tcb.max_user_mtu)
    }

    /// Operations queued or in flight on a link
    pub fn pending_operations(&self, conn_id: ConnId) -> usize {
        self.tcbs
            .get(&conn_id.tcb_idx())
            .map(|tcb| tcb.bearers.iter().map(AttBearer::load).sum())
            .unwrap_or(0)
    }

    /// An ATT or EATT bearer came up
    pub fn on_bearer_connected(&mut self, desc: &BearerDescriptor) {
        if desc.psm == Some(EATT_PSM) {
            let idx = match self.tcbs.values().find(|tcb| tcb.peer == desc.peer) {
                Some(tcb) => tcb.idx,
                None => {
                    warn!("GATT: EATT bearer {} to {} without ATT link", desc.id, desc.peer);
                    return;
                }
            };
            if let Some(tcb) = self.tcbs.get_mut(&idx) {
                tcb.bearers.push(AttBearer::new(desc.id, true, desc.mtu));
                self.bearer_map.insert(desc.id, idx);
                info!("GATT: EATT bearer {} to {} mtu {}", desc.id, desc.peer, desc.mtu);
            }
            return;
        }

        if self.tcbs.values().any(|tcb| tcb.peer == desc.peer) {
            warn!("GATT: second ATT bearer to {} ignored", desc.peer);
            return;
        }
        let idx = match (0..self.config.max_connections as u8).find(|i| !self.tcbs.contains_key(i)) {
            Some(idx) => idx,
            None => {
                error!("GATT: no free link for {}", desc.peer);
                return;
            }
        };
        self.tcbs.insert(
            idx,
            Tcb {
                idx,
                peer: desc.peer,
                bearers: vec![AttBearer::new(desc.id, false, LE_MIN_MTU)],
                max_user_mtu: LE_MIN_MTU,
                mtu_exchanged: false,
                ind_count: 0,
                ind_bearer: None,
            },
        );
        self.bearer_map.insert(desc.id, idx);
        info!("GATT: connected to {} on bearer {}", desc.peer, desc.id);

        for gatt_if in self.app_ids() {
            self.pending.push((
                gatt_if,
                GattEvent::Connected {
                    conn_id: ConnId::new(gatt_if, idx),
                    peer: desc.peer,
                },
            ));
        }
        self.dispatch();
    }

    /// A bearer went away; losing the ATT bearer ends the link
    pub fn on_bearer_disconnected(&mut self, id: BearerId) {
        let idx = match self.bearer_map.get(&id) {
            Some(idx) => *idx,
            None => return,
        };
        let is_att = self
            .tcbs
            .get(&idx)
            .and_then(|tcb| tcb.bearer(id))
            .map(|b| !b.eatt)
            .unwrap_or(false);

        if !is_att {
            if let Some(tcb) = self.tcbs.get_mut(&idx) {
                tcb.bearers.retain(|b| b.id != id);
            }
            self.bearer_map.remove(&id);
            self.close_clcbs(|clcb| clcb.bearer == id);
            debug!("GATT: EATT bearer {} closed", id);
            self.dispatch();
            return;
        }

        let tcb = match self.tcbs.remove(&idx) {
            Some(tcb) => tcb,
            None => return,
        };
        for bearer in &tcb.bearers {
            self.bearer_map.remove(&bearer.id);
        }
        self.timers.cancel(&GattTimer::IndicationAck(idx));
        self.close_clcbs(|clcb| clcb.conn_id.tcb_idx() == idx);
        info!("GATT: disconnected from {}", tcb.peer);

        for gatt_if in self.app_ids() {
            self.pending.push((
                gatt_if,
                GattEvent::Disconnected {
                    conn_id: ConnId::new(gatt_if, idx),
                },
            ));
        }
        self.dispatch();
    }

    pub fn on_bearer_congestion(&mut self, id: BearerId, congested: bool) {
        match self.att_bearer_mut(id) {
            Some(bearer) => bearer.congested = congested,
            None => return,
        }
        if !congested {
            self.service_queue(id);
            self.dispatch();
        }
    }

    /// Inbound ATT PDU
    pub fn on_bearer_data(&mut self, id: BearerId, data: &[u8]) {
        let payload_size = match self.att_bearer_mut(id) {
            Some(bearer) => bearer.payload_size,
            None => {
                warn!("GATT: data on unknown bearer {}", id);
                return;
            }
        };
        let opcode = match data.first() {
            Some(opcode) => *opcode,
            None => return,
        };

        if data.len() > payload_size as usize {
            error!(
                "GATT: PDU {:#04x} of {} bytes exceeds payload size {}",
                opcode,
                data.len(),
                payload_size
            );
            if !matches!(
                opcode,
                ATT_HANDLE_VALUE_NTF | ATT_HANDLE_VALUE_IND | ATT_MULTIPLE_HANDLE_VALUE_NTF
            ) {
                self.fail_in_flight(id, GattStatus::Error);
            }
            self.dispatch();
            return;
        }

        match ServerPdu::parse(data) {
            Ok(pdu) => self.handle_pdu(id, pdu),
            Err(err) => {
                warn!("GATT: malformed PDU {:#04x} on bearer {}: {}", opcode, id, err);
                let answers_request = self
                    .in_flight_request(id)
                    .map(|request| {
                        opcode == ATT_ERROR_RSP || request.response_opcode() == Some(opcode)
                    })
                    .unwrap_or(false);
                if answers_request {
                    self.fail_in_flight(id, GattStatus::InvalidPdu);
                }
            }
        }
        self.dispatch();
    }

    /// Exchange MTU on the link's ATT bearer
    pub fn configure_mtu(&mut self, conn_id: ConnId, mtu: u16) -> GattResult<()> {
        if mtu < LE_MIN_MTU {
            return Err(GattError::InvalidParameter("MTU below minimum"));
        }
        let mtu = mtu.min(self.config.local_mtu);
        if let Some(tcb) = self.tcbs.get_mut(&conn_id.tcb_idx()) {
            tcb.max_user_mtu = tcb.max_user_mtu.max(mtu);
        }
        self.enqueue(conn_id, Procedure::Mtu { mtu })
    }

    /// Start a discovery procedure over a handle range
    pub fn discover(
        &mut self,
        conn_id: ConnId,
        kind: DiscoveryType,
        start: u16,
        end: u16,
    ) -> GattResult<()> {
        if start == 0 {
            return Err(GattError::InvalidHandle(start));
        }
        if start > end {
            return Err(GattError::InvalidParameter("start handle after end handle"));
        }
        self.enqueue(
            conn_id,
            Procedure::Discover {
                kind,
                start,
                end,
                pending_include: None,
            },
        )
    }

    pub fn read(&mut self, conn_id: ConnId, read: ReadType) -> GattResult<()> {
        let procedure = match read {
            ReadType::ByHandle(handle) => {
                check_handle(handle)?;
                Procedure::Read {
                    handle,
                    value: Vec::new(),
                }
            }
            ReadType::ByUuid { start, end, uuid } => {
                check_handle(start)?;
                if start > end {
                    return Err(GattError::InvalidParameter("start handle after end handle"));
                }
                Procedure::ReadByUuid { start, end, uuid }
            }
            ReadType::Multiple(handles) | ReadType::MultipleVariable(handles)
                if handles.len() < 2 =>
            {
                return Err(GattError::InvalidParameter("read multiple needs two handles"));
            }
            ReadType::Multiple(handles) => {
                handles.iter().try_for_each(|h| check_handle(*h))?;
                Procedure::ReadMultiple {
                    handles,
                    variable: false,
                }
            }
            ReadType::MultipleVariable(handles) => {
                handles.iter().try_for_each(|h| check_handle(*h))?;
                Procedure::ReadMultiple {
                    handles,
                    variable: true,
                }
            }
            ReadType::Partial { handle, offset } => {
                check_handle(handle)?;
                Procedure::ReadPartial { handle, offset }
            }
        };
        self.enqueue(conn_id, procedure)
    }

    pub fn write(
        &mut self,
        conn_id: ConnId,
        handle: u16,
        value: Vec<u8>,
        kind: WriteType,
    ) -> GattResult<()> {
        check_handle(handle)?;
        if value.len() > GATT_MAX_ATTR_LEN {
            return Err(GattError::InvalidParameter("value longer than an attribute"));
        }
        if kind == WriteType::Signed {
            let peer = self
                .tcbs
                .get(&conn_id.tcb_idx())
                .map(|tcb| tcb.peer)
                .ok_or(GattError::NotConnected(conn_id))?;
            if !self.signers.contains_key(&peer) {
                return Err(GattError::NoSigningKey(peer));
            }
        }
        let procedure = match kind {
            WriteType::Prepare { offset } => Procedure::Prepare {
                handle,
                offset,
                value,
            },
            kind => Procedure::Write { handle, value, kind },
        };
        self.enqueue(conn_id, procedure)
    }

    /// Commit or discard writes prepared by the app
    pub fn execute_write(&mut self, conn_id: ConnId, commit: bool) -> GattResult<()> {
        self.enqueue(conn_id, Procedure::Execute { commit })
    }

    /// Enable notifications or indications by writing the CCCD
    pub fn register_for_notifications(
        &mut self,
        conn_id: ConnId,
        cccd_handle: u16,
        indicate: bool,
    ) -> GattResult<()> {
        let value = if indicate {
            GATT_CCCD_INDICATE
        } else {
            GATT_CCCD_NOTIFY
        };
        self.write(conn_id, cccd_handle, value.to_le_bytes().to_vec(), WriteType::Request)
    }

    pub fn unregister_for_notifications(&mut self, conn_id: ConnId, cccd_handle: u16) -> GattResult<()> {
        self.write(conn_id, cccd_handle, vec![0, 0], WriteType::Request)
    }

    /// App acknowledgement of an indication; the confirmation goes out once
    /// every app has acknowledged
    pub fn send_confirmation(&mut self, conn_id: ConnId) -> GattResult<()> {
        let idx = conn_id.tcb_idx();
        let tcb = self
            .tcbs
            .get_mut(&idx)
            .ok_or(GattError::NotConnected(conn_id))?;
        if tcb.ind_count == 0 {
            return Err(GattError::InvalidParameter("no indication to confirm"));
        }
        tcb.ind_count -= 1;
        if tcb.ind_count == 0 {
            self.timers.cancel(&GattTimer::IndicationAck(idx));
            self.confirm_indication(idx);
        }
        Ok(())
    }

    /// Expire response and indication timers
    pub fn process_timeouts(&mut self, now: Instant) {
        for timer in self.timers.expired(now) {
            match timer {
                GattTimer::Response(id) => self.response_timeout(id),
                GattTimer::IndicationAck(idx) => {
                    warn!("GATT: apps did not confirm indication in time");
                    if let Some(tcb) = self.tcbs.get_mut(&idx) {
                        tcb.ind_count = 0;
                    }
                    self.confirm_indication(idx);
                }
            }
        }
        self.dispatch();
    }

    /// Earliest pending timer, for the caller's event loop
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn has_app(&self, gatt_if: GattIf) -> bool {
        self.apps.iter().any(|(id, _)| *id == gatt_if)
    }

    fn app_ids(&self) -> Vec<GattIf> {
        self.apps.iter().map(|(id, _)| *id).collect()
    }

    fn att_bearer_mut(&mut self, id: BearerId) -> Option<&mut AttBearer> {
        let idx = self.bearer_map.get(&id)?;
        self.tcbs.get_mut(idx)?.bearer_mut(id)
    }

    fn in_flight_request(&self, id: BearerId) -> Option<&ClientPdu> {
        let idx = self.bearer_map.get(&id)?;
        let clcb_id = self.tcbs.get(idx)?.bearer(id)?.in_flight?;
        self.clcbs.get(&clcb_id)?.request.as_ref()
    }

    fn enqueue(&mut self, conn_id: ConnId, procedure: Procedure) -> GattResult<()> {
        if !self.has_app(conn_id.gatt_if()) {
            return Err(GattError::UnknownApp(conn_id.gatt_if()));
        }
        if self.clcbs.len() >= self.config.max_operations {
            return Err(GattError::NoResources);
        }
        let tcb = self
            .tcbs
            .get_mut(&conn_id.tcb_idx())
            .ok_or(GattError::NotConnected(conn_id))?;

        // MTU exchange only exists on the fixed ATT bearer
        let bearer = match procedure {
            Procedure::Mtu { .. } => tcb.bearers.iter_mut().find(|b| !b.eatt),
            _ => tcb.bearers.iter_mut().min_by_key(|b| b.load()),
        };
        let bearer = bearer.ok_or(GattError::NotConnected(conn_id))?;
        check_fits(&procedure, bearer.payload_size)?;

        let id = ClcbId(self.next_clcb);
        self.next_clcb = self.next_clcb.wrapping_add(1).max(1);
        bearer.queue.push_back(id);
        let bearer_id = bearer.id;
        trace!("GATT: {} queued {:?} on bearer {}", conn_id, procedure, bearer_id);
        self.clcbs.insert(
            id,
            Clcb {
                id,
                conn_id,
                bearer: bearer_id,
                procedure,
                retry_count: 0,
                request: None,
            },
        );
        self.service_queue(bearer_id);
        self.dispatch();
        Ok(())
    }

    /// Send queued operations until one waits for a response
    fn service_queue(&mut self, bearer_id: BearerId) {
        loop {
            let idx = match self.bearer_map.get(&bearer_id) {
                Some(idx) => *idx,
                None => return,
            };
            let (peer, payload_size, id) = match self.tcbs.get(&idx) {
                Some(tcb) => match tcb.bearer(bearer_id) {
                    Some(b) if b.in_flight.is_none() && !b.congested => match b.queue.front() {
                        Some(id) => (tcb.peer, b.payload_size, *id),
                        None => return,
                    },
                    _ => return,
                },
                None => return,
            };
            let mut clcb = match self.clcbs.remove(&id) {
                Some(clcb) => clcb,
                None => {
                    self.pop_head(bearer_id);
                    continue;
                }
            };

            let request = match clcb.request.take() {
                Some(request) => request,
                None => match self.build_request(&mut clcb, &peer, payload_size) {
                    Some(request) => request,
                    None => {
                        self.pop_head(bearer_id);
                        self.complete(clcb, GattStatus::Error, OperationData::None);
                        continue;
                    }
                },
            };

            match self.bearer.send(bearer_id, &request.to_bytes()) {
                SendStatus::Ok => {}
                SendStatus::Congested => {
                    debug!("GATT: bearer {} congested", bearer_id);
                    clcb.request = Some(request);
                    self.clcbs.insert(id, clcb);
                    if let Some(bearer) = self.att_bearer_mut(bearer_id) {
                        bearer.congested = true;
                    }
                    return;
                }
                SendStatus::Failed => {
                    error!("GATT: send on bearer {} failed", bearer_id);
                    self.pop_head(bearer_id);
                    self.complete(clcb, GattStatus::Error, OperationData::None);
                    continue;
                }
            }

            self.pop_head(bearer_id);
            if request.response_opcode().is_some() {
                clcb.request = Some(request);
                self.clcbs.insert(id, clcb);
                if let Some(bearer) = self.att_bearer_mut(bearer_id) {
                    bearer.in_flight = Some(id);
                }
                self.timers
                    .arm(GattTimer::Response(id), self.config.response_timeout);
                return;
            }

            // Commands are done once they are on the air
            let handle = match &clcb.procedure {
                Procedure::Write { handle, .. } => *handle,
                _ => 0,
            };
            self.complete(clcb, GattStatus::Success, OperationData::Handle(handle));
        }
    }

    fn pop_head(&mut self, bearer_id: BearerId) {
        if let Some(bearer) = self.att_bearer_mut(bearer_id) {
            bearer.queue.pop_front();
        }
    }

    /// Next request of a procedure, derived from its progress
    fn build_request(&mut self, clcb: &mut Clcb, peer: &BdAddr, payload_size: u16) -> Option<ClientPdu> {
        let request = match &mut clcb.procedure {
            Procedure::Mtu { mtu } => ClientPdu::ExchangeMtuRequest { mtu: *mtu },
            Procedure::Discover {
                pending_include: Some((_, included_start, _)),
                ..
            } => ClientPdu::ReadRequest {
                handle: *included_start,
            },
            Procedure::Discover {
                kind, start, end, ..
            } => {
                let (start, end) = (*start, *end);
                match kind {
                    DiscoveryType::AllServices => ClientPdu::ReadByGroupTypeRequest {
                        start,
                        end,
                        group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
                    },
                    DiscoveryType::ServicesByUuid(uuid) => ClientPdu::FindByTypeValueRequest {
                        start,
                        end,
                        attribute_type: PRIMARY_SERVICE_UUID,
                        value: uuid.to_att_bytes(),
                    },
                    DiscoveryType::IncludedServices => ClientPdu::ReadByTypeRequest {
                        start,
                        end,
                        attribute_type: Uuid::from_u16(INCLUDE_UUID),
                    },
                    DiscoveryType::Characteristics(_) => ClientPdu::ReadByTypeRequest {
                        start,
                        end,
                        attribute_type: Uuid::from_u16(CHARACTERISTIC_UUID),
                    },
                    DiscoveryType::Descriptors => ClientPdu::FindInformationRequest { start, end },
                }
            }
            Procedure::Read { handle, value } if value.is_empty() => {
                ClientPdu::ReadRequest { handle: *handle }
            }
            Procedure::Read { handle, value } => ClientPdu::ReadBlobRequest {
                handle: *handle,
                offset: value.len() as u16,
            },
            Procedure::ReadByUuid { start, end, uuid } => ClientPdu::ReadByTypeRequest {
                start: *start,
                end: *end,
                attribute_type: uuid.clone(),
            },
            Procedure::ReadMultiple { handles, variable } => {
                let handles = handles.clone();
                if *variable {
                    ClientPdu::ReadMultipleVariableRequest { handles }
                } else {
                    ClientPdu::ReadMultipleRequest { handles }
                }
            }
            Procedure::ReadPartial { handle, offset } => ClientPdu::ReadBlobRequest {
                handle: *handle,
                offset: *offset,
            },
            Procedure::Write { handle, value, kind } => match kind {
                WriteType::NoResponse => ClientPdu::WriteCommand {
                    handle: *handle,
                    value: value.clone(),
                },
                WriteType::Signed => {
                    let signer = match self.signers.get_mut(peer) {
                        Some(signer) => signer,
                        None => {
                            warn!("GATT: signing key for {} went away", peer);
                            return None;
                        }
                    };
                    let signature = signer.sign(&ClientPdu::signed_message(*handle, value));
                    ClientPdu::SignedWriteCommand {
                        handle: *handle,
                        value: value.clone(),
                        signature,
                    }
                }
                _ if value.len() + ATT_WRITE_HEADER_SIZE > payload_size as usize => {
                    // Too long for one Write Request: switch to queued writes
                    let value = std::mem::take(value);
                    clcb.procedure = Procedure::LongWrite {
                        handle: *handle,
                        value,
                        offset: 0,
                        chunk: 0,
                        failure: None,
                    };
                    return self.build_request(clcb, peer, payload_size);
                }
                _ => ClientPdu::WriteRequest {
                    handle: *handle,
                    value: value.clone(),
                },
            },
            Procedure::LongWrite {
                handle,
                value,
                offset,
                chunk,
                failure,
            } => {
                if failure.is_some() {
                    ClientPdu::ExecuteWriteRequest { commit: false }
                } else if *offset >= value.len() {
                    ClientPdu::ExecuteWriteRequest { commit: true }
                } else {
                    let room = (payload_size as usize).saturating_sub(ATT_PREPARE_WRITE_HEADER_SIZE);
                    *chunk = room.min(value.len() - *offset);
                    ClientPdu::PrepareWriteRequest {
                        handle: *handle,
                        offset: *offset as u16,
                        value: value[*offset..*offset + *chunk].to_vec(),
                    }
                }
            }
            Procedure::Prepare {
                handle,
                offset,
                value,
            } => ClientPdu::PrepareWriteRequest {
                handle: *handle,
                offset: *offset,
                value: value.clone(),
            },
            Procedure::Execute { commit } => ClientPdu::ExecuteWriteRequest { commit: *commit },
        };
        Some(request)
    }

    fn handle_pdu(&mut self, id: BearerId, pdu: ServerPdu) {
        match pdu {
            ServerPdu::Notification { handle, value } => self.deliver(id, handle, value, false),
            ServerPdu::Indication { handle, value } => self.deliver(id, handle, value, true),
            ServerPdu::MultipleNotification(records) => {
                for record in records {
                    self.deliver(id, record.handle, record.value, false);
                }
            }
            ServerPdu::ExchangeMtuRequest { mtu } => self.on_mtu_request(id, mtu),
            ServerPdu::UnsupportedRequest { opcode } => {
                debug!("GATT: server request {:#04x} not supported", opcode);
                self.send_reply(
                    id,
                    ClientPdu::ErrorResponse {
                        request_opcode: opcode,
                        handle: 0,
                        code: AttErrorCode::RequestNotSupported,
                    },
                );
            }
            ServerPdu::UnsupportedCommand { opcode } => {
                debug!("GATT: ignoring command {:#04x}", opcode);
            }
            response => self.on_response(id, response),
        }
    }

    /// Replies owed to the server travel outside the request queue
    fn send_reply(&self, id: BearerId, pdu: ClientPdu) {
        match self.bearer.send(id, &pdu.to_bytes()) {
            SendStatus::Ok => {}
            SendStatus::Congested => warn!(
                "GATT: bearer {} congested, {:#04x} dropped",
                id,
                pdu.opcode()
            ),
            SendStatus::Failed => error!("GATT: send on bearer {} failed", id),
        }
    }

    fn on_mtu_request(&mut self, id: BearerId, peer_mtu: u16) {
        let local_mtu = self.config.local_mtu;
        let idx = match self.bearer_map.get(&id) {
            Some(idx) => *idx,
            None => return,
        };
        let payload_size = LE_MIN_MTU.max(peer_mtu.min(local_mtu));
        let on_att = self
            .tcbs
            .get(&idx)
            .and_then(|tcb| tcb.bearer(id))
            .map(|b| !b.eatt)
            .unwrap_or(false);
        if !on_att {
            warn!("GATT: MTU request on EATT bearer {}", id);
            self.send_reply(
                id,
                ClientPdu::ErrorResponse {
                    request_opcode: ATT_EXCHANGE_MTU_REQ,
                    handle: 0,
                    code: AttErrorCode::RequestNotSupported,
                },
            );
            return;
        }
        if let Some(bearer) = self.att_bearer_mut(id) {
            bearer.payload_size = payload_size;
        }
        self.send_reply(id, ClientPdu::ExchangeMtuResponse { mtu: local_mtu });
        info!("GATT: server set payload size {}", payload_size);
        self.mtu_changed(idx, payload_size);
    }

    fn mtu_changed(&mut self, idx: u8, mtu: u16) {
        for gatt_if in self.app_ids() {
            self.pending.push((
                gatt_if,
                GattEvent::MtuChanged {
                    conn_id: ConnId::new(gatt_if, idx),
                    mtu,
                },
            ));
        }
    }

    fn deliver(&mut self, id: BearerId, handle: u16, value: Vec<u8>, is_indication: bool) {
        let idx = match self.bearer_map.get(&id) {
            Some(idx) => *idx,
            None => return,
        };
        if handle == 0 {
            warn!("GATT: value with invalid handle dropped");
            if is_indication {
                self.send_reply(id, ClientPdu::HandleValueConfirmation);
            }
            return;
        }
        trace!("GATT: {} {:#06x} len {}", if is_indication { "indication" } else { "notification" }, handle, value.len());

        let apps = self.app_ids();
        if is_indication {
            if let Some(tcb) = self.tcbs.get_mut(&idx) {
                if tcb.ind_count > 0 {
                    warn!("GATT: indication before previous one was confirmed");
                }
                tcb.ind_count = apps.len();
                tcb.ind_bearer = Some(id);
            }
            if apps.is_empty() {
                self.confirm_indication(idx);
            } else {
                self.timers
                    .arm(GattTimer::IndicationAck(idx), self.config.ind_ack_timeout);
            }
        }
        for gatt_if in apps {
            self.pending.push((
                gatt_if,
                GattEvent::Notification {
                    conn_id: ConnId::new(gatt_if, idx),
                    handle,
                    value: value.clone(),
                    is_indication,
                },
            ));
        }
    }

    fn confirm_indication(&mut self, idx: u8) {
        let bearer = match self.tcbs.get_mut(&idx).and_then(|tcb| tcb.ind_bearer.take()) {
            Some(bearer) => bearer,
            None => return,
        };
        self.send_reply(bearer, ClientPdu::HandleValueConfirmation);
    }

    fn on_response(&mut self, bearer_id: BearerId, pdu: ServerPdu) {
        let (payload_size, id) = match self.att_bearer_mut(bearer_id) {
            Some(bearer) => match bearer.in_flight.take() {
                Some(id) => (bearer.payload_size, id),
                None => {
                    warn!(
                        "GATT: unexpected response {:#04x} on bearer {}",
                        pdu.opcode(),
                        bearer_id
                    );
                    return;
                }
            },
            None => return,
        };
        self.timers.cancel(&GattTimer::Response(id));
        let mut clcb = match self.clcbs.remove(&id) {
            Some(clcb) => clcb,
            None => {
                // owner unregistered while the request was on the air
                self.service_queue(bearer_id);
                return;
            }
        };
        clcb.retry_count = 0;
        let expected = clcb.request.take().and_then(|request| request.response_opcode());

        let flow = match pdu {
            ServerPdu::ErrorResponse { code, handle, .. } => self.on_error_response(&mut clcb, code, handle),
            pdu if Some(pdu.opcode()) != expected => {
                warn!(
                    "GATT: response {:#04x} does not match request, expected {:?}",
                    pdu.opcode(),
                    expected
                );
                Flow::Done(GattStatus::Error, OperationData::None)
            }
            pdu => self.on_success_response(bearer_id, &mut clcb, pdu, payload_size),
        };
        self.advance(bearer_id, clcb, flow);
    }

    fn advance(&mut self, bearer_id: BearerId, clcb: Clcb, flow: Flow) {
        match flow {
            Flow::Continue => {
                let id = clcb.id;
                self.clcbs.insert(id, clcb);
                if let Some(bearer) = self.att_bearer_mut(bearer_id) {
                    bearer.queue.push_front(id);
                }
            }
            Flow::Done(status, data) => self.complete(clcb, status, data),
        }
        self.service_queue(bearer_id);
    }

    fn on_error_response(&mut self, clcb: &mut Clcb, code: AttErrorCode, handle: u16) -> Flow {
        debug!("GATT: {} error {:?} on handle {:#06x}", clcb.conn_id, code, handle);
        match &mut clcb.procedure {
            // Running out of attributes ends a discovery normally
            Procedure::Discover { .. } if code == AttErrorCode::AttributeNotFound => {
                Flow::Done(GattStatus::Success, OperationData::None)
            }
            Procedure::Read { handle, value }
                if !value.is_empty() && code == AttErrorCode::AttributeNotLong =>
            {
                Flow::Done(
                    GattStatus::Success,
                    OperationData::Value {
                        handle: *handle,
                        value: std::mem::take(value),
                    },
                )
            }
            Procedure::LongWrite {
                handle,
                value,
                offset,
                failure,
                ..
            } => match failure {
                // the cancel itself failed
                Some(status) => Flow::Done(*status, OperationData::Handle(*handle)),
                // the commit failed; nothing is left queued to cancel
                None if *offset >= value.len() => {
                    Flow::Done(GattStatus::Att(code), OperationData::Handle(*handle))
                }
                None => {
                    *failure = Some(GattStatus::Att(code));
                    Flow::Continue
                }
            },
            _ => Flow::Done(GattStatus::Att(code), OperationData::None),
        }
    }

    fn on_success_response(
        &mut self,
        bearer_id: BearerId,
        clcb: &mut Clcb,
        pdu: ServerPdu,
        payload_size: u16,
    ) -> Flow {
        let conn_id = clcb.conn_id;
        let mut switch_to = None;
        let flow = match (&mut clcb.procedure, pdu) {
            (Procedure::Mtu { mtu }, ServerPdu::ExchangeMtuResponse { mtu: peer_mtu }) => {
                let payload_size = LE_MIN_MTU.max(peer_mtu.min(*mtu));
                let idx = conn_id.tcb_idx();
                if let Some(tcb) = self.tcbs.get_mut(&idx) {
                    tcb.mtu_exchanged = true;
                    if let Some(bearer) = tcb.bearer_mut(bearer_id) {
                        bearer.payload_size = payload_size;
                    }
                    info!(
                        "GATT: payload size {} with {}, data length hint {}",
                        payload_size, tcb.peer, tcb.max_user_mtu
                    );
                }
                self.mtu_changed(idx, payload_size);
                Flow::Done(GattStatus::Success, OperationData::Mtu(payload_size))
            }
            (
                Procedure::Discover {
                    kind,
                    start,
                    end,
                    pending_include,
                },
                pdu,
            ) => {
                let last = match self.discovery_records(conn_id, kind, pending_include, pdu) {
                    Ok(Some(last)) => last,
                    Ok(None) => return Flow::Continue,
                    Err(status) => return Flow::Done(status, OperationData::None),
                };
                if last < *start {
                    warn!("GATT: discovery went backwards to {:#06x}", last);
                    return Flow::Done(GattStatus::InvalidPdu, OperationData::None);
                }
                if last >= *end {
                    return Flow::Done(GattStatus::Success, OperationData::None);
                }
                *start = last + 1;
                Flow::Continue
            }
            (Procedure::Read { handle, value }, ServerPdu::ReadResponse(chunk))
            | (Procedure::Read { handle, value }, ServerPdu::ReadBlobResponse(chunk)) => {
                let full = chunk.len() + 1 == payload_size as usize;
                value.extend_from_slice(&chunk);
                if full && value.len() < GATT_MAX_ATTR_LEN {
                    return Flow::Continue;
                }
                value.truncate(GATT_MAX_ATTR_LEN);
                Flow::Done(
                    GattStatus::Success,
                    OperationData::Value {
                        handle: *handle,
                        value: std::mem::take(value),
                    },
                )
            }
            (Procedure::ReadByUuid { .. }, ServerPdu::ReadByTypeResponse(records)) => {
                let record = match records.into_iter().next() {
                    Some(record) => record,
                    None => return Flow::Done(GattStatus::InvalidPdu, OperationData::None),
                };
                if record.value.len() + 4 == payload_size as usize {
                    // value may be cut short: read the rest as a long read
                    switch_to = Some(Procedure::Read {
                        handle: record.handle,
                        value: record.value,
                    });
                    Flow::Continue
                } else {
                    Flow::Done(
                    GattStatus::Success,
                        OperationData::Value {
                            handle: record.handle,
                            value: record.value,
                        },
                    )
                }
            }
            (Procedure::ReadMultiple { .. }, ServerPdu::ReadMultipleResponse(value)) => {
                Flow::Done(GattStatus::Success, OperationData::Multiple(value))
            }
            (Procedure::ReadMultiple { .. }, ServerPdu::ReadMultipleVariableResponse(values)) => {
                Flow::Done(GattStatus::Success, OperationData::Values(values))
            }
            (Procedure::ReadPartial { handle, .. }, ServerPdu::ReadBlobResponse(value)) => Flow::Done(
                GattStatus::Success,
                OperationData::Value {
                    handle: *handle,
                    value,
                },
            ),
            (Procedure::Write { handle, .. }, ServerPdu::WriteResponse) => {
                Flow::Done(GattStatus::Success, OperationData::Handle(*handle))
            }
            (
                Procedure::LongWrite {
                    handle,
                    value,
                    offset,
                    chunk,
                    failure,
                },
                ServerPdu::PrepareWriteResponse {
                    handle: echoed_handle,
                    offset: echoed_offset,
                    value: echoed,
                },
            ) => {
                let sent = &value[*offset..*offset + *chunk];
                if echoed_handle != *handle
                    || echoed_offset as usize != *offset
                    || echoed.as_slice() != sent
                {
                    warn!("GATT: prepared value mismatch at offset {}, cancelling", offset);
                    *failure = Some(GattStatus::Error);
                } else {
                    *offset += *chunk;
                }
                Flow::Continue
            }
            (Procedure::LongWrite { handle, failure, .. }, ServerPdu::ExecuteWriteResponse) => {
                Flow::Done(
                    failure.unwrap_or(GattStatus::Success),
                    OperationData::Handle(*handle),
                )
            }
            (
                Procedure::Prepare { .. },
                ServerPdu::PrepareWriteResponse {
                    handle,
                    offset,
                    value,
                },
            ) => Flow::Done(
                GattStatus::Success,
                OperationData::Prepared {
                    handle,
                    offset,
                    value,
                },
            ),
            (Procedure::Execute { .. }, ServerPdu::ExecuteWriteResponse) => {
                Flow::Done(GattStatus::Success, OperationData::None)
            }
            (procedure, pdu) => {
                warn!("GATT: {:#04x} does not fit {:?}", pdu.opcode(), procedure);
                Flow::Done(GattStatus::Error, OperationData::None)
            }
        };
        if let Some(procedure) = switch_to {
            clcb.procedure = procedure;
        }
        flow
    }

    /// Report the records of one discovery response
    ///
    /// Returns the last handle covered, `None` when a follow-up read is
    /// needed first, or the status that ends the discovery.
    fn discovery_records(
        &mut self,
        conn_id: ConnId,
        kind: &DiscoveryType,
        pending_include: &mut Option<(u16, u16, u16)>,
        pdu: ServerPdu,
    ) -> Result<Option<u16>, GattStatus> {
        let mut last = 0;
        let mut found = Vec::new();
        match (kind, pdu) {
            (DiscoveryType::AllServices, ServerPdu::ReadByGroupTypeResponse(groups)) => {
                for group in groups {
                    let uuid = Uuid::from_bytes(&group.value).ok_or(GattStatus::InvalidPdu)?;
                    if group.end_group < group.handle {
                        return Err(GattStatus::InvalidPdu);
                    }
                    found.push(DiscoveryRecord::Service(Service {
                        uuid,
                        is_primary: true,
                        start_handle: group.handle,
                        end_handle: group.end_group,
                    }));
                    last = group.end_group;
                }
            }
            (DiscoveryType::ServicesByUuid(uuid), ServerPdu::FindByTypeValueResponse(ranges)) => {
                for range in ranges {
                    if range.end_group < range.found {
                        return Err(GattStatus::InvalidPdu);
                    }
                    found.push(DiscoveryRecord::Service(Service {
                        uuid: uuid.clone(),
                        is_primary: true,
                        start_handle: range.found,
                        end_handle: range.end_group,
                    }));
                    last = range.end_group;
                }
            }
            (DiscoveryType::IncludedServices, ServerPdu::ReadByTypeResponse(records)) => {
                for record in records {
                    let v = &record.value;
                    let (included_start, included_end) = match v.len() {
                        4 | 6 => (
                            u16::from_le_bytes([v[0], v[1]]),
                            u16::from_le_bytes([v[2], v[3]]),
                        ),
                        _ => return Err(GattStatus::InvalidPdu),
                    };
                    if v.len() == 4 {
                        // 128-bit service UUID: read it from the service declaration
                        *pending_include = Some((record.handle, included_start, included_end));
                        self.push_records(conn_id, found);
                        return Ok(None);
                    }
                    found.push(DiscoveryRecord::IncludedService(IncludedService {
                        handle: record.handle,
                        uuid: Uuid::from_u16(u16::from_le_bytes([v[4], v[5]])),
                        start_handle: included_start,
                        end_handle: included_end,
                    }));
                    last = record.handle;
                }
            }
            (DiscoveryType::IncludedServices, ServerPdu::ReadResponse(value)) => {
                let (handle, included_start, included_end) =
                    pending_include.take().ok_or(GattStatus::Error)?;
                if value.len() != 16 {
                    return Err(GattStatus::InvalidPdu);
                }
                let uuid = Uuid::from_bytes(&value).ok_or(GattStatus::InvalidPdu)?;
                found.push(DiscoveryRecord::IncludedService(IncludedService {
                    handle,
                    uuid,
                    start_handle: included_start,
                    end_handle: included_end,
                }));
                last = handle;
            }
            (DiscoveryType::Characteristics(filter), ServerPdu::ReadByTypeResponse(records)) => {
                for record in records {
                    let v = &record.value;
                    if v.len() != 5 && v.len() != 19 {
                        return Err(GattStatus::InvalidPdu);
                    }
                    let uuid = Uuid::from_bytes(&v[3..]).ok_or(GattStatus::InvalidPdu)?;
                    last = record.handle;
                    if let Some(filter) = filter {
                        if !filter.same_as(&uuid) {
                            continue;
                        }
                    }
                    found.push(DiscoveryRecord::Characteristic(Characteristic {
                        uuid,
                        declaration_handle: record.handle,
                        value_handle: u16::from_le_bytes([v[1], v[2]]),
                        properties: CharacteristicProperty(v[0]),
                    }));
                }
            }
            (DiscoveryType::Descriptors, ServerPdu::FindInformationResponse(info)) => {
                for (handle, uuid) in info {
                    found.push(DiscoveryRecord::Descriptor(Descriptor { handle, uuid }));
                    last = handle;
                }
            }
            (kind, pdu) => {
                warn!("GATT: {:#04x} does not fit {:?} discovery", pdu.opcode(), kind);
                return Err(GattStatus::Error);
            }
        }
        self.push_records(conn_id, found);
        Ok(Some(last))
    }

    fn push_records(&mut self, conn_id: ConnId, records: Vec<DiscoveryRecord>) {
        for record in records {
            self.pending.push((
                conn_id.gatt_if(),
                GattEvent::DiscoveryResult { conn_id, record },
            ));
        }
    }

    fn response_timeout(&mut self, id: ClcbId) {
        let clcb = match self.clcbs.get_mut(&id) {
            Some(clcb) => clcb,
            None => return,
        };
        let bearer_id = clcb.bearer;

        let retry = matches!(
            clcb.procedure,
            Procedure::Discover {
                kind: DiscoveryType::AllServices,
                ..
            }
        ) && clcb.retry_count < GATT_REQ_RETRY_LIMIT;
        if retry {
            if let Some(request) = &clcb.request {
                clcb.retry_count += 1;
                warn!(
                    "GATT: service discovery timed out, retry {}",
                    clcb.retry_count
                );
                if self.bearer.send(bearer_id, &request.to_bytes()) == SendStatus::Ok {
                    self.timers
                        .arm(GattTimer::Response(id), self.config.response_timeout);
                    return;
                }
            }
        }

        warn!("GATT: response timeout for {}", clcb.conn_id);
        if let Some(bearer) = self.att_bearer_mut(bearer_id) {
            if bearer.in_flight == Some(id) {
                bearer.in_flight = None;
            }
        }
        if let Some(clcb) = self.clcbs.remove(&id) {
            self.complete(clcb, GattStatus::Error, OperationData::None);
        }
        self.service_queue(bearer_id);
    }

    /// End the request in flight on a bearer with `status`
    fn fail_in_flight(&mut self, bearer_id: BearerId, status: GattStatus) {
        let id = match self.att_bearer_mut(bearer_id).and_then(|b| b.in_flight.take()) {
            Some(id) => id,
            None => return,
        };
        if let Some(clcb) = self.clcbs.remove(&id) {
            self.complete(clcb, status, OperationData::None);
        }
        self.service_queue(bearer_id);
    }

    /// Complete every CLCB matching `pred` because its bearer is gone
    fn close_clcbs<P: Fn(&Clcb) -> bool>(&mut self, pred: P) {
        let mut closed: Vec<ClcbId> = self
            .clcbs
            .values()
            .filter(|clcb| pred(clcb))
            .map(|clcb| clcb.id)
            .collect();
        closed.sort();
        for id in closed {
            if let Some(clcb) = self.clcbs.remove(&id) {
                self.complete(clcb, GattStatus::ConnectionClosed, OperationData::None);
            }
        }
    }

    fn complete(&mut self, clcb: Clcb, status: GattStatus, data: OperationData) {
        self.timers.cancel(&GattTimer::Response(clcb.id));
        let conn_id = clcb.conn_id;
        if !status.is_success() {
            debug!("GATT: {} {:?} ended with {:?}", conn_id, clcb.procedure.operation(), status);
        }
        let event = match clcb.procedure {
            Procedure::Discover { .. } => GattEvent::DiscoveryComplete { conn_id, status },
            procedure => GattEvent::OperationComplete {
                conn_id,
                op: procedure.operation(),
                status,
                data,
            },
        };
        self.pending.push((conn_id.gatt_if(), event));
    }

    fn dispatch(&mut self) {
        let events = std::mem::take(&mut self.pending);
        if events.is_empty() {
            return;
        }
        // Snapshot so a callback sees a stable subscriber list
        let apps: Vec<(GattIf, GattEventCallback)> = self
            .apps
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();
        for (gatt_if, event) in events {
            let callback = match apps.iter().find(|(id, _)| *id == gatt_if) {
                Some((_, callback)) => callback,
                None => {
                    trace!("GATT: app {} gone, dropping {:?}", gatt_if, event);
                    continue;
                }
            };
            match callback.lock() {
                Ok(mut callback) => callback(event),
                Err(_) => error!("GATT event callback for {} poisoned", gatt_if),
            };
        }
    }
}

impl std::fmt::Debug for GattClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattClient")
            .field("apps", &self.apps.len())
            .field("links", &self.tcbs.len())
            .field("operations", &self.clcbs.len())
            .finish()
    }
}

fn check_handle(handle: u16) -> GattResult<()> {
    if handle == 0 {
        return Err(GattError::InvalidHandle(handle));
    }
    Ok(())
}

/// Reject values that can never fit the chosen bearer
fn check_fits(procedure: &Procedure, payload_size: u16) -> GattResult<()> {
    let room = payload_size as usize;
    match procedure {
        Procedure::Write {
            value,
            kind: WriteType::NoResponse,
            ..
        } if value.len() + ATT_WRITE_HEADER_SIZE > room => {
            Err(GattError::InvalidParameter("value too long for a write command"))
        }
        Procedure::Write {
            value,
            kind: WriteType::Signed,
            ..
        } if value.len() + ATT_WRITE_HEADER_SIZE + ATT_SIGNATURE_SIZE > room => {
            Err(GattError::InvalidParameter("value too long for a signed write"))
        }
        Procedure::Prepare { value, .. } if value.len() + ATT_PREPARE_WRITE_HEADER_SIZE > room => {
            Err(GattError::InvalidParameter("value too long for a prepare write"))
        }
        _ => Ok(()),
    }
}
