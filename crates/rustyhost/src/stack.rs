//! Core context owning the protocol engines
//!
//! The [`Stack`] is the one value every task on the executor works
//! against. It keeps the bearer registry, routes lower-layer events to the
//! engine that owns each channel (by fixed CID or PSM) and fans timer
//! processing out to the engines.

use crate::adv::{AdvEvent, AdvReassembler};
use crate::bearer::{
    Bearer, BearerDescriptor, BearerId, BearerTable, ATT_CID, BR_SMP_CID, EATT_PSM, RFCOMM_PSM,
    SMP_CID,
};
use crate::codec::CodecError;
use crate::config::StackConfig;
use crate::error::Result;
use crate::gap::{AddressWithType, BdAddr, Transport};
use crate::gatt::{GattClient, GattError};
use crate::hci::{HciEvent, LeMetaEvent};
use crate::rfcomm::RfcommManager;
use crate::smp::{
    ConnectionSignatureResolvingKey, CsrkSigner, KeyStore, KeyType, MemoryKeyStore, PairingRole,
    SmpCrypto, SmpLink, SmpManager, SoftwareCrypto,
};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Callback type for reassembled advertising output
pub type AdvEventCallback = Arc<Mutex<dyn FnMut(AdvEvent) + Send>>;

/// Engine owning a bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Gatt,
    Smp,
    Rfcomm,
}

impl Route {
    fn for_bearer(desc: &BearerDescriptor) -> Option<Self> {
        match (desc.psm, desc.local_cid) {
            (Some(RFCOMM_PSM), _) => Some(Route::Rfcomm),
            (Some(EATT_PSM), _) => Some(Route::Gatt),
            (None, ATT_CID) => Some(Route::Gatt),
            (None, SMP_CID) if desc.transport == Transport::Le => Some(Route::Smp),
            (None, BR_SMP_CID) if desc.transport == Transport::BrEdr => Some(Route::Smp),
            _ => None,
        }
    }
}

/// ACL link as reported by the controller
#[derive(Debug, Clone, Copy)]
struct Link {
    peer: AddressWithType,
    role: PairingRole,
}

/// The host core: bearer registry plus the four protocol engines
pub struct Stack {
    local_address: AddressWithType,
    bearers: BearerTable,
    routes: HashMap<BearerId, Route>,
    links: HashMap<(BdAddr, Transport), Link>,
    /// SMP channels that opened before their link was reported
    unbound_smp: HashMap<(BdAddr, Transport), BearerId>,
    rfcomm: RfcommManager,
    smp: SmpManager,
    gatt: GattClient,
    adv: AdvReassembler,
    adv_callback: Option<AdvEventCallback>,
}

impl Stack {
    pub fn new(
        config: StackConfig,
        bearer: Arc<dyn Bearer>,
        crypto: Arc<dyn SmpCrypto>,
        key_store: Arc<dyn KeyStore>,
    ) -> Self {
        let StackConfig {
            local_address,
            rfcomm,
            smp,
            gatt,
            adv,
        } = config;
        info!("host core up as {}", local_address);
        Self {
            local_address,
            bearers: BearerTable::new(),
            routes: HashMap::new(),
            links: HashMap::new(),
            unbound_smp: HashMap::new(),
            rfcomm: RfcommManager::new(rfcomm, Arc::clone(&bearer)),
            smp: SmpManager::new(smp, Arc::clone(&bearer), crypto, key_store),
            gatt: GattClient::new(gatt, bearer),
            adv: AdvReassembler::new(adv),
            adv_callback: None,
        }
    }

    /// Stack with the software crypto provider and an in-memory key store
    pub fn with_defaults(config: StackConfig, bearer: Arc<dyn Bearer>) -> Self {
        Self::new(
            config,
            bearer,
            Arc::new(SoftwareCrypto::new()),
            Arc::new(MemoryKeyStore::new()),
        )
    }

    pub fn rfcomm(&self) -> &RfcommManager {
        &self.rfcomm
    }

    pub fn rfcomm_mut(&mut self) -> &mut RfcommManager {
        &mut self.rfcomm
    }

    pub fn smp(&self) -> &SmpManager {
        &self.smp
    }

    pub fn smp_mut(&mut self) -> &mut SmpManager {
        &mut self.smp
    }

    pub fn gatt(&self) -> &GattClient {
        &self.gatt
    }

    pub fn gatt_mut(&mut self) -> &mut GattClient {
        &mut self.gatt
    }

    pub fn adv(&self) -> &AdvReassembler {
        &self.adv
    }

    pub fn adv_mut(&mut self) -> &mut AdvReassembler {
        &mut self.adv
    }

    pub fn bearers(&self) -> &BearerTable {
        &self.bearers
    }

    /// Set the callback receiving reassembled advertising reports
    pub fn set_adv_callback<F>(&mut self, callback: F)
    where
        F: FnMut(AdvEvent) + Send + 'static,
    {
        self.adv_callback = Some(Arc::new(Mutex::new(callback)));
    }

    /// An ACL link came up; SMP needs the role and peer address type
    pub fn on_link_up(&mut self, peer: AddressWithType, transport: Transport, role: PairingRole) {
        let key = (peer.address, transport);
        debug!("link up: {} {:?} as {:?}", peer, transport, role);
        self.links.insert(key, Link { peer, role });
        if let Some(bearer) = self.unbound_smp.remove(&key) {
            self.bind_smp(bearer, key);
        }
    }

    pub fn on_link_down(&mut self, peer: &BdAddr, transport: Transport) {
        let key = (*peer, transport);
        debug!("link down: {} {:?}", peer, transport);
        self.links.remove(&key);
        self.unbound_smp.remove(&key);
        self.smp.on_link_down(peer, transport);
    }

    /// A fixed or dynamic L2CAP channel came up; route it by CID or PSM
    pub fn on_bearer_connected(&mut self, desc: BearerDescriptor) {
        let route = match Route::for_bearer(&desc) {
            Some(route) => route,
            None => {
                debug!(
                    "no engine for bearer {} cid {:#06x} psm {:?}",
                    desc.id, desc.local_cid, desc.psm
                );
                return;
            }
        };
        if let Err(err) = self.bearers.open(desc.clone()) {
            warn!("ignoring bearer {}: {}", desc.id, err);
            return;
        }
        self.routes.insert(desc.id, route);
        trace!("bearer {} routed to {:?}", desc.id, route);

        match route {
            Route::Gatt => self.gatt.on_bearer_connected(&desc),
            Route::Rfcomm => self.rfcomm.on_bearer_connected(&desc),
            Route::Smp => {
                let key = (desc.peer, desc.transport);
                if self.links.contains_key(&key) {
                    self.bind_smp(desc.id, key);
                } else {
                    debug!("SMP bearer {} waits for its link", desc.id);
                    self.unbound_smp.insert(key, desc.id);
                }
            }
        }
    }

    pub fn on_bearer_disconnected(&mut self, id: BearerId) {
        let desc = match self.bearers.invalidate(id) {
            Ok(desc) => desc,
            Err(err) => {
                debug!("disconnect: {}", err);
                return;
            }
        };
        match self.routes.remove(&id) {
            Some(Route::Gatt) => self.gatt.on_bearer_disconnected(id),
            Some(Route::Rfcomm) => self.rfcomm.on_bearer_disconnected(id),
            Some(Route::Smp) => {
                let key = (desc.peer, desc.transport);
                if self.unbound_smp.get(&key) == Some(&id) {
                    self.unbound_smp.remove(&key);
                }
                self.smp.on_link_down(&desc.peer, desc.transport);
            }
            None => {}
        }
    }

    pub fn on_bearer_congestion(&mut self, id: BearerId, congested: bool) {
        if let Err(err) = self.bearers.set_congested(id, congested) {
            debug!("congestion: {}", err);
            return;
        }
        match self.routes.get(&id) {
            Some(Route::Gatt) => self.gatt.on_bearer_congestion(id, congested),
            Some(Route::Rfcomm) => self.rfcomm.on_bearer_congestion(id, congested),
            Some(Route::Smp) => trace!("SMP bearer {} congested: {}", id, congested),
            None => {}
        }
    }

    pub fn on_bearer_data(&mut self, id: BearerId, data: &[u8]) {
        match self.routes.get(&id) {
            Some(Route::Gatt) => self.gatt.on_bearer_data(id, data),
            Some(Route::Rfcomm) => self.rfcomm.on_bearer_data(id, data),
            Some(Route::Smp) => self.smp.on_bearer_data(id, data),
            None => warn!("dropping {} bytes on unrouted bearer {}", data.len(), id),
        }
    }

    /// The lower layer finished transmitting frames; sends already
    /// returned `Ok`, so this is informational
    pub fn on_bearer_tx_complete(&mut self, id: BearerId, sdu_count: u16) {
        trace!("bearer {} transmitted {} frames", id, sdu_count);
    }

    /// Feed one HCI event packet (without the packet indicator)
    pub fn on_hci_event(&mut self, data: &[u8]) -> Result<()> {
        let event = HciEvent::parse(data).ok_or(CodecError::ShortRead {
            needed: data.get(1).map_or(2, |len| *len as usize + 2),
            remaining: data.len(),
        })?;
        let meta = match event.le_meta()? {
            Some(meta) => meta,
            None => {
                trace!("ignoring HCI event {:#04x}", event.event_code);
                return Ok(());
            }
        };

        match meta {
            LeMetaEvent::AdvertisingReports(fragments)
            | LeMetaEvent::ExtendedAdvertisingReports(fragments) => {
                for fragment in fragments {
                    if let Some(report) = self.adv.process_report(fragment) {
                        self.emit(AdvEvent::Report(report));
                    }
                }
            }
            LeMetaEvent::PeriodicAdvertisingReport(fragment) => {
                if let Some(report) = self.adv.process_periodic(fragment) {
                    self.emit(AdvEvent::PeriodicReport(report));
                }
            }
            LeMetaEvent::PeriodicSyncLost { sync_handle } => {
                self.adv.sync_lost(sync_handle);
                self.emit(AdvEvent::PeriodicSyncLost { sync_handle });
            }
            LeMetaEvent::Other(subevent) => trace!("ignoring LE meta event {:#04x}", subevent),
        }
        Ok(())
    }

    /// Sign writes to `peer` with the CSRK we distributed when bonding
    pub fn enable_signed_writes(&mut self, peer: &BdAddr) -> Result<()> {
        let csrk = self
            .smp
            .key_store()
            .get_bonded_key(peer, KeyType::LocalCsrk)
            .and_then(|bytes| ConnectionSignatureResolvingKey::from_bytes(&bytes))
            .ok_or(GattError::NoSigningKey(*peer))?;
        let signer = CsrkSigner::new(Arc::clone(self.smp.crypto()), csrk);
        self.gatt.set_signing_key(*peer, signer);
        debug!("signed writes enabled for {}", peer);
        Ok(())
    }

    /// Run every engine's expired timers
    pub fn process_timeouts(&mut self, now: Instant) {
        self.rfcomm.process_timeouts(now);
        self.smp.process_timeouts(now);
        self.gatt.process_timeouts(now);
    }

    /// Earliest deadline of any engine
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.rfcomm.next_deadline(),
            self.smp.next_deadline(),
            self.gatt.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn bind_smp(&mut self, bearer: BearerId, key: (BdAddr, Transport)) {
        let link = match self.links.get(&key) {
            Some(link) => *link,
            None => return,
        };
        self.smp.on_link_up(SmpLink {
            bearer,
            transport: key.1,
            role: link.role,
            local: self.local_address,
            peer: link.peer,
        });
    }

    fn emit(&self, event: AdvEvent) {
        let callback = match &self.adv_callback {
            Some(callback) => callback,
            None => return,
        };
        match callback.lock() {
            Ok(mut callback) => callback(event),
            Err(_) => error!("advertising callback poisoned"),
        };
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("local_address", &self.local_address)
            .field("bearers", &self.bearers.len())
            .field("links", &self.links.len())
            .field("gatt", &self.gatt)
            .finish()
    }
}
