//! Security Manager Protocol manager implementation
//!
//! One pairing control block exists per (peer, transport) while a pairing
//! runs. Inbound frames, user answers, encryption changes and timer
//! expiries drive it through
//!
//! ```text
//! IDLE -> PAIR_REQ_SENT | PAIR_REQ_RECVD -> [PUBLIC_KEY_EXCHANGE]
//!      -> [COMMITMENT_EXCHANGE] -> NONCE_EXCHANGE -> [DHKEY_CHECK]
//!      -> ENCRYPTION_PENDING -> BOND_PENDING -> COMPLETE
//! ```
//!
//! Pairing over BR/EDR goes straight from the feature exchange to key
//! distribution. Every failure ends the block and is reported once through
//! [`SmpEvent::PairingComplete`]; success is reported when the delayed-auth
//! timer expires so that a late Pairing Failed can still downgrade it.

use super::constants::*;
use super::crypto::{h7_salt, EcdhKeyPair, SmpCrypto};
use super::keys::{self, *};
use super::method::{select_model, PairingModel, PasskeyAction};
use super::pdu::SmpCommand;
use super::types::*;
use crate::bearer::{Bearer, BearerId, SendStatus};
use crate::gap::{AddressWithType, BdAddr, Transport};
use crate::timer::TimerQueue;
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type CbKey = (BdAddr, Transport);

/// Outcome of one protocol step; `Err` aborts the pairing with the reason
type Step = Result<(), SmpReason>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SmpTimer {
    Response(CbKey),
    DelayedAuth(CbKey),
}

fn mask_key(mut key: [u8; 16], key_size: u8) -> [u8; 16] {
    for byte in key.iter_mut().skip(key_size as usize) {
        *byte = 0;
    }
    key
}

/// Passkey as the 128-bit value used for TK and for f6
fn passkey_value(passkey: u32) -> [u8; 16] {
    let mut value = [0u8; 16];
    value[0..4].copy_from_slice(&passkey.to_le_bytes());
    value
}

/// Address as fed to f5 and f6: six address octets then the type octet
fn addr7(addr: &AddressWithType) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0..6].copy_from_slice(addr.address.as_slice());
    out[6] = smp_address_type(addr);
    out
}

fn derive_link_key(crypto: &dyn SmpCrypto, ltk: &[u8; 16], h7: bool) -> [u8; 16] {
    let ilk = if h7 {
        crypto.h7(&h7_salt(&SMP_KEYID_TMP1), ltk)
    } else {
        crypto.h6(ltk, &SMP_KEYID_TMP1)
    };
    crypto.h6(&ilk, &SMP_KEYID_LEBR)
}

fn derive_ltk(crypto: &dyn SmpCrypto, link_key: &[u8; 16], h7: bool) -> [u8; 16] {
    let iltk = if h7 {
        crypto.h7(&h7_salt(&SMP_KEYID_TMP2), link_key)
    } else {
        crypto.h6(link_key, &SMP_KEYID_TMP2)
    };
    crypto.h6(&iltk, &SMP_KEYID_BRLE)
}

/// Pairing control block
struct PairingCb {
    link: SmpLink,
    state: SmpState,
    requirements: AuthRequirements,
    local_params: Option<PairingParams>,
    peer_params: Option<PairingParams>,
    preq: [u8; 7],
    pres: [u8; 7],
    model: Option<PairingModel>,
    sc: bool,
    h7: bool,
    key_size: u8,
    init_keys: u8,
    resp_keys: u8,
    peer_keys_pending: u8,
    local_keys_pending: u8,
    tk: Option<[u8; 16]>,
    passkey: Option<u32>,
    passkey_round: u8,
    awaiting_user: bool,
    local_rand: [u8; 16],
    peer_rand: Option<[u8; 16]>,
    peer_confirm: Option<[u8; 16]>,
    keypair: Option<EcdhKeyPair>,
    peer_public: Option<([u8; 32], [u8; 32])>,
    dhkey: Option<[u8; 32]>,
    mac_key: [u8; 16],
    /// STK while legacy encryption is pending, otherwise the LTK
    ltk: [u8; 16],
    ltk_derived: bool,
    peer_dhkey_check: Option<[u8; 16]>,
    sec_level: SecurityLevel,
    peer_enc_key: Option<[u8; 16]>,
    peer_ltk: Option<LongTermKey>,
    peer_irk: Option<[u8; 16]>,
    peer_identity: Option<IdentityResolvingKey>,
    peer_csrk: Option<ConnectionSignatureResolvingKey>,
    local_ltk: Option<LongTermKey>,
    local_identity: Option<IdentityResolvingKey>,
    local_csrk: Option<ConnectionSignatureResolvingKey>,
    link_key: Option<keys::LinkKey>,
}

impl PairingCb {
    fn new(link: SmpLink, requirements: AuthRequirements) -> Self {
        Self {
            link,
            state: SmpState::Idle,
            requirements,
            local_params: None,
            peer_params: None,
            preq: [0; 7],
            pres: [0; 7],
            model: None,
            sc: false,
            h7: false,
            key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            init_keys: 0,
            resp_keys: 0,
            peer_keys_pending: 0,
            local_keys_pending: 0,
            tk: None,
            passkey: None,
            passkey_round: 0,
            awaiting_user: false,
            local_rand: [0; 16],
            peer_rand: None,
            peer_confirm: None,
            keypair: None,
            peer_public: None,
            dhkey: None,
            mac_key: [0; 16],
            ltk: [0; 16],
            ltk_derived: false,
            peer_dhkey_check: None,
            sec_level: SecurityLevel::None,
            peer_enc_key: None,
            peer_ltk: None,
            peer_irk: None,
            peer_identity: None,
            peer_csrk: None,
            local_ltk: None,
            local_identity: None,
            local_csrk: None,
            link_key: None,
        }
    }

    fn role(&self) -> PairingRole {
        self.link.role
    }

    fn central_addr(&self) -> AddressWithType {
        match self.role() {
            PairingRole::Central => self.link.local,
            PairingRole::Peripheral => self.link.peer,
        }
    }

    fn peripheral_addr(&self) -> AddressWithType {
        match self.role() {
            PairingRole::Central => self.link.peer,
            PairingRole::Peripheral => self.link.local,
        }
    }

    fn central_params(&self) -> Option<PairingParams> {
        match self.role() {
            PairingRole::Central => self.local_params,
            PairingRole::Peripheral => self.peer_params,
        }
    }

    fn peripheral_params(&self) -> Option<PairingParams> {
        match self.role() {
            PairingRole::Central => self.peer_params,
            PairingRole::Peripheral => self.local_params,
        }
    }

    fn bonding(&self) -> bool {
        match (self.local_params, self.peer_params) {
            (Some(local), Some(peer)) => local.bonding() && peer.bonding(),
            _ => false,
        }
    }

    fn model(&self) -> Result<PairingModel, SmpReason> {
        self.model.ok_or(SmpReason::UnspecifiedReason)
    }

    fn local_public_x(&self) -> Result<[u8; 32], SmpReason> {
        self.keypair
            .as_ref()
            .map(|kp| kp.public_x)
            .ok_or(SmpReason::UnspecifiedReason)
    }

    fn peer_public_x(&self) -> Result<[u8; 32], SmpReason> {
        self.peer_public
            .map(|(x, _)| x)
            .ok_or(SmpReason::UnspecifiedReason)
    }

    /// (PKax, PKbx)
    fn public_keys_ab(&self) -> Result<([u8; 32], [u8; 32]), SmpReason> {
        let local = self.local_public_x()?;
        let peer = self.peer_public_x()?;
        Ok(match self.role() {
            PairingRole::Central => (local, peer),
            PairingRole::Peripheral => (peer, local),
        })
    }

    /// (Na, Nb)
    fn nonces_ab(&self) -> Result<([u8; 16], [u8; 16]), SmpReason> {
        let peer = self.peer_rand.ok_or(SmpReason::UnspecifiedReason)?;
        Ok(match self.role() {
            PairingRole::Central => (self.local_rand, peer),
            PairingRole::Peripheral => (peer, self.local_rand),
        })
    }

    /// Commitment bit of the current passkey round
    fn passkey_bit(&self) -> Result<u8, SmpReason> {
        let passkey = self.passkey.ok_or(SmpReason::UnspecifiedReason)?;
        Ok(0x80 | ((passkey >> self.passkey_round) & 0x01) as u8)
    }

    fn legacy_confirm(&self, crypto: &dyn SmpCrypto, rand: &[u8; 16]) -> Result<[u8; 16], SmpReason> {
        let tk = self.tk.ok_or(SmpReason::UnspecifiedReason)?;
        let ia = self.central_addr();
        let ra = self.peripheral_addr();
        Ok(crypto.c1(
            &tk,
            rand,
            &self.preq,
            &self.pres,
            smp_address_type(&ia),
            &ia.address.bytes,
            smp_address_type(&ra),
            &ra.address.bytes,
        ))
    }

    /// Run f5 over the exchanged values, storing MacKey and LTK
    fn compute_f5(&mut self, crypto: &dyn SmpCrypto) -> Step {
        let dhkey = self.dhkey.ok_or(SmpReason::UnspecifiedReason)?;
        let (na, nb) = self.nonces_ab()?;
        let (mac_key, ltk) = crypto.f5(
            &dhkey,
            &na,
            &nb,
            &addr7(&self.central_addr()),
            &addr7(&self.peripheral_addr()),
        );
        self.mac_key = mac_key;
        self.ltk = mask_key(ltk, self.key_size);
        self.ltk_derived = true;
        Ok(())
    }
}

/// Security Manager Protocol manager
pub struct SmpManager {
    config: SmpConfig,
    bearer: Arc<dyn Bearer>,
    crypto: Arc<dyn SmpCrypto>,
    key_store: Arc<dyn KeyStore>,
    links: HashMap<CbKey, SmpLink>,
    bearers: HashMap<BearerId, CbKey>,
    cbs: HashMap<CbKey, PairingCb>,
    /// Links on which SMP timed out; no further SMP until reconnect
    blocked: HashSet<CbKey>,
    /// OOB data received about peers
    oob: HashMap<BdAddr, OobData>,
    /// Key pair and random value handed out through local OOB data
    local_oob: Option<(EcdhKeyPair, [u8; 16])>,
    timers: TimerQueue<SmpTimer>,
    event_callback: Option<SmpEventCallback>,
    pending: Vec<SmpEvent>,
}

impl SmpManager {
    /// Create a new SMP manager
    pub fn new(
        config: SmpConfig,
        bearer: Arc<dyn Bearer>,
        crypto: Arc<dyn SmpCrypto>,
        key_store: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            config,
            bearer,
            crypto,
            key_store,
            links: HashMap::new(),
            bearers: HashMap::new(),
            cbs: HashMap::new(),
            blocked: HashSet::new(),
            oob: HashMap::new(),
            local_oob: None,
            timers: TimerQueue::new(),
            event_callback: None,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &SmpConfig {
        &self.config
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.key_store
    }

    pub fn crypto(&self) -> &Arc<dyn SmpCrypto> {
        &self.crypto
    }

    /// Set the event callback
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SmpEvent) + Send + 'static,
    {
        self.event_callback = Some(Arc::new(Mutex::new(callback)));
    }

    /// Current pairing state with a peer on a transport
    pub fn state(&self, peer: &BdAddr, transport: Transport) -> SmpState {
        self.cbs
            .get(&(*peer, transport))
            .map(|cb| cb.state)
            .unwrap_or(SmpState::Idle)
    }

    /// Association model chosen for a running pairing
    pub fn pairing_model(&self, peer: &BdAddr, transport: Transport) -> Option<PairingModel> {
        self.cbs.get(&(*peer, transport)).and_then(|cb| cb.model)
    }

    pub fn is_bonded(&self, peer: &BdAddr) -> bool {
        self.key_store
            .get_bonded_key(peer, KeyType::PeerEncryption)
            .is_some()
            || self
                .key_store
                .get_bonded_key(peer, KeyType::LocalEncryption)
                .is_some()
    }

    pub fn remove_bond(&mut self, peer: &BdAddr) -> SmpResult<()> {
        self.oob.remove(peer);
        self.key_store.delete(peer)
    }

    /// Register the fixed SMP channel of a new link
    pub fn on_link_up(&mut self, link: SmpLink) {
        let key = (link.peer.address, link.transport);
        debug!(
            "SMP link up: {} {:?} as {:?} on bearer {}",
            link.peer, link.transport, link.role, link.bearer
        );
        self.blocked.remove(&key);
        self.bearers.insert(link.bearer, key);
        self.links.insert(key, link);
    }

    /// Tear down SMP state for a dropped link
    pub fn on_link_down(&mut self, peer: &BdAddr, transport: Transport) {
        let key = (*peer, transport);
        if self.cbs.contains_key(&key) {
            warn!("SMP: link to {} dropped mid-pairing", peer);
            self.report(key, PairingStatus::Failed(SmpReason::UnspecifiedReason));
        }
        if let Some(link) = self.links.remove(&key) {
            self.bearers.remove(&link.bearer);
        }
        self.blocked.remove(&key);
        self.dispatch();
    }

    /// Handle one inbound SMP frame
    pub fn on_bearer_data(&mut self, id: BearerId, data: &[u8]) {
        let key = match self.bearers.get(&id) {
            Some(key) => *key,
            None => {
                warn!("SMP data on unknown bearer {}", id);
                return;
            }
        };
        if self.blocked.contains(&key) {
            debug!("SMP: dropping frame from {} after timeout", key.0);
            return;
        }

        match SmpCommand::parse(data) {
            Ok(command) => {
                trace!("SMP <- {}: opcode {:#04x}", key.0, command.opcode());
                self.timers.cancel(&SmpTimer::Response(key));
                if let Err(reason) = self.handle_command(key, command, data) {
                    self.fail(key, reason);
                }
            }
            Err(err) => match err.reply_reason() {
                Some(reason) => {
                    warn!("SMP: rejecting frame from {}: {}", key.0, err);
                    self.fail(key, reason);
                }
                None => debug!("SMP: dropping frame from {}: {}", key.0, err),
            },
        }
        self.dispatch();
    }

    /// Link encryption finished (or failed) for a peer
    pub fn on_encryption_changed(&mut self, peer: &BdAddr, transport: Transport, encrypted: bool) {
        let key = (*peer, transport);
        let pending = matches!(
            self.cbs.get(&key).map(|cb| cb.state),
            Some(SmpState::EncryptionPending)
        );
        if !pending {
            debug!("SMP: encryption change for {} outside pairing", peer);
            return;
        }

        if !encrypted {
            warn!("SMP: encryption with {} failed", peer);
            self.fail(key, SmpReason::UnspecifiedReason);
        } else if let Err(reason) = self.encryption_established(key) {
            self.fail(key, reason);
        }
        self.dispatch();
    }

    /// Key to answer a controller LTK request with (peripheral role)
    pub fn ltk_request(&self, peer: &BdAddr, ediv: u16, rand: &[u8; 8]) -> Option<[u8; 16]> {
        if let Some(cb) = self.cbs.get(&(*peer, Transport::Le)) {
            if cb.state == SmpState::EncryptionPending && cb.role() == PairingRole::Peripheral {
                return Some(cb.ltk);
            }
        }

        let record = self
            .key_store
            .get_bonded_key(peer, KeyType::LocalEncryption)?;
        let ltk = LongTermKey::from_bytes(&record)?;
        if ltk.ediv == ediv && &ltk.rand == rand {
            Some(ltk.key)
        } else {
            None
        }
    }

    /// Start pairing on the LE link to `peer`
    ///
    /// As central this sends a Pairing Request; as peripheral a Security
    /// Request asking the central to start.
    pub fn start_pairing(
        &mut self,
        peer: &BdAddr,
        role: PairingRole,
        requirements: AuthRequirements,
    ) -> SmpResult<()> {
        let key = (*peer, Transport::Le);
        let link = *self.links.get(&key).ok_or(SmpError::NoLink(*peer))?;
        if link.role != role {
            return Err(SmpError::WrongRole(link.role));
        }
        if self.cbs.contains_key(&key) {
            return Err(SmpError::AlreadyPairing(*peer));
        }
        if self.blocked.contains(&key) {
            return Err(SmpError::InvalidState);
        }

        match role {
            PairingRole::Central => self.send_pairing_request(key, requirements),
            PairingRole::Peripheral => {
                let mut cb = PairingCb::new(link, requirements);
                cb.state = SmpState::SecReqSent;
                self.cbs.insert(key, cb);
                info!("SMP: sending Security Request to {}", peer);
                self.send_command(key, SmpCommand::SecurityRequest(requirements.to_u8()));
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Ask the central to secure the link (peripheral role)
    pub fn security_request(&mut self, peer: &BdAddr) -> SmpResult<()> {
        let requirements = self.config.auth_req;
        self.start_pairing(peer, PairingRole::Peripheral, requirements)
    }

    /// Derive LE keys over an encrypted BR/EDR link (central role)
    pub fn start_cross_transport_pairing(&mut self, peer: &BdAddr) -> SmpResult<()> {
        let key = (*peer, Transport::BrEdr);
        let link = *self.links.get(&key).ok_or(SmpError::NoLink(*peer))?;
        if link.role != PairingRole::Central {
            return Err(SmpError::WrongRole(link.role));
        }
        if self.cbs.contains_key(&key) || self.cbs.contains_key(&(*peer, Transport::Le)) {
            return Err(SmpError::AlreadyPairing(*peer));
        }
        if self.stored_link_key(peer).is_none() {
            return Err(SmpError::InvalidState);
        }
        let requirements = self.config.auth_req;
        self.send_pairing_request(key, requirements);
        self.dispatch();
        Ok(())
    }

    /// Answer a numeric comparison prompt
    pub fn confirm(&mut self, peer: &BdAddr, action: UserAction) -> SmpResult<()> {
        let key = self.active_key(peer).ok_or(SmpError::NotPairing(*peer))?;
        let (role, waiting) = match self.cbs.get(&key) {
            Some(cb) => (
                cb.role(),
                cb.awaiting_user
                    && cb.state == SmpState::DhKeyCheck
                    && cb.model == Some(PairingModel::ScNumericComparison),
            ),
            None => return Err(SmpError::NotPairing(*peer)),
        };
        if !waiting {
            return Err(SmpError::InvalidState);
        }

        let step = match action {
            UserAction::Reject => Err(SmpReason::NumericComparisonFailed),
            UserAction::Accept => {
                if let Some(cb) = self.cbs.get_mut(&key) {
                    cb.awaiting_user = false;
                }
                match role {
                    PairingRole::Central => self.send_central_dhkey_check(key),
                    PairingRole::Peripheral => {
                        let have_check = self
                            .cbs
                            .get(&key)
                            .map(|cb| cb.peer_dhkey_check.is_some())
                            .unwrap_or(false);
                        if have_check {
                            self.check_central_dhkey(key)
                        } else {
                            Ok(())
                        }
                    }
                }
            }
        };
        if let Err(reason) = step {
            self.fail(key, reason);
        }
        self.dispatch();
        Ok(())
    }

    /// Supply the passkey the user typed, or `None` if entry was refused
    pub fn passkey_entry(&mut self, peer: &BdAddr, passkey: Option<u32>) -> SmpResult<()> {
        if let Some(value) = passkey {
            if value > SMP_PASSKEY_MAX {
                return Err(SmpError::InvalidParameter(format!(
                    "passkey {} has more than six digits",
                    value
                )));
            }
        }
        let key = self.active_key(peer).ok_or(SmpError::NotPairing(*peer))?;
        let waiting = match self.cbs.get(&key) {
            Some(cb) => {
                cb.awaiting_user
                    && matches!(
                        cb.model,
                        Some(PairingModel::LegacyPasskey(PasskeyAction::Input))
                            | Some(PairingModel::ScPasskey(PasskeyAction::Input))
                    )
            }
            None => false,
        };
        if !waiting {
            return Err(SmpError::InvalidState);
        }

        let step = match passkey {
            None => Err(SmpReason::PasskeyEntryFailed),
            Some(value) => {
                if let Some(cb) = self.cbs.get_mut(&key) {
                    cb.awaiting_user = false;
                    cb.passkey = Some(value);
                    if cb.model == Some(PairingModel::LegacyPasskey(PasskeyAction::Input)) {
                        cb.tk = Some(passkey_value(value));
                    }
                }
                self.user_input_ready(key)
            }
        };
        if let Err(reason) = step {
            self.fail(key, reason);
        }
        self.dispatch();
        Ok(())
    }

    /// Supply out-of-band data received about `peer`
    ///
    /// Data given before pairing starts is remembered and advertised through
    /// the OOB flag; data given while a legacy pairing waits for its TK
    /// resumes it.
    pub fn oob_data_ready(&mut self, peer: &BdAddr, data: OobData) -> SmpResult<()> {
        self.oob.insert(*peer, data.clone());

        let key = match self.active_key(peer) {
            Some(key) => key,
            None => return Ok(()),
        };
        let waiting = self
            .cbs
            .get(&key)
            .map(|cb| cb.awaiting_user && cb.model == Some(PairingModel::LegacyOob))
            .unwrap_or(false);
        if !waiting {
            return Ok(());
        }

        let step = match data {
            OobData::Legacy { tk } => {
                if let Some(cb) = self.cbs.get_mut(&key) {
                    cb.awaiting_user = false;
                    cb.tk = Some(tk);
                }
                self.user_input_ready(key)
            }
            OobData::SecureConnections { .. } => Err(SmpReason::OobNotAvailable),
        };
        if let Err(reason) = step {
            self.fail(key, reason);
        }
        self.dispatch();
        Ok(())
    }

    /// Create local Secure Connections OOB data to hand to a peer
    ///
    /// The key pair behind it is used for every following SC pairing until
    /// new data is generated.
    pub fn generate_local_oob(&mut self) -> SmpResult<OobData> {
        let keypair = self.crypto.generate_keypair()?;
        let r = self.crypto.random_128();
        let c = self
            .crypto
            .f4(&keypair.public_x, &keypair.public_x, &r, 0);
        self.local_oob = Some((keypair, r));
        Ok(OobData::SecureConnections { r, c })
    }

    /// Abort a pairing in progress
    pub fn cancel(&mut self, peer: &BdAddr) -> SmpResult<()> {
        let key = self.active_key(peer).ok_or(SmpError::NotPairing(*peer))?;
        let wire_reason = match self.cbs.get(&key) {
            Some(cb) if cb.awaiting_user && cb.model.map(|m| m.is_passkey()).unwrap_or(false) => {
                SmpReason::PasskeyEntryFailed
            }
            _ => SmpReason::UnspecifiedReason,
        };
        info!("SMP: pairing with {} cancelled", peer);
        self.send_command(key, SmpCommand::PairingFailed(wire_reason));
        self.report(key, PairingStatus::UserCancelled);
        self.dispatch();
        Ok(())
    }

    /// Tell the peer about passkey entry progress
    pub fn send_keypress(
        &mut self,
        peer: &BdAddr,
        notification: KeypressNotificationType,
    ) -> SmpResult<()> {
        let key = self.active_key(peer).ok_or(SmpError::NotPairing(*peer))?;
        let allowed = match self.cbs.get(&key) {
            Some(cb) => {
                let both = cb.local_params.map(|p| p.keypress()).unwrap_or(false)
                    && cb.peer_params.map(|p| p.keypress()).unwrap_or(false);
                both && cb.awaiting_user && cb.model.map(|m| m.is_passkey()).unwrap_or(false)
            }
            None => false,
        };
        if !allowed {
            return Err(SmpError::InvalidState);
        }
        self.send_command(key, SmpCommand::KeypressNotification(notification));
        Ok(())
    }

    /// Process expired response and delayed-auth timers
    pub fn process_timeouts(&mut self, now: Instant) {
        for timer in self.timers.expired(now) {
            match timer {
                SmpTimer::Response(key) => {
                    if self.cbs.contains_key(&key) {
                        warn!("SMP: response timeout with {}", key.0);
                        self.blocked.insert(key);
                        self.report(key, PairingStatus::ResponseTimeout);
                    }
                }
                SmpTimer::DelayedAuth(key) => {
                    let complete = matches!(
                        self.cbs.get(&key).map(|cb| cb.state),
                        Some(SmpState::Complete)
                    );
                    if complete {
                        self.report(key, PairingStatus::Success);
                    }
                }
            }
        }
        self.dispatch();
    }

    /// Earliest pending timer, for the caller's event loop
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn active_key(&self, peer: &BdAddr) -> Option<CbKey> {
        [Transport::Le, Transport::BrEdr]
            .iter()
            .map(|transport| (*peer, *transport))
            .find(|key| self.cbs.contains_key(key))
    }

    fn stored_link_key(&self, peer: &BdAddr) -> Option<keys::LinkKey> {
        self.key_store
            .get_bonded_key(peer, KeyType::LinkKey)
            .and_then(|record| keys::LinkKey::from_bytes(&record))
    }

    fn local_params(&self, transport: Transport, requirements: &AuthRequirements, peer: &BdAddr) -> PairingParams {
        match transport {
            Transport::Le => {
                let mut auth_req = requirements.to_u8();
                if self.config.sc_only {
                    auth_req |= SMP_AUTH_REQ_SC;
                }
                PairingParams {
                    io_capability: self.config.io_capability,
                    oob_data_present: self.oob.contains_key(peer),
                    auth_req,
                    max_key_size: self.config.max_key_size,
                    initiator_key_dist: self.config.initiator_key_dist.to_u8(),
                    responder_key_dist: self.config.responder_key_dist.to_u8(),
                }
            }
            Transport::BrEdr => {
                // only CT2 is meaningful over BR/EDR
                let auth_req = if requirements.ct2 { SMP_AUTH_REQ_CT2 } else { 0 };
                let mask = !SMP_KEY_DIST_LINK_KEY;
                PairingParams {
                    io_capability: IoCapability::DisplayOnly,
                    oob_data_present: false,
                    auth_req,
                    max_key_size: self.config.max_key_size,
                    initiator_key_dist: self.config.initiator_key_dist.to_u8() & mask,
                    responder_key_dist: self.config.responder_key_dist.to_u8() & mask,
                }
            }
        }
    }

    fn send_command(&mut self, key: CbKey, command: SmpCommand) {
        let bearer = match self.links.get(&key) {
            Some(link) => link.bearer,
            None => {
                warn!("SMP: no link to {} for opcode {:#04x}", key.0, command.opcode());
                return;
            }
        };
        let opcode = command.opcode();
        trace!("SMP -> {}: opcode {:#04x}", key.0, opcode);
        match self.bearer.send(bearer, &command.to_bytes()) {
            SendStatus::Ok => {}
            SendStatus::Congested => warn!("SMP: bearer {} congested, opcode {:#04x} dropped", bearer, opcode),
            SendStatus::Failed => error!("SMP: send on bearer {} failed", bearer),
        }

        let expects_reply = !matches!(
            command,
            SmpCommand::PairingFailed(_) | SmpCommand::KeypressNotification(_)
        );
        let active = self
            .cbs
            .get(&key)
            .map(|cb| cb.state != SmpState::Complete)
            .unwrap_or(false);
        if expects_reply && active {
            self.timers
                .arm(SmpTimer::Response(key), self.config.response_timeout);
        }
    }

    fn send_pairing_request(&mut self, key: CbKey, requirements: AuthRequirements) {
        let link = match self.links.get(&key) {
            Some(link) => *link,
            None => return,
        };
        let params = self.local_params(key.1, &requirements, &key.0);
        let command = SmpCommand::PairingRequest(params);
        let bytes = command.to_bytes();

        let mut cb = PairingCb::new(link, requirements);
        cb.local_params = Some(params);
        cb.preq.copy_from_slice(&bytes);
        cb.state = SmpState::PairReqSent;
        self.cbs.insert(key, cb);

        info!("SMP: pairing with {} over {:?}", key.0, key.1);
        self.send_command(key, command);
    }

    fn handle_command(&mut self, key: CbKey, command: SmpCommand, raw: &[u8]) -> Step {
        match command {
            SmpCommand::PairingRequest(params) => self.on_pairing_request(key, params, raw),
            SmpCommand::SecurityRequest(auth_req) => self.on_security_request(key, auth_req),
            SmpCommand::PairingFailed(reason) => {
                if self.cbs.contains_key(&key) {
                    warn!("SMP: peer {} failed pairing: {:?}", key.0, reason);
                    self.report(key, PairingStatus::Failed(reason));
                }
                Ok(())
            }
            command => {
                if !self.cbs.contains_key(&key) {
                    debug!(
                        "SMP: opcode {:#04x} from {} with no pairing, ignored",
                        command.opcode(),
                        key.0
                    );
                    return Ok(());
                }
                match command {
                    SmpCommand::PairingResponse(params) => self.on_pairing_response(key, params, raw),
                    SmpCommand::PairingConfirm(value) | SmpCommand::PairingCommitment(value) => {
                        self.on_confirm(key, value)
                    }
                    SmpCommand::PairingRandom(value) => self.on_random(key, value),
                    SmpCommand::PairingPublicKey { x, y } => self.on_public_key(key, x, y),
                    SmpCommand::PairingDhKeyCheck(value) => self.on_dhkey_check(key, value),
                    SmpCommand::KeypressNotification(notification) => {
                        self.pending.push(SmpEvent::Keypress {
                            peer: key.0,
                            notification,
                        });
                        Ok(())
                    }
                    command => self.on_key_command(key, command),
                }
            }
        }
    }

    fn on_pairing_request(&mut self, key: CbKey, params: PairingParams, raw: &[u8]) -> Step {
        let link = match self.links.get(&key) {
            Some(link) => *link,
            None => return Ok(()),
        };
        if link.role == PairingRole::Central {
            warn!("SMP: Pairing Request from {} while central", key.0);
            return Err(SmpReason::CommandNotSupported);
        }
        let requirements = match self.cbs.get(&key) {
            None => self.config.auth_req,
            Some(cb) if cb.state == SmpState::SecReqSent => cb.requirements,
            Some(cb) => {
                warn!("SMP: Pairing Request from {} in {:?}", key.0, cb.state);
                return Err(SmpReason::UnspecifiedReason);
            }
        };

        let mut local = self.local_params(key.1, &requirements, &key.0);
        let key_size = local.max_key_size.min(params.max_key_size);
        let le = key.1 == Transport::Le;
        let sc = le && params.secure_connections() && local.secure_connections();
        if le && !(params.bonding() && local.bonding()) {
            local.initiator_key_dist = 0;
            local.responder_key_dist = 0;
        } else {
            local.initiator_key_dist &= params.initiator_key_dist;
            local.responder_key_dist &= params.responder_key_dist;
        }
        let model = select_model(&params, &local, PairingRole::Peripheral);
        let response = SmpCommand::PairingResponse(local);
        let bytes = response.to_bytes();

        let mut cb = self
            .cbs
            .remove(&key)
            .unwrap_or_else(|| PairingCb::new(link, requirements));
        cb.state = SmpState::PairReqRecvd;
        cb.preq.copy_from_slice(raw);
        cb.pres.copy_from_slice(&bytes);
        cb.peer_params = Some(params);
        cb.local_params = Some(local);
        cb.key_size = key_size;
        cb.sc = sc;
        cb.h7 = params.ct2() && local.ct2();
        cb.init_keys = local.initiator_key_dist;
        cb.resp_keys = local.responder_key_dist;
        cb.model = Some(model);
        self.cbs.insert(key, cb);

        if key_size < self.config.min_key_size {
            warn!("SMP: key size {} from {} too small", key_size, key.0);
            return Err(SmpReason::EncryptionKeySize);
        }
        if le && self.config.sc_only && !sc {
            return Err(SmpReason::AuthenticationRequirements);
        }
        if le && local.mitm() && !model.security_level().is_authenticated() {
            return Err(SmpReason::AuthenticationRequirements);
        }

        if le {
            info!("SMP: {} pairing with {} using {}", if sc { "SC" } else { "legacy" }, key.0, model);
        }
        self.send_command(key, response);

        match key.1 {
            Transport::BrEdr => self.enter_key_distribution(key),
            Transport::Le if sc => {
                self.set_state(key, SmpState::PublicKeyExchange);
                Ok(())
            }
            Transport::Le => self.begin_legacy(key),
        }
    }

    fn on_pairing_response(&mut self, key: CbKey, params: PairingParams, raw: &[u8]) -> Step {
        let min_key_size = self.config.min_key_size;
        let sc_only = self.config.sc_only;
        let le = key.1 == Transport::Le;
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        if cb.state != SmpState::PairReqSent || cb.role() != PairingRole::Central {
            warn!("SMP: unexpected Pairing Response from {} in {:?}", key.0, cb.state);
            return Err(SmpReason::UnspecifiedReason);
        }
        let local = cb.local_params.ok_or(SmpReason::UnspecifiedReason)?;

        if params.initiator_key_dist & !local.initiator_key_dist != 0
            || params.responder_key_dist & !local.responder_key_dist != 0
        {
            return Err(SmpReason::InvalidParameters);
        }
        let key_size = local.max_key_size.min(params.max_key_size);
        if key_size < min_key_size {
            return Err(SmpReason::EncryptionKeySize);
        }
        let sc = le && params.secure_connections() && local.secure_connections();
        if le && sc_only && !sc {
            return Err(SmpReason::AuthenticationRequirements);
        }
        let model = select_model(&local, &params, PairingRole::Central);
        if le && local.mitm() && !model.security_level().is_authenticated() {
            return Err(SmpReason::AuthenticationRequirements);
        }

        cb.pres.copy_from_slice(raw);
        cb.peer_params = Some(params);
        cb.key_size = key_size;
        cb.sc = sc;
        cb.h7 = params.ct2() && local.ct2();
        cb.init_keys = params.initiator_key_dist;
        cb.resp_keys = params.responder_key_dist;
        cb.model = Some(model);
        cb.state = SmpState::PairReqRecvd;

        match key.1 {
            Transport::BrEdr => self.enter_key_distribution(key),
            Transport::Le if sc => {
                info!("SMP: SC pairing with {} using {}", key.0, model);
                let keypair = self.take_keypair()?;
                let command = SmpCommand::PairingPublicKey {
                    x: keypair.public_x,
                    y: keypair.public_y,
                };
                if let Some(cb) = self.cbs.get_mut(&key) {
                    cb.keypair = Some(keypair);
                    cb.state = SmpState::PublicKeyExchange;
                }
                self.send_command(key, command);
                Ok(())
            }
            Transport::Le => {
                info!("SMP: legacy pairing with {} using {}", key.0, model);
                self.begin_legacy(key)
            }
        }
    }

    /// Local key pair for a Secure Connections pairing
    fn take_keypair(&self) -> Result<EcdhKeyPair, SmpReason> {
        if let Some((keypair, _)) = &self.local_oob {
            return Ok(keypair.clone());
        }
        self.crypto.generate_keypair().map_err(|err| {
            error!("SMP: key generation failed: {}", err);
            SmpReason::UnspecifiedReason
        })
    }

    fn set_state(&mut self, key: CbKey, state: SmpState) {
        if let Some(cb) = self.cbs.get_mut(&key) {
            trace!("SMP {}: {:?} -> {:?}", key.0, cb.state, state);
            cb.state = state;
        }
    }

    /// Obtain the legacy TK, prompting the user when the model needs one
    fn begin_legacy(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let oob_tk = match self.oob.get(&key.0) {
            Some(OobData::Legacy { tk }) => Some(*tk),
            _ => None,
        };
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        cb.state = SmpState::CommitmentExchange;
        let event = match cb.model()? {
            PairingModel::EncryptionOnly => {
                cb.tk = Some([0; 16]);
                None
            }
            PairingModel::LegacyPasskey(PasskeyAction::Display) => {
                let passkey = crypto.passkey();
                cb.passkey = Some(passkey);
                cb.tk = Some(passkey_value(passkey));
                Some(SmpEvent::DisplayPasskey {
                    peer: key.0,
                    passkey,
                })
            }
            PairingModel::LegacyPasskey(PasskeyAction::Input) => {
                cb.awaiting_user = true;
                Some(SmpEvent::PasskeyRequest { peer: key.0 })
            }
            PairingModel::LegacyOob => match oob_tk {
                Some(tk) => {
                    cb.tk = Some(tk);
                    None
                }
                None => {
                    cb.awaiting_user = true;
                    Some(SmpEvent::OobRequest { peer: key.0 })
                }
            },
            _ => return Err(SmpReason::UnspecifiedReason),
        };
        let send_confirm = cb.role() == PairingRole::Central && cb.tk.is_some();
        if let Some(event) = event {
            self.pending.push(event);
        }
        if send_confirm {
            self.send_legacy_confirm(key)?;
        }
        Ok(())
    }

    fn send_legacy_confirm(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        cb.local_rand = crypto.random_128();
        let confirm = cb.legacy_confirm(&*crypto, &cb.local_rand)?;
        self.send_command(key, SmpCommand::PairingConfirm(confirm));
        Ok(())
    }

    /// A passkey or OOB TK arrived from the user
    fn user_input_ready(&mut self, key: CbKey) -> Step {
        let cb = self.cbs.get(&key).ok_or(SmpReason::UnspecifiedReason)?;
        let role = cb.role();
        let have_peer_confirm = cb.peer_confirm.is_some();
        let sc = cb.model()?.is_secure_connections();
        let keys_exchanged = cb.dhkey.is_some();

        match (sc, role) {
            (false, PairingRole::Central) => self.send_legacy_confirm(key),
            (false, PairingRole::Peripheral) => {
                if have_peer_confirm {
                    self.send_legacy_confirm(key)?;
                    self.set_state(key, SmpState::NonceExchange);
                }
                Ok(())
            }
            (true, PairingRole::Central) => {
                if keys_exchanged {
                    self.send_passkey_commitment(key)?;
                }
                Ok(())
            }
            (true, PairingRole::Peripheral) => {
                if have_peer_confirm {
                    self.send_passkey_commitment(key)?;
                    self.set_state(key, SmpState::NonceExchange);
                }
                Ok(())
            }
        }
    }

    /// Commitment for the current round of SC passkey entry
    fn send_passkey_commitment(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        let ri = cb.passkey_bit()?;
        let local_x = cb.local_public_x()?;
        let peer_x = cb.peer_public_x()?;
        cb.local_rand = crypto.random_128();
        let confirm = crypto.f4(&local_x, &peer_x, &cb.local_rand, ri);
        self.send_command(key, SmpCommand::PairingConfirm(confirm));
        Ok(())
    }

    fn on_public_key(&mut self, key: CbKey, x: [u8; 32], y: [u8; 32]) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let (role, model) = {
            let cb = self.cbs.get(&key).ok_or(SmpReason::UnspecifiedReason)?;
            if cb.state != SmpState::PublicKeyExchange || !cb.sc {
                warn!("SMP: unexpected public key from {} in {:?}", key.0, cb.state);
                return Err(SmpReason::UnspecifiedReason);
            }
            (cb.role(), cb.model()?)
        };

        let keypair = match role {
            PairingRole::Central => self
                .cbs
                .get(&key)
                .and_then(|cb| cb.keypair.clone())
                .ok_or(SmpReason::UnspecifiedReason)?,
            PairingRole::Peripheral => self.take_keypair()?,
        };
        if keypair.public_x == x && keypair.public_y == y {
            warn!("SMP: {} reflected our public key", key.0);
            return Err(SmpReason::InvalidParameters);
        }
        let dhkey = crypto.dhkey(&keypair, &x, &y).map_err(|err| {
            warn!("SMP: public key from {} rejected: {}", key.0, err);
            SmpReason::InvalidParameters
        })?;

        let peer_oob = match self.oob.get(&key.0) {
            Some(OobData::SecureConnections { r, c }) => Some((*r, *c)),
            _ => None,
        };
        if role == PairingRole::Peripheral {
            self.send_command(
                key,
                SmpCommand::PairingPublicKey {
                    x: keypair.public_x,
                    y: keypair.public_y,
                },
            );
        }

        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        cb.keypair = Some(keypair);
        cb.peer_public = Some((x, y));
        cb.dhkey = Some(dhkey);

        match (role, model) {
            (PairingRole::Central, PairingModel::ScJustWorks)
            | (PairingRole::Central, PairingModel::ScNumericComparison) => {
                cb.state = SmpState::CommitmentExchange;
                Ok(())
            }
            (PairingRole::Peripheral, PairingModel::ScJustWorks)
            | (PairingRole::Peripheral, PairingModel::ScNumericComparison) => {
                cb.local_rand = crypto.random_128();
                let local_x = cb.local_public_x()?;
                let confirm = crypto.f4(&local_x, &x, &cb.local_rand, 0);
                cb.state = SmpState::NonceExchange;
                self.send_command(key, SmpCommand::PairingConfirm(confirm));
                Ok(())
            }
            (_, PairingModel::ScPasskey(action)) => {
                cb.state = SmpState::CommitmentExchange;
                let event = match action {
                    PasskeyAction::Display => {
                        let passkey = crypto.passkey();
                        cb.passkey = Some(passkey);
                        SmpEvent::DisplayPasskey {
                            peer: key.0,
                            passkey,
                        }
                    }
                    PasskeyAction::Input => {
                        cb.awaiting_user = true;
                        SmpEvent::PasskeyRequest { peer: key.0 }
                    }
                };
                let ready = role == PairingRole::Central && cb.passkey.is_some();
                self.pending.push(event);
                if ready {
                    self.send_passkey_commitment(key)?;
                }
                Ok(())
            }
            (_, PairingModel::ScOob) => {
                if let Some((r, c)) = peer_oob {
                    if crypto.f4(&x, &x, &r, 0) != c {
                        warn!("SMP: OOB commitment from {} does not match", key.0);
                        return Err(SmpReason::ConfirmValueFailed);
                    }
                }
                cb.state = SmpState::NonceExchange;
                if role == PairingRole::Central {
                    cb.local_rand = crypto.random_128();
                    let nonce = cb.local_rand;
                    self.send_command(key, SmpCommand::PairingRandom(nonce));
                }
                Ok(())
            }
            _ => Err(SmpReason::UnspecifiedReason),
        }
    }

    fn on_confirm(&mut self, key: CbKey, value: [u8; 16]) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        if cb.state != SmpState::CommitmentExchange {
            warn!("SMP: unexpected confirm from {} in {:?}", key.0, cb.state);
            return Err(SmpReason::UnspecifiedReason);
        }
        let model = cb.model()?;

        match (cb.role(), model) {
            (PairingRole::Central, PairingModel::ScJustWorks)
            | (PairingRole::Central, PairingModel::ScNumericComparison) => {
                cb.peer_confirm = Some(value);
                cb.local_rand = crypto.random_128();
                cb.state = SmpState::NonceExchange;
                let nonce = cb.local_rand;
                self.send_command(key, SmpCommand::PairingRandom(nonce));
                Ok(())
            }
            (PairingRole::Central, PairingModel::ScPasskey(_)) => {
                if cb.awaiting_user || cb.passkey.is_none() {
                    return Err(SmpReason::UnspecifiedReason);
                }
                cb.peer_confirm = Some(value);
                cb.state = SmpState::NonceExchange;
                let nonce = cb.local_rand;
                self.send_command(key, SmpCommand::PairingRandom(nonce));
                Ok(())
            }
            (PairingRole::Peripheral, PairingModel::ScPasskey(_)) => {
                cb.peer_confirm = Some(value);
                if cb.passkey.is_some() && !cb.awaiting_user {
                    self.send_passkey_commitment(key)?;
                    self.set_state(key, SmpState::NonceExchange);
                }
                Ok(())
            }
            (PairingRole::Central, model) if !model.is_secure_connections() => {
                if cb.tk.is_none() {
                    return Err(SmpReason::UnspecifiedReason);
                }
                cb.peer_confirm = Some(value);
                cb.state = SmpState::NonceExchange;
                let nonce = cb.local_rand;
                self.send_command(key, SmpCommand::PairingRandom(nonce));
                Ok(())
            }
            (PairingRole::Peripheral, model) if !model.is_secure_connections() => {
                cb.peer_confirm = Some(value);
                if cb.tk.is_some() {
                    self.send_legacy_confirm(key)?;
                    self.set_state(key, SmpState::NonceExchange);
                }
                Ok(())
            }
            _ => Err(SmpReason::UnspecifiedReason),
        }
    }

    fn on_random(&mut self, key: CbKey, value: [u8; 16]) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        if cb.state != SmpState::NonceExchange {
            warn!("SMP: unexpected random from {} in {:?}", key.0, cb.state);
            return Err(SmpReason::UnspecifiedReason);
        }
        let model = cb.model()?;
        let role = cb.role();

        if !model.is_secure_connections() {
            let expected = cb.legacy_confirm(&*crypto, &value)?;
            if Some(expected) != cb.peer_confirm {
                warn!("SMP: confirm value from {} does not match", key.0);
                return Err(SmpReason::ConfirmValueFailed);
            }
            let tk = cb.tk.ok_or(SmpReason::UnspecifiedReason)?;
            cb.peer_rand = Some(value);
            // s1(TK, Srand, Mrand)
            let stk = match role {
                PairingRole::Central => crypto.s1(&tk, &value, &cb.local_rand),
                PairingRole::Peripheral => crypto.s1(&tk, &cb.local_rand, &value),
            };
            cb.ltk = mask_key(stk, cb.key_size);
            cb.state = SmpState::EncryptionPending;
            match role {
                PairingRole::Central => {
                    let event = SmpEvent::StartEncryption {
                        peer: key.0,
                        ltk: cb.ltk,
                        ediv: 0,
                        rand: [0; 8],
                        key_size: cb.key_size,
                    };
                    self.pending.push(event);
                }
                PairingRole::Peripheral => {
                    let nonce = cb.local_rand;
                    self.send_command(key, SmpCommand::PairingRandom(nonce));
                }
            }
            return Ok(());
        }

        let (pkax, pkbx) = cb.public_keys_ab()?;
        match (role, model) {
            (PairingRole::Central, PairingModel::ScJustWorks)
            | (PairingRole::Central, PairingModel::ScNumericComparison) => {
                if Some(crypto.f4(&pkbx, &pkax, &value, 0)) != cb.peer_confirm {
                    warn!("SMP: commitment from {} does not match", key.0);
                    return Err(SmpReason::ConfirmValueFailed);
                }
                cb.peer_rand = Some(value);
                if model == PairingModel::ScNumericComparison {
                    let number = crypto.g2(&pkax, &pkbx, &cb.local_rand, &value);
                    cb.awaiting_user = true;
                    cb.state = SmpState::DhKeyCheck;
                    self.pending.push(SmpEvent::NumericComparison {
                        peer: key.0,
                        value: number,
                    });
                    Ok(())
                } else {
                    self.send_central_dhkey_check(key)
                }
            }
            (PairingRole::Central, PairingModel::ScPasskey(_)) => {
                let ri = cb.passkey_bit()?;
                if Some(crypto.f4(&pkbx, &pkax, &value, ri)) != cb.peer_confirm {
                    warn!("SMP: passkey commitment {} from {} does not match", cb.passkey_round, key.0);
                    return Err(SmpReason::ConfirmValueFailed);
                }
                cb.peer_rand = Some(value);
                cb.peer_confirm = None;
                cb.passkey_round += 1;
                if cb.passkey_round < SMP_PASSKEY_ROUNDS {
                    cb.state = SmpState::CommitmentExchange;
                    self.send_passkey_commitment(key)
                } else {
                    self.send_central_dhkey_check(key)
                }
            }
            (PairingRole::Central, PairingModel::ScOob) => {
                cb.peer_rand = Some(value);
                self.send_central_dhkey_check(key)
            }
            (PairingRole::Peripheral, PairingModel::ScJustWorks)
            | (PairingRole::Peripheral, PairingModel::ScNumericComparison) => {
                cb.peer_rand = Some(value);
                cb.state = SmpState::DhKeyCheck;
                let nonce = cb.local_rand;
                if model == PairingModel::ScNumericComparison {
                    let number = crypto.g2(&pkax, &pkbx, &value, &nonce);
                    cb.awaiting_user = true;
                    self.pending.push(SmpEvent::NumericComparison {
                        peer: key.0,
                        value: number,
                    });
                }
                self.send_command(key, SmpCommand::PairingRandom(nonce));
                Ok(())
            }
            (PairingRole::Peripheral, PairingModel::ScPasskey(_)) => {
                let ri = cb.passkey_bit()?;
                if Some(crypto.f4(&pkax, &pkbx, &value, ri)) != cb.peer_confirm {
                    warn!("SMP: passkey commitment {} from {} does not match", cb.passkey_round, key.0);
                    return Err(SmpReason::ConfirmValueFailed);
                }
                cb.peer_rand = Some(value);
                cb.peer_confirm = None;
                cb.passkey_round += 1;
                cb.state = if cb.passkey_round < SMP_PASSKEY_ROUNDS {
                    SmpState::CommitmentExchange
                } else {
                    SmpState::DhKeyCheck
                };
                let nonce = cb.local_rand;
                self.send_command(key, SmpCommand::PairingRandom(nonce));
                Ok(())
            }
            (PairingRole::Peripheral, PairingModel::ScOob) => {
                cb.peer_rand = Some(value);
                cb.local_rand = crypto.random_128();
                cb.state = SmpState::DhKeyCheck;
                let nonce = cb.local_rand;
                self.send_command(key, SmpCommand::PairingRandom(nonce));
                Ok(())
            }
            _ => Err(SmpReason::UnspecifiedReason),
        }
    }

    /// r used in the local DHKey check: what we learned about the peer
    fn own_check_r(&self, cb: &PairingCb) -> [u8; 16] {
        match cb.model {
            Some(PairingModel::ScPasskey(_)) => cb.passkey.map(passkey_value).unwrap_or([0; 16]),
            Some(PairingModel::ScOob) => match self.oob.get(&cb.link.peer.address) {
                Some(OobData::SecureConnections { r, .. }) => *r,
                _ => [0; 16],
            },
            _ => [0; 16],
        }
    }

    /// r the peer used in its DHKey check: what it learned about us
    fn peer_check_r(&self, cb: &PairingCb) -> [u8; 16] {
        match cb.model {
            Some(PairingModel::ScPasskey(_)) => cb.passkey.map(passkey_value).unwrap_or([0; 16]),
            Some(PairingModel::ScOob) => {
                let peer_has_ours = cb.peer_params.map(|p| p.oob_data_present).unwrap_or(false);
                match (&self.local_oob, peer_has_ours) {
                    (Some((_, r)), true) => *r,
                    _ => [0; 16],
                }
            }
            _ => [0; 16],
        }
    }

    /// Central: derive MacKey/LTK and send Ea
    fn send_central_dhkey_check(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let rb = match self.cbs.get(&key) {
            Some(cb) => self.own_check_r(cb),
            None => return Err(SmpReason::UnspecifiedReason),
        };
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        cb.compute_f5(&*crypto)?;
        let (na, nb) = cb.nonces_ab()?;
        let io_cap_a = cb
            .central_params()
            .ok_or(SmpReason::UnspecifiedReason)?
            .iocap_triplet();
        let ea = crypto.f6(
            &cb.mac_key,
            &na,
            &nb,
            &rb,
            &io_cap_a,
            &addr7(&cb.central_addr()),
            &addr7(&cb.peripheral_addr()),
        );
        cb.state = SmpState::DhKeyCheck;
        self.send_command(key, SmpCommand::PairingDhKeyCheck(ea));
        Ok(())
    }

    /// Peripheral: verify the stored Ea and answer with Eb
    fn check_central_dhkey(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let (ra, rb) = match self.cbs.get(&key) {
            Some(cb) => (self.own_check_r(cb), self.peer_check_r(cb)),
            None => return Err(SmpReason::UnspecifiedReason),
        };
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        let ea = cb.peer_dhkey_check.ok_or(SmpReason::UnspecifiedReason)?;
        cb.compute_f5(&*crypto)?;
        let (na, nb) = cb.nonces_ab()?;
        let a = addr7(&cb.central_addr());
        let b = addr7(&cb.peripheral_addr());
        let io_cap_a = cb
            .central_params()
            .ok_or(SmpReason::UnspecifiedReason)?
            .iocap_triplet();
        let io_cap_b = cb
            .peripheral_params()
            .ok_or(SmpReason::UnspecifiedReason)?
            .iocap_triplet();

        if crypto.f6(&cb.mac_key, &na, &nb, &rb, &io_cap_a, &a, &b) != ea {
            warn!("SMP: DHKey check from {} failed", key.0);
            return Err(SmpReason::DhKeyCheckFailed);
        }
        let eb = crypto.f6(&cb.mac_key, &nb, &na, &ra, &io_cap_b, &b, &a);
        cb.state = SmpState::EncryptionPending;
        self.send_command(key, SmpCommand::PairingDhKeyCheck(eb));
        Ok(())
    }

    fn on_dhkey_check(&mut self, key: CbKey, value: [u8; 16]) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let ra = match self.cbs.get(&key) {
            Some(cb) => self.peer_check_r(cb),
            None => return Err(SmpReason::UnspecifiedReason),
        };
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        if cb.state != SmpState::DhKeyCheck || !cb.sc {
            warn!("SMP: unexpected DHKey check from {} in {:?}", key.0, cb.state);
            return Err(SmpReason::UnspecifiedReason);
        }

        match cb.role() {
            PairingRole::Peripheral => {
                cb.peer_dhkey_check = Some(value);
                if cb.awaiting_user {
                    return Ok(());
                }
                self.check_central_dhkey(key)
            }
            PairingRole::Central => {
                if cb.awaiting_user {
                    return Err(SmpReason::UnspecifiedReason);
                }
                let (na, nb) = cb.nonces_ab()?;
                let io_cap_b = cb
                    .peripheral_params()
                    .ok_or(SmpReason::UnspecifiedReason)?
                    .iocap_triplet();
                let expected = crypto.f6(
                    &cb.mac_key,
                    &nb,
                    &na,
                    &ra,
                    &io_cap_b,
                    &addr7(&cb.peripheral_addr()),
                    &addr7(&cb.central_addr()),
                );
                if expected != value {
                    warn!("SMP: DHKey check from {} failed", key.0);
                    return Err(SmpReason::DhKeyCheckFailed);
                }
                cb.state = SmpState::EncryptionPending;
                let event = SmpEvent::StartEncryption {
                    peer: key.0,
                    ltk: cb.ltk,
                    ediv: 0,
                    rand: [0; 8],
                    key_size: cb.key_size,
                };
                self.pending.push(event);
                Ok(())
            }
        }
    }

    fn encryption_established(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        let model = cb.model()?;
        cb.sec_level = model.security_level();
        debug!("SMP: link to {} encrypted at {:?}", key.0, cb.sec_level);

        let wants_link_key = (cb.init_keys | cb.resp_keys) & SMP_KEY_DIST_LINK_KEY != 0;
        if cb.sc && wants_link_key {
            let link_key = derive_link_key(&*crypto, &cb.ltk, cb.h7);
            cb.link_key = Some(keys::LinkKey::new(link_key, cb.sec_level));
        }
        self.enter_key_distribution(key)
    }

    fn enter_key_distribution(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let stored_link_key = match key.1 {
            Transport::BrEdr => self.stored_link_key(&key.0),
            Transport::Le => None,
        };
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        cb.state = SmpState::BondPending;

        let mut init = cb.init_keys;
        let mut resp = cb.resp_keys;
        if key.1 == Transport::BrEdr {
            // the LE LTK is derived from the link key rather than sent
            let link_key = stored_link_key.ok_or(SmpReason::CrossTransportKeyNotAllowed)?;
            cb.sec_level = link_key.sec_level;
            if (init | resp) & SMP_KEY_DIST_ENC_KEY != 0 {
                let ltk = derive_ltk(&*crypto, &link_key.key, cb.h7);
                cb.ltk = mask_key(ltk, cb.key_size);
                cb.ltk_derived = true;
            }
        }
        if cb.sc || key.1 == Transport::BrEdr {
            init &= !SMP_KEY_DIST_ENC_KEY;
            resp &= !SMP_KEY_DIST_ENC_KEY;
        }
        init &= !SMP_KEY_DIST_LINK_KEY;
        resp &= !SMP_KEY_DIST_LINK_KEY;

        let (expect, send) = match cb.role() {
            PairingRole::Central => (resp, init),
            PairingRole::Peripheral => (init, resp),
        };
        cb.peer_keys_pending = expect;
        cb.local_keys_pending = send;
        debug!(
            "SMP: key distribution with {}: expecting {:#04x}, sending {:#04x}",
            key.0, expect, send
        );

        match cb.role() {
            PairingRole::Peripheral => {
                self.distribute_local_keys(key)?;
                if expect == 0 {
                    self.finish(key);
                }
            }
            PairingRole::Central => {
                if expect == 0 {
                    self.distribute_local_keys(key)?;
                    self.finish(key);
                }
            }
        }
        Ok(())
    }

    fn distribute_local_keys(&mut self, key: CbKey) -> Step {
        let crypto = Arc::clone(&self.crypto);
        let irk = self.config.local_irk;
        let identity = self.config.identity_address;
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        let send = cb.local_keys_pending;
        cb.local_keys_pending = 0;
        let mut commands = Vec::new();

        if send & SMP_KEY_DIST_ENC_KEY != 0 {
            let ltk = mask_key(crypto.random_128(), cb.key_size);
            let mut ediv = [0u8; 2];
            crypto.random_bytes(&mut ediv);
            let ediv = u16::from_le_bytes(ediv);
            let mut rand = [0u8; 8];
            crypto.random_bytes(&mut rand);
            cb.local_ltk = Some(LongTermKey::new(ltk, ediv, rand, cb.key_size, cb.sec_level));
            commands.push(SmpCommand::EncryptionInformation(ltk));
            commands.push(SmpCommand::CentralIdentification { ediv, rand });
        }
        if send & SMP_KEY_DIST_ID_KEY != 0 {
            let address = identity.unwrap_or(cb.link.local);
            let addr_type = smp_address_type(&address);
            cb.local_identity = Some(IdentityResolvingKey::new(irk, addr_type, address.address));
            commands.push(SmpCommand::IdentityInformation(irk));
            commands.push(SmpCommand::IdentityAddressInformation {
                addr_type,
                address: address.address,
            });
        }
        if send & SMP_KEY_DIST_SIGN_KEY != 0 {
            let csrk = crypto.random_128();
            cb.local_csrk = Some(ConnectionSignatureResolvingKey::new(csrk, cb.sec_level));
            commands.push(SmpCommand::SigningInformation(csrk));
        }

        for command in commands {
            self.send_command(key, command);
        }
        Ok(())
    }

    fn on_key_command(&mut self, key: CbKey, command: SmpCommand) -> Step {
        let cb = self.cbs.get_mut(&key).ok_or(SmpReason::UnspecifiedReason)?;
        if cb.state != SmpState::BondPending {
            warn!(
                "SMP: key opcode {:#04x} from {} in {:?}",
                command.opcode(),
                key.0,
                cb.state
            );
            return Err(SmpReason::UnspecifiedReason);
        }
        let pending = cb.peer_keys_pending;
        let expecting = |bit: u8| pending & bit != 0;

        match command {
            SmpCommand::EncryptionInformation(ltk) => {
                if !expecting(SMP_KEY_DIST_ENC_KEY) || cb.peer_enc_key.is_some() {
                    return Err(SmpReason::UnspecifiedReason);
                }
                cb.peer_enc_key = Some(ltk);
            }
            SmpCommand::CentralIdentification { ediv, rand } => {
                let ltk = cb.peer_enc_key.take().ok_or(SmpReason::UnspecifiedReason)?;
                cb.peer_ltk = Some(LongTermKey::new(ltk, ediv, rand, cb.key_size, cb.sec_level));
                cb.peer_keys_pending &= !SMP_KEY_DIST_ENC_KEY;
            }
            SmpCommand::IdentityInformation(irk) => {
                if !expecting(SMP_KEY_DIST_ID_KEY) || cb.peer_irk.is_some() {
                    return Err(SmpReason::UnspecifiedReason);
                }
                cb.peer_irk = Some(irk);
            }
            SmpCommand::IdentityAddressInformation { addr_type, address } => {
                let irk = cb.peer_irk.take().ok_or(SmpReason::UnspecifiedReason)?;
                cb.peer_identity = Some(IdentityResolvingKey::new(irk, addr_type, address));
                cb.peer_keys_pending &= !SMP_KEY_DIST_ID_KEY;
            }
            SmpCommand::SigningInformation(csrk) => {
                if !expecting(SMP_KEY_DIST_SIGN_KEY) {
                    return Err(SmpReason::UnspecifiedReason);
                }
                cb.peer_csrk = Some(ConnectionSignatureResolvingKey::new(csrk, cb.sec_level));
                cb.peer_keys_pending &= !SMP_KEY_DIST_SIGN_KEY;
            }
            _ => return Err(SmpReason::UnspecifiedReason),
        }

        if cb.peer_keys_pending == 0 {
            if cb.role() == PairingRole::Central {
                self.distribute_local_keys(key)?;
            }
            self.finish(key);
        }
        Ok(())
    }

    fn on_security_request(&mut self, key: CbKey, auth_req: u8) -> Step {
        let link = match self.links.get(&key) {
            Some(link) => *link,
            None => return Ok(()),
        };
        if link.role != PairingRole::Central || key.1 != Transport::Le {
            return Err(SmpReason::CommandNotSupported);
        }
        if self.cbs.contains_key(&key) {
            debug!("SMP: Security Request from {} while pairing, ignored", key.0);
            return Ok(());
        }

        let peer_auth = AuthRequirements::from_u8(auth_req);
        let required = if peer_auth.mitm {
            SecurityLevel::Authenticated
        } else {
            SecurityLevel::Unauthenticated
        };
        let stored = self
            .key_store
            .get_bonded_key(&key.0, KeyType::PeerEncryption)
            .and_then(|record| LongTermKey::from_bytes(&record));
        if let Some(ltk) = stored {
            if ltk.sec_level >= required {
                info!("SMP: re-encrypting with {} using stored key", key.0);
                self.pending.push(SmpEvent::StartEncryption {
                    peer: key.0,
                    ltk: ltk.key,
                    ediv: ltk.ediv,
                    rand: ltk.rand,
                    key_size: ltk.key_size,
                });
                return Ok(());
            }
        }

        let mut requirements = self.config.auth_req;
        requirements.mitm |= peer_auth.mitm;
        self.send_pairing_request(key, requirements);
        Ok(())
    }

    /// All keys exchanged; wait out the delayed-auth window
    fn finish(&mut self, key: CbKey) {
        if let Some(cb) = self.cbs.get_mut(&key) {
            cb.state = SmpState::Complete;
        }
        self.timers.cancel(&SmpTimer::Response(key));
        self.timers
            .arm(SmpTimer::DelayedAuth(key), self.config.delayed_auth_timeout);
    }

    /// Send Pairing Failed and end the pairing
    fn fail(&mut self, key: CbKey, reason: SmpReason) {
        warn!("SMP: pairing with {} failed: {:?}", key.0, reason);
        self.send_command(key, SmpCommand::PairingFailed(reason));
        self.report(key, PairingStatus::Failed(reason));
    }

    /// Release the control block and queue the completion event
    fn report(&mut self, key: CbKey, status: PairingStatus) {
        self.timers.cancel(&SmpTimer::Response(key));
        self.timers.cancel(&SmpTimer::DelayedAuth(key));
        let cb = match self.cbs.remove(&key) {
            Some(cb) => cb,
            None => return,
        };

        let sec_level = if status.is_success() {
            self.save_keys(&cb);
            info!("SMP: pairing with {} complete at {:?}", key.0, cb.sec_level);
            cb.sec_level
        } else {
            SecurityLevel::None
        };
        self.pending.push(SmpEvent::PairingComplete {
            peer: key.0,
            status,
            sec_level,
            smp_over_br: key.1 == Transport::BrEdr,
        });
    }

    fn save_keys(&self, cb: &PairingCb) {
        let bonded = cb.link.transport == Transport::BrEdr || cb.bonding();
        if !bonded {
            return;
        }
        let peer = cb.link.peer.address;
        let mut records: Vec<(KeyType, Vec<u8>)> = Vec::new();

        if cb.ltk_derived {
            let ltk = LongTermKey::new_secure_connections(cb.ltk, cb.key_size, cb.sec_level);
            records.push((KeyType::PeerEncryption, ltk.to_bytes()));
            records.push((KeyType::LocalEncryption, ltk.to_bytes()));
        } else {
            if let Some(ltk) = &cb.peer_ltk {
                records.push((KeyType::PeerEncryption, ltk.to_bytes()));
            }
            if let Some(ltk) = &cb.local_ltk {
                records.push((KeyType::LocalEncryption, ltk.to_bytes()));
            }
        }
        if let Some(irk) = &cb.peer_identity {
            records.push((KeyType::PeerIdentity, irk.to_bytes()));
        }
        if let Some(irk) = &cb.local_identity {
            records.push((KeyType::LocalIdentity, irk.to_bytes()));
        }
        if let Some(csrk) = &cb.peer_csrk {
            records.push((KeyType::PeerCsrk, csrk.to_bytes()));
        }
        if let Some(csrk) = &cb.local_csrk {
            records.push((KeyType::LocalCsrk, csrk.to_bytes()));
        }
        if let Some(link_key) = &cb.link_key {
            records.push((KeyType::LinkKey, link_key.to_bytes()));
        }

        for (key_type, record) in records {
            if let Err(err) = self.key_store.save_key(&peer, key_type, &record) {
                error!("SMP: saving {:?} for {} failed: {}", key_type, peer, err);
            }
        }
    }

    /// Deliver queued events to the upper layer
    fn dispatch(&mut self) {
        let events = std::mem::take(&mut self.pending);
        if events.is_empty() {
            return;
        }
        let callback = match &self.event_callback {
            Some(callback) => Arc::clone(callback),
            None => {
                debug!("SMP: no event callback, dropping {} events", events.len());
                return;
            }
        };
        for event in events {
            match callback.lock() {
                Ok(mut callback) => callback(event),
                Err(_) => error!("SMP event callback poisoned"),
            }
        }
    }
}

impl std::fmt::Debug for SmpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmpManager")
            .field("links", &self.links.len())
            .field("pairings", &self.cbs.len())
            .finish()
    }
}
