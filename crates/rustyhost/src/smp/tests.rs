use super::constants::*;
use super::*;
use crate::bearer::BearerId;
use crate::gap::{AddressType, AddressWithType, BdAddr, Transport};
use crate::testing::RecordingBearer;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn central_addr() -> BdAddr {
    BdAddr::new([0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1])
}

fn peripheral_addr() -> BdAddr {
    BdAddr::new([0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1])
}

fn unhex<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&hex::decode(s).unwrap());
    out
}

/// One side of a pairing: engine, its bearer and its recorded events
struct Side {
    smp: SmpManager,
    bearer: Arc<RecordingBearer>,
    store: Arc<MemoryKeyStore>,
    events: Arc<Mutex<Vec<SmpEvent>>>,
    bearer_id: BearerId,
    peer: BdAddr,
}

impl Side {
    fn new(config: SmpConfig, role: PairingRole) -> Self {
        Self::on(config, role, Transport::Le)
    }

    fn on(config: SmpConfig, role: PairingRole, transport: Transport) -> Self {
        let bearer = Arc::new(RecordingBearer::new());
        let store = Arc::new(MemoryKeyStore::new());
        let mut smp = SmpManager::new(
            config,
            bearer.clone(),
            Arc::new(SoftwareCrypto::new()),
            store.clone(),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        smp.set_event_callback(move |event| sink.lock().unwrap().push(event));

        let (local, peer, bearer_id) = match role {
            PairingRole::Central => (central_addr(), peripheral_addr(), BearerId(1)),
            PairingRole::Peripheral => (peripheral_addr(), central_addr(), BearerId(2)),
        };
        smp.on_link_up(SmpLink {
            bearer: bearer_id,
            transport,
            role,
            local: AddressWithType::new(local, AddressType::Public),
            peer: AddressWithType::new(peer, AddressType::Public),
        });

        Self {
            smp,
            bearer,
            store,
            events,
            bearer_id,
            peer,
        }
    }

    fn take_events(&self) -> Vec<SmpEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn completion(&self) -> Option<(PairingStatus, SecurityLevel)> {
        self.events.lock().unwrap().iter().find_map(|event| match event {
            SmpEvent::PairingComplete {
                status, sec_level, ..
            } => Some((*status, *sec_level)),
            _ => None,
        })
    }
}

/// Carry frames between both sides until neither has anything to send
fn pump(a: &mut Side, b: &mut Side) {
    relay(a, b, |_| {});
}

/// Like `pump`, letting `edit` rewrite frames from `a` on the way.
/// Returns every frame `a` sent.
fn relay(a: &mut Side, b: &mut Side, mut edit: impl FnMut(&mut Vec<u8>)) -> Vec<Vec<u8>> {
    let mut sent_by_a = Vec::new();
    loop {
        let from_a = a.bearer.take_payloads();
        let from_b = b.bearer.take_payloads();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for mut frame in from_a {
            edit(&mut frame);
            b.smp.on_bearer_data(b.bearer_id, &frame);
            sent_by_a.push(frame);
        }
        for frame in from_b {
            a.smp.on_bearer_data(a.bearer_id, &frame);
        }
    }
    sent_by_a
}

/// Both sides see the link encrypted, then the delayed-auth window passes
fn finish_encryption(central: &mut Side, peripheral: &mut Side) {
    central
        .smp
        .on_encryption_changed(&central.peer, Transport::Le, true);
    peripheral
        .smp
        .on_encryption_changed(&peripheral.peer, Transport::Le, true);
    pump(central, peripheral);

    let later = Instant::now() + Duration::from_secs(1);
    central.smp.process_timeouts(later);
    peripheral.smp.process_timeouts(later);
}

fn displayed_passkey(events: &[SmpEvent]) -> Option<u32> {
    events.iter().find_map(|event| match event {
        SmpEvent::DisplayPasskey { passkey, .. } => Some(*passkey),
        _ => None,
    })
}

fn asked_for(events: &[SmpEvent], wanted: fn(&SmpEvent) -> bool) -> bool {
    events.iter().any(wanted)
}

fn start_encryption(events: &[SmpEvent]) -> Option<[u8; 16]> {
    events.iter().find_map(|event| match event {
        SmpEvent::StartEncryption { ltk, .. } => Some(*ltk),
        _ => None,
    })
}

fn numeric_value(events: &[SmpEvent]) -> Option<u32> {
    events.iter().find_map(|event| match event {
        SmpEvent::NumericComparison { value, .. } => Some(*value),
        _ => None,
    })
}

#[test]
fn test_aes_cmac_vectors() {
    let crypto = SoftwareCrypto::new();
    let key: [u8; 16] = unhex("2b7e151628aed2a6abf7158809cf4f3c");

    assert_eq!(
        hex::encode(crypto.aes_cmac(&key, &[])),
        "bb1d6929e95937287fa37d129b756746"
    );
    let message: [u8; 16] = unhex("6bc1bee22e409f96e93d7e117393172a");
    assert_eq!(
        hex::encode(crypto.aes_cmac(&key, &message)),
        "070a16b46b4d4144f79bdd9dd04a287c"
    );
}

#[test]
fn test_c1_vector() {
    let crypto = SoftwareCrypto::new();
    let r: [u8; 16] = unhex("e02e70c64e2788630e6fad5621d58357");
    let preq = [0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07];
    let pres = [0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05];
    let ia = [0xa6, 0xa5, 0xa4, 0xa3, 0xa2, 0xa1];
    let ra = [0xb6, 0xb5, 0xb4, 0xb3, 0xb2, 0xb1];

    let confirm = crypto.c1(&[0; 16], &r, &preq, &pres, 1, &ia, 0, &ra);
    assert_eq!(hex::encode(confirm), "863bf1bec54da7d2ea888987ef3f1e1e");
}

#[test]
fn test_s1_vector() {
    let crypto = SoftwareCrypto::new();
    let r1 = swap(&unhex::<16>("000f0e0d0c0b0a091122334455667788"));
    let r2 = swap(&unhex::<16>("010203040506070899aabbccddeeff00"));

    let stk = crypto.s1(&[0; 16], &r1, &r2);
    assert_eq!(hex::encode(swap(&stk)), "9a1fe1f0e8b0f49b5b4216ae796da062");
}

#[test]
fn test_f4_vector() {
    let crypto = SoftwareCrypto::new();
    let u: [u8; 32] = unhex("e69d350e480103ccdbfdf4ac1191f4efb9a5f9e9a7832c5e2cbe97f2d203b020");
    let v: [u8; 32] = unhex("fdc57ff449dd4f6bfb7c9df1c29acb592ae7d4eefbfc0a909abbf6323d8b1855");
    let x: [u8; 16] = unhex("abae2b71ecb2ffff3e7377d15484cbd5");

    assert_eq!(
        hex::encode(crypto.f4(&u, &v, &x, 0)),
        "2d8774a9bea1edf11cbda907f116c9f2"
    );
}

#[test]
fn test_dhkey_agreement() {
    let crypto = SoftwareCrypto::new();
    let a = crypto.generate_keypair().unwrap();
    let b = crypto.generate_keypair().unwrap();

    let ab = crypto.dhkey(&a, &b.public_x, &b.public_y).unwrap();
    let ba = crypto.dhkey(&b, &a.public_x, &a.public_y).unwrap();
    assert_eq!(ab, ba);

    let mut bogus = b.public_y;
    bogus[0] ^= 0x01;
    assert!(crypto.dhkey(&a, &b.public_x, &bogus).is_err());
}

#[test]
fn test_pdu_validation() {
    assert_eq!(SmpCommand::parse(&[]), Err(SmpPduError::Empty));
    assert_eq!(
        SmpCommand::parse(&[0x20, 0x00]),
        Err(SmpPduError::UnknownOpcode(0x20))
    );

    let short = SmpCommand::parse(&[SMP_PAIRING_REQUEST, 0x03]).unwrap_err();
    assert_eq!(short.reply_reason(), Some(SmpReason::InvalidParameters));

    let small_key =
        SmpCommand::parse(&[SMP_PAIRING_REQUEST, 0x03, 0x00, 0x01, 0x06, 0x07, 0x07]).unwrap_err();
    assert_eq!(small_key.reply_reason(), Some(SmpReason::EncryptionKeySize));

    let bad_io =
        SmpCommand::parse(&[SMP_PAIRING_REQUEST, 0x05, 0x00, 0x01, 0x10, 0x07, 0x07]).unwrap_err();
    assert_eq!(bad_io.reply_reason(), Some(SmpReason::InvalidParameters));

    // RFU key distribution bits are ignored
    match SmpCommand::parse(&[SMP_PAIRING_REQUEST, 0x03, 0x00, 0x01, 0x10, 0xF7, 0x07]) {
        Ok(SmpCommand::PairingRequest(params)) => assert_eq!(params.initiator_key_dist, 0x07),
        other => panic!("unexpected parse result {:?}", other),
    }
}

fn params(io: IoCapability, auth_req: u8, oob: bool) -> PairingParams {
    PairingParams {
        io_capability: io,
        oob_data_present: oob,
        auth_req,
        max_key_size: 16,
        initiator_key_dist: 0,
        responder_key_dist: 0,
    }
}

#[test]
fn test_association_model_selection() {
    use IoCapability::*;
    let mitm = SMP_AUTH_REQ_BONDING | SMP_AUTH_REQ_MITM;
    let sc_mitm = mitm | SMP_AUTH_REQ_SC;

    assert_eq!(
        select_model(&params(DisplayYesNo, sc_mitm, false), &params(DisplayYesNo, sc_mitm, false), PairingRole::Central),
        PairingModel::ScNumericComparison
    );
    assert_eq!(
        select_model(&params(DisplayYesNo, mitm, false), &params(DisplayYesNo, mitm, false), PairingRole::Central),
        PairingModel::EncryptionOnly
    );
    assert_eq!(
        select_model(&params(KeyboardOnly, mitm, false), &params(DisplayOnly, mitm, false), PairingRole::Central),
        PairingModel::LegacyPasskey(PasskeyAction::Input)
    );
    assert_eq!(
        select_model(&params(KeyboardOnly, mitm, false), &params(DisplayOnly, mitm, false), PairingRole::Peripheral),
        PairingModel::LegacyPasskey(PasskeyAction::Display)
    );
    assert_eq!(
        select_model(&params(KeyboardDisplay, sc_mitm, false), &params(KeyboardDisplay, sc_mitm, false), PairingRole::Central),
        PairingModel::ScNumericComparison
    );
    assert_eq!(
        select_model(&params(KeyboardDisplay, mitm, false), &params(KeyboardDisplay, mitm, false), PairingRole::Central),
        PairingModel::LegacyPasskey(PasskeyAction::Display)
    );
    // both keyboards: each side types the same passkey
    assert_eq!(
        select_model(&params(KeyboardOnly, sc_mitm, false), &params(KeyboardOnly, sc_mitm, false), PairingRole::Peripheral),
        PairingModel::ScPasskey(PasskeyAction::Input)
    );
    assert_eq!(
        select_model(&params(DisplayOnly, mitm, false), &params(KeyboardOnly, mitm, false), PairingRole::Central),
        PairingModel::LegacyPasskey(PasskeyAction::Display)
    );
    // no MITM on either side means Just Works whatever the IO
    assert_eq!(
        select_model(&params(KeyboardOnly, SMP_AUTH_REQ_SC, false), &params(DisplayOnly, SMP_AUTH_REQ_SC, false), PairingRole::Central),
        PairingModel::ScJustWorks
    );
    assert_eq!(
        select_model(&params(NoInputNoOutput, sc_mitm, false), &params(KeyboardDisplay, sc_mitm, true), PairingRole::Central),
        PairingModel::ScOob
    );
}

#[test]
fn test_malformed_frames_answered_with_pairing_failed() {
    let mut side = Side::new(SmpConfig::default(), PairingRole::Peripheral);

    side.smp.on_bearer_data(side.bearer_id, &[SMP_PAIRING_REQUEST, 0x03]);
    assert_eq!(
        side.bearer.take_payloads(),
        vec![vec![SMP_PAIRING_FAILED, SMP_REASON_INVALID_PARAMETERS]]
    );

    side.smp.on_bearer_data(
        side.bearer_id,
        &[SMP_PAIRING_REQUEST, 0x03, 0x00, 0x01, 0x06, 0x07, 0x07],
    );
    assert_eq!(
        side.bearer.take_payloads(),
        vec![vec![SMP_PAIRING_FAILED, SMP_REASON_ENCRYPTION_KEY_SIZE]]
    );

    side.smp.on_bearer_data(side.bearer_id, &[0x3F, 0x01, 0x02]);
    assert!(side.bearer.take_payloads().is_empty());

    // the link still pairs after the garbage
    side.smp.on_bearer_data(
        side.bearer_id,
        &[SMP_PAIRING_REQUEST, 0x03, 0x00, 0x01, 0x10, 0x07, 0x07],
    );
    let sent = side.bearer.take_payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][0], SMP_PAIRING_RESPONSE);
    assert_eq!(side.smp.state(&central_addr(), Transport::Le), SmpState::CommitmentExchange);
}

#[test]
fn test_legacy_just_works_pairing() {
    let mut central = Side::new(SmpConfig::default(), PairingRole::Central);
    let mut peripheral = Side::new(SmpConfig::default(), PairingRole::Peripheral);

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::default())
        .unwrap();
    pump(&mut central, &mut peripheral);

    assert_eq!(
        central.smp.pairing_model(&peripheral_addr(), Transport::Le),
        Some(PairingModel::EncryptionOnly)
    );
    let stk = start_encryption(&central.take_events()).expect("central starts encryption");
    assert_eq!(
        peripheral.smp.ltk_request(&central_addr(), 0, &[0; 8]),
        Some(stk)
    );

    central
        .smp
        .on_encryption_changed(&peripheral_addr(), Transport::Le, true);
    peripheral
        .smp
        .on_encryption_changed(&central_addr(), Transport::Le, true);
    pump(&mut central, &mut peripheral);
    assert_eq!(central.smp.state(&peripheral_addr(), Transport::Le), SmpState::Complete);
    assert_eq!(peripheral.smp.state(&central_addr(), Transport::Le), SmpState::Complete);

    let later = Instant::now() + Duration::from_secs(1);
    central.smp.process_timeouts(later);
    peripheral.smp.process_timeouts(later);

    assert_eq!(
        central.completion(),
        Some((PairingStatus::Success, SecurityLevel::Unauthenticated))
    );
    assert_eq!(
        peripheral.completion(),
        Some((PairingStatus::Success, SecurityLevel::Unauthenticated))
    );

    // each side holds what the other distributed
    let central_peer_ltk = central
        .store
        .get_bonded_key(&peripheral_addr(), KeyType::PeerEncryption)
        .unwrap();
    let peripheral_local_ltk = peripheral
        .store
        .get_bonded_key(&central_addr(), KeyType::LocalEncryption)
        .unwrap();
    assert_eq!(central_peer_ltk, peripheral_local_ltk);
    let ltk = LongTermKey::from_bytes(&peripheral_local_ltk).unwrap();
    assert_eq!(
        peripheral.smp.ltk_request(&central_addr(), ltk.ediv, &ltk.rand),
        Some(ltk.key)
    );
    assert!(central
        .store
        .get_bonded_key(&peripheral_addr(), KeyType::PeerIdentity)
        .is_some());
    assert!(peripheral
        .store
        .get_bonded_key(&central_addr(), KeyType::PeerCsrk)
        .is_some());
}

fn sc_config() -> SmpConfig {
    SmpConfig {
        io_capability: IoCapability::DisplayYesNo,
        auth_req: AuthRequirements::secure(),
        ..SmpConfig::default()
    }
}

#[test]
fn test_secure_connections_numeric_comparison() {
    let mut central = Side::new(sc_config(), PairingRole::Central);
    let mut peripheral = Side::new(sc_config(), PairingRole::Peripheral);

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::secure())
        .unwrap();
    pump(&mut central, &mut peripheral);

    let shown_central = numeric_value(&central.take_events()).expect("central shows a number");
    let shown_peripheral =
        numeric_value(&peripheral.take_events()).expect("peripheral shows a number");
    assert_eq!(shown_central, shown_peripheral);
    assert!(shown_central <= SMP_PASSKEY_MAX);

    central
        .smp
        .confirm(&peripheral_addr(), UserAction::Accept)
        .unwrap();
    pump(&mut central, &mut peripheral);
    // the peripheral holds the check until its user answers
    assert!(start_encryption(&central.take_events()).is_none());

    peripheral
        .smp
        .confirm(&central_addr(), UserAction::Accept)
        .unwrap();
    pump(&mut central, &mut peripheral);
    let ltk = start_encryption(&central.take_events()).expect("central starts encryption");
    assert_eq!(peripheral.smp.ltk_request(&central_addr(), 0, &[0; 8]), Some(ltk));

    central
        .smp
        .on_encryption_changed(&peripheral_addr(), Transport::Le, true);
    peripheral
        .smp
        .on_encryption_changed(&central_addr(), Transport::Le, true);
    pump(&mut central, &mut peripheral);

    let later = Instant::now() + Duration::from_secs(1);
    central.smp.process_timeouts(later);
    peripheral.smp.process_timeouts(later);
    assert_eq!(
        central.completion(),
        Some((PairingStatus::Success, SecurityLevel::AuthenticatedSc))
    );
    assert_eq!(
        peripheral.completion(),
        Some((PairingStatus::Success, SecurityLevel::AuthenticatedSc))
    );

    for (store, peer) in [
        (&central.store, peripheral_addr()),
        (&peripheral.store, central_addr()),
    ] {
        let penc = store.get_bonded_key(&peer, KeyType::PeerEncryption).unwrap();
        let lenc = store.get_bonded_key(&peer, KeyType::LocalEncryption).unwrap();
        assert_eq!(penc, lenc);
        assert_eq!(LongTermKey::from_bytes(&penc).unwrap().key, ltk);
    }
}

#[test]
fn test_numeric_comparison_rejected() {
    let mut central = Side::new(sc_config(), PairingRole::Central);
    let mut peripheral = Side::new(sc_config(), PairingRole::Peripheral);

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::secure())
        .unwrap();
    pump(&mut central, &mut peripheral);
    central.take_events();

    peripheral
        .smp
        .confirm(&central_addr(), UserAction::Reject)
        .unwrap();
    pump(&mut central, &mut peripheral);

    assert_eq!(
        peripheral.completion(),
        Some((
            PairingStatus::Failed(SmpReason::NumericComparisonFailed),
            SecurityLevel::None
        ))
    );
    assert_eq!(
        central.completion(),
        Some((
            PairingStatus::Failed(SmpReason::NumericComparisonFailed),
            SecurityLevel::None
        ))
    );
    assert_eq!(central.smp.state(&peripheral_addr(), Transport::Le), SmpState::Idle);
}

#[test]
fn test_response_timeout_blocks_link() {
    let mut central = Side::new(SmpConfig::default(), PairingRole::Central);
    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::default())
        .unwrap();
    assert!(central.smp.next_deadline().is_some());

    central
        .smp
        .process_timeouts(Instant::now() + Duration::from_secs(SMP_RSP_TIMEOUT + 1));
    assert_eq!(
        central.completion(),
        Some((PairingStatus::ResponseTimeout, SecurityLevel::None))
    );

    // only the request went out; no Pairing Failed after a timeout
    let sent = central.bearer.take_payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0][0], SMP_PAIRING_REQUEST);

    assert_eq!(
        central
            .smp
            .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::default()),
        Err(SmpError::InvalidState)
    );
}

#[test]
fn test_late_pairing_failed_downgrades_result() {
    let mut central = Side::new(SmpConfig::default(), PairingRole::Central);
    let mut peripheral = Side::new(SmpConfig::default(), PairingRole::Peripheral);

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::default())
        .unwrap();
    pump(&mut central, &mut peripheral);
    central
        .smp
        .on_encryption_changed(&peripheral_addr(), Transport::Le, true);
    peripheral
        .smp
        .on_encryption_changed(&central_addr(), Transport::Le, true);
    pump(&mut central, &mut peripheral);
    assert_eq!(central.smp.state(&peripheral_addr(), Transport::Le), SmpState::Complete);

    let failed = SmpCommand::PairingFailed(SmpReason::UnspecifiedReason).to_bytes();
    central.smp.on_bearer_data(central.bearer_id, &failed);
    central
        .smp
        .process_timeouts(Instant::now() + Duration::from_secs(1));

    assert_eq!(
        central.completion(),
        Some((
            PairingStatus::Failed(SmpReason::UnspecifiedReason),
            SecurityLevel::None
        ))
    );
    assert!(!central.smp.is_bonded(&peripheral_addr()));
}

#[test]
fn test_cancel_and_link_loss() {
    let mut central = Side::new(SmpConfig::default(), PairingRole::Central);
    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::default())
        .unwrap();
    central.bearer.take_payloads();

    central.smp.cancel(&peripheral_addr()).unwrap();
    assert_eq!(
        central.bearer.take_payloads(),
        vec![vec![SMP_PAIRING_FAILED, SMP_REASON_UNSPECIFIED_REASON]]
    );
    assert_eq!(
        central.completion(),
        Some((PairingStatus::UserCancelled, SecurityLevel::None))
    );
    assert_eq!(
        central.smp.cancel(&peripheral_addr()),
        Err(SmpError::NotPairing(peripheral_addr()))
    );

    central.take_events();
    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::default())
        .unwrap();
    central.smp.on_link_down(&peripheral_addr(), Transport::Le);
    assert_eq!(
        central.completion(),
        Some((
            PairingStatus::Failed(SmpReason::UnspecifiedReason),
            SecurityLevel::None
        ))
    );
}

#[test]
fn test_security_request_starts_pairing() {
    let mut central = Side::new(SmpConfig::default(), PairingRole::Central);
    let mut peripheral = Side::new(SmpConfig::default(), PairingRole::Peripheral);

    assert_eq!(
        peripheral
            .smp
            .start_pairing(&central_addr(), PairingRole::Central, AuthRequirements::default()),
        Err(SmpError::WrongRole(PairingRole::Peripheral))
    );
    peripheral.smp.security_request(&central_addr()).unwrap();
    assert_eq!(peripheral.smp.state(&central_addr(), Transport::Le), SmpState::SecReqSent);

    pump(&mut central, &mut peripheral);
    assert_eq!(
        central.smp.state(&peripheral_addr(), Transport::Le),
        SmpState::EncryptionPending
    );
    assert!(start_encryption(&central.take_events()).is_some());
}

#[test]
fn test_csrk_signing() {
    let crypto: Arc<dyn SmpCrypto> = Arc::new(SoftwareCrypto::new());
    let csrk = ConnectionSignatureResolvingKey::new([0x42; 16], SecurityLevel::Authenticated);
    let mut signer = CsrkSigner::new(crypto.clone(), csrk.clone());
    let mut verifier = CsrkSigner::new(crypto, csrk);

    let message = [0xD2, 0x03, 0x00, 0x01, 0x02];
    let first = signer.sign(&message);
    let second = signer.sign(&message);
    assert_eq!(signer.counter(), 2);
    assert_ne!(first, second);

    assert!(verifier.verify(&message, &first));
    assert!(verifier.verify(&message, &second));
    // replayed counter
    assert!(!verifier.verify(&message, &first));

    let third = signer.sign(&message);
    assert!(!verifier.verify(&[0xD2, 0x03, 0x00, 0x01, 0x03], &third));
}

#[test]
fn test_key_records_round_trip_through_store() {
    let store = MemoryKeyStore::new();
    let peer = peripheral_addr();
    let ltk = LongTermKey::new([7; 16], 0x1234, [9; 8], 16, SecurityLevel::Authenticated);
    store
        .save_key(&peer, KeyType::PeerEncryption, &ltk.to_bytes())
        .unwrap();

    let stored = store.get_bonded_key(&peer, KeyType::PeerEncryption).unwrap();
    assert_eq!(LongTermKey::from_bytes(&stored), Some(ltk));
    assert_eq!(store.bonded_devices(), vec![peer]);

    store.delete(&peer).unwrap();
    assert!(store.bonded_devices().is_empty());
}

fn passkey_config(io: IoCapability, auth_req: AuthRequirements) -> SmpConfig {
    SmpConfig {
        io_capability: io,
        auth_req,
        ..SmpConfig::default()
    }
}

/// Keyboard central against a display-only peripheral, up to the point
/// where the central has been asked for the passkey
fn passkey_pairing(auth_req: AuthRequirements) -> (Side, Side, u32) {
    let mut central = Side::new(passkey_config(IoCapability::KeyboardOnly, auth_req), PairingRole::Central);
    let mut peripheral =
        Side::new(passkey_config(IoCapability::DisplayOnly, auth_req), PairingRole::Peripheral);

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, auth_req)
        .unwrap();
    pump(&mut central, &mut peripheral);

    let passkey = displayed_passkey(&peripheral.take_events()).expect("peripheral shows a passkey");
    assert!(passkey <= SMP_PASSKEY_MAX);
    assert!(asked_for(&central.take_events(), |e| matches!(
        e,
        SmpEvent::PasskeyRequest { .. }
    )));
    (central, peripheral, passkey)
}

#[test]
fn test_legacy_passkey_pairing() {
    let auth_req = AuthRequirements::new(true, true, false);
    let (mut central, mut peripheral, passkey) = passkey_pairing(auth_req);
    assert_eq!(
        central.smp.pairing_model(&peripheral_addr(), Transport::Le),
        Some(PairingModel::LegacyPasskey(PasskeyAction::Input))
    );

    central
        .smp
        .passkey_entry(&peripheral_addr(), Some(passkey))
        .unwrap();
    pump(&mut central, &mut peripheral);
    let stk = start_encryption(&central.take_events()).expect("central starts encryption");
    assert_eq!(peripheral.smp.ltk_request(&central_addr(), 0, &[0; 8]), Some(stk));

    finish_encryption(&mut central, &mut peripheral);
    assert_eq!(
        central.completion(),
        Some((PairingStatus::Success, SecurityLevel::Authenticated))
    );
    assert_eq!(
        peripheral.completion(),
        Some((PairingStatus::Success, SecurityLevel::Authenticated))
    );
}

#[test]
fn test_legacy_passkey_mismatch_fails_confirm() {
    let auth_req = AuthRequirements::new(true, true, false);
    let (mut central, mut peripheral, passkey) = passkey_pairing(auth_req);

    central
        .smp
        .passkey_entry(&peripheral_addr(), Some(passkey ^ 1))
        .unwrap();
    pump(&mut central, &mut peripheral);

    let failed = (
        PairingStatus::Failed(SmpReason::ConfirmValueFailed),
        SecurityLevel::None,
    );
    assert_eq!(peripheral.completion(), Some(failed));
    assert_eq!(central.completion(), Some(failed));
}

#[test]
fn test_sc_passkey_runs_twenty_commitment_rounds() {
    let (mut central, mut peripheral, passkey) = passkey_pairing(AuthRequirements::secure());
    assert_eq!(
        central.smp.pairing_model(&peripheral_addr(), Transport::Le),
        Some(PairingModel::ScPasskey(PasskeyAction::Input))
    );

    central
        .smp
        .passkey_entry(&peripheral_addr(), Some(passkey))
        .unwrap();
    let sent = relay(&mut central, &mut peripheral, |_| {});
    let count = |opcode: u8| sent.iter().filter(|frame| frame[0] == opcode).count();
    assert_eq!(count(SMP_PAIRING_CONFIRM), SMP_PASSKEY_ROUNDS as usize);
    assert_eq!(count(SMP_PAIRING_RANDOM), SMP_PASSKEY_ROUNDS as usize);
    assert_eq!(count(SMP_PAIRING_DHK_CHECK), 1);

    let ltk = start_encryption(&central.take_events()).expect("central starts encryption");
    assert_eq!(peripheral.smp.ltk_request(&central_addr(), 0, &[0; 8]), Some(ltk));

    finish_encryption(&mut central, &mut peripheral);
    assert_eq!(
        central.completion(),
        Some((PairingStatus::Success, SecurityLevel::AuthenticatedSc))
    );
    assert_eq!(
        peripheral.completion(),
        Some((PairingStatus::Success, SecurityLevel::AuthenticatedSc))
    );
}

#[test]
fn test_sc_passkey_wrong_commitment() {
    let (mut central, mut peripheral, passkey) = passkey_pairing(AuthRequirements::secure());

    // bit 0 differs, so the very first round disagrees
    central
        .smp
        .passkey_entry(&peripheral_addr(), Some(passkey ^ 1))
        .unwrap();
    pump(&mut central, &mut peripheral);

    let failed = (
        PairingStatus::Failed(SmpReason::ConfirmValueFailed),
        SecurityLevel::None,
    );
    assert_eq!(peripheral.completion(), Some(failed));
    assert_eq!(central.completion(), Some(failed));
    assert!(start_encryption(&central.take_events()).is_none());
}

#[test]
fn test_sc_dhkey_check_mismatch() {
    let auth_req = AuthRequirements::new(true, false, true);
    let mut central = Side::new(passkey_config(IoCapability::NoInputNoOutput, auth_req), PairingRole::Central);
    let mut peripheral =
        Side::new(passkey_config(IoCapability::NoInputNoOutput, auth_req), PairingRole::Peripheral);

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, auth_req)
        .unwrap();
    let sent = relay(&mut central, &mut peripheral, |frame| {
        if frame[0] == SMP_PAIRING_DHK_CHECK {
            frame[1] ^= 0x80;
        }
    });
    assert!(sent.iter().any(|frame| frame[0] == SMP_PAIRING_DHK_CHECK));
    assert_eq!(
        central.smp.pairing_model(&peripheral_addr(), Transport::Le),
        None
    );

    let failed = (
        PairingStatus::Failed(SmpReason::DhKeyCheckFailed),
        SecurityLevel::None,
    );
    assert_eq!(peripheral.completion(), Some(failed));
    assert_eq!(central.completion(), Some(failed));
    assert!(start_encryption(&central.take_events()).is_none());
}

#[test]
fn test_legacy_oob_pairing() {
    let auth_req = AuthRequirements::new(true, true, false);
    let mut central = Side::new(passkey_config(IoCapability::NoInputNoOutput, auth_req), PairingRole::Central);
    let mut peripheral =
        Side::new(passkey_config(IoCapability::NoInputNoOutput, auth_req), PairingRole::Peripheral);
    let tk = [0x3C; 16];

    // the peripheral already holds the TK; the central is asked for it
    peripheral
        .smp
        .oob_data_ready(&central_addr(), OobData::Legacy { tk })
        .unwrap();
    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, auth_req)
        .unwrap();
    pump(&mut central, &mut peripheral);

    assert_eq!(
        central.smp.pairing_model(&peripheral_addr(), Transport::Le),
        Some(PairingModel::LegacyOob)
    );
    assert!(asked_for(&central.take_events(), |e| matches!(
        e,
        SmpEvent::OobRequest { .. }
    )));

    central
        .smp
        .oob_data_ready(&peripheral_addr(), OobData::Legacy { tk })
        .unwrap();
    pump(&mut central, &mut peripheral);
    assert!(start_encryption(&central.take_events()).is_some());

    finish_encryption(&mut central, &mut peripheral);
    assert_eq!(
        central.completion(),
        Some((PairingStatus::Success, SecurityLevel::Authenticated))
    );
    assert_eq!(
        peripheral.completion(),
        Some((PairingStatus::Success, SecurityLevel::Authenticated))
    );
}

fn sc_oob_sides() -> (Side, Side, OobData) {
    let auth_req = AuthRequirements::secure();
    let mut central = Side::new(passkey_config(IoCapability::NoInputNoOutput, auth_req), PairingRole::Central);
    let peripheral =
        Side::new(passkey_config(IoCapability::KeyboardDisplay, auth_req), PairingRole::Peripheral);
    let data = central.smp.generate_local_oob().unwrap();
    (central, peripheral, data)
}

#[test]
fn test_sc_oob_pairing() {
    let (mut central, mut peripheral, data) = sc_oob_sides();
    peripheral.smp.oob_data_ready(&central_addr(), data).unwrap();

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::secure())
        .unwrap();
    pump(&mut central, &mut peripheral);
    let ltk = start_encryption(&central.take_events()).expect("central starts encryption");
    assert_eq!(peripheral.smp.ltk_request(&central_addr(), 0, &[0; 8]), Some(ltk));

    finish_encryption(&mut central, &mut peripheral);
    assert_eq!(
        central.completion(),
        Some((PairingStatus::Success, SecurityLevel::AuthenticatedSc))
    );
    assert_eq!(
        peripheral.completion(),
        Some((PairingStatus::Success, SecurityLevel::AuthenticatedSc))
    );
}

#[test]
fn test_sc_oob_commitment_mismatch() {
    let (mut central, mut peripheral, data) = sc_oob_sides();
    let OobData::SecureConnections { r, mut c } = data else {
        panic!("expected Secure Connections OOB data");
    };
    c[0] ^= 0x01;
    peripheral
        .smp
        .oob_data_ready(&central_addr(), OobData::SecureConnections { r, c })
        .unwrap();

    central
        .smp
        .start_pairing(&central.peer, PairingRole::Central, AuthRequirements::secure())
        .unwrap();
    pump(&mut central, &mut peripheral);

    let failed = (
        PairingStatus::Failed(SmpReason::ConfirmValueFailed),
        SecurityLevel::None,
    );
    assert_eq!(peripheral.completion(), Some(failed));
    assert_eq!(central.completion(), Some(failed));
}

#[test]
fn test_cross_transport_key_derivation_over_br_edr() {
    let mut central = Side::on(SmpConfig::default(), PairingRole::Central, Transport::BrEdr);
    let mut peripheral = Side::on(SmpConfig::default(), PairingRole::Peripheral, Transport::BrEdr);

    assert_eq!(
        central.smp.start_cross_transport_pairing(&peripheral_addr()),
        Err(SmpError::InvalidState)
    );
    let link_key = LinkKey::new([0x5A; 16], SecurityLevel::Authenticated).to_bytes();
    central
        .store
        .save_key(&peripheral_addr(), KeyType::LinkKey, &link_key)
        .unwrap();
    peripheral
        .store
        .save_key(&central_addr(), KeyType::LinkKey, &link_key)
        .unwrap();

    central
        .smp
        .start_cross_transport_pairing(&peripheral_addr())
        .unwrap();
    let sent = relay(&mut central, &mut peripheral, |_| {});
    // keys only; no confirm, random or LTK on the wire
    assert!(sent.iter().all(|frame| {
        ![SMP_PAIRING_CONFIRM, SMP_PAIRING_RANDOM, SMP_ENCRYPTION_INFORMATION].contains(&frame[0])
    }));
    assert_eq!(central.smp.state(&peripheral_addr(), Transport::BrEdr), SmpState::Complete);

    let later = Instant::now() + Duration::from_secs(1);
    central.smp.process_timeouts(later);
    peripheral.smp.process_timeouts(later);

    for side in [&central, &peripheral] {
        let over_br = side.events.lock().unwrap().iter().find_map(|event| match event {
            SmpEvent::PairingComplete {
                status,
                sec_level,
                smp_over_br,
                ..
            } => Some((*status, *sec_level, *smp_over_br)),
            _ => None,
        });
        assert_eq!(
            over_br,
            Some((PairingStatus::Success, SecurityLevel::Authenticated, true))
        );
    }

    let central_ltk = central
        .store
        .get_bonded_key(&peripheral_addr(), KeyType::PeerEncryption)
        .unwrap();
    let peripheral_ltk = peripheral
        .store
        .get_bonded_key(&central_addr(), KeyType::LocalEncryption)
        .unwrap();
    assert_eq!(central_ltk, peripheral_ltk);
    assert!(central
        .store
        .get_bonded_key(&peripheral_addr(), KeyType::PeerIdentity)
        .is_some());
}
