//! Unit tests for the GATT client

use super::*;
use crate::att::*;
use crate::bearer::{BearerDescriptor, BearerId, ATT_CID, EATT_PSM};
use crate::gap::{BdAddr, Transport};
use crate::smp::{
    ConnectionSignatureResolvingKey, CsrkSigner, SecurityLevel, SmpCrypto, SoftwareCrypto,
    SIGNATURE_LEN,
};
use crate::testing::RecordingBearer;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const ATT: BearerId = BearerId(1);
const EATT: BearerId = BearerId(2);

fn peer() -> BdAddr {
    BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
}

/// Client with one app connected to one peer over the ATT bearer
struct Fixture {
    gatt: GattClient,
    bearer: Arc<RecordingBearer>,
    /// Events of every app; the conn id tells them apart
    events: Arc<Mutex<Vec<GattEvent>>>,
    conn_id: ConnId,
}

impl Fixture {
    fn new() -> Self {
        let bearer = Arc::new(RecordingBearer::new());
        let mut gatt = GattClient::new(GattConfig::default(), bearer.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let gatt_if = gatt
            .register_app(move |event| sink.lock().unwrap().push(event))
            .unwrap();
        gatt.on_bearer_connected(&BearerDescriptor::fixed(
            ATT,
            peer(),
            Transport::Le,
            ATT_CID,
            23,
        ));
        let conn_id = gatt.conn_id(gatt_if, &peer()).unwrap();
        Self {
            gatt,
            bearer,
            events,
            conn_id,
        }
    }

    fn add_app(&mut self) -> ConnId {
        let sink = self.events.clone();
        let gatt_if = self
            .gatt
            .register_app(move |event| sink.lock().unwrap().push(event))
            .unwrap();
        self.gatt.conn_id(gatt_if, &peer()).unwrap()
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.bearer.take_payloads()
    }

    fn respond(&mut self, pdu: &[u8]) {
        self.gatt.on_bearer_data(ATT, pdu);
    }

    fn take_events(&self) -> Vec<GattEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn completions(&self) -> Vec<(GattOperation, GattStatus, OperationData)> {
        self.take_events()
            .into_iter()
            .filter_map(|event| match event {
                GattEvent::OperationComplete {
                    op, status, data, ..
                } => Some((op, status, data)),
                _ => None,
            })
            .collect()
    }

    fn timeout(&mut self, secs: u64) {
        self.gatt
            .process_timeouts(Instant::now() + Duration::from_secs(secs));
    }
}

fn discovery(events: &[GattEvent]) -> (Vec<DiscoveryRecord>, Option<GattStatus>) {
    let mut records = Vec::new();
    let mut status = None;
    for event in events {
        match event {
            GattEvent::DiscoveryResult { record, .. } => records.push(record.clone()),
            GattEvent::DiscoveryComplete { status: s, .. } => status = Some(*s),
            _ => {}
        }
    }
    (records, status)
}

#[test]
fn test_connection_gives_each_app_a_conn_id() {
    let mut fx = Fixture::new();
    assert_eq!(fx.conn_id, ConnId(0x0001));
    assert_eq!(fx.conn_id.gatt_if(), GattIf(1));
    assert_eq!(fx.conn_id.tcb_idx(), 0);
    assert!(matches!(
        fx.take_events().as_slice(),
        [GattEvent::Connected { conn_id, .. }] if *conn_id == ConnId(0x0001)
    ));

    let second = fx.add_app();
    assert_eq!(second, ConnId(0x0002));
    assert_eq!(fx.gatt.payload_size(fx.conn_id), Some(ATT_DEFAULT_MTU));
}

#[test]
fn test_long_read_accumulates_blobs() {
    let mut fx = Fixture::new();
    let value: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();

    let mut requests = 0;
    loop {
        let sent = fx.sent();
        if sent.is_empty() {
            break;
        }
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        requests += 1;
        let offset = match frame[0] {
            ATT_READ_REQ => 0,
            ATT_READ_BLOB_REQ => u16::from_le_bytes([frame[3], frame[4]]) as usize,
            other => panic!("unexpected opcode {:#04x}", other),
        };
        assert_eq!(&frame[1..3], &[0x10, 0x00]);

        let end = (offset + 22).min(value.len());
        let opcode = if offset == 0 {
            ATT_READ_RSP
        } else {
            ATT_READ_BLOB_RSP
        };
        let mut rsp = vec![opcode];
        rsp.extend_from_slice(&value[offset..end]);
        fx.respond(&rsp);
    }

    // one read and 27 blob reads of 22 bytes, the last one short
    assert_eq!(requests, 28);
    match fx.completions().as_slice() {
        [(
            GattOperation::Read,
            GattStatus::Success,
            OperationData::Value {
                handle,
                value: read,
            },
        )] => {
            assert_eq!(*handle, 0x0010);
            assert_eq!(read, &value);
        }
        other => panic!("unexpected completions {:?}", other),
    }
}

#[test]
fn test_long_read_ends_on_not_long() {
    let mut fx = Fixture::new();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0003)).unwrap();
    fx.sent();

    let mut rsp = vec![ATT_READ_RSP];
    rsp.extend_from_slice(&[0x5A; 22]);
    fx.respond(&rsp);
    assert_eq!(fx.sent(), vec![vec![ATT_READ_BLOB_REQ, 0x03, 0x00, 22, 0x00]]);

    fx.respond(&[ATT_ERROR_RSP, ATT_READ_BLOB_REQ, 0x03, 0x00, ATT_ERROR_ATTRIBUTE_NOT_LONG]);
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Read,
            GattStatus::Success,
            OperationData::Value {
                handle: 0x0003,
                value: vec![0x5A; 22]
            }
        )]
    );
}

#[test]
fn test_discover_all_primary_services() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt
        .discover(fx.conn_id, DiscoveryType::AllServices, 0x0001, 0xFFFF)
        .unwrap();
    assert_eq!(
        fx.sent(),
        vec![vec![0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]]
    );

    fx.respond(&[
        0x11, 0x06, 0x01, 0x00, 0x05, 0x00, 0x00, 0x18, 0x06, 0x00, 0x0B, 0x00, 0x01, 0x18,
    ]);
    assert_eq!(
        fx.sent(),
        vec![vec![0x10, 0x0C, 0x00, 0xFF, 0xFF, 0x00, 0x28]]
    );

    fx.respond(&[ATT_ERROR_RSP, 0x10, 0x0C, 0x00, ATT_ERROR_ATTRIBUTE_NOT_FOUND]);
    let (records, status) = discovery(&fx.take_events());
    assert_eq!(status, Some(GattStatus::Success));
    assert_eq!(
        records,
        vec![
            DiscoveryRecord::Service(Service {
                uuid: Uuid::from_u16(0x1800),
                is_primary: true,
                start_handle: 0x0001,
                end_handle: 0x0005,
            }),
            DiscoveryRecord::Service(Service {
                uuid: Uuid::from_u16(0x1801),
                is_primary: true,
                start_handle: 0x0006,
                end_handle: 0x000B,
            }),
        ]
    );
}

#[test]
fn test_discover_service_by_32bit_uuid_sends_128bit_value() {
    let mut fx = Fixture::new();
    fx.gatt
        .discover(
            fx.conn_id,
            DiscoveryType::ServicesByUuid(Uuid::from_u32(0x0000FEED)),
            0x0001,
            0xFFFF,
        )
        .unwrap();
    let sent = fx.sent();
    assert_eq!(sent[0][0], ATT_FIND_BY_TYPE_VALUE_REQ);
    assert_eq!(sent[0].len(), 1 + 6 + 16);
    assert_eq!(&sent[0][7..], &Uuid::from_u16(0xFEED).to_uuid128());

    fx.respond(&[ATT_FIND_BY_TYPE_VALUE_RSP, 0x10, 0x00, 0xFF, 0xFF]);
    let (records, status) = discovery(&fx.take_events());
    assert_eq!(status, Some(GattStatus::Success));
    assert_eq!(records.len(), 1);
    assert!(fx.sent().is_empty());
}

#[test]
fn test_characteristic_discovery_filters_by_uuid() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt
        .discover(
            fx.conn_id,
            DiscoveryType::Characteristics(Some(Uuid::from_u16(0x2A01))),
            0x0001,
            0x0020,
        )
        .unwrap();
    assert_eq!(
        fx.sent(),
        vec![vec![0x08, 0x01, 0x00, 0x20, 0x00, 0x03, 0x28]]
    );

    fx.respond(&[
        0x09, 0x07, 0x02, 0x00, 0x02, 0x03, 0x00, 0x00, 0x2A, 0x04, 0x00, 0x0A, 0x05, 0x00,
        0x01, 0x2A,
    ]);
    assert_eq!(
        fx.sent(),
        vec![vec![0x08, 0x05, 0x00, 0x20, 0x00, 0x03, 0x28]]
    );
    fx.respond(&[ATT_ERROR_RSP, 0x08, 0x05, 0x00, ATT_ERROR_ATTRIBUTE_NOT_FOUND]);

    let (records, status) = discovery(&fx.take_events());
    assert_eq!(status, Some(GattStatus::Success));
    assert_eq!(
        records,
        vec![DiscoveryRecord::Characteristic(Characteristic {
            uuid: Uuid::from_u16(0x2A01),
            declaration_handle: 0x0004,
            value_handle: 0x0005,
            properties: CharacteristicProperty(0x0A),
        })]
    );
}

#[test]
fn test_included_service_with_128bit_uuid_is_read() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt
        .discover(fx.conn_id, DiscoveryType::IncludedServices, 0x0001, 0x0010)
        .unwrap();
    fx.sent();

    fx.respond(&[0x09, 0x06, 0x02, 0x00, 0x20, 0x00, 0x30, 0x00]);
    assert_eq!(fx.sent(), vec![vec![ATT_READ_REQ, 0x20, 0x00]]);

    let uuid: Vec<u8> = (0x10..0x20).collect();
    let mut rsp = vec![ATT_READ_RSP];
    rsp.extend_from_slice(&uuid);
    fx.respond(&rsp);
    assert_eq!(
        fx.sent(),
        vec![vec![0x08, 0x03, 0x00, 0x10, 0x00, 0x02, 0x28]]
    );

    fx.respond(&[ATT_ERROR_RSP, 0x08, 0x03, 0x00, ATT_ERROR_ATTRIBUTE_NOT_FOUND]);
    let (records, status) = discovery(&fx.take_events());
    assert_eq!(status, Some(GattStatus::Success));
    assert_eq!(
        records,
        vec![DiscoveryRecord::IncludedService(IncludedService {
            handle: 0x0002,
            uuid: Uuid::from_bytes(&uuid).unwrap(),
            start_handle: 0x0020,
            end_handle: 0x0030,
        })]
    );
}

#[test]
fn test_descriptor_discovery() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt
        .discover(fx.conn_id, DiscoveryType::Descriptors, 0x0006, 0x0007)
        .unwrap();
    assert_eq!(fx.sent(), vec![vec![0x04, 0x06, 0x00, 0x07, 0x00]]);

    fx.respond(&[0x05, 0x01, 0x06, 0x00, 0x02, 0x29, 0x07, 0x00, 0x01, 0x29]);
    let (records, status) = discovery(&fx.take_events());
    assert_eq!(status, Some(GattStatus::Success));
    assert_eq!(records.len(), 2);
    assert!(fx.sent().is_empty());
}

#[test]
fn test_one_request_in_flight_per_bearer() {
    let mut fx = Fixture::new();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();
    fx.gatt
        .write(fx.conn_id, 0x0011, vec![0x01], WriteType::Request)
        .unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_READ_REQ, 0x10, 0x00]]);
    assert_eq!(fx.gatt.pending_operations(fx.conn_id), 2);

    fx.respond(&[ATT_READ_RSP, 0x42]);
    assert_eq!(fx.sent(), vec![vec![ATT_WRITE_REQ, 0x11, 0x00, 0x01]]);
    fx.respond(&[ATT_WRITE_RSP]);

    let completions = fx.completions();
    assert_eq!(completions.len(), 2);
    assert_eq!(
        completions[0],
        (
            GattOperation::Read,
            GattStatus::Success,
            OperationData::Value {
                handle: 0x0010,
                value: vec![0x42]
            }
        )
    );
    assert_eq!(
        completions[1],
        (
            GattOperation::Write,
            GattStatus::Success,
            OperationData::Handle(0x0011)
        )
    );
    assert_eq!(fx.gatt.pending_operations(fx.conn_id), 0);
}

#[test]
fn test_long_write_uses_prepared_writes() {
    let mut fx = Fixture::new();
    let value: Vec<u8> = (0..40).collect();
    fx.gatt
        .write(fx.conn_id, 0x0020, value.clone(), WriteType::Request)
        .unwrap();

    let mut written = Vec::new();
    loop {
        let sent = fx.sent();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        if frame[0] == ATT_EXECUTE_WRITE_REQ {
            assert_eq!(frame[1], ATT_EXEC_WRITE_COMMIT);
            fx.respond(&[ATT_EXECUTE_WRITE_RSP]);
            break;
        }
        assert_eq!(frame[0], ATT_PREPARE_WRITE_REQ);
        let offset = u16::from_le_bytes([frame[3], frame[4]]) as usize;
        assert_eq!(offset, written.len());
        // payload size minus the prepare write header
        assert!(frame.len() - 5 <= 18);
        written.extend_from_slice(&frame[5..]);

        let mut echo = frame.clone();
        echo[0] = ATT_PREPARE_WRITE_RSP;
        fx.respond(&echo);
    }

    assert_eq!(written, value);
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Write,
            GattStatus::Success,
            OperationData::Handle(0x0020)
        )]
    );
}

#[test]
fn test_long_write_mismatch_cancels_queue() {
    let mut fx = Fixture::new();
    fx.gatt
        .write(fx.conn_id, 0x0020, vec![0x33; 30], WriteType::Request)
        .unwrap();
    let sent = fx.sent();
    let mut echo = sent[0].clone();
    echo[0] = ATT_PREPARE_WRITE_RSP;
    echo[6] ^= 0xFF;
    fx.respond(&echo);

    assert_eq!(
        fx.sent(),
        vec![vec![ATT_EXECUTE_WRITE_REQ, ATT_EXEC_WRITE_CANCEL]]
    );
    fx.respond(&[ATT_EXECUTE_WRITE_RSP]);
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Write,
            GattStatus::Error,
            OperationData::Handle(0x0020)
        )]
    );
}

#[test]
fn test_long_write_commit_error_reported_without_cancel() {
    let mut fx = Fixture::new();
    fx.gatt
        .write(fx.conn_id, 0x0020, vec![0x44; 30], WriteType::Request)
        .unwrap();
    for _ in 0..2 {
        let sent = fx.sent();
        assert_eq!(sent[0][0], ATT_PREPARE_WRITE_REQ);
        let mut echo = sent[0].clone();
        echo[0] = ATT_PREPARE_WRITE_RSP;
        fx.respond(&echo);
    }
    assert_eq!(
        fx.sent(),
        vec![vec![ATT_EXECUTE_WRITE_REQ, ATT_EXEC_WRITE_COMMIT]]
    );

    fx.respond(&[
        ATT_ERROR_RSP,
        ATT_EXECUTE_WRITE_REQ,
        0x20,
        0x00,
        ATT_ERROR_INVALID_ATTRIBUTE_VALUE_LENGTH,
    ]);
    assert!(fx.sent().is_empty());
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Write,
            GattStatus::Att(AttErrorCode::InvalidAttributeValueLength),
            OperationData::Handle(0x0020)
        )]
    );
}

#[test]
fn test_app_driven_prepare_and_execute() {
    let mut fx = Fixture::new();
    fx.gatt
        .write(
            fx.conn_id,
            0x0030,
            vec![0xAB, 0xCD],
            WriteType::Prepare { offset: 4 },
        )
        .unwrap();
    assert_eq!(
        fx.sent(),
        vec![vec![ATT_PREPARE_WRITE_REQ, 0x30, 0x00, 0x04, 0x00, 0xAB, 0xCD]]
    );
    fx.respond(&[ATT_PREPARE_WRITE_RSP, 0x30, 0x00, 0x04, 0x00, 0xAB, 0xCD]);

    fx.gatt.execute_write(fx.conn_id, true).unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_EXECUTE_WRITE_REQ, 0x01]]);
    fx.respond(&[ATT_EXECUTE_WRITE_RSP]);

    let completions = fx.completions();
    assert_eq!(
        completions[0].2,
        OperationData::Prepared {
            handle: 0x0030,
            offset: 4,
            value: vec![0xAB, 0xCD]
        }
    );
    assert_eq!(completions[1].0, GattOperation::ExecuteWrite);
    assert_eq!(completions[1].1, GattStatus::Success);
}

#[test]
fn test_write_command_completes_once_sent() {
    let mut fx = Fixture::new();
    fx.gatt
        .write(fx.conn_id, 0x0012, vec![0x01, 0x02], WriteType::NoResponse)
        .unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_WRITE_CMD, 0x12, 0x00, 0x01, 0x02]]);
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Write,
            GattStatus::Success,
            OperationData::Handle(0x0012)
        )]
    );

    assert_eq!(
        fx.gatt
            .write(fx.conn_id, 0x0012, vec![0; 21], WriteType::NoResponse),
        Err(GattError::InvalidParameter("value too long for a write command"))
    );
}

#[test]
fn test_signed_write_carries_valid_signature() {
    let mut fx = Fixture::new();
    assert_eq!(
        fx.gatt
            .write(fx.conn_id, 0x0015, vec![1, 2, 3], WriteType::Signed),
        Err(GattError::NoSigningKey(peer()))
    );

    let crypto: Arc<dyn SmpCrypto> = Arc::new(SoftwareCrypto::new());
    let csrk = ConnectionSignatureResolvingKey::new([0x77; 16], SecurityLevel::Authenticated);
    fx.gatt
        .set_signing_key(peer(), CsrkSigner::new(crypto.clone(), csrk.clone()));
    fx.gatt
        .write(fx.conn_id, 0x0015, vec![1, 2, 3], WriteType::Signed)
        .unwrap();

    let sent = fx.sent();
    let frame = &sent[0];
    assert_eq!(&frame[..6], &[ATT_SIGNED_WRITE_CMD, 0x15, 0x00, 1, 2, 3]);
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&frame[6..]);

    let mut verifier = CsrkSigner::new(crypto, csrk);
    assert!(verifier.verify(&ClientPdu::signed_message(0x0015, &[1, 2, 3]), &signature));
    assert_eq!(fx.completions()[0].1, GattStatus::Success);
}

#[test]
fn test_notifications_reach_every_app_in_order() {
    let mut fx = Fixture::new();
    let second = fx.add_app();
    fx.take_events();

    fx.respond(&[ATT_HANDLE_VALUE_NTF, 0x20, 0x00, 0xAA]);
    let targets: Vec<ConnId> = fx
        .take_events()
        .into_iter()
        .filter_map(|event| match event {
            GattEvent::Notification {
                conn_id,
                handle,
                value,
                is_indication,
            } => {
                assert_eq!(handle, 0x0020);
                assert_eq!(value, vec![0xAA]);
                assert!(!is_indication);
                Some(conn_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec![fx.conn_id, second]);
    assert!(fx.sent().is_empty());
}

#[test]
fn test_multiple_notification_dispatches_each_value() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.respond(&[
        ATT_MULTIPLE_HANDLE_VALUE_NTF, 0x20, 0x00, 0x01, 0x00, 0xAA, 0x21, 0x00, 0x02, 0x00, 0xBB,
        0xCC,
    ]);
    let handles: Vec<u16> = fx
        .take_events()
        .into_iter()
        .filter_map(|event| match event {
            GattEvent::Notification { handle, .. } => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(handles, vec![0x0020, 0x0021]);
}

#[test]
fn test_indication_confirmed_once_all_apps_ack() {
    let mut fx = Fixture::new();
    let second = fx.add_app();

    fx.respond(&[ATT_HANDLE_VALUE_IND, 0x20, 0x00, 0x01]);
    assert!(fx.sent().is_empty());

    fx.gatt.send_confirmation(fx.conn_id).unwrap();
    assert!(fx.sent().is_empty());
    fx.gatt.send_confirmation(second).unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_HANDLE_VALUE_CONF]]);

    assert!(fx.gatt.send_confirmation(second).is_err());
    assert!(fx.gatt.next_deadline().is_none());
}

#[test]
fn test_indication_without_apps_confirmed_immediately() {
    let mut fx = Fixture::new();
    fx.gatt.unregister_app(fx.conn_id.gatt_if()).unwrap();
    fx.respond(&[ATT_HANDLE_VALUE_IND, 0x20, 0x00, 0x01]);
    assert_eq!(fx.sent(), vec![vec![ATT_HANDLE_VALUE_CONF]]);
}

#[test]
fn test_unconfirmed_indication_confirmed_on_timeout() {
    let mut fx = Fixture::new();
    fx.respond(&[ATT_HANDLE_VALUE_IND, 0x20, 0x00, 0x01]);
    assert!(fx.sent().is_empty());
    fx.timeout(6);
    assert_eq!(fx.sent(), vec![vec![ATT_HANDLE_VALUE_CONF]]);
}

#[test]
fn test_oversize_frames_are_rejected() {
    let mut fx = Fixture::new();
    fx.take_events();

    let mut notification = vec![ATT_HANDLE_VALUE_NTF, 0x20, 0x00];
    notification.extend_from_slice(&[0; 21]);
    fx.respond(&notification);
    assert!(fx.take_events().is_empty());

    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();
    fx.sent();
    let mut rsp = vec![ATT_READ_RSP];
    rsp.extend_from_slice(&[0; 23]);
    fx.respond(&rsp);
    assert_eq!(
        fx.completions(),
        vec![(GattOperation::Read, GattStatus::Error, OperationData::None)]
    );
}

#[test]
fn test_short_error_response_uses_unknown_reason() {
    let mut fx = Fixture::new();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();
    fx.sent();
    fx.respond(&[ATT_ERROR_RSP, ATT_READ_REQ]);
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Read,
            GattStatus::Att(AttErrorCode::Unknown(0x7F)),
            OperationData::None
        )]
    );
}

#[test]
fn test_mismatched_response_fails_request() {
    let mut fx = Fixture::new();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();
    fx.sent();
    fx.respond(&[ATT_WRITE_RSP]);
    assert_eq!(
        fx.completions(),
        vec![(GattOperation::Read, GattStatus::Error, OperationData::None)]
    );
}

#[test]
fn test_response_timeout_moves_queue_on() {
    let mut fx = Fixture::new();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();
    fx.gatt
        .write(fx.conn_id, 0x0011, vec![0x01], WriteType::Request)
        .unwrap();
    assert_eq!(fx.sent().len(), 1);

    fx.timeout(31);
    assert_eq!(
        fx.completions(),
        vec![(GattOperation::Read, GattStatus::Error, OperationData::None)]
    );
    assert_eq!(fx.sent(), vec![vec![ATT_WRITE_REQ, 0x11, 0x00, 0x01]]);
}

#[test]
fn test_service_discovery_retried_after_timeout() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt
        .discover(fx.conn_id, DiscoveryType::AllServices, 0x0001, 0xFFFF)
        .unwrap();
    let request = fx.sent();

    for _ in 0..GATT_REQ_RETRY_LIMIT {
        fx.timeout(31);
        assert_eq!(fx.sent(), request);
    }
    fx.timeout(31);
    assert!(fx.sent().is_empty());
    let (_, status) = discovery(&fx.take_events());
    assert_eq!(status, Some(GattStatus::Error));
}

#[test]
fn test_disconnect_completes_every_operation() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)).unwrap();
    fx.gatt
        .write(fx.conn_id, 0x0011, vec![0x01], WriteType::Request)
        .unwrap();

    fx.gatt.on_bearer_disconnected(ATT);
    let events = fx.take_events();
    let closed = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                GattEvent::OperationComplete {
                    status: GattStatus::ConnectionClosed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(closed, 2);
    assert!(matches!(events.last(), Some(GattEvent::Disconnected { .. })));
    assert_eq!(fx.gatt.conn_id(fx.conn_id.gatt_if(), &peer()), None);
    assert_eq!(
        fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0010)),
        Err(GattError::NotConnected(fx.conn_id))
    );
    assert!(fx.gatt.next_deadline().is_none());
}

#[test]
fn test_mtu_exchange() {
    let mut fx = Fixture::new();
    fx.take_events();
    fx.gatt.configure_mtu(fx.conn_id, 100).unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_EXCHANGE_MTU_REQ, 100, 0x00]]);

    fx.respond(&[ATT_EXCHANGE_MTU_RSP, 64, 0x00]);
    assert_eq!(fx.gatt.payload_size(fx.conn_id), Some(64));
    assert_eq!(fx.gatt.data_length_hint(&peer()), Some(100));
    let events = fx.take_events();
    assert!(events.contains(&GattEvent::MtuChanged {
        conn_id: fx.conn_id,
        mtu: 64
    }));
    assert!(events.contains(&GattEvent::OperationComplete {
        conn_id: fx.conn_id,
        op: GattOperation::Config,
        status: GattStatus::Success,
        data: OperationData::Mtu(64),
    }));
}

#[test]
fn test_server_mtu_request_is_answered() {
    let mut fx = Fixture::new();
    fx.respond(&[ATT_EXCHANGE_MTU_REQ, 0x00, 0x01]);
    assert_eq!(fx.sent(), vec![vec![ATT_EXCHANGE_MTU_RSP, 0x05, 0x02]]);
    assert_eq!(fx.gatt.payload_size(fx.conn_id), Some(256));
}

#[test]
fn test_server_requests_not_supported() {
    let mut fx = Fixture::new();
    fx.respond(&[ATT_READ_REQ, 0x01, 0x00]);
    assert_eq!(
        fx.sent(),
        vec![vec![
            ATT_ERROR_RSP,
            ATT_READ_REQ,
            0x00,
            0x00,
            ATT_ERROR_REQUEST_NOT_SUPPORTED
        ]]
    );

    fx.respond(&[ATT_WRITE_CMD, 0x01, 0x00, 0x00]);
    assert!(fx.sent().is_empty());
}

#[test]
fn test_eatt_bearer_takes_least_loaded_work() {
    let mut fx = Fixture::new();
    fx.gatt.on_bearer_connected(&BearerDescriptor::dynamic(
        EATT,
        peer(),
        Transport::Le,
        EATT_PSM,
        0x0040,
        0x0041,
        64,
    ));

    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0001)).unwrap();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0002)).unwrap();
    fx.gatt.read(fx.conn_id, ReadType::ByHandle(0x0003)).unwrap();
    assert_eq!(
        fx.bearer.take_sent(),
        vec![
            (ATT, vec![ATT_READ_REQ, 0x01, 0x00]),
            (EATT, vec![ATT_READ_REQ, 0x02, 0x00]),
        ]
    );

    fx.gatt.on_bearer_data(EATT, &[ATT_READ_RSP, 0x02]);
    fx.respond(&[ATT_READ_RSP, 0x01]);
    assert_eq!(
        fx.bearer.take_sent(),
        vec![(ATT, vec![ATT_READ_REQ, 0x03, 0x00])]
    );

    // losing EATT leaves the link up
    fx.gatt.on_bearer_disconnected(EATT);
    assert!(fx.gatt.conn_id(fx.conn_id.gatt_if(), &peer()).is_some());
}

#[test]
fn test_read_multiple_variable() {
    let mut fx = Fixture::new();
    assert_eq!(
        fx.gatt
            .read(fx.conn_id, ReadType::MultipleVariable(vec![0x0003])),
        Err(GattError::InvalidParameter("read multiple needs two handles"))
    );

    fx.gatt
        .read(fx.conn_id, ReadType::MultipleVariable(vec![0x0003, 0x0005]))
        .unwrap();
    assert_eq!(
        fx.sent(),
        vec![vec![ATT_READ_MULTIPLE_VARIABLE_REQ, 0x03, 0x00, 0x05, 0x00]]
    );
    fx.respond(&[ATT_READ_MULTIPLE_VARIABLE_RSP, 0x01, 0x00, 0xAA, 0x02, 0x00, 0xBB, 0xCC]);
    assert_eq!(
        fx.completions(),
        vec![(
            GattOperation::Read,
            GattStatus::Success,
            OperationData::Values(vec![vec![0xAA], vec![0xBB, 0xCC]])
        )]
    );
}

#[test]
fn test_cccd_registration_writes_descriptor() {
    let mut fx = Fixture::new();
    fx.gatt
        .register_for_notifications(fx.conn_id, 0x0021, true)
        .unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_WRITE_REQ, 0x21, 0x00, 0x02, 0x00]]);
    fx.respond(&[ATT_WRITE_RSP]);
    fx.gatt.unregister_for_notifications(fx.conn_id, 0x0021).unwrap();
    assert_eq!(fx.sent(), vec![vec![ATT_WRITE_REQ, 0x21, 0x00, 0x00, 0x00]]);
}

#[test]
fn test_api_edge_validation() {
    let mut fx = Fixture::new();
    assert_eq!(
        fx.gatt.read(fx.conn_id, ReadType::ByHandle(0)),
        Err(GattError::InvalidHandle(0))
    );
    let stranger = ConnId::new(GattIf(9), 0);
    assert_eq!(
        fx.gatt.read(stranger, ReadType::ByHandle(1)),
        Err(GattError::UnknownApp(GattIf(9)))
    );
    let no_link = ConnId::new(fx.conn_id.gatt_if(), 3);
    assert_eq!(
        fx.gatt.read(no_link, ReadType::ByHandle(1)),
        Err(GattError::NotConnected(no_link))
    );
    assert_eq!(
        fx.gatt
            .discover(fx.conn_id, DiscoveryType::Descriptors, 9, 3),
        Err(GattError::InvalidParameter("start handle after end handle"))
    );
}
