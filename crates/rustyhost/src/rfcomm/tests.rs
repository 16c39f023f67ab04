use super::constants::*;
use super::*;
use crate::bearer::{BearerDescriptor, BearerId, SendStatus, RFCOMM_PSM};
use crate::gap::{BdAddr, Transport};
use crate::testing::RecordingBearer;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn peer_addr() -> BdAddr {
    BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
}

/// Builds frames the way the remote side would send them
struct Peer {
    initiator: bool,
}

impl Peer {
    fn sabme(&self, dlci: u8) -> Vec<u8> {
        RfcommFrame::sabme(dlci, self.initiator).serialize()
    }

    fn ua(&self, dlci: u8) -> Vec<u8> {
        RfcommFrame::ua(dlci, !self.initiator).serialize()
    }

    fn disc(&self, dlci: u8) -> Vec<u8> {
        RfcommFrame::disc(dlci, self.initiator).serialize()
    }

    fn mux(&self, frame: MuxFrame) -> Vec<u8> {
        RfcommFrame::uih(RFCOMM_MX_DLCI, self.initiator, frame.serialize(), None).serialize()
    }

    fn data(&self, dlci: u8, data: &[u8], credits: Option<u8>) -> Vec<u8> {
        RfcommFrame::uih(dlci, self.initiator, data.to_vec(), credits).serialize()
    }
}

#[derive(Default, Clone)]
struct Recorder {
    statuses: Arc<Mutex<Vec<PortStatus>>>,
    events: Arc<Mutex<Vec<PortEvents>>>,
}

impl Recorder {
    fn attach(&self, params: &mut OpenPortParams) {
        let statuses = self.statuses.clone();
        let events = self.events.clone();
        params.mgmt_callback = Some(Arc::new(Mutex::new(move |_: PortHandle, status| {
            statuses.lock().unwrap().push(status);
        })));
        params.event_callback = Some(Arc::new(Mutex::new(move |_: PortHandle, ev| {
            events.lock().unwrap().push(ev);
        })));
    }

    fn statuses(&self) -> Vec<PortStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn all_events(&self) -> PortEvents {
        self.events
            .lock()
            .unwrap()
            .iter()
            .fold(PortEvents::empty(), |acc, ev| acc | *ev)
    }

    fn clear(&self) {
        self.statuses.lock().unwrap().clear();
        self.events.lock().unwrap().clear();
    }
}

fn sent_frames(bearer: &RecordingBearer, credit_flow: bool) -> Vec<RfcommFrame> {
    bearer
        .take_payloads()
        .iter()
        .map(|bytes| RfcommFrame::parse(bytes, credit_flow).unwrap())
        .collect()
}

fn mux_commands(frames: &[RfcommFrame]) -> Vec<MuxFrame> {
    frames
        .iter()
        .filter(|f| f.dlci == RFCOMM_MX_DLCI && f.frame_type == FrameType::Uih)
        .map(|f| MuxFrame::parse(&f.info).unwrap())
        .collect()
}

fn inbound_bearer(id: u32) -> BearerDescriptor {
    BearerDescriptor::dynamic(
        BearerId(id),
        peer_addr(),
        Transport::BrEdr,
        RFCOMM_PSM,
        0x0040,
        0x0041,
        1691,
    )
}

/// Server on SCN 1 with the peer's multiplexer already up
fn server_with_mux(config: RfcommConfig, mtu: u16) -> (RfcommManager, Arc<RecordingBearer>, PortHandle, Recorder) {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(config, bearer.clone());
    let recorder = Recorder::default();
    let mut params = OpenPortParams::server(1, UUID_SERVCLASS_SERIAL_PORT);
    params.mtu = mtu;
    recorder.attach(&mut params);
    let handle = mgr.open_port(params).unwrap();

    let peer = Peer { initiator: true };
    mgr.on_bearer_connected(&inbound_bearer(7));
    mgr.on_bearer_data(BearerId(7), &peer.sabme(0));
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::Connected));
    (mgr, bearer, handle, recorder)
}

/// Client port on SCN 1 fully opened, credit flow with `credits` granted
fn open_client(credits: u8, peer_mtu: u16) -> (RfcommManager, Arc<RecordingBearer>, PortHandle, Recorder) {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer.clone());
    let recorder = Recorder::default();
    let mut params = OpenPortParams::client(peer_addr(), 1, UUID_SERVCLASS_SERIAL_PORT);
    recorder.attach(&mut params);
    let handle = mgr.open_port(params).unwrap();

    let id = BearerId(101);
    let peer = Peer { initiator: false };
    mgr.on_bearer_connected(&inbound_bearer(101));
    mgr.on_bearer_data(id, &peer.ua(0));
    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::response(MuxCommand::Pn(PnParams {
            dlci: 2,
            cl: RFCOMM_PN_CONV_LAYER_CBFC_R,
            priority: 0,
            t1: 0,
            mtu: peer_mtu,
            n2: 0,
            k: credits,
        }))),
    );
    mgr.on_bearer_data(id, &peer.ua(2));
    let signals = (ModemSignals::DTR_DSR | ModemSignals::RTS_CTS).to_msc(false);
    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::command(MuxCommand::Msc {
            dlci: 2,
            signals,
            break_duration: None,
        })),
    );
    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::response(MuxCommand::Msc {
            dlci: 2,
            signals,
            break_duration: None,
        })),
    );
    (mgr, bearer, handle, recorder)
}

#[test]
fn test_fcs_vectors() {
    assert_eq!(RfcommFrame::sabme(0, true).serialize(), vec![0x03, 0x3F, 0x01, 0x1C]);
    assert_eq!(RfcommFrame::ua(0, true).serialize(), vec![0x03, 0x73, 0x01, 0xD7]);
    assert!(check_fcs(&[0x03, 0x3F, 0x01], 0x1C));
    assert!(!check_fcs(&[0x03, 0x3F, 0x01], 0x1D));
}

#[test]
fn test_frame_parse_rejects_bad_fcs() {
    let mut bytes = RfcommFrame::disc(4, true).serialize();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    assert_eq!(RfcommFrame::parse(&bytes, false), Err(FrameError::BadFcs));
}

#[test]
fn test_uih_credit_octet_only_under_credit_flow() {
    let bytes = RfcommFrame::uih(2, true, vec![1, 2, 3], Some(4)).serialize();
    let frame = RfcommFrame::parse(&bytes, true).unwrap();
    assert_eq!(frame.credits, Some(4));
    assert_eq!(frame.info, vec![1, 2, 3]);

    // Without credit flow the extra octet makes the length disagree
    assert!(matches!(
        RfcommFrame::parse(&bytes, false),
        Err(FrameError::BadLength { .. })
    ));
}

#[test]
fn test_server_pn_negotiates_credit_flow() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut mgr, bearer, handle, recorder) = server_with_mux(RfcommConfig::default(), 1000);
    let peer = Peer { initiator: true };

    let frames = sent_frames(&bearer, false);
    assert_eq!(frames, vec![RfcommFrame::ua(0, true)]);

    mgr.on_bearer_data(
        BearerId(7),
        &peer.mux(MuxFrame::command(MuxCommand::Pn(PnParams {
            dlci: 3,
            cl: RFCOMM_PN_CONV_LAYER_CBFC_I,
            priority: 0,
            t1: 0,
            mtu: 500,
            n2: 0,
            k: 5,
        }))),
    );

    let commands = mux_commands(&sent_frames(&bearer, false));
    assert_eq!(
        commands,
        vec![MuxFrame::response(MuxCommand::Pn(PnParams {
            dlci: 3,
            cl: RFCOMM_PN_CONV_LAYER_CBFC_R,
            priority: 0,
            t1: 0,
            mtu: 500,
            n2: 0,
            k: 7,
        }))]
    );
    assert_eq!(mgr.mux_flow(&peer_addr()), Some(FlowMode::Credit));
    let info = mgr.port_info(handle).unwrap();
    assert_eq!(info.state, PortState::ParamNeg);
    assert_eq!(info.peer_mtu, 500);
    assert_eq!(info.credit_tx, 5);
    assert_eq!(info.credit_rx, 7);

    mgr.on_bearer_data(BearerId(7), &peer.sabme(3));
    let frames = sent_frames(&bearer, true);
    assert_eq!(frames[0], RfcommFrame::ua(3, true));
    assert_eq!(recorder.statuses(), vec![PortStatus::Success]);
    assert_eq!(mgr.remote_mtu(handle), Ok(500));
    assert_eq!(mgr.remote_addr(handle), Ok(peer_addr()));
}

#[test]
fn test_pn_mtu_is_clamped() {
    let (mut mgr, _bearer, handle, _recorder) = server_with_mux(RfcommConfig::default(), 1000);
    let peer = Peer { initiator: true };
    mgr.on_bearer_data(
        BearerId(7),
        &peer.mux(MuxFrame::command(MuxCommand::Pn(PnParams {
            dlci: 2,
            cl: RFCOMM_PN_CONV_LAYER_TYPE_1,
            priority: 0,
            t1: 0,
            mtu: 5,
            n2: 0,
            k: 0,
        }))),
    );
    assert_eq!(mgr.port_info(handle).unwrap().peer_mtu, RFCOMM_MIN_MTU);
    assert_eq!(mgr.mux_flow(&peer_addr()), Some(FlowMode::Ts710));
}

#[test]
fn test_rx_overflow_drops_and_reports_rls() {
    let config = RfcommConfig {
        rx_critical_bytes: 10000,
        ..RfcommConfig::default()
    };
    let (mut mgr, bearer, handle, recorder) = server_with_mux(config, 1000);
    let peer = Peer { initiator: true };
    let id = BearerId(7);

    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::command(MuxCommand::Pn(PnParams {
            dlci: 2,
            cl: RFCOMM_PN_CONV_LAYER_TYPE_1,
            priority: 0,
            t1: 0,
            mtu: 1000,
            n2: 0,
            k: 0,
        }))),
    );
    mgr.on_bearer_data(id, &peer.sabme(2));
    bearer.take_sent();

    for _ in 0..11 {
        mgr.on_bearer_data(id, &peer.data(2, &[0x55; 1000], None));
    }

    assert_eq!(mgr.rx_queue_count(handle), Ok((10000, 10)));
    let commands = mux_commands(&sent_frames(&bearer, false));
    assert!(commands.contains(&MuxFrame::command(MuxCommand::Rls {
        dlci: 2,
        status: RLS_ERROR | RLS_OVERRUN,
    })));
    // Crossing the high watermark asked the peer to stop via MSC
    assert!(commands.iter().any(|c| matches!(
        c.command,
        MuxCommand::Msc { signals, .. } if signals & MSC_FC != 0
    )));
    assert!(recorder.all_events().contains(PortEvents::OVERRUN | PortEvents::ERR));
    let (_, line) = mgr.modem_status(handle).unwrap();
    assert!(line.contains(LineStatus::OVERRUN));

    // Draining the queue lifts flow control again
    let mut buf = vec![0u8; 10000];
    assert_eq!(mgr.read_data(handle, &mut buf), Ok(10000));
    assert!(buf.iter().all(|b| *b == 0x55));
    assert!(!mgr.port_info(handle).unwrap().user_fc);
    let commands = mux_commands(&sent_frames(&bearer, false));
    assert!(commands.iter().any(|c| matches!(
        c.command,
        MuxCommand::Msc { signals, .. } if signals & MSC_FC == 0
    )));
}

#[test]
fn test_partial_reads() {
    let (mut mgr, _bearer, handle, _recorder) = open_client(7, 100);
    let peer = Peer { initiator: false };
    mgr.on_bearer_data(BearerId(101), &peer.data(2, b"hello world", None));

    let mut buf = [0u8; 5];
    assert_eq!(mgr.read_data(handle, &mut buf), Ok(5));
    assert_eq!(&buf, b"hello");
    assert_eq!(mgr.rx_queue_count(handle), Ok((6, 1)));

    let mut rest = [0u8; 32];
    assert_eq!(mgr.read_data(handle, &mut rest), Ok(6));
    assert_eq!(&rest[..6], b" world");
    assert_eq!(mgr.rx_queue_count(handle), Ok((0, 0)));
}

#[test]
fn test_client_open_sequence() {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer.clone());
    let recorder = Recorder::default();
    let mut params = OpenPortParams::client(peer_addr(), 1, UUID_SERVCLASS_SERIAL_PORT);
    recorder.attach(&mut params);
    let handle = mgr.open_port(params).unwrap();

    assert_eq!(bearer.connects(), vec![(peer_addr(), RFCOMM_PSM)]);
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::WaitConnCnf));

    let id = BearerId(101);
    let peer = Peer { initiator: false };
    mgr.on_bearer_connected(&inbound_bearer(101));
    assert_eq!(sent_frames(&bearer, false), vec![RfcommFrame::sabme(0, true)]);

    mgr.on_bearer_data(id, &peer.ua(0));
    let commands = mux_commands(&sent_frames(&bearer, false));
    match &commands[..] {
        [MuxFrame {
            is_command: true,
            command: MuxCommand::Pn(pn),
        }] => {
            assert_eq!(pn.dlci, 2);
            assert_eq!(pn.cl, RFCOMM_PN_CONV_LAYER_CBFC_I);
            assert_eq!(pn.k, RFCOMM_K_MAX);
        }
        other => panic!("expected a PN command, got {:?}", other),
    }
    assert_eq!(mgr.port_info(handle).unwrap().state, PortState::ParamNeg);

    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::response(MuxCommand::Pn(PnParams {
            dlci: 2,
            cl: RFCOMM_PN_CONV_LAYER_CBFC_R,
            priority: 0,
            t1: 0,
            mtu: 100,
            n2: 0,
            k: 4,
        }))),
    );
    assert_eq!(sent_frames(&bearer, true), vec![RfcommFrame::sabme(2, true)]);

    mgr.on_bearer_data(id, &peer.ua(2));
    assert_eq!(recorder.statuses(), vec![PortStatus::Success]);
    let commands = mux_commands(&sent_frames(&bearer, true));
    assert!(matches!(
        commands[..],
        [MuxFrame {
            is_command: true,
            command: MuxCommand::Msc { dlci: 2, .. }
        }]
    ));
    assert!(!recorder.all_events().contains(PortEvents::CONNECTED));

    let signals = ModemSignals::DTR_DSR.to_msc(false);
    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::command(MuxCommand::Msc {
            dlci: 2,
            signals,
            break_duration: None,
        })),
    );
    mgr.on_bearer_data(
        id,
        &peer.mux(MuxFrame::response(MuxCommand::Msc {
            dlci: 2,
            signals,
            break_duration: None,
        })),
    );
    assert!(recorder.all_events().contains(PortEvents::CONNECTED | PortEvents::DSR));

    let info = mgr.port_info(handle).unwrap();
    assert_eq!(info.state, PortState::Opened);
    assert_eq!(info.peer_mtu, 100);
    assert_eq!(info.credit_tx, 4);
    assert_eq!(info.peer_signals, ModemSignals::DTR_DSR);
    assert_eq!(mgr.l2cap_cid(handle), Ok(0x0040));
}

#[test]
fn test_client_port_queued_on_responder_mux_sends_pn() {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer.clone());
    let recorder = Recorder::default();

    // Peer raised the L2CAP channel but has not opened the multiplexer yet
    mgr.on_bearer_connected(&inbound_bearer(9));
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::Configured));

    let mut params = OpenPortParams::client(peer_addr(), 2, UUID_SERVCLASS_SERIAL_PORT);
    recorder.attach(&mut params);
    let handle = mgr.open_port(params).unwrap();
    assert_eq!(mgr.port_info(handle).unwrap().state, PortState::Opening);
    assert!(bearer.take_payloads().is_empty());

    let peer = Peer { initiator: true };
    mgr.on_bearer_data(BearerId(9), &peer.sabme(0));
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::Connected));

    let frames = sent_frames(&bearer, false);
    assert_eq!(frames[0].frame_type, FrameType::Ua);
    match &mux_commands(&frames)[..] {
        [MuxFrame {
            is_command: true,
            command: MuxCommand::Pn(pn),
        }] => assert_eq!(pn.dlci, 5),
        other => panic!("expected a PN command, got {:?}", other),
    }
    assert_eq!(mgr.port_info(handle).unwrap().state, PortState::ParamNeg);
    assert!(recorder.statuses().is_empty());
}

#[test]
fn test_write_segments_and_consumes_credits() {
    let (mut mgr, bearer, handle, recorder) = open_client(2, 100);
    bearer.take_sent();
    recorder.clear();

    assert_eq!(mgr.write_data(handle, &[0xAB; 250]), Ok(250));
    let frames = sent_frames(&bearer, true);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.dlci == 2 && f.info.len() == 100));
    let info = mgr.port_info(handle).unwrap();
    assert_eq!(info.credit_tx, 0);
    assert!(info.peer_fc);
    assert_eq!(info.tx_queue_size, 50);
    assert!(!recorder.all_events().contains(PortEvents::TXEMPTY));

    let peer = Peer { initiator: false };
    mgr.on_bearer_data(BearerId(101), &peer.data(2, &[], Some(3)));
    let frames = sent_frames(&bearer, true);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].info.len(), 50);
    assert_eq!(mgr.port_info(handle).unwrap().credit_tx, 2);
    assert!(recorder.all_events().contains(PortEvents::TXEMPTY));
}

#[test]
fn test_receive_replenishes_credits() {
    let (mut mgr, bearer, handle, _recorder) = open_client(7, 100);
    bearer.take_sent();
    let peer = Peer { initiator: false };

    for _ in 0..5 {
        mgr.on_bearer_data(BearerId(101), &peer.data(2, &[1; 10], None));
    }

    let frames = sent_frames(&bearer, true);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].credits, Some(5));
    assert!(frames[0].info.is_empty());
    assert_eq!(mgr.port_info(handle).unwrap().credit_rx, 7);
}

#[test]
fn test_write_requires_open_port_and_bounds_queue() {
    let config = RfcommConfig::default();
    let (mut mgr, _bearer, server, _recorder) = server_with_mux(config, 0);
    assert_eq!(mgr.write_data(server, b"x"), Err(PortError::NotOpened));
    assert_eq!(
        mgr.write_data(PortHandle(99), b"x"),
        Err(PortError::BadHandle(99))
    );

    let (mut mgr, _bearer, handle, _recorder) = open_client(0, 100);
    let limit = mgr.config().tx_critical_bytes;
    assert_eq!(mgr.write_data(handle, &vec![0; limit]), Ok(limit));
    assert_eq!(mgr.write_data(handle, b"more"), Err(PortError::TxQueueFull));
}

#[test]
fn test_close_port_then_mux_released_after_inactivity() {
    let (mut mgr, bearer, handle, recorder) = open_client(7, 100);
    bearer.take_sent();
    recorder.clear();
    let peer = Peer { initiator: false };

    mgr.close_port(handle).unwrap();
    assert_eq!(sent_frames(&bearer, true), vec![RfcommFrame::disc(2, true)]);
    assert_eq!(mgr.port_info(handle).unwrap().state, PortState::Closing);

    mgr.on_bearer_data(BearerId(101), &peer.ua(2));
    assert_eq!(recorder.statuses(), vec![PortStatus::Closed]);
    assert!(mgr.port_info(handle).is_none());
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::Connected));

    mgr.process_timeouts(Instant::now() + Duration::from_secs(3));
    assert_eq!(sent_frames(&bearer, true), vec![RfcommFrame::disc(0, true)]);
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::DiscWaitUa));

    mgr.on_bearer_data(BearerId(101), &peer.ua(0));
    assert_eq!(bearer.disconnects(), vec![BearerId(101)]);
    assert_eq!(mgr.mux_state(&peer_addr()), None);
}

#[test]
fn test_peer_disc_returns_server_to_listening() {
    let (mut mgr, bearer, handle, recorder) = server_with_mux(RfcommConfig::default(), 0);
    let peer = Peer { initiator: true };
    mgr.on_bearer_data(BearerId(7), &peer.sabme(2));
    assert_eq!(mgr.port_info(handle).unwrap().state, PortState::Opened);
    bearer.take_sent();

    mgr.on_bearer_data(BearerId(7), &peer.disc(2));
    assert_eq!(sent_frames(&bearer, true), vec![RfcommFrame::ua(2, true)]);
    assert_eq!(
        recorder.statuses(),
        vec![PortStatus::Success, PortStatus::Closed]
    );
    let info = mgr.port_info(handle).unwrap();
    assert_eq!(info.state, PortState::Opening);
    assert_eq!(info.peer, None);

    // A new connection on the same channel is accepted again
    mgr.on_bearer_data(BearerId(7), &peer.sabme(2));
    assert_eq!(mgr.port_info(handle).unwrap().state, PortState::Opened);
}

#[test]
fn test_unknown_dlci_gets_dm() {
    let (mut mgr, bearer, _handle, _recorder) = server_with_mux(RfcommConfig::default(), 0);
    let peer = Peer { initiator: true };
    bearer.take_sent();

    mgr.on_bearer_data(BearerId(7), &peer.sabme(10));
    assert_eq!(sent_frames(&bearer, false), vec![RfcommFrame::dm(10, true)]);
}

#[test]
fn test_sabme_timeout_fails_with_peer_timeout() {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer.clone());
    let recorder = Recorder::default();
    let mut params = OpenPortParams::client(peer_addr(), 3, UUID_SERVCLASS_SERIAL_PORT);
    recorder.attach(&mut params);
    let handle = mgr.open_port(params).unwrap();
    mgr.on_bearer_connected(&inbound_bearer(101));
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::SabmeWaitUa));

    mgr.process_timeouts(Instant::now() + Duration::from_secs(10));
    assert_eq!(mgr.mux_state(&peer_addr()), Some(MuxState::SabmeWaitUa));

    mgr.process_timeouts(Instant::now() + Duration::from_secs(21));
    assert_eq!(recorder.statuses(), vec![PortStatus::PeerTimeout]);
    assert_eq!(bearer.disconnects(), vec![BearerId(101)]);
    assert!(mgr.port_info(handle).is_none());
    assert_eq!(mgr.mux_state(&peer_addr()), None);
}

#[test]
fn test_connect_refused_reports_start_failed() {
    let bearer = Arc::new(RecordingBearer::new());
    bearer.refuse_connect();
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer.clone());
    let recorder = Recorder::default();
    let mut params = OpenPortParams::client(peer_addr(), 3, UUID_SERVCLASS_SERIAL_PORT);
    recorder.attach(&mut params);

    assert!(matches!(mgr.open_port(params), Err(PortError::StartFailed(_))));
    assert_eq!(recorder.statuses(), vec![PortStatus::StartFailed]);
    assert_eq!(mgr.mux_state(&peer_addr()), None);
}

#[test]
fn test_bearer_loss_clears_peer_signals() {
    let (mut mgr, _bearer, handle, recorder) = open_client(7, 100);
    recorder.clear();

    mgr.on_bearer_disconnected(BearerId(101));
    assert_eq!(recorder.statuses(), vec![PortStatus::PeerConnectionFailed]);
    let events = recorder.all_events();
    assert!(events.contains(PortEvents::ERR | PortEvents::CTS | PortEvents::DSR | PortEvents::CLOSED));
    assert!(mgr.port_info(handle).is_none());
    assert_eq!(mgr.mux_state(&peer_addr()), None);
}

#[test]
fn test_congestion_holds_frames_until_released() {
    let (mut mgr, bearer, handle, recorder) = open_client(7, 100);
    bearer.take_sent();
    recorder.clear();

    bearer.push_status(SendStatus::Congested);
    mgr.write_data(handle, b"queued").unwrap();
    assert!(bearer.take_sent().is_empty());
    assert!(recorder.all_events().contains(PortEvents::CONGESTED));

    mgr.on_bearer_congestion(BearerId(101), false);
    let frames = sent_frames(&bearer, true);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].info, b"queued".to_vec());
    assert!(recorder.all_events().contains(PortEvents::UNCONGESTED));
}

#[test]
fn test_mux_test_echo_and_unknown_command() {
    let (mut mgr, bearer, _handle, _recorder) = server_with_mux(RfcommConfig::default(), 0);
    let peer = Peer { initiator: true };
    bearer.take_sent();

    mgr.on_bearer_data(
        BearerId(7),
        &peer.mux(MuxFrame::command(MuxCommand::Test(vec![1, 2, 3]))),
    );
    mgr.on_bearer_data(BearerId(7), &peer.mux(MuxFrame::command(MuxCommand::Unknown(0xFF))));

    let commands = mux_commands(&sent_frames(&bearer, false));
    assert_eq!(commands[0], MuxFrame::response(MuxCommand::Test(vec![1, 2, 3])));
    assert!(matches!(
        commands[1],
        MuxFrame {
            is_command: false,
            command: MuxCommand::Nsc { .. }
        }
    ));
}

#[test]
fn test_fcoff_pauses_all_ports() {
    let (mut mgr, bearer, handle, _recorder) = open_client(7, 100);
    let peer = Peer { initiator: false };
    mgr.on_bearer_data(BearerId(101), &peer.mux(MuxFrame::command(MuxCommand::Fcoff)));
    bearer.take_sent();

    mgr.write_data(handle, b"held").unwrap();
    assert!(bearer.take_sent().is_empty());

    mgr.on_bearer_data(BearerId(101), &peer.mux(MuxFrame::command(MuxCommand::Fcon)));
    let frames = sent_frames(&bearer, true);
    assert!(frames.iter().any(|f| f.dlci == 2 && f.info == b"held".to_vec()));
}

#[test]
fn test_rpn_query_returns_current_settings() {
    let (mut mgr, bearer, handle, _recorder) = open_client(7, 100);
    let peer = Peer { initiator: false };
    bearer.take_sent();

    mgr.on_bearer_data(
        BearerId(101),
        &peer.mux(MuxFrame::command(MuxCommand::Rpn {
            dlci: 2,
            settings: None,
        })),
    );
    let commands = mux_commands(&sent_frames(&bearer, true));
    let settings = mgr.port_settings(handle).unwrap();
    assert_eq!(
        commands,
        vec![MuxFrame::response(MuxCommand::Rpn {
            dlci: 2,
            settings: Some((settings, RPN_PM_MASK)),
        })]
    );
}

#[test]
fn test_allocate_scn_skips_servers() {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer);
    let first = mgr.allocate_scn().unwrap();
    mgr.open_port(OpenPortParams::server(first, UUID_SERVCLASS_SERIAL_PORT))
        .unwrap();
    let second = mgr.allocate_scn().unwrap();
    assert_ne!(first, second);
    assert!(second >= 1 && second <= RFCOMM_MAX_SCN);
}

#[test]
fn test_port_info_reports_open_parameters() {
    let bearer = Arc::new(RecordingBearer::new());
    let mut mgr = RfcommManager::new(RfcommConfig::default(), bearer);
    let mut params = OpenPortParams::server(4, UUID_SERVCLASS_SERIAL_PORT);
    params.security_flags = 0x0012;
    let handle = mgr.open_port(params).unwrap();

    let info = mgr.port_info(handle).unwrap();
    assert_eq!(info.security_flags, 0x0012);
    assert_eq!(info.psm, RFCOMM_PSM);
    assert!(info.is_server);
}
