//! End-to-end dispatcher tests: a fake server over the UDP control socket,
//! scripted ECUs on the far ends of the simulated buses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use canbadger_core::{CanBus, CanFrame, LogRecord, MemEeprom, MemStorage, SdCard, SimBus, bus_pair};
use canbadger_isotp::{IsoTpConfig, IsoTpLink};
use canbadger_net::{ActionKind, Device, Dispatcher, EthernetManager, Message, MessageKind};
use canbadger_settings::{Settings, StatusBit};
use pretty_assertions::assert_eq;

struct Harness {
    dispatcher: Dispatcher<SimBus, MemEeprom, MemStorage>,
    server: UdpSocket,
    device_addr: SocketAddr,
    can1_far: SimBus,
    can2_far: SimBus,
    _dir: tempfile::TempDir,
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sd = SdCard::new(dir.path());
    let (can1, can1_far) = bus_pair();
    let (can2, can2_far) = bus_pair();
    let device = Device::new(can1, can2, sd, MemEeprom::new());

    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let server_port = server.local_addr().unwrap().port();
    let manager =
        EthernetManager::with_ports(&device.settings.id, 0, localhost(server_port)).unwrap();
    let device_addr = localhost(manager.local_port());
    let mut dispatcher = Dispatcher::new(manager, device, MemStorage::new()).unwrap();

    // connect: the payload tells the device which port to send data to
    let mut payload = vec![0; 4];
    LittleEndian::write_u32(&mut payload, server_port as u32);
    let connect = Message {
        kind: MessageKind::Connect,
        action: ActionKind::NoType,
        data: payload,
    };
    server.send_to(&connect.encode(), device_addr).unwrap();
    for _ in 0..500 {
        dispatcher.poll().unwrap();
        if dispatcher.manager().is_connected() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(dispatcher.manager().is_connected());

    let mut harness = Harness {
        dispatcher,
        server,
        device_addr,
        can1_far,
        can2_far,
        _dir: dir,
    };
    let ack = harness.recv_message();
    assert_eq!(ack.kind, MessageKind::Ack);
    harness
}

impl Harness {
    fn send_action(&self, action: ActionKind, data: Vec<u8>) {
        let message = Message::action(action, data);
        self.server
            .send_to(&message.encode(), self.device_addr)
            .unwrap();
    }

    /// Pump the dispatcher until the queued datagrams are handled
    fn pump(&mut self) {
        for _ in 0..50 {
            self.dispatcher.poll().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Next control-plane message, skipping discovery beacons
    fn recv_message(&mut self) -> Message {
        let mut buf = vec![0; 4096];
        loop {
            let (received, _) = self.server.recv_from(&mut buf).unwrap();
            if let Ok(message) = Message::decode(&buf[..received]) {
                return message;
            }
        }
    }
}

#[test]
fn test_settings_request_returns_blob() {
    let mut harness = harness();
    harness.send_action(ActionKind::Settings, Vec::new());
    harness.pump();
    let reply = harness.recv_message();
    assert_eq!(reply.kind, MessageKind::Data);
    assert_eq!(reply.action, ActionKind::Settings);
    let settings = Settings::from_blob(&reply.data).unwrap();
    assert_eq!(&settings, &harness.dispatcher.device().settings);
}

#[test]
fn test_settings_update_applies_and_persists() {
    let mut harness = harness();
    let mut settings = harness.dispatcher.device().settings.clone();
    settings.id = String::from("renamed");
    settings.can2_speed = 125_000;
    settings.set(StatusBit::EthernetEnabled, true);
    harness.send_action(ActionKind::Settings, settings.to_blob());
    harness.pump();
    assert_eq!(harness.dispatcher.device().settings, settings);
    // the new name hits the SD settings file too
    let text = harness
        .dispatcher
        .device()
        .sd
        .read_all("/canbadger_settings.txt")
        .unwrap();
    assert!(String::from_utf8_lossy(&text).contains("id: renamed"));
}

#[test]
fn test_replay_injects_one_frame() {
    let mut harness = harness();
    let mut data = vec![1, 0, 0, 0, 0];
    LittleEndian::write_u32(&mut data[1..5], 0x123);
    data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    harness.send_action(ActionKind::StartReplay, data);
    harness.pump();
    let frame = harness.can1_far.try_recv().unwrap().unwrap();
    assert_eq!(frame.id, 0x123);
    assert_eq!(frame.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);
}

#[test]
fn test_download_file_in_paced_chunks() {
    let mut harness = harness();
    let content: Vec<u8> = (0..450u32).map(|i| i as u8).collect();
    harness
        .dispatcher
        .device()
        .sd
        .write_all("/logs/dump.bin", &content)
        .unwrap();

    let mut data = b"/logs/dump.bin".to_vec();
    data.push(0);
    harness.send_action(ActionKind::DownloadFile, data);
    harness.pump();

    let mut reassembled = Vec::new();
    for expected_packet in 0..3u32 {
        let chunk = harness.recv_message();
        assert_eq!(chunk.kind, MessageKind::Data);
        assert_eq!(BigEndian::read_u32(&chunk.data[0..4]), expected_packet);
        let length = BigEndian::read_u16(&chunk.data[4..6]) as usize;
        assert_eq!(chunk.data.len(), 6 + length);
        reassembled.extend_from_slice(&chunk.data[6..]);
    }
    assert_eq!(reassembled, content);
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);
}

#[test]
fn test_missing_download_is_nacked() {
    let mut harness = harness();
    harness.send_action(ActionKind::DownloadFile, b"/nope.bin\0".to_vec());
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Nack);
}

#[test]
fn test_upload_acks_in_order_packets() {
    let mut harness = harness();
    harness.send_action(ActionKind::UpdateSd, b"/uploads/new.bin\0".to_vec());
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);

    for (packet, chunk) in [b"hello ".as_slice(), b"world".as_slice()]
        .into_iter()
        .enumerate()
    {
        let mut data = vec![0; 5];
        LittleEndian::write_u32(&mut data[0..4], packet as u32);
        data[4] = chunk.len() as u8;
        data.extend_from_slice(chunk);
        harness.send_action(ActionKind::UpdateSd, data);
        harness.pump();
        assert_eq!(harness.recv_message().kind, MessageKind::Ack);
    }
    let written = harness
        .dispatcher
        .device()
        .sd
        .read_all("/uploads/new.bin")
        .unwrap();
    assert_eq!(written, b"hello world");

    // an out-of-order packet aborts the transfer
    let mut data = vec![0; 5];
    LittleEndian::write_u32(&mut data[0..4], 9);
    harness.send_action(ActionKind::UpdateSd, data);
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Nack);
}

#[test]
fn test_sd_tree_upload() {
    let mut harness = harness();
    let sd = &harness.dispatcher.device().sd;
    sd.write_all("/root.txt", b"x").unwrap();
    sd.make_dir("/LOGS").unwrap();
    sd.write_all("/LOGS/a.log", b"y").unwrap();

    harness.send_action(ActionKind::UpdateSd, Vec::new());
    harness.pump();

    let root = harness.recv_message();
    assert_eq!(root.kind, MessageKind::Data);
    // the restore at startup wrote the settings file alongside our fixtures
    let mut expected = b"/\0".to_vec();
    expected.push(0xF0);
    expected.extend_from_slice(b"LOGS\0");
    expected.push(0x0F);
    expected.extend_from_slice(b"canbadger_settings.txt\0");
    expected.push(0x0F);
    expected.extend_from_slice(b"root.txt\0");
    assert_eq!(root.data, expected);

    let logs = harness.recv_message();
    let mut expected = b"/LOGS\0".to_vec();
    expected.push(0x0F);
    expected.extend_from_slice(b"a.log\0");
    assert_eq!(logs.data, expected);

    let terminator = harness.recv_message();
    assert_eq!(terminator.data, vec![0]);
}

#[test]
fn test_uds_session_and_request_over_wire() {
    let mut harness = harness();
    let ecu_bus = harness.can1_far.clone();
    std::thread::scope(|scope| {
        scope.spawn(move || {
            let mut ecu = IsoTpLink::new(
                ecu_bus,
                IsoTpConfig {
                    local_id: 0x7E8,
                    remote_id: 0x7E0,
                    response_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
            );
            let request = ecu.recv().unwrap();
            assert_eq!(request, vec![0x10, 0x03]);
            ecu.send(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]).unwrap();

            let request = ecu.recv().unwrap();
            assert_eq!(request, vec![0x22, 0xF1, 0x90]);
            let mut reply = vec![0x62, 0xF1, 0x90];
            reply.extend_from_slice(b"WVWZZZ1JZ3W386752");
            ecu.send(&reply).unwrap();
        });

        // START_UDS: interface 1, 0x7E0 -> 0x7E8, standard frames, no
        // padding, normal addressing, extended diagnostic session
        let mut data = vec![0; 14];
        data[0] = 1;
        LittleEndian::write_u32(&mut data[1..5], 0x7E0);
        LittleEndian::write_u32(&mut data[5..9], 0x7E8);
        data[13] = 0x03;
        harness.send_action(ActionKind::StartUds, data);
        harness.pump();
        let reply = harness.recv_message();
        assert_eq!(reply.kind, MessageKind::Data);
        assert_eq!(LittleEndian::read_u16(&reply.data[0..2]), 0x10);
        assert_eq!(reply.data[2], 1, "session start should succeed");
        assert_eq!(&reply.data[7..9], &[0x50, 0x03]);

        // UDS: ReadDataByIdentifier 0xF190
        let mut data = vec![0; 6];
        LittleEndian::write_u16(&mut data[0..2], 0x22);
        LittleEndian::write_u32(&mut data[2..6], 2);
        data.extend_from_slice(&[0xF1, 0x90]);
        harness.send_action(ActionKind::Uds, data);
        harness.pump();
        let reply = harness.recv_message();
        assert_eq!(reply.data[2], 1);
        assert_eq!(&reply.data[7..10], &[0x62, 0xF1, 0x90]);
        assert_eq!(&reply.data[10..], b"WVWZZZ1JZ3W386752");
    });
}

#[test]
fn test_uds_without_session_is_nacked() {
    let mut harness = harness();
    let mut data = vec![0; 6];
    LittleEndian::write_u16(&mut data[0..2], 0x22);
    harness.send_action(ActionKind::Uds, data);
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Nack);
}

#[test]
fn test_mitm_transforms_until_stopped() {
    let mut harness = harness();

    harness.send_action(ActionKind::ReceiveRules, Vec::new());
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);

    // swap byte 0 to 0xFF when it is 0x00 on ID 0x100
    let rule = b"0x0101,0x100,0,0,0,0,0,0,0,0,0x0101,0xFF,0,0,0,0,0,0,0".to_vec();
    harness.send_action(ActionKind::AddRule, rule);
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);

    // one frame to transform, then engage; STOP is already queued behind it
    harness
        .can1_far
        .try_send(&CanFrame::new(0x100, &[0x00, 0x11, 0x22]))
        .unwrap();
    harness.send_action(ActionKind::Mitm, Vec::new());
    harness.send_action(ActionKind::StopCurrentAction, Vec::new());
    harness.pump();

    let out = harness.can2_far.try_recv().unwrap().unwrap();
    assert_eq!(out.data(), &[0xFF, 0x11, 0x22]);
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);
    assert!(!harness.dispatcher.device().is_running());
}

#[test]
fn test_hijack_over_the_wire() {
    let mut harness = harness();
    let tester_far = harness.can2_far.clone();
    let ecu_far = harness.can1_far.clone();

    // HIJACK: tester 0x7E0, ECU 0x7E8, any level, any session
    let mut data = vec![0; 12];
    LittleEndian::write_u32(&mut data[0..4], 0x7E0);
    LittleEndian::write_u32(&mut data[4..8], 0x7E8);
    harness.send_action(ActionKind::Hijack, data);

    std::thread::scope(|scope| {
        scope.spawn(move || {
            let pace = Duration::from_millis(20);
            std::thread::sleep(pace);
            tester_far
                .try_send(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x03]))
                .unwrap();
            std::thread::sleep(pace);
            tester_far
                .try_send(&CanFrame::new(0x7E0, &[0x02, 0x27, 0x01]))
                .unwrap();
            std::thread::sleep(pace);
            ecu_far
                .try_send(&CanFrame::new(0x7E8, &[0x06, 0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]))
                .unwrap();
            std::thread::sleep(pace);
            tester_far
                .try_send(&CanFrame::new(0x7E0, &[0x06, 0x27, 0x02, 0x01, 0x02, 0x03, 0x04]))
                .unwrap();
            std::thread::sleep(pace);
            ecu_far
                .try_send(&CanFrame::new(0x7E8, &[0x02, 0x67, 0x02]))
                .unwrap();
        });
        // the poll enters the hijack loop and returns once captured
        harness.pump();
    });

    let reply = harness.recv_message();
    assert_eq!(reply.kind, MessageKind::Data);
    assert_eq!(reply.data[0], 1, "hijack should report success");
    assert_eq!(LittleEndian::read_u16(&reply.data[1..3]), 0x03);
}

#[test]
fn test_logging_streams_records() {
    let mut harness = harness();
    harness
        .can1_far
        .try_send(&CanFrame::new(0x7DF, &[0x02, 0x01, 0x0D]))
        .unwrap();
    harness
        .can1_far
        .try_send(&CanFrame::new(0x123, &[0xAA]))
        .unwrap();

    // engage logging without bridge mode; STOP is queued right behind it
    harness.send_action(ActionKind::LogRawCanTraffic, vec![0]);
    harness.send_action(ActionKind::StopCurrentAction, Vec::new());
    harness.pump();

    let first = harness.recv_message();
    assert_eq!(first.kind, MessageKind::Data);
    let (record, _) = LogRecord::decode(&first.data).unwrap();
    assert_eq!(record.to_can_frame().unwrap(), CanFrame::new(0x7DF, &[0x02, 0x01, 0x0D]));
    assert_eq!(record.bitrate, 500_000);

    let second = harness.recv_message();
    let (record, _) = LogRecord::decode(&second.data).unwrap();
    assert_eq!(record.to_can_frame().unwrap(), CanFrame::new(0x123, &[0xAA]));

    assert_eq!(harness.recv_message().kind, MessageKind::Ack);
    // nothing was bridged to the other bus
    assert_eq!(harness.can2_far.try_recv().unwrap(), None);
}

#[test]
fn test_stop_while_idle_still_acks() {
    let mut harness = harness();
    harness.send_action(ActionKind::StopCurrentAction, Vec::new());
    harness.pump();
    assert_eq!(harness.recv_message().kind, MessageKind::Ack);
}
