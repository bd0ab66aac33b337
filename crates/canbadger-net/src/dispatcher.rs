//! The command dispatcher: decode, bound-check, and either answer from
//! local state or enter a long-running routine. Long-running routines pump
//! the inbox every pass so STOP_CURRENT_ACTION stays responsive.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use canbadger_core::{CanBus, CanFrame, Eeprom, FrameFormat, FrameRing, LogRecord, Storage};
use canbadger_diag::{DiagError, UdsClient};
use canbadger_hijack::{SecurityHijack, UdsMatcher};
use canbadger_isotp::{Addressing, IsoTpConfig};
use canbadger_mitm::{Mitm, RuleStore, parse_rules};
use canbadger_settings::{Settings, StatusBit, eeprom as settings_eeprom};

use crate::device::Device;
use crate::manager::EthernetManager;
use crate::message::{ActionKind, ControlError, Message};
use crate::transfer;

/// Replay frames get a generous transmit window
const REPLAY_TIMEOUT: Duration = Duration::from_secs(1);

/// Rule files live here unless the command names one
const DEFAULT_RULE_FILE: &str = "/MITM/rules.txt";

struct UploadState {
    path: String,
    next_packet: u32,
}

pub struct Dispatcher<B: CanBus + Clone, E: Eeprom, S: Storage> {
    manager: EthernetManager,
    device: Device<B, E>,
    mitm: Mitm<B, B, S>,
    uds: Option<UdsClient<B>>,
    upload: Option<UploadState>,
    reset_requested: bool,
}

impl<B: CanBus + Clone, E: Eeprom, S: Storage> Dispatcher<B, E, S> {
    pub fn new(
        manager: EthernetManager,
        device: Device<B, E>,
        arena: S,
    ) -> Result<Self, ControlError> {
        let format = if device.settings.get(StatusBit::Can1Extended) {
            FrameFormat::Extended
        } else {
            FrameFormat::Standard
        };
        let store = RuleStore::new(arena, format)?;
        let mitm = Mitm::new(device.can1.clone(), device.can2.clone(), store);
        Ok(Self {
            manager,
            device,
            mitm,
            uds: None,
            upload: None,
            reset_requested: false,
        })
    }

    #[inline]
    #[must_use]
    pub fn device(&self) -> &Device<B, E> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<B, E> {
        &mut self.device
    }

    #[inline]
    #[must_use]
    pub fn manager(&self) -> &EthernetManager {
        &self.manager
    }

    /// True once a RESET command asked for a device restart
    #[inline]
    #[must_use]
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// One pump of the main loop: socket, command handling, session upkeep
    pub fn poll(&mut self) -> Result<(), ControlError> {
        let Some(message) = self.pump_socket()? else {
            if let Some(uds) = self.uds.as_mut() {
                if let Err(e) = uds.tick() {
                    tracing::warn!("Diagnostic session dropped: {e}");
                }
            }
            return Ok(());
        };
        self.handle(message)
    }

    /// Read one datagram, answering protocol violations with a NACK
    fn pump_socket(&mut self) -> Result<Option<Message>, ControlError> {
        match self.manager.run() {
            Ok(message) => Ok(message),
            Err(
                e @ (ControlError::BadFraming(_)
                | ControlError::UnknownKind(_)
                | ControlError::UnknownAction(_)),
            ) => {
                tracing::debug!("Rejecting message: {e}");
                let _eat_err = self.manager.send_nack();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Execute one command
    pub fn handle(&mut self, message: Message) -> Result<(), ControlError> {
        tracing::debug!("Handling {:?}", message.action);
        match message.action {
            ActionKind::Settings => self.handle_settings(&message.data),
            ActionKind::EepromWrite => self.handle_eeprom_write(&message.data),
            ActionKind::Reset => {
                self.handle_reset();
                Ok(())
            }
            ActionKind::LogRawCanTraffic => {
                let bridge = message.data.first().copied().unwrap_or(0) != 0;
                self.run_logging(bridge)
            }
            ActionKind::StartUds => self.handle_start_uds(&message.data),
            ActionKind::Uds => self.handle_uds(&message.data),
            ActionKind::Hijack => self.handle_hijack(&message.data),
            ActionKind::UpdateSd => {
                if message.data.is_empty() && self.upload.is_none() {
                    transfer::send_sd_tree(&mut self.manager, &self.device.sd)
                } else {
                    self.handle_upload(&message.data)
                }
            }
            ActionKind::DownloadFile => self.handle_download(&message.data),
            ActionKind::DeleteFile => self.handle_delete(&message.data),
            ActionKind::ReceiveRules => {
                self.mitm.store_mut().reset()?;
                self.manager.send_ack()
            }
            ActionKind::AddRule => self.handle_add_rule(&message.data),
            ActionKind::Mitm => self.run_mitm(),
            ActionKind::EnableMitmMode => self.handle_mitm_mode(&message.data),
            ActionKind::StartReplay => self.handle_replay(&message.data),
            ActionKind::StopCurrentAction => self.handle_stop(),
            ActionKind::Relay => self.handle_relay(&message.data),
            ActionKind::Led => self.handle_led(&message.data),
            ActionKind::NoType
            | ActionKind::EnableTestmode
            | ActionKind::StartTp
            | ActionKind::Tp => {
                tracing::debug!("Ignoring unimplemented action {:?}", message.action);
                Ok(())
            }
        }
    }

    /// Inbox pump for long-running routines: STOP, RESET, REPLAY and the
    /// LED/relay shims stay live, everything else is refused busy.
    fn service_inbox(&mut self) -> Result<(), ControlError> {
        let Some(message) = self.pump_socket()? else {
            return Ok(());
        };
        match message.action {
            ActionKind::StopCurrentAction => self.handle_stop(),
            ActionKind::Reset => {
                self.handle_reset();
                Ok(())
            }
            ActionKind::StartReplay => self.handle_replay(&message.data),
            ActionKind::Relay => self.handle_relay(&message.data),
            ActionKind::Led => self.handle_led(&message.data),
            other => {
                tracing::debug!("Refusing {other:?} while an action is running");
                self.manager.send_nack()
            }
        }
    }

    fn handle_settings(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.is_empty() {
            // no payload means "send me yours"
            let blob = self.device.settings.to_blob();
            return self.manager.send(&Message::data(ActionKind::Settings, blob));
        }
        let Some(mut settings) = Settings::from_blob(data) else {
            tracing::warn!("Refusing malformed settings payload");
            return self.manager.send_nack();
        };
        settings.clamp_lengths();
        self.device.settings = settings;
        if let Err(e) = self
            .device
            .settings
            .persist(&self.device.sd, &mut self.device.eeprom)
        {
            tracing::warn!("Could not persist settings: {e}");
        }
        // the beacon must carry the possibly-new name
        self.manager.reacquire_identifier(&self.device.settings.id);
        Ok(())
    }

    fn handle_eeprom_write(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.is_empty() {
            settings_eeprom::store(&self.device.settings, &mut self.device.eeprom)?;
        } else {
            let name = String::from_utf8_lossy(transfer::c_string(data)).into_owned();
            settings_eeprom::store_settings_filename(&mut self.device.eeprom, &name)?;
        }
        Ok(())
    }

    fn handle_reset(&mut self) {
        tracing::info!("Reset requested by the server");
        self.reset_requested = true;
        self.device.set_running(false);
        self.manager.disconnect();
    }

    fn handle_stop(&mut self) -> Result<(), ControlError> {
        self.device.set_running(false);
        if let Some(mut uds) = self.uds.take() {
            uds.end_session();
        }
        if self.upload.take().is_some() {
            tracing::debug!("Upload aborted by STOP");
        }
        self.manager.send_ack()
    }

    fn handle_start_uds(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.len() != 14 {
            return self.manager.send_nack();
        }
        // a running bridge would race the session on the bus
        let settings = &self.device.settings;
        if settings.get(StatusBit::CanBridgeEnabled)
            || settings.get(StatusBit::Can1ToCan2Bridge)
            || settings.get(StatusBit::Can2ToCan1Bridge)
        {
            return self.manager.send_nack();
        }

        let Some(bus) = self.device.bus(data[0]).cloned() else {
            return self.manager.send_nack();
        };
        if let Some(mut old) = self.uds.take() {
            old.end_session();
        }

        let local_id = LittleEndian::read_u32(&data[1..5]);
        let remote_id = LittleEndian::read_u32(&data[5..9]);
        let config = IsoTpConfig {
            local_id,
            remote_id,
            format: if data[9] == 1 {
                FrameFormat::Extended
            } else {
                FrameFormat::Standard
            },
            padding: (data[10] != 0).then_some(data[11]),
            addressing: if data[12] == 1 {
                Addressing::Extended {
                    address: remote_id as u8,
                }
            } else {
                Addressing::Standard
            },
            ..Default::default()
        };
        let mut uds = UdsClient::new(bus, config);
        let result = uds.start_diag_session(data[13]);
        if result.is_ok() {
            self.uds = Some(uds);
        }
        self.send_uds_reply(0x10, result)
    }

    fn handle_uds(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.len() < 6 {
            return self.manager.send_nack();
        }
        let sid = LittleEndian::read_u16(&data[0..2]) as u8;
        let length = LittleEndian::read_u32(&data[2..6]) as usize;
        if data.len() != 6 + length {
            return self.manager.send_nack();
        }
        let mut request = vec![sid];
        request.extend_from_slice(&data[6..]);

        let Some(uds) = self.uds.as_mut() else {
            return self.manager.send_nack();
        };
        if !uds.in_session() {
            return self.manager.send_nack();
        }
        let result = uds.request_response(&request);
        self.send_uds_reply(sid, result)
    }

    /// UDS exchanges answer with `sid u16 LE | success u8 | len u32 LE | data`
    fn send_uds_reply(
        &mut self,
        sid: u8,
        result: Result<Vec<u8>, DiagError>,
    ) -> Result<(), ControlError> {
        let (success, payload) = match result {
            Ok(response) => (1u8, response),
            Err(DiagError::Negative { sid, nrc }) => (0, vec![0x7F, sid, nrc]),
            Err(e) => {
                tracing::debug!("UDS exchange failed: {e}");
                return self.manager.send_nack();
            }
        };
        let mut data = vec![0; 7 + payload.len()];
        LittleEndian::write_u16(&mut data[0..2], sid as u16);
        data[2] = success;
        LittleEndian::write_u32(&mut data[3..7], payload.len() as u32);
        data[7..].copy_from_slice(&payload);
        self.manager.send(&Message::data(ActionKind::NoType, data))
    }

    fn handle_hijack(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.len() != 12 {
            return self.manager.send_nack();
        }
        let local_id = LittleEndian::read_u32(&data[0..4]);
        let remote_id = LittleEndian::read_u32(&data[4..8]);
        let level = LittleEndian::read_u16(&data[8..10]) as u8;

        self.device.set_running(true);
        let mut hijack = SecurityHijack::new(
            self.device.can1.clone(),
            self.device.can2.clone(),
            UdsMatcher {
                tester_id: local_id,
                ecu_id: remote_id,
                level_filter: level,
            },
        );
        let outcome = loop {
            if !self.device.is_running() {
                break None;
            }
            match hijack.step() {
                Ok(Some(outcome)) => break Some(outcome),
                Ok(None) => {}
                Err(e) => tracing::warn!("Hijack bridge error: {e}"),
            }
            self.service_inbox()?;
            std::thread::sleep(Duration::from_micros(100));
        };
        self.device.set_running(false);

        let Some(outcome) = outcome else {
            return Ok(());
        };
        // inherit the authenticated session on the ECU-side bus
        let mut uds = UdsClient::new(
            self.device.can1.clone(),
            IsoTpConfig {
                local_id,
                remote_id,
                padding: Some(0x00),
                ..Default::default()
            },
        );
        uds.set_session_status(true);
        self.uds = Some(uds);

        let mut reply = vec![1, 0, 0];
        LittleEndian::write_u16(&mut reply[1..3], outcome.session_type as u16);
        self.manager.send(&Message::data(ActionKind::NoType, reply))
    }

    /// The logging loop: capture into the frame ring, drain to DATA
    /// messages, optionally bridge the buses, and stay responsive to STOP.
    fn run_logging(&mut self, bridge: bool) -> Result<(), ControlError> {
        let started = Instant::now();
        self.device.set_running(true);

        let settings = &mut self.device.settings;
        let saved_status = settings.status;
        settings.set(StatusBit::Can1Standard, true);
        settings.set(StatusBit::Can1Extended, false);
        settings.set(StatusBit::Can1Logging, true);
        if bridge {
            settings.set(StatusBit::Can2Standard, true);
            settings.set(StatusBit::Can2Extended, false);
            settings.set(StatusBit::Can2Logging, true);
            settings.set(StatusBit::Can1ToCan2Bridge, true);
            settings.set(StatusBit::Can2ToCan1Bridge, true);
        }

        let ring = FrameRing::new();
        let mut captured = 0u64;
        loop {
            let mut idle = true;

            // receive-hook work: format records into the ring, bridge if asked
            while let Ok(Some(frame)) = self.device.can1.try_recv() {
                idle = false;
                let record = LogRecord::from_can_frame(
                    &frame,
                    1,
                    started.elapsed().as_millis() as u32,
                    self.device.can1.bitrate(),
                );
                if !ring.push(&record.encode()) {
                    tracing::trace!("Ring full, dropping a bus 1 record");
                }
                if bridge {
                    let _eat_err = self.device.can2.send(&frame, Duration::from_millis(10));
                }
            }
            if bridge {
                while let Ok(Some(frame)) = self.device.can2.try_recv() {
                    idle = false;
                    let record = LogRecord::from_can_frame(
                        &frame,
                        2,
                        started.elapsed().as_millis() as u32,
                        self.device.can2.bitrate(),
                    );
                    if !ring.push(&record.encode()) {
                        tracing::trace!("Ring full, dropping a bus 2 record");
                    }
                    let _eat_err = self.device.can1.send(&frame, Duration::from_millis(10));
                }
            }

            // main-loop work: drain the ring out to the server
            while let Some(record) = ring.pop() {
                if self.manager.is_connected() {
                    self.manager.send(&Message::data(ActionKind::NoType, record))?;
                }
                captured += 1;
            }

            self.service_inbox()?;
            if !self.device.is_running() {
                break;
            }
            if idle {
                std::thread::sleep(Duration::from_micros(200));
            }
        }

        tracing::info!("Logging stopped after {captured} records ({} dropped)", ring.dropped());
        self.device.settings.status = saved_status;
        Ok(())
    }

    fn run_mitm(&mut self) -> Result<(), ControlError> {
        self.device.set_running(true);
        tracing::info!("MITM engaged over {} target IDs", self.mitm.store_mut().target_count());
        loop {
            let idle = self.mitm.step()?;
            self.service_inbox()?;
            if !self.device.is_running() {
                break;
            }
            if idle {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        let stats = self.mitm.stats();
        tracing::info!(
            "MITM disengaged: {} forwarded, {} transformed, {} dropped",
            stats.forwarded,
            stats.transformed,
            stats.dropped
        );
        Ok(())
    }

    fn handle_add_rule(&mut self, data: &[u8]) -> Result<(), ControlError> {
        let text = String::from_utf8_lossy(transfer::c_string(data)).into_owned();
        let rules = parse_rules(&text);
        let Some((target, rule)) = rules.first() else {
            return self.manager.send_nack();
        };
        if self.mitm.store_mut().insert(*target, rule)? {
            self.manager.send_ack()
        } else {
            self.manager.send_nack()
        }
    }

    fn handle_mitm_mode(&mut self, data: &[u8]) -> Result<(), ControlError> {
        let path = if data.is_empty() {
            String::from(DEFAULT_RULE_FILE)
        } else {
            format!("/MITM/{}", String::from_utf8_lossy(transfer::c_string(data)))
        };
        if !self.device.sd.exists(&path) {
            return self.manager.send_nack();
        }
        self.manager.send_ack()?;

        let raw = self.device.sd.read_all(&path)?;
        let text = String::from_utf8_lossy(&raw);
        let store = self.mitm.store_mut();
        store.reset()?;
        let mut loaded = 0;
        for (target, rule) in parse_rules(&text) {
            if store.insert(target, &rule)? {
                loaded += 1;
            }
        }
        tracing::info!("Loaded {loaded} rules from {path}");
        self.run_mitm()
    }

    fn handle_replay(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.len() < 5 || data.len() > 13 {
            return self.manager.send_nack();
        }
        let wire_id = LittleEndian::read_u32(&data[1..5]);
        let frame = CanFrame::from_wire_id(wire_id, &data[5..]);
        let Some(bus) = self.device.bus(data[0]) else {
            return self.manager.send_nack();
        };
        match bus.send(&frame, REPLAY_TIMEOUT) {
            Ok(()) => self.manager.send_ack(),
            Err(e) => {
                tracing::warn!("Replay of {frame} failed: {e}");
                self.manager.send_nack()
            }
        }
    }

    fn handle_download(&mut self, data: &[u8]) -> Result<(), ControlError> {
        let path = String::from_utf8_lossy(transfer::c_string(data)).into_owned();
        if !self.device.sd.exists(&path) {
            return self.manager.send_nack();
        }
        transfer::send_download(&mut self.manager, &self.device.sd, &path)
    }

    fn handle_delete(&mut self, data: &[u8]) -> Result<(), ControlError> {
        let path = String::from_utf8_lossy(transfer::c_string(data)).into_owned();
        if !self.device.sd.exists(&path) {
            return self.manager.send_nack();
        }
        self.device.sd.remove(&path)?;
        self.manager.send_ack()
    }

    /// UPDATE_SD uploads: the first message names the file, each following
    /// one carries `packet u32 LE | length u8 | bytes` and is ACKed;
    /// anything out of order aborts the transfer.
    fn handle_upload(&mut self, data: &[u8]) -> Result<(), ControlError> {
        let Some(state) = self.upload.as_mut() else {
            let path = String::from_utf8_lossy(transfer::c_string(data)).into_owned();
            if path.is_empty() || self.device.sd.write_all(&path, &[]).is_err() {
                return self.manager.send_nack();
            }
            self.upload = Some(UploadState {
                path,
                next_packet: 0,
            });
            return self.manager.send_ack();
        };

        if data.len() < 5 {
            self.upload = None;
            return self.manager.send_nack();
        }
        let packet = LittleEndian::read_u32(&data[0..4]);
        let length = data[4] as usize;
        if data.len() < 5 + length || packet != state.next_packet {
            tracing::warn!(
                "Upload to {} aborted at packet {packet} (expected {})",
                state.path,
                state.next_packet
            );
            self.upload = None;
            return self.manager.send_nack();
        }
        state.next_packet += 1;
        let path = state.path.clone();
        match self.device.sd.append(&path, &data[5..5 + length]) {
            Ok(()) => self.manager.send_ack(),
            Err(e) => {
                tracing::warn!("Upload write to {path} failed: {e}");
                self.upload = None;
                self.manager.send_nack()
            }
        }
    }

    /// GPIO relay shim: reports both relays off; the expansion driver is
    /// not part of this build
    fn handle_relay(&mut self, data: &[u8]) -> Result<(), ControlError> {
        if data.len() > 2 {
            return Ok(());
        }
        if data.is_empty() {
            return self
                .manager
                .send(&Message::data(ActionKind::Relay, vec![0, 0]));
        }
        tracing::debug!("Relay command ignored (no GPIO expansion fitted)");
        Ok(())
    }

    /// LED shim: color changes become log lines on a headless build
    fn handle_led(&mut self, data: &[u8]) -> Result<(), ControlError> {
        match data {
            [color] => tracing::debug!("LED set to color {color}"),
            [color, times] => tracing::debug!("LED blink {times}x color {color}"),
            _ => {}
        }
        Ok(())
    }
}
