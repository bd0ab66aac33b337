//! VW TP2.0: a connection-oriented transport with its own channel setup,
//! parameter negotiation, sequence counters and keep-alive. KWP2000
//! application PDUs ride inside its data frames.
//!
//! Channel lifecycle:
//!
//! ```text
//!  IDLE ──channel_setup_ok──▶ NEGOTIATING ──params_ok──▶ ESTABLISHED
//!    ▲                                                     │
//!    └──────── timeout / abort / close_channel ────────────┘
//! ```

use std::time::{Duration, Instant};

use canbadger_core::{BusError, CanBus, CanFrame};

use crate::kwp::{self, encode};
use crate::session::TesterPresent;
use crate::{DiagError, nrc};

/// Channel setup requests go to `0x200 + ecu_id`; the reply comes back on
/// the same conversation ID carrying the data IDs for the session.
pub const CHANNEL_SETUP_BASE: u32 = 0x200;

/// Broadcast/control opcodes carried in byte 1 of setup frames
const OP_SETUP_REQUEST: u8 = 0xC0;
const OP_SETUP_POSITIVE: u8 = 0xD0;

/// Full-byte control opcodes on an established channel
const OP_PARAMS_REQUEST: u8 = 0xA0;
const OP_PARAMS_RESPONSE: u8 = 0xA1;
const OP_CHANNEL_TEST: u8 = 0xA3;
const OP_DISCONNECT: u8 = 0xA8;

/// Frame-type nibbles in the low half of a data frame's first byte; the high
/// nibble carries the 4-bit sequence counter.
const DATA_FINAL: u8 = 0x0;
const DATA_MORE: u8 = 0x1;
const DATA_ACK: u8 = 0xB;

const POLL_TICK: Duration = Duration::from_micros(100);

#[derive(Debug, thiserror::Error)]
pub enum Tp20Error {
    #[error("no TP2.0 frame within the timeout window")]
    Timeout,
    #[error("TP2.0 data frame out of sequence: expected {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },
    #[error("ECU rejected the channel setup (opcode {0:#04X})")]
    SetupRejected(u8),
    #[error("channel is not established")]
    ChannelClosed,
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tp20State {
    #[default]
    Idle,
    Negotiating,
    Established,
}

/// Negotiated channel parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tp20Params {
    /// Frames per ACK window
    pub block_size: u8,
    /// Delay between data frames, in ms
    pub separation_time: u8,
    /// Idle time after which a keep-alive is owed
    pub inactivity_timeout: Duration,
}

impl Default for Tp20Params {
    fn default() -> Self {
        Self {
            block_size: 0x0F,
            separation_time: 0,
            inactivity_timeout: Duration::from_millis(500),
        }
    }
}

pub struct Tp20Channel<B: CanBus> {
    bus: B,
    state: Tp20State,
    ecu_id: u8,
    /// ID we transmit data frames on
    tx_id: u32,
    /// ID the ECU transmits on
    rx_id: u32,
    params: Tp20Params,
    tx_seq: u8,
    rx_seq: u8,
    last_activity: Instant,
    response_timeout: Duration,
}

impl<B: CanBus> Tp20Channel<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            state: Tp20State::Idle,
            ecu_id: 0,
            tx_id: 0,
            rx_id: 0,
            params: Tp20Params::default(),
            tx_seq: 0,
            rx_seq: 0,
            last_activity: Instant::now(),
            response_timeout: Duration::from_secs(1),
        }
    }

    /// Rebuild an established channel from observed state, e.g. after
    /// inheriting another tester's session mid-stream
    pub fn resume(bus: B, tx_id: u32, rx_id: u32, tx_seq: u8, rx_seq: u8) -> Self {
        Self {
            bus,
            state: Tp20State::Established,
            ecu_id: 0,
            tx_id,
            rx_id,
            params: Tp20Params::default(),
            tx_seq: tx_seq & 0x0F,
            rx_seq: rx_seq & 0x0F,
            last_activity: Instant::now(),
            response_timeout: Duration::from_secs(1),
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> Tp20State {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn params(&self) -> &Tp20Params {
        &self.params
    }

    #[inline]
    #[must_use]
    pub fn ecu_id(&self) -> u8 {
        self.ecu_id
    }

    #[inline]
    #[must_use]
    pub fn ids(&self) -> (u32, u32) {
        (self.tx_id, self.rx_id)
    }

    #[inline]
    #[must_use]
    pub fn counters(&self) -> (u8, u8) {
        (self.tx_seq, self.rx_seq)
    }

    /// Two-phase connect: channel setup, then A0/A1 parameter negotiation
    pub fn connect(&mut self, ecu_id: u8) -> Result<(), Tp20Error> {
        self.ecu_id = ecu_id;
        let setup_id = CHANNEL_SETUP_BASE + ecu_id as u32;

        // propose listening on 0x300; the ECU assigns the ID we transmit on
        let request = [0x00, OP_SETUP_REQUEST, 0x00, 0x03, 0x00, 0x10, 0x01];
        self.bus
            .send(&CanFrame::new(setup_id, &request), self.response_timeout)?;

        let deadline = Instant::now() + self.response_timeout;
        let reply = loop {
            let frame = self.wait_any(deadline)?;
            if frame.id == setup_id && frame.dlc >= 6 {
                break frame;
            }
        };
        let data = reply.data();
        if data[1] != OP_SETUP_POSITIVE {
            return Err(Tp20Error::SetupRejected(data[1]));
        }
        self.tx_id = u16::from_le_bytes([data[2], data[3]]) as u32;
        self.rx_id = u16::from_le_bytes([data[4], data[5]]) as u32;
        self.state = Tp20State::Negotiating;
        tracing::debug!(
            "TP2.0 channel to ECU {ecu_id:#04X}: tx {:#05X}, rx {:#05X}",
            self.tx_id,
            self.rx_id
        );

        self.negotiate()
    }

    fn negotiate(&mut self) -> Result<(), Tp20Error> {
        let request = [
            OP_PARAMS_REQUEST,
            self.params.block_size,
            0x8A, // T1: ACK timeout
            0xFF, // T2: unused
            self.params.separation_time,
            0xFF, // T4: unused
        ];
        self.bus
            .send(&CanFrame::new(self.tx_id, &request), self.response_timeout)?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let frame = self.wait_on_rx(deadline)?;
            let data = frame.data();
            match data[0] {
                OP_PARAMS_RESPONSE if data.len() >= 5 => {
                    self.params.block_size = data[1];
                    self.params.separation_time = data[4];
                    // T1 counts in 10 ms steps
                    self.params.inactivity_timeout =
                        Duration::from_millis((data[2] & 0x3F) as u64 * 10);
                    self.state = Tp20State::Established;
                    self.tx_seq = 0;
                    self.rx_seq = 0;
                    self.touch();
                    return Ok(());
                }
                OP_DISCONNECT => {
                    self.state = Tp20State::Idle;
                    return Err(Tp20Error::ChannelClosed);
                }
                _ => {}
            }
        }
    }

    /// Send one application PDU, chunked into sequence-counted data frames
    pub fn send(&mut self, payload: &[u8]) -> Result<(), Tp20Error> {
        if self.state != Tp20State::Established {
            return Err(Tp20Error::ChannelClosed);
        }
        let chunks: Vec<&[u8]> = payload.chunks(7).collect();
        let mut in_block = 0u16;
        for (i, chunk) in chunks.iter().enumerate() {
            let final_chunk = i + 1 == chunks.len();
            let opcode = if final_chunk { DATA_FINAL } else { DATA_MORE };
            let mut bytes = vec![(self.tx_seq << 4) | opcode];
            bytes.extend_from_slice(chunk);
            if self.params.separation_time > 0 {
                std::thread::sleep(Duration::from_millis(self.params.separation_time as u64));
            }
            self.bus
                .send(&CanFrame::new(self.tx_id, &bytes), self.response_timeout)?;
            self.tx_seq = (self.tx_seq + 1) & 0x0F;
            in_block += 1;

            // the receiver ACKs after each full block and after the last frame
            if final_chunk
                || (self.params.block_size != 0 && in_block == self.params.block_size as u16)
            {
                self.wait_ack()?;
                in_block = 0;
            }
        }
        self.touch();
        Ok(())
    }

    /// Receive one application PDU
    pub fn recv(&mut self) -> Result<Vec<u8>, Tp20Error> {
        if self.state != Tp20State::Established {
            return Err(Tp20Error::ChannelClosed);
        }
        let mut message = Vec::new();
        loop {
            let deadline = Instant::now() + self.response_timeout;
            let frame = self.wait_on_rx(deadline)?;
            let data = frame.data();
            let opcode = data[0] & 0x0F;
            let sequence = data[0] >> 4;
            match opcode {
                DATA_FINAL | DATA_MORE => {
                    if sequence != self.rx_seq {
                        return Err(Tp20Error::Sequence {
                            expected: self.rx_seq,
                            got: sequence,
                        });
                    }
                    self.rx_seq = (self.rx_seq + 1) & 0x0F;
                    message.extend_from_slice(&data[1..]);
                    if opcode == DATA_FINAL {
                        self.send_ack()?;
                        self.touch();
                        return Ok(message);
                    }
                }
                DATA_ACK => {
                    // stray ACK from a previous exchange
                }
                _ => match data[0] {
                    OP_DISCONNECT => {
                        self.state = Tp20State::Idle;
                        return Err(Tp20Error::ChannelClosed);
                    }
                    OP_CHANNEL_TEST | OP_PARAMS_RESPONSE => {}
                    other => {
                        tracing::trace!("Ignoring TP2.0 control frame {other:#04X}");
                    }
                },
            }
        }
    }

    /// Emit the keep-alive if the channel has been idle past the negotiated
    /// timeout. Call from the owning loop.
    pub fn tick(&mut self) -> Result<(), Tp20Error> {
        if self.state != Tp20State::Established {
            return Ok(());
        }
        if self.last_activity.elapsed() >= self.params.inactivity_timeout {
            self.bus.send(
                &CanFrame::new(self.tx_id, &[OP_CHANNEL_TEST]),
                self.response_timeout,
            )?;
            self.touch();
        }
        Ok(())
    }

    /// Close the channel with a disconnect frame
    pub fn close(&mut self) -> Result<(), Tp20Error> {
        if self.state == Tp20State::Established {
            self.bus.send(
                &CanFrame::new(self.tx_id, &[OP_DISCONNECT]),
                self.response_timeout,
            )?;
        }
        self.state = Tp20State::Idle;
        Ok(())
    }

    fn send_ack(&mut self) -> Result<(), Tp20Error> {
        let ack = (self.rx_seq << 4) | DATA_ACK;
        self.bus
            .send(&CanFrame::new(self.tx_id, &[ack]), self.response_timeout)?;
        Ok(())
    }

    fn wait_ack(&mut self) -> Result<(), Tp20Error> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            let frame = self.wait_on_rx(deadline)?;
            let data = frame.data();
            if data[0] & 0x0F == DATA_ACK {
                let acked = data[0] >> 4;
                if acked != self.tx_seq {
                    tracing::warn!(
                        "TP2.0 ACK for sequence {acked}, expected {}; continuing",
                        self.tx_seq
                    );
                }
                return Ok(());
            }
            if data[0] == OP_DISCONNECT {
                self.state = Tp20State::Idle;
                return Err(Tp20Error::ChannelClosed);
            }
        }
    }

    fn wait_on_rx(&mut self, deadline: Instant) -> Result<CanFrame, Tp20Error> {
        loop {
            let frame = self.wait_any(deadline)?;
            if frame.id == self.rx_id && frame.dlc >= 1 {
                return Ok(frame);
            }
        }
    }

    fn wait_any(&mut self, deadline: Instant) -> Result<CanFrame, Tp20Error> {
        loop {
            if let Some(frame) = self.bus.try_recv()? {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(Tp20Error::Timeout);
            }
            std::thread::sleep(POLL_TICK);
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// KWP2000 riding on a TP2.0 channel
pub struct KwpTp20Client<B: CanBus> {
    channel: Tp20Channel<B>,
    ticker: TesterPresent,
    in_session: bool,
    current_session: u8,
}

impl<B: CanBus> KwpTp20Client<B> {
    pub fn new(channel: Tp20Channel<B>) -> Self {
        Self {
            channel,
            ticker: TesterPresent::new(),
            in_session: false,
            current_session: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn channel(&self) -> &Tp20Channel<B> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut Tp20Channel<B> {
        &mut self.channel
    }

    #[inline]
    #[must_use]
    pub fn in_session(&self) -> bool {
        self.in_session
    }

    #[inline]
    #[must_use]
    pub fn current_session(&self) -> u8 {
        self.current_session
    }

    pub fn set_session_status(&mut self, active: bool) {
        self.in_session = active;
        if active {
            self.ticker.attach();
        } else {
            self.ticker.detach();
        }
    }

    pub fn end_session(&mut self) -> Result<(), DiagError> {
        self.set_session_status(false);
        self.channel.close()?;
        Ok(())
    }

    /// Drive TesterPresent and the channel keep-alive together
    pub fn tick(&mut self) -> Result<(), DiagError> {
        self.channel.tick()?;
        if !self.in_session || !self.ticker.is_due() {
            return Ok(());
        }
        let outcome = self.request_response(&encode::tester_present());
        match outcome {
            Ok(response)
                if response.first()
                    == Some(&(kwp::sid::TESTER_PRESENT + kwp::sid::RESPONSE_OFFSET)) =>
            {
                Ok(())
            }
            _ => {
                self.set_session_status(false);
                Err(DiagError::SessionLost)
            }
        }
    }

    pub fn request_response(&mut self, request: &[u8]) -> Result<Vec<u8>, DiagError> {
        let keep_alive_was_on = self.ticker.is_attached();
        self.ticker.detach();
        let result = self.exchange(request);
        if keep_alive_was_on && self.in_session {
            self.ticker.attach();
        }
        result
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.channel.send(request)?;
        loop {
            let response = self.channel.recv()?;
            if response.len() >= 3 && response[0] == kwp::sid::NEGATIVE_RESPONSE {
                if response[2] == nrc::RESPONSE_PENDING {
                    continue;
                }
                return Err(DiagError::Negative {
                    sid: response[1],
                    nrc: response[2],
                });
            }
            return Ok(response);
        }
    }

    pub fn start_diag_session(&mut self, session: u8) -> Result<Vec<u8>, DiagError> {
        let response = self.request_response(&encode::start_diag_session(session))?;
        if response.first() == Some(&(kwp::sid::START_DIAG_SESSION + kwp::sid::RESPONSE_OFFSET)) {
            self.current_session = session;
            self.set_session_status(true);
        }
        Ok(response)
    }

    pub fn read_ecu_id(&mut self, id_type: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::read_ecu_id(id_type))
    }

    pub fn read_data_by_local_id(&mut self, record: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::read_data_by_local_id(record))
    }

    pub fn request_seed(&mut self, level: u8) -> Result<Vec<u8>, DiagError> {
        let response = self.request_response(&encode::request_seed(level))?;
        Ok(response.get(2..).unwrap_or_default().to_vec())
    }

    pub fn send_key(&mut self, level: u8, key: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::send_key(level, key))
    }

    pub fn read_dtcs(&mut self, args: &[u8]) -> Result<Vec<kwp::Dtc>, DiagError> {
        let response = self.request_response(&encode::read_dtcs(args))?;
        Ok(kwp::parse_dtc_list(response.get(1..).unwrap_or_default()))
    }

    pub fn transfer_data(&mut self, data: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::transfer_data(data))
    }
}

#[cfg(test)]
mod tests {
    use canbadger_core::{SimBus, bus_pair};
    use pretty_assertions::assert_eq;

    use super::*;

    const ECU_ID: u8 = 0x01;
    const ECU_TX: u32 = 0x300; // ECU transmits here (tester rx)
    const TESTER_TX: u32 = 0x740;

    /// Scripted ECU side: channel setup, parameter negotiation, then serve
    /// `count` request/response exchanges with the given responder.
    fn ecu_serve(bus: SimBus, count: usize, respond: impl Fn(&[u8]) -> Vec<u8>) {
        let setup_id = CHANNEL_SETUP_BASE + ECU_ID as u32;
        // channel setup
        let request = recv_on(&bus, setup_id);
        assert_eq!(request.data()[1], 0xC0);
        let tx = (TESTER_TX as u16).to_le_bytes();
        let rx = (ECU_TX as u16).to_le_bytes();
        let reply = [0x00, 0xD0, tx[0], tx[1], rx[0], rx[1], 0x01];
        bus.try_send(&CanFrame::new(setup_id, &reply)).unwrap();

        // parameter negotiation
        let request = recv_on(&bus, TESTER_TX);
        assert_eq!(request.data()[0], 0xA0);
        bus.try_send(&CanFrame::new(ECU_TX, &[0xA1, 0x0F, 0x8A, 0xFF, 0x00, 0xFF]))
            .unwrap();

        let mut rx_seq = 0u8;
        let mut tx_seq = 0u8;
        for _ in 0..count {
            // collect one PDU
            let mut pdu = Vec::new();
            loop {
                let frame = recv_on(&bus, TESTER_TX);
                let opcode = frame.data()[0] & 0x0F;
                assert_eq!(frame.data()[0] >> 4, rx_seq);
                rx_seq = (rx_seq + 1) & 0x0F;
                pdu.extend_from_slice(&frame.data()[1..]);
                if opcode == 0x0 {
                    break;
                }
            }
            // ACK it
            bus.try_send(&CanFrame::new(ECU_TX, &[(rx_seq << 4) | 0xB]))
                .unwrap();

            // reply
            let reply = respond(&pdu);
            let chunks: Vec<&[u8]> = reply.chunks(7).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let opcode = if i + 1 == chunks.len() { 0x0 } else { 0x1 };
                let mut bytes = vec![(tx_seq << 4) | opcode];
                bytes.extend_from_slice(chunk);
                bus.try_send(&CanFrame::new(ECU_TX, &bytes)).unwrap();
                tx_seq = (tx_seq + 1) & 0x0F;
            }
            // swallow the tester's ACK
            let ack = recv_on(&bus, TESTER_TX);
            assert_eq!(ack.data()[0] & 0x0F, 0xB);
        }
    }

    fn recv_on(bus: &SimBus, id: u32) -> CanFrame {
        loop {
            if let Some(frame) = bus.try_recv().unwrap() {
                if frame.id == id {
                    return frame;
                }
                continue;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    #[test]
    fn test_connect_negotiates_channel() {
        let (tester_bus, ecu_bus) = bus_pair();
        std::thread::scope(|scope| {
            scope.spawn(move || ecu_serve(ecu_bus, 0, |_| Vec::new()));
            let mut channel = Tp20Channel::new(tester_bus);
            channel.connect(ECU_ID).unwrap();
            assert_eq!(channel.state(), Tp20State::Established);
            assert_eq!(channel.ids(), (TESTER_TX, ECU_TX));
            assert_eq!(channel.params().block_size, 0x0F);
        });
    }

    #[test]
    fn test_kwp_pdu_roundtrip() {
        let (tester_bus, ecu_bus) = bus_pair();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                ecu_serve(ecu_bus, 1, |pdu| {
                    assert_eq!(pdu, &[0x10, 0x89]);
                    vec![0x50, 0x89]
                });
            });
            let mut channel = Tp20Channel::new(tester_bus);
            channel.connect(ECU_ID).unwrap();
            let mut kwp = KwpTp20Client::new(channel);
            let response = kwp.start_diag_session(0x89).unwrap();
            assert_eq!(response, vec![0x50, 0x89]);
            assert!(kwp.in_session());
        });
    }

    #[test]
    fn test_multi_frame_pdu_sequences() {
        let (tester_bus, ecu_bus) = bus_pair();
        let request: Vec<u8> = (0..20).collect();
        let expected = request.clone();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                ecu_serve(ecu_bus, 1, |pdu| {
                    assert_eq!(pdu.len(), 20);
                    let mut reply = vec![0x61];
                    reply.extend_from_slice(pdu);
                    reply
                });
            });
            let mut channel = Tp20Channel::new(tester_bus);
            channel.connect(ECU_ID).unwrap();
            channel.send(&request).unwrap();
            let reply = channel.recv().unwrap();
            assert_eq!(reply[0], 0x61);
            assert_eq!(&reply[1..], &expected[..]);
            // one message of 3 frames sent, counters advanced mod 16
            assert_eq!(channel.counters().0, 3);
        });
    }

    #[test]
    fn test_send_on_idle_channel_fails() {
        let (tester_bus, _ecu_bus) = bus_pair();
        let mut channel = Tp20Channel::new(tester_bus);
        assert!(matches!(
            channel.send(&[0x3E]),
            Err(Tp20Error::ChannelClosed)
        ));
    }

    #[test]
    fn test_resume_carries_counters() {
        let (tester_bus, _ecu_bus) = bus_pair();
        let channel = Tp20Channel::resume(tester_bus, TESTER_TX, ECU_TX, 7, 9);
        assert_eq!(channel.state(), Tp20State::Established);
        assert_eq!(channel.counters(), (7, 9));
    }
}
