use std::time::{Duration, Instant};

use canbadger_core::{BusError, CanBus, CanFrame, FrameFormat};

use crate::MAX_MESSAGE_LEN;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

const FC_CONTINUE: u8 = 0x0;
const FC_WAIT: u8 = 0x1;
const FC_ABORT: u8 = 0x2;

/// Receive polling granularity, matching the transmit retry tick
const POLL_TICK: Duration = Duration::from_micros(100);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no matching frame within the timeout window")]
    Timeout,
    #[error("consecutive frame out of sequence: expected {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },
    #[error("remote aborted the transfer via flow control")]
    Abort,
    #[error("message of {0} bytes exceeds the 4095-byte transport limit")]
    Overlong(usize),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// How the first byte of each frame is interpreted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Addressing {
    /// The CAN ID identifies the endpoint; byte 0 is the PCI
    #[default]
    Standard,
    /// Byte 0 carries a target address and the PCI shifts to byte 1,
    /// costing one payload byte per frame
    Extended { address: u8 },
}

impl Addressing {
    /// Offset of the PCI byte within the frame payload
    #[inline]
    #[must_use]
    fn pci_offset(&self) -> usize {
        match self {
            Addressing::Standard => 0,
            Addressing::Extended { .. } => 1,
        }
    }
}

/// Which incoming frames a receive accepts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Only frames from the configured remote ID (sessions)
    #[default]
    Session,
    /// The first frame seen, whatever its ID (scans)
    Wide,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsoTpConfig {
    pub local_id: u32,
    pub remote_id: u32,
    pub format: FrameFormat,
    /// Pad every frame to 8 bytes with this byte, if set
    pub padding: Option<u8>,
    pub addressing: Addressing,
    /// How long a transmit may wait for bus access
    pub request_timeout: Duration,
    /// How long to wait for the first frame of a reply, or for flow control
    pub response_timeout: Duration,
    /// How long to wait for each consecutive frame
    pub consecutive_timeout: Duration,
    /// Block size we advertise in outgoing flow control (0 = unbounded)
    pub rx_block_size: u8,
    /// Separation time we advertise in outgoing flow control
    pub rx_separation_time: u8,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            local_id: 0x7E0,
            remote_id: 0x7E8,
            format: FrameFormat::Standard,
            padding: None,
            addressing: Addressing::Standard,
            request_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
            consecutive_timeout: Duration::from_millis(500),
            rx_block_size: 0,
            rx_separation_time: 0,
        }
    }
}

impl IsoTpConfig {
    /// Payload bytes a single frame can carry under this addressing mode
    #[inline]
    #[must_use]
    pub fn single_frame_capacity(&self) -> usize {
        7 - self.addressing.pci_offset()
    }
}

/// One configured ISO-TP endpoint over a CAN port
pub struct IsoTpLink<B: CanBus> {
    bus: B,
    config: IsoTpConfig,
}

impl<B: CanBus> IsoTpLink<B> {
    pub fn new(bus: B, config: IsoTpConfig) -> Self {
        Self { bus, config }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: IsoTpConfig) {
        self.config = config;
    }

    #[inline]
    #[must_use]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Send one message, segmenting into FF + CFs with flow control when it
    /// does not fit a single frame.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::Overlong(payload.len()));
        }
        if payload.len() <= self.config.single_frame_capacity() {
            return self.send_single(payload);
        }
        self.send_segmented(payload)
    }

    /// Receive one message addressed to us
    pub fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.recv_filtered(FilterMode::Session)
    }

    /// Receive one message; [FilterMode::Wide] returns whatever arrives first
    pub fn recv_filtered(&mut self, mode: FilterMode) -> Result<Vec<u8>, TransportError> {
        let pci_at = self.config.addressing.pci_offset();
        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let frame = self.wait_frame(mode, self.config.remote_id, deadline)?;
            let data = frame.data();
            if data.len() <= pci_at {
                continue;
            }
            match data[pci_at] >> 4 {
                PCI_SINGLE => {
                    let len = (data[pci_at] & 0x0F) as usize;
                    if len == 0 || data.len() < pci_at + 1 + len {
                        tracing::warn!("Malformed single frame from {:#X}, ignoring", frame.id);
                        continue;
                    }
                    return Ok(data[pci_at + 1..pci_at + 1 + len].to_vec());
                }
                PCI_FIRST => {
                    return self.recv_remainder(&frame);
                }
                _ => {
                    // stray CF or FC outside a transfer
                    tracing::trace!("Ignoring unexpected frame {frame}");
                }
            }
        }
    }

    /// Send a request and read back one reply
    pub fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.send(payload)?;
        self.recv()
    }

    fn send_single(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut bytes = self.frame_prefix();
        bytes.push(PCI_SINGLE << 4 | payload.len() as u8);
        bytes.extend_from_slice(payload);
        self.transmit(&bytes, self.config.request_timeout)
    }

    fn send_segmented(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut bytes = self.frame_prefix();
        bytes.push(PCI_FIRST << 4 | (payload.len() >> 8) as u8);
        bytes.push(payload.len() as u8);
        let ff_capacity = 8 - bytes.len();
        let (head, mut rest) = payload.split_at(ff_capacity);
        bytes.extend_from_slice(head);
        self.transmit(&bytes, self.config.request_timeout)?;

        let mut sequence = 1u8;
        let (mut block_size, mut separation) = self.wait_flow_control()?;
        loop {
            let mut sent_in_block = 0u16;
            while !rest.is_empty() {
                sleep_separation(separation);
                let mut bytes = self.frame_prefix();
                bytes.push(PCI_CONSECUTIVE << 4 | sequence);
                let take = rest.len().min(8 - bytes.len());
                let (chunk, remainder) = rest.split_at(take);
                bytes.extend_from_slice(chunk);
                rest = remainder;
                self.transmit(&bytes, self.config.request_timeout)?;
                sequence = (sequence + 1) & 0x0F;
                sent_in_block += 1;
                if block_size != 0 && sent_in_block == block_size as u16 {
                    break;
                }
            }
            if rest.is_empty() {
                return Ok(());
            }
            // the receiver owes us another flow control before the next block
            (block_size, separation) = self.wait_flow_control()?;
        }
    }

    /// Collect the consecutive frames following a first frame
    fn recv_remainder(&mut self, first: &CanFrame) -> Result<Vec<u8>, TransportError> {
        let pci_at = self.config.addressing.pci_offset();
        let data = first.data();
        let total = ((data[pci_at] as usize & 0x0F) << 8) | data[pci_at + 1] as usize;
        let mut message = Vec::with_capacity(total);
        message.extend_from_slice(&data[pci_at + 2..]);
        message.truncate(total);
        tracing::trace!("First frame from {:#X} announcing {total} bytes", first.id);

        self.send_flow_control(FC_CONTINUE)?;
        let mut expected = 1u8;
        let mut in_block = 0u16;
        while message.len() < total {
            let deadline = Instant::now() + self.config.consecutive_timeout;
            let frame = self.wait_frame(FilterMode::Session, first.id, deadline)?;
            let data = frame.data();
            if data.len() <= pci_at || data[pci_at] >> 4 != PCI_CONSECUTIVE {
                continue;
            }
            let sequence = data[pci_at] & 0x0F;
            if sequence != expected {
                return Err(TransportError::Sequence {
                    expected,
                    got: sequence,
                });
            }
            expected = (expected + 1) & 0x0F;
            let remaining = total - message.len();
            let take = remaining.min(data.len() - pci_at - 1);
            message.extend_from_slice(&data[pci_at + 1..pci_at + 1 + take]);

            in_block += 1;
            if self.config.rx_block_size != 0
                && in_block == self.config.rx_block_size as u16
                && message.len() < total
            {
                self.send_flow_control(FC_CONTINUE)?;
                in_block = 0;
            }
        }
        Ok(message)
    }

    /// Wait for the receiver's flow control frame, honoring Wait extensions
    fn wait_flow_control(&mut self) -> Result<(u8, u8), TransportError> {
        let pci_at = self.config.addressing.pci_offset();
        let mut deadline = Instant::now() + self.config.response_timeout;
        loop {
            let frame = self.wait_frame(FilterMode::Session, self.config.remote_id, deadline)?;
            let data = frame.data();
            if data.len() <= pci_at + 2 || data[pci_at] >> 4 != PCI_FLOW_CONTROL {
                continue;
            }
            match data[pci_at] & 0x0F {
                FC_CONTINUE => return Ok((data[pci_at + 1], data[pci_at + 2])),
                FC_WAIT => {
                    tracing::debug!("Flow control Wait from {:#X}, extending", frame.id);
                    deadline = Instant::now() + self.config.response_timeout;
                }
                FC_ABORT => return Err(TransportError::Abort),
                flag => {
                    tracing::warn!("Unknown flow control flag {flag:#X}, ignoring");
                }
            }
        }
    }

    fn send_flow_control(&mut self, flag: u8) -> Result<(), TransportError> {
        let mut bytes = self.frame_prefix();
        bytes.push(PCI_FLOW_CONTROL << 4 | flag);
        bytes.push(self.config.rx_block_size);
        bytes.push(self.config.rx_separation_time);
        self.transmit(&bytes, self.config.request_timeout)
    }

    /// Poll the bus for a frame passing the filter until `deadline`
    fn wait_frame(
        &mut self,
        mode: FilterMode,
        want_id: u32,
        deadline: Instant,
    ) -> Result<CanFrame, TransportError> {
        loop {
            if let Some(frame) = self.bus.try_recv()? {
                match mode {
                    FilterMode::Wide => return Ok(frame),
                    FilterMode::Session if frame.id == want_id => return Ok(frame),
                    FilterMode::Session => {
                        tracing::trace!("Filtered out frame {frame}");
                    }
                }
            } else if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            } else {
                std::thread::sleep(POLL_TICK);
            }
        }
    }

    /// Address byte, if extended addressing is on
    fn frame_prefix(&self) -> Vec<u8> {
        match self.config.addressing {
            Addressing::Standard => Vec::with_capacity(8),
            Addressing::Extended { address } => {
                let mut bytes = Vec::with_capacity(8);
                bytes.push(address);
                bytes
            }
        }
    }

    fn transmit(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let mut bytes = bytes.to_vec();
        if let Some(pad) = self.config.padding {
            bytes.resize(8, pad);
        }
        let frame = CanFrame::new(self.config.local_id, &bytes).with_format(self.config.format);
        self.bus.send(&frame, timeout)?;
        Ok(())
    }
}

fn sleep_separation(st: u8) {
    match st {
        0 => {}
        1..=0x7F => std::thread::sleep(Duration::from_millis(st as u64)),
        // 0xF1..=0xF9 encode 100..900 us
        0xF1..=0xF9 => std::thread::sleep(Duration::from_micros((st as u64 - 0xF0) * 100)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use canbadger_core::bus_pair;
    use pretty_assertions::assert_eq;

    use super::*;

    fn link_pair() -> (IsoTpLink<canbadger_core::SimBus>, IsoTpLink<canbadger_core::SimBus>) {
        let (tester_bus, ecu_bus) = bus_pair();
        let tester = IsoTpLink::new(
            tester_bus,
            IsoTpConfig {
                local_id: 0x7E0,
                remote_id: 0x7E8,
                ..Default::default()
            },
        );
        let ecu = IsoTpLink::new(
            ecu_bus,
            IsoTpConfig {
                local_id: 0x7E8,
                remote_id: 0x7E0,
                ..Default::default()
            },
        );
        (tester, ecu)
    }

    #[test]
    fn test_seven_byte_payload_is_a_single_frame() {
        let (mut tester, ecu) = link_pair();
        tester.send(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        let frame = ecu.bus().try_recv().unwrap().unwrap();
        assert_eq!(frame.data(), &[0x07, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_single_frame_padding() {
        let (mut tester, ecu) = link_pair();
        tester.config.padding = Some(0xAA);
        tester.send(&[0x3E, 0x00]).unwrap();
        let frame = ecu.bus().try_recv().unwrap().unwrap();
        assert_eq!(frame.data(), &[0x02, 0x3E, 0x00, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn test_eight_byte_payload_needs_first_and_consecutive() {
        let (mut tester, mut ecu) = link_pair();
        let payload = [1, 2, 3, 4, 5, 6, 7, 8];
        std::thread::scope(|scope| {
            let sender = scope.spawn(move || tester.send(&payload).map(|()| tester));
            let received = ecu.recv().unwrap();
            assert_eq!(received, payload);
            sender.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_extended_addressing_capacity() {
        let (mut tester, ecu) = link_pair();
        tester.config.addressing = Addressing::Extended { address: 0x55 };
        // 6 bytes still fit a single frame with extended addressing
        tester.send(&[1, 2, 3, 4, 5, 6]).unwrap();
        let frame = ecu.bus().try_recv().unwrap().unwrap();
        assert_eq!(frame.data(), &[0x55, 0x06, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_loopback_roundtrip_across_sizes() {
        for len in [1usize, 7, 8, 62, 106, 300] {
            let (mut tester, mut ecu) = link_pair();
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let expected = payload.clone();
            std::thread::scope(|scope| {
                scope.spawn(move || tester.send(&payload).unwrap());
                let received = ecu.recv().unwrap();
                assert_eq!(received, expected);
            });
        }
    }

    #[test]
    fn test_block_size_pacing() {
        let (mut tester, mut ecu) = link_pair();
        ecu.config.rx_block_size = 2;
        let payload: Vec<u8> = (0..40).collect();
        let expected = payload.clone();
        std::thread::scope(|scope| {
            scope.spawn(move || tester.send(&payload).unwrap());
            assert_eq!(ecu.recv().unwrap(), expected);
        });
    }

    #[test]
    fn test_overlong_message_is_rejected() {
        let (mut tester, _ecu) = link_pair();
        let payload = vec![0; MAX_MESSAGE_LEN + 1];
        assert!(matches!(
            tester.send(&payload),
            Err(TransportError::Overlong(4096))
        ));
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        let (tester, ecu) = link_pair();
        // handcrafted FF announcing 20 bytes, then a CF with the wrong sequence
        let tester_bus = tester.bus().clone();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                let ff = CanFrame::new(0x7E8, &[0x10, 20, 1, 2, 3, 4, 5, 6]);
                tester_bus.try_send(&ff).unwrap();
                // swallow the flow control, then misnumber the CF
                loop {
                    if let Some(frame) = tester_bus.try_recv().unwrap() {
                        assert_eq!(frame.data()[0] >> 4, 0x3);
                        break;
                    }
                    std::thread::sleep(Duration::from_micros(100));
                }
                let cf = CanFrame::new(0x7E8, &[0x23, 7, 8, 9, 10, 11, 12, 13]);
                tester_bus.try_send(&cf).unwrap();
            });
            // the ECU link receives from 0x7E8 here: swap roles so the
            // receiving side is the one under test
            let mut rx = IsoTpLink::new(
                ecu.bus().clone(),
                IsoTpConfig {
                    local_id: 0x7E0,
                    remote_id: 0x7E8,
                    response_timeout: Duration::from_millis(500),
                    consecutive_timeout: Duration::from_millis(200),
                    ..Default::default()
                },
            );
            let err = rx.recv().unwrap_err();
            assert!(matches!(err, TransportError::Sequence { expected: 1, got: 3 }));
        });
    }

    #[test]
    fn test_flow_control_abort() {
        let (mut tester, ecu) = link_pair();
        let ecu_bus = ecu.bus().clone();
        std::thread::scope(|scope| {
            scope.spawn(move || {
                // wait for the FF, then abort
                loop {
                    if let Some(frame) = ecu_bus.try_recv().unwrap() {
                        assert_eq!(frame.data()[0] >> 4, 0x1);
                        break;
                    }
                    std::thread::sleep(Duration::from_micros(100));
                }
                let fc = CanFrame::new(0x7E8, &[0x32, 0, 0]);
                ecu_bus.try_send(&fc).unwrap();
            });
            let payload = vec![0x11; 64];
            let err = tester.send(&payload).unwrap_err();
            assert!(matches!(err, TransportError::Abort));
        });
    }

    #[test]
    fn test_wide_filter_accepts_any_id() {
        let (tester, mut ecu) = link_pair();
        let frame = CanFrame::new(0x123, &[0x02, 0x50, 0x01]);
        tester.bus().try_send(&frame).unwrap();
        let payload = ecu.recv_filtered(FilterMode::Wide).unwrap();
        assert_eq!(payload, vec![0x50, 0x01]);
    }

    #[test]
    fn test_session_filter_times_out_on_foreign_id() {
        let (tester, mut ecu) = link_pair();
        ecu.config.response_timeout = Duration::from_millis(50);
        let frame = CanFrame::new(0x123, &[0x02, 0x50, 0x01]);
        tester.bus().try_send(&frame).unwrap();
        assert!(matches!(ecu.recv(), Err(TransportError::Timeout)));
    }
}
