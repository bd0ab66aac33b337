//! Length-tagged capture records, as stored in the frame ring and shipped in
//! DATA messages during a logging session.

use byteorder::{BigEndian, ByteOrder};

use crate::frame::{CanFrame, FrameFormat};

/// Flag bits in the first header byte of a record
pub mod flags {
    pub const BUS1: u8 = 1 << 0;
    pub const BUS2: u8 = 1 << 1;
    pub const CAN: u8 = 1 << 2;
    pub const KLINE: u8 = 1 << 3;
    pub const STANDARD: u8 = 1 << 4;
    pub const EXTENDED: u8 = 1 << 5;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record header truncated: {0} bytes available")]
    TruncatedHeader(usize),
    #[error("record payload truncated: header says {expected} bytes, {available} available")]
    TruncatedPayload { expected: usize, available: usize },
    #[error("no record found in buffer")]
    Empty,
}

/// One captured frame: a fixed 14-byte header followed by the payload.
///
/// | offset | size | field                                        |
/// |--------|------|----------------------------------------------|
/// | 0      | 1    | flag bits ([flags])                          |
/// | 1      | 4    | capture timestamp in ms, big-endian          |
/// | 5      | 4    | frame ID, big-endian                         |
/// | 9      | 4    | interface bit-rate, big-endian               |
/// | 13     | 1    | payload length (1..=255)                     |
///
/// A zero flag byte never occurs in a real record, so runs of `0x00` act as
/// skip markers that a decoder steps over to resynchronize.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub flags: u8,
    pub timestamp_ms: u32,
    pub id: u32,
    pub bitrate: u32,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub const HEADER_LEN: usize = 14;
    pub const MAX_PAYLOAD: usize = 255;

    /// Build a record for a CAN frame captured on bus 1 or 2
    pub fn from_can_frame(frame: &CanFrame, bus: u8, timestamp_ms: u32, bitrate: u32) -> Self {
        debug_assert!(bus == 1 || bus == 2);
        let mut record_flags = flags::CAN;
        record_flags |= if bus == 1 { flags::BUS1 } else { flags::BUS2 };
        record_flags |= match frame.format {
            FrameFormat::Standard => flags::STANDARD,
            FrameFormat::Extended => flags::EXTENDED,
        };
        Self {
            flags: record_flags,
            timestamp_ms,
            id: frame.id,
            bitrate,
            payload: frame.data().to_vec(),
        }
    }

    /// Recover the CAN frame this record captured, if it is a CAN record
    #[must_use]
    pub fn to_can_frame(&self) -> Option<CanFrame> {
        if self.flags & flags::CAN == 0 {
            return None;
        }
        let frame = CanFrame::new(self.id, &self.payload);
        let frame = if self.flags & flags::EXTENDED != 0 {
            frame.with_format(FrameFormat::Extended)
        } else {
            frame.with_format(FrameFormat::Standard)
        };
        Some(frame)
    }

    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0; self.encoded_len()];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into `buf`, which must hold at least [LogRecord::encoded_len] bytes.
    /// Returns the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        debug_assert!(!self.payload.is_empty(), "empty payloads encode as skip markers");
        debug_assert!(self.payload.len() <= Self::MAX_PAYLOAD);
        buf[0] = self.flags;
        BigEndian::write_u32(&mut buf[1..5], self.timestamp_ms);
        BigEndian::write_u32(&mut buf[5..9], self.id);
        BigEndian::write_u32(&mut buf[9..13], self.bitrate);
        buf[13] = self.payload.len() as u8;
        buf[Self::HEADER_LEN..self.encoded_len()].copy_from_slice(&self.payload);
        self.encoded_len()
    }

    /// Decode the first record in `buf`, skipping any leading `0x00` run.
    ///
    /// Returns the record and the total number of bytes consumed, including
    /// skipped bytes.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RecordError> {
        let skipped = buf.iter().take_while(|&&b| b == 0).count();
        let buf = &buf[skipped..];
        if buf.is_empty() {
            return Err(RecordError::Empty);
        }
        if buf.len() < Self::HEADER_LEN {
            return Err(RecordError::TruncatedHeader(buf.len()));
        }
        let payload_len = buf[13] as usize;
        if buf.len() < Self::HEADER_LEN + payload_len {
            return Err(RecordError::TruncatedPayload {
                expected: payload_len,
                available: buf.len() - Self::HEADER_LEN,
            });
        }
        let record = Self {
            flags: buf[0],
            timestamp_ms: BigEndian::read_u32(&buf[1..5]),
            id: BigEndian::read_u32(&buf[5..9]),
            bitrate: BigEndian::read_u32(&buf[9..13]),
            payload: buf[Self::HEADER_LEN..Self::HEADER_LEN + payload_len].to_vec(),
        };
        let consumed = skipped + record.encoded_len();
        Ok((record, consumed))
    }
}
