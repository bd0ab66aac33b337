use std::fmt;

use serde::ser::SerializeStruct;

/// Highest valid 11-bit CAN identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Highest valid 29-bit CAN identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Wire encodings pack the extended flag into the top bit of the identifier
const EXTENDED_FLAG: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameFormat {
    #[default]
    Standard,
    Extended,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameKind {
    #[default]
    Data,
    Remote,
}

/// A single Classical CAN frame: up to 8 payload bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub format: FrameFormat,
    pub kind: FrameKind,
    pub dlc: usize,

    data: [u8; 8],
}

impl CanFrame {
    /// Build a data frame, inferring [FrameFormat::Extended] for IDs above 11 bits
    pub fn new(id: u32, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= 8, "CAN payloads are at most 8 bytes");
        debug_assert!(id <= MAX_EXTENDED_ID, "CAN IDs are at most 29 bits");
        let format = if id > MAX_STANDARD_ID {
            FrameFormat::Extended
        } else {
            FrameFormat::Standard
        };
        let dlc = payload.len().min(8);
        let mut data = [0; 8];
        data[..dlc].copy_from_slice(&payload[..dlc]);
        Self {
            id,
            format,
            kind: FrameKind::Data,
            dlc,
            data,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: FrameFormat) -> Self {
        self.format = format;
        self
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc]
    }

    /// The full 8-byte payload buffer, including bytes past the DLC
    #[inline]
    #[must_use]
    pub fn raw_data(&self) -> &[u8; 8] {
        &self.data
    }

    /// The identifier with the extended flag packed into the top bit
    #[inline]
    #[must_use]
    pub fn wire_id(&self) -> u32 {
        match self.format {
            FrameFormat::Standard => self.id,
            FrameFormat::Extended => self.id | EXTENDED_FLAG,
        }
    }

    /// Recover a frame ID from its [CanFrame::wire_id] encoding
    #[inline]
    #[must_use]
    pub fn from_wire_id(wire_id: u32, payload: &[u8]) -> Self {
        let frame = Self::new(wire_id & !EXTENDED_FLAG, payload);
        if wire_id & EXTENDED_FLAG != 0 {
            frame.with_format(FrameFormat::Extended)
        } else {
            frame
        }
    }
}

/// candump -L style rendering: `123#DEADBEEF`
impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            FrameFormat::Standard => write!(f, "{:03X}#", self.id)?,
            FrameFormat::Extended => write!(f, "{:08X}#", self.id)?,
        }
        write!(f, "{}", hex::encode_upper(self.data()))
    }
}

impl serde::Serialize for CanFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CanFrame", 4)?;
        state.serialize_field("canid", &format!("{:#X}", self.id))?;
        state.serialize_field("extended", &(self.format == FrameFormat::Extended))?;
        state.serialize_field("dlc", &self.dlc)?;
        state.serialize_field("data", &hex::encode_upper(self.data()))?;
        state.end()
    }
}
