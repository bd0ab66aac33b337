//! The control-plane wire format:
//! `[type u8][action u8][data_length u32 LE][data]`.

use byteorder::{ByteOrder, LittleEndian};
use canbadger_core::StorageError;
use canbadger_isotp::TransportError;

pub const HEADER_LEN: usize = 6;
/// Hard bound on a message body
pub const MAX_DATA_LEN: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("message framing violated: {0}")]
    BadFraming(String),
    #[error("unknown message type {0:#04X}")]
    UnknownKind(u8),
    #[error("unknown action type {0:#04X}")]
    UnknownAction(u8),
    #[error("no server connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ack = 0,
    Nack = 1,
    Data = 2,
    Action = 3,
    Connect = 4,
    Debug = 5,
}

impl MessageKind {
    fn from_u8(value: u8) -> Result<Self, ControlError> {
        Ok(match value {
            0 => MessageKind::Ack,
            1 => MessageKind::Nack,
            2 => MessageKind::Data,
            3 => MessageKind::Action,
            4 => MessageKind::Connect,
            5 => MessageKind::Debug,
            other => return Err(ControlError::UnknownKind(other)),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionKind {
    NoType = 0,
    Settings = 1,
    EepromWrite = 2,
    LogRawCanTraffic = 3,
    EnableTestmode = 4,
    StopCurrentAction = 5,
    Reset = 6,
    StartUds = 7,
    StartTp = 8,
    Uds = 9,
    Tp = 10,
    Hijack = 11,
    Mitm = 12,
    UpdateSd = 13,
    DownloadFile = 14,
    DeleteFile = 15,
    ReceiveRules = 16,
    AddRule = 17,
    EnableMitmMode = 18,
    StartReplay = 19,
    Relay = 20,
    Led = 21,
}

impl ActionKind {
    fn from_u8(value: u8) -> Result<Self, ControlError> {
        Ok(match value {
            0 => ActionKind::NoType,
            1 => ActionKind::Settings,
            2 => ActionKind::EepromWrite,
            3 => ActionKind::LogRawCanTraffic,
            4 => ActionKind::EnableTestmode,
            5 => ActionKind::StopCurrentAction,
            6 => ActionKind::Reset,
            7 => ActionKind::StartUds,
            8 => ActionKind::StartTp,
            9 => ActionKind::Uds,
            10 => ActionKind::Tp,
            11 => ActionKind::Hijack,
            12 => ActionKind::Mitm,
            13 => ActionKind::UpdateSd,
            14 => ActionKind::DownloadFile,
            15 => ActionKind::DeleteFile,
            16 => ActionKind::ReceiveRules,
            17 => ActionKind::AddRule,
            18 => ActionKind::EnableMitmMode,
            19 => ActionKind::StartReplay,
            20 => ActionKind::Relay,
            21 => ActionKind::Led,
            other => return Err(ControlError::UnknownAction(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub action: ActionKind,
    pub data: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn ack() -> Self {
        Self {
            kind: MessageKind::Ack,
            action: ActionKind::NoType,
            data: Vec::new(),
        }
    }

    /// NACKs carry no payload
    #[must_use]
    pub fn nack() -> Self {
        Self {
            kind: MessageKind::Nack,
            action: ActionKind::NoType,
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn data(action: ActionKind, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Data,
            action,
            data,
        }
    }

    #[must_use]
    pub fn action(action: ActionKind, data: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Action,
            action,
            data,
        }
    }

    #[must_use]
    pub fn debug(text: &str) -> Self {
        Self {
            kind: MessageKind::Debug,
            action: ActionKind::NoType,
            data: text.as_bytes().to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0; HEADER_LEN + self.data.len()];
        buf[0] = self.kind as u8;
        buf[1] = self.action as u8;
        LittleEndian::write_u32(&mut buf[2..6], self.data.len() as u32);
        buf[HEADER_LEN..].copy_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < HEADER_LEN {
            return Err(ControlError::BadFraming(format!(
                "{} bytes is shorter than the 6-byte header",
                buf.len()
            )));
        }
        let kind = MessageKind::from_u8(buf[0])?;
        let action = ActionKind::from_u8(buf[1])?;
        let length = LittleEndian::read_u32(&buf[2..6]) as usize;
        if length > MAX_DATA_LEN {
            return Err(ControlError::BadFraming(format!(
                "declared length {length} exceeds the {MAX_DATA_LEN}-byte bound"
            )));
        }
        if buf.len() < HEADER_LEN + length {
            return Err(ControlError::BadFraming(format!(
                "declared length {length} but only {} bytes follow the header",
                buf.len() - HEADER_LEN
            )));
        }
        Ok(Self {
            kind,
            action,
            data: buf[HEADER_LEN..HEADER_LEN + length].to_vec(),
        })
    }
}

/// Pack a diagnostic exchange outcome into the legacy 32-bit word the
/// control plane exchanges: low 16 bits carry the response length, the high
/// 16 bits carry `SID << 8 | NRC` for a negative response and zero on
/// success. A hard transport failure packs to all-zero.
#[must_use]
pub fn pack_diag_result(result: &Result<Vec<u8>, canbadger_diag::DiagError>) -> u32 {
    match result {
        Ok(response) => response.len() as u32 & 0xFFFF,
        Err(canbadger_diag::DiagError::Negative { sid, nrc }) => {
            ((*sid as u32) << 8 | *nrc as u32) << 16
        }
        Err(_) => 0,
    }
}
