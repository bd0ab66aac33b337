//! KWP2000 (ISO 14230) client over ISO-TP on CAN.
//!
//! Same transport as UDS but a different SID set: 1-byte local identifiers,
//! a transmission-mode byte on reads, and `reply = request + 0x40`.

use canbadger_core::CanBus;
use canbadger_isotp::{IsoTpConfig, IsoTpLink};

use crate::session::TesterPresent;
use crate::{DiagError, nrc};

pub mod sid {
    pub const START_DIAG_SESSION: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DTC: u8 = 0x13;
    pub const CLEAR_DTC: u8 = 0x14;
    pub const READ_ECU_ID: u8 = 0x1A;
    pub const STOP_DIAG_SESSION: u8 = 0x20;
    pub const READ_DATA_BY_LOCAL_ID: u8 = 0x21;
    pub const READ_DATA_BY_COMMON_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const START_ROUTINE_BY_LOCAL_ID: u8 = 0x31;
    pub const STOP_ROUTINE_BY_LOCAL_ID: u8 = 0x32;
    pub const REQUEST_ROUTINE_RESULTS_BY_LOCAL_ID: u8 = 0x33;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_DATA_BY_LOCAL_ID: u8 = 0x3B;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    pub const RESPONSE_OFFSET: u8 = 0x40;
}

/// Transmission modes for read requests
pub mod transmission_mode {
    pub const SINGLE: u8 = 0x01;
    pub const SLOW: u8 = 0x02;
    pub const MEDIUM: u8 = 0x03;
    pub const FAST: u8 = 0x04;
    pub const STOP: u8 = 0x05;
}

/// TesterPresent with a reply required (responseRequired = yes)
const TESTER_PRESENT_REPLY_REQUIRED: u8 = 0x01;

/// Request encoders, shared with the TP2.0 client which carries the same
/// application PDUs over its own transport.
pub mod encode {
    use super::{sid, transmission_mode};

    pub fn start_diag_session(session: u8) -> Vec<u8> {
        vec![sid::START_DIAG_SESSION, session]
    }

    pub fn stop_diag_session() -> Vec<u8> {
        vec![sid::STOP_DIAG_SESSION]
    }

    pub fn ecu_reset(reset_type: u8) -> Vec<u8> {
        vec![sid::ECU_RESET, reset_type]
    }

    pub fn tester_present() -> Vec<u8> {
        vec![sid::TESTER_PRESENT, super::TESTER_PRESENT_REPLY_REQUIRED]
    }

    pub fn read_ecu_id(id_type: u8) -> Vec<u8> {
        vec![sid::READ_ECU_ID, id_type]
    }

    pub fn read_data_by_local_id(record: u8) -> Vec<u8> {
        // single-shot mode makes the max-responses byte moot; 0xFF like the hardware tools
        vec![
            sid::READ_DATA_BY_LOCAL_ID,
            record,
            transmission_mode::SINGLE,
            0xFF,
        ]
    }

    pub fn write_data_by_local_id(record: u8, data: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::WRITE_DATA_BY_LOCAL_ID, record];
        request.extend_from_slice(data);
        request
    }

    pub fn read_data_by_common_id(id: u16) -> Vec<u8> {
        vec![
            sid::READ_DATA_BY_COMMON_ID,
            (id >> 8) as u8,
            id as u8,
            transmission_mode::SINGLE,
            0xFF,
        ]
    }

    pub fn read_memory_by_address(address: u32, size: u8, mode: u8) -> Vec<u8> {
        vec![
            sid::READ_MEMORY_BY_ADDRESS,
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
            size,
            mode,
        ]
    }

    pub fn write_memory_by_address(address: u32, data: &[u8]) -> Vec<u8> {
        let mut request = vec![
            sid::WRITE_MEMORY_BY_ADDRESS,
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
            data.len() as u8,
        ];
        request.extend_from_slice(data);
        request
    }

    pub fn request_seed(level: u8) -> Vec<u8> {
        vec![sid::SECURITY_ACCESS, level]
    }

    pub fn send_key(level: u8, key: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::SECURITY_ACCESS, level + 1];
        request.extend_from_slice(key);
        request
    }

    pub fn start_routine_by_local_id(routine: u8, params: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::START_ROUTINE_BY_LOCAL_ID, routine];
        request.extend_from_slice(params);
        request
    }

    pub fn stop_routine_by_local_id(routine: u8, params: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::STOP_ROUTINE_BY_LOCAL_ID, routine];
        request.extend_from_slice(params);
        request
    }

    pub fn routine_results_by_local_id(routine: u8) -> Vec<u8> {
        vec![sid::REQUEST_ROUTINE_RESULTS_BY_LOCAL_ID, routine]
    }

    pub fn read_dtcs(args: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::READ_DTC];
        request.extend_from_slice(args);
        request
    }

    pub fn clear_dtcs(args: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::CLEAR_DTC];
        request.extend_from_slice(args);
        request
    }

    pub fn request_upload(params: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::REQUEST_UPLOAD];
        request.extend_from_slice(params);
        request
    }

    pub fn request_download(params: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::REQUEST_DOWNLOAD];
        request.extend_from_slice(params);
        request
    }

    pub fn transfer_data(data: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::TRANSFER_DATA];
        request.extend_from_slice(data);
        request
    }

    pub fn request_transfer_exit(params: &[u8]) -> Vec<u8> {
        let mut request = vec![sid::REQUEST_TRANSFER_EXIT];
        request.extend_from_slice(params);
        request
    }
}

/// One trouble code as reported by ReadDiagnosticTroubleCodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dtc {
    pub code: u16,
    pub status: u8,
}

impl Dtc {
    /// `P0123`-style rendering; appends a marker when the MIL status bits are set
    #[must_use]
    pub fn describe(&self) -> String {
        let mut text = nrc::format_dtc(self.code);
        if self.status == 0xE0 {
            text.push_str(" (MIL on)");
        }
        text
    }
}

/// Parse the `count | [code_hi code_lo status]...` DTC list layout
#[must_use]
pub fn parse_dtc_list(payload: &[u8]) -> Vec<Dtc> {
    let Some((&count, rest)) = payload.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(3)
        .take(count as usize)
        .map(|chunk| Dtc {
            code: ((chunk[0] as u16) << 8) | chunk[1] as u16,
            status: chunk[2],
        })
        .collect()
}

pub struct KwpClient<B: CanBus> {
    link: IsoTpLink<B>,
    ticker: TesterPresent,
    in_session: bool,
    current_session: u8,
}

impl<B: CanBus> KwpClient<B> {
    pub fn new(bus: B, config: IsoTpConfig) -> Self {
        Self {
            link: IsoTpLink::new(bus, config),
            ticker: TesterPresent::new(),
            in_session: false,
            current_session: 0,
        }
    }

    pub fn set_transmission_parameters(&mut self, config: IsoTpConfig) {
        self.link.set_config(config);
    }

    #[inline]
    #[must_use]
    pub fn link(&self) -> &IsoTpLink<B> {
        &self.link
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

    pub fn end_session(&mut self) {
        self.set_session_status(false);
    }

    /// Drive the 500 ms TesterPresent schedule from the owning loop
    pub fn tick(&mut self) -> Result<(), DiagError> {
        if !self.in_session || !self.ticker.is_due() {
            return Ok(());
        }
        let outcome = self.request_response(&encode::tester_present());
        match outcome {
            Ok(response)
                if response.first() == Some(&(sid::TESTER_PRESENT + sid::RESPONSE_OFFSET)) =>
            {
                Ok(())
            }
            _ => {
                self.set_session_status(false);
                Err(DiagError::SessionLost)
            }
        }
    }

    /// One request/response exchange with pending-reply handling, keeping the
    /// TesterPresent schedule out of the way for the duration
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
        self.link.send(request)?;
        loop {
            let response = self.link.recv()?;
            if response.len() >= 3 && response[0] == sid::NEGATIVE_RESPONSE {
                if response[2] == nrc::RESPONSE_PENDING {
                    continue;
                }
                tracing::debug!(
                    "Negative response to SID {:#04X}: {}",
                    response[1],
                    nrc::describe_kwp(response[2])
                );
                return Err(DiagError::Negative {
                    sid: response[1],
                    nrc: response[2],
                });
            }
            return Ok(response);
        }
    }

    /// StartDiagnosticSession; marks the session active on a positive reply
    pub fn start_comms(&mut self, session: u8) -> Result<Vec<u8>, DiagError> {
        let response = self.request_response(&encode::start_diag_session(session))?;
        if response.first() == Some(&(sid::START_DIAG_SESSION + sid::RESPONSE_OFFSET)) {
            self.current_session = session;
            self.set_session_status(true);
        }
        Ok(response)
    }

    /// StopDiagnosticSession; always clears the session state
    pub fn stop_comms(&mut self) -> Result<Vec<u8>, DiagError> {
        let result = self.request_response(&encode::stop_diag_session());
        self.set_session_status(false);
        result
    }

    pub fn ecu_reset(&mut self, reset_type: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::ecu_reset(reset_type))
    }

    pub fn read_ecu_id(&mut self, id_type: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::read_ecu_id(id_type))
    }

    pub fn read_data_by_local_id(&mut self, record: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::read_data_by_local_id(record))
    }

    pub fn write_data_by_local_id(
        &mut self,
        record: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::write_data_by_local_id(record, data))
    }

    pub fn read_data_by_common_id(&mut self, id: u16) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::read_data_by_common_id(id))
    }

    pub fn read_memory_by_address(
        &mut self,
        address: u32,
        size: u8,
        mode: u8,
    ) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::read_memory_by_address(address, size, mode))
    }

    pub fn write_memory_by_address(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::write_memory_by_address(address, data))
    }

    pub fn request_seed(&mut self, level: u8) -> Result<Vec<u8>, DiagError> {
        let response = self.request_response(&encode::request_seed(level))?;
        Ok(response.get(2..).unwrap_or_default().to_vec())
    }

    pub fn send_key(&mut self, level: u8, key: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::send_key(level, key))
    }

    pub fn start_routine_by_local_id(
        &mut self,
        routine: u8,
        params: &[u8],
    ) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::start_routine_by_local_id(routine, params))
    }

    pub fn stop_routine_by_local_id(
        &mut self,
        routine: u8,
        params: &[u8],
    ) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::stop_routine_by_local_id(routine, params))
    }

    pub fn routine_results_by_local_id(&mut self, routine: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::routine_results_by_local_id(routine))
    }

    /// ReadDiagnosticTroubleCodes, returning the decoded list
    pub fn read_dtcs(&mut self, args: &[u8]) -> Result<Vec<Dtc>, DiagError> {
        let response = self.request_response(&encode::read_dtcs(args))?;
        Ok(parse_dtc_list(response.get(1..).unwrap_or_default()))
    }

    pub fn clear_dtcs(&mut self, args: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::clear_dtcs(args))
    }

    pub fn request_upload(&mut self, params: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::request_upload(params))
    }

    pub fn request_download(&mut self, params: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::request_download(params))
    }

    pub fn transfer_data(&mut self, data: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::transfer_data(data))
    }

    pub fn request_transfer_exit(&mut self, params: &[u8]) -> Result<Vec<u8>, DiagError> {
        self.request_response(&encode::request_transfer_exit(params))
    }
}
