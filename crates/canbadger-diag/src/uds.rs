//! UDS (ISO 14229) client over ISO-TP.

use canbadger_core::CanBus;
use canbadger_isotp::{IsoTpConfig, IsoTpLink};

use crate::session::TesterPresent;
use crate::{DiagError, nrc};

pub mod sid {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
    pub const READ_DTC_INFORMATION: u8 = 0x19;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// Positive replies echo the SID plus this offset
    pub const RESPONSE_OFFSET: u8 = 0x40;
}

/// Append the low `len` bytes of `value`, big-endian
fn push_be(buf: &mut Vec<u8>, value: u64, len: u8) {
    for i in (0..len).rev() {
        buf.push((value >> (8 * i)) as u8);
    }
}

/// addressAndLengthFormatIdentifier: size length in the high nibble,
/// address length in the low nibble
fn alfid(address_len: u8, size_len: u8) -> u8 {
    debug_assert!(address_len <= 0xF && size_len <= 0xF);
    (size_len << 4) | address_len
}

pub struct UdsClient<B: CanBus> {
    link: IsoTpLink<B>,
    ticker: TesterPresent,
    in_session: bool,
    current_session: u8,
}

impl<B: CanBus> UdsClient<B> {
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

    /// Start or stop the session bookkeeping without any handshake.
    ///
    /// Used when inheriting another tester's authenticated session.
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

    /// Drive the 500 ms TesterPresent schedule.
    ///
    /// Call from the owning event loop. Returns [DiagError::SessionLost] (and
    /// clears the session) when the keep-alive goes unanswered.
    pub fn tick(&mut self) -> Result<(), DiagError> {
        if !self.in_session || !self.ticker.is_due() {
            return Ok(());
        }
        match self.tester_present() {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!("TesterPresent went unanswered: {e}");
                self.set_session_status(false);
                Err(DiagError::SessionLost)
            }
        }
    }

    /// One request/response exchange.
    ///
    /// The TesterPresent schedule is suspended for the duration and resumed
    /// afterwards. `7F xx 78` response-pending replies are consumed
    /// internally; the caller always sees a final outcome.
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
                    tracing::trace!("Response pending for SID {:#04X}", response[1]);
                    continue;
                }
                tracing::debug!(
                    "Negative response to SID {:#04X}: {}",
                    response[1],
                    nrc::describe_uds(response[2])
                );
                return Err(DiagError::Negative {
                    sid: response[1],
                    nrc: response[2],
                });
            }
            return Ok(response);
        }
    }

    /// DiagnosticSessionControl: on a positive reply the session is marked
    /// active and the TesterPresent schedule starts.
    pub fn start_diag_session(&mut self, session_type: u8) -> Result<Vec<u8>, DiagError> {
        let response =
            self.request_response(&[sid::DIAGNOSTIC_SESSION_CONTROL, session_type])?;
        self.current_session = session_type;
        self.set_session_status(true);
        Ok(response)
    }

    pub fn ecu_reset(&mut self, reset_type: u8) -> Result<Vec<u8>, DiagError> {
        self.request_response(&[sid::ECU_RESET, reset_type])
    }

    pub fn tester_present(&mut self) -> Result<Vec<u8>, DiagError> {
        let response = self.request_response(&[sid::TESTER_PRESENT, 0x00])?;
        if response.first() != Some(&(sid::TESTER_PRESENT + sid::RESPONSE_OFFSET)) {
            return Err(DiagError::SessionLost);
        }
        Ok(response)
    }

    /// ClearDiagnosticInformation for a 3-byte DTC group
    pub fn clear_diagnostic_information(&mut self, group: u32) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::CLEAR_DIAGNOSTIC_INFORMATION];
        push_be(&mut request, group as u64, 3);
        self.request_response(&request)
    }

    pub fn read_dtc_information(
        &mut self,
        subfunction: u8,
        args: &[u8],
    ) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::READ_DTC_INFORMATION, subfunction];
        request.extend_from_slice(args);
        self.request_response(&request)
    }

    pub fn read_data_by_identifier(&mut self, did: u16) -> Result<Vec<u8>, DiagError> {
        self.request_response(&[sid::READ_DATA_BY_IDENTIFIER, (did >> 8) as u8, did as u8])
    }

    pub fn write_data_by_identifier(
        &mut self,
        did: u16,
        data: &[u8],
    ) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::WRITE_DATA_BY_IDENTIFIER, (did >> 8) as u8, did as u8];
        request.extend_from_slice(data);
        self.request_response(&request)
    }

    pub fn read_memory_by_address(
        &mut self,
        address: u64,
        address_len: u8,
        size: u64,
        size_len: u8,
    ) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::READ_MEMORY_BY_ADDRESS, alfid(address_len, size_len)];
        push_be(&mut request, address, address_len);
        push_be(&mut request, size, size_len);
        self.request_response(&request)
    }

    pub fn write_memory_by_address(
        &mut self,
        address: u64,
        address_len: u8,
        data: &[u8],
        size_len: u8,
    ) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::WRITE_MEMORY_BY_ADDRESS, alfid(address_len, size_len)];
        push_be(&mut request, address, address_len);
        push_be(&mut request, data.len() as u64, size_len);
        request.extend_from_slice(data);
        self.request_response(&request)
    }

    /// SecurityAccess seed request; returns the seed bytes
    pub fn request_seed(&mut self, level: u8) -> Result<Vec<u8>, DiagError> {
        let response = self.request_response(&[sid::SECURITY_ACCESS, level])?;
        Ok(response.get(2..).unwrap_or_default().to_vec())
    }

    /// SecurityAccess key reply for `level + 1`
    pub fn send_key(&mut self, level: u8, key: &[u8]) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::SECURITY_ACCESS, level + 1];
        request.extend_from_slice(key);
        self.request_response(&request)
    }

    pub fn communication_control(
        &mut self,
        control: u8,
        communication_type: u8,
    ) -> Result<Vec<u8>, DiagError> {
        self.request_response(&[sid::COMMUNICATION_CONTROL, control, communication_type])
    }

    pub fn request_upload(
        &mut self,
        compression: u8,
        address: u64,
        address_len: u8,
        size: u64,
        size_len: u8,
    ) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![
            sid::REQUEST_UPLOAD,
            compression,
            alfid(address_len, size_len),
        ];
        push_be(&mut request, address, address_len);
        push_be(&mut request, size, size_len);
        self.request_response(&request)
    }

    pub fn request_download(
        &mut self,
        compression: u8,
        address: u64,
        address_len: u8,
        size: u64,
        size_len: u8,
    ) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![
            sid::REQUEST_DOWNLOAD,
            compression,
            alfid(address_len, size_len),
        ];
        push_be(&mut request, address, address_len);
        push_be(&mut request, size, size_len);
        self.request_response(&request)
    }

    pub fn transfer_data(&mut self, sequence: u8, data: &[u8]) -> Result<Vec<u8>, DiagError> {
        let mut request = vec![sid::TRANSFER_DATA, sequence];
        request.extend_from_slice(data);
        self.request_response(&request)
    }

    pub fn request_transfer_exit(&mut self) -> Result<Vec<u8>, DiagError> {
        self.request_response(&[sid::REQUEST_TRANSFER_EXIT])
    }
}
