//! Transparent two-bus bridge with the hijack FSM watching the traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canbadger_core::{BusError, CanBus, CanFrame};

use crate::fsm::{ECU_BUS, HijackFsm, HijackOutcome, HijackProtocol, Observation, TESTER_BUS};

/// Bounded forwarding retry, like the MITM engine's
const FORWARD_TIMEOUT: Duration = Duration::from_millis(10);

/// Bridges the ECU bus and the tester bus while watching for a
/// SecurityAccess handshake to inherit.
pub struct SecurityHijack<B1: CanBus, B2: CanBus, P: HijackProtocol> {
    ecu_bus: B1,
    tester_bus: B2,
    fsm: HijackFsm<P>,
}

impl<B1: CanBus, B2: CanBus, P: HijackProtocol> SecurityHijack<B1, B2, P> {
    pub fn new(ecu_bus: B1, tester_bus: B2, protocol: P) -> Self {
        Self {
            ecu_bus,
            tester_bus,
            fsm: HijackFsm::new(protocol),
        }
    }

    /// One polling pass over both buses.
    ///
    /// Every frame is forwarded to the opposite bus regardless of what the
    /// FSM makes of it; the legitimate tester never notices the observer.
    pub fn step(&mut self) -> Result<Option<HijackOutcome>, BusError> {
        let mut outcome = None;
        if let Some(frame) = self.ecu_bus.try_recv()? {
            outcome = self.fsm.observe(&Observation {
                bus: ECU_BUS,
                id: frame.id,
                data: frame.data(),
            });
            self.forward(&frame, TESTER_BUS);
        }
        if outcome.is_none() {
            if let Some(frame) = self.tester_bus.try_recv()? {
                outcome = self.fsm.observe(&Observation {
                    bus: TESTER_BUS,
                    id: frame.id,
                    data: frame.data(),
                });
                self.forward(&frame, ECU_BUS);
            }
        }
        Ok(outcome)
    }

    /// Run the bridge until the handshake is captured or `running` clears
    pub fn run(&mut self, running: &AtomicBool) -> Result<Option<HijackOutcome>, BusError> {
        while running.load(Ordering::Relaxed) {
            if let Some(outcome) = self.step()? {
                return Ok(Some(outcome));
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        Ok(None)
    }

    fn forward(&self, frame: &CanFrame, to_bus: u8) {
        let result = if to_bus == ECU_BUS {
            self.ecu_bus.send(frame, FORWARD_TIMEOUT)
        } else {
            self.tester_bus.send(frame, FORWARD_TIMEOUT)
        };
        if let Err(e) = result {
            tracing::warn!("Bridge dropped frame {frame}: {e}");
        }
    }
}
