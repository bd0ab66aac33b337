//! The forwarding loop: read both buses, look each frame up in the rule
//! store, apply the first matching rule, and retransmit on the opposite bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canbadger_core::{CanBus, CanFrame, Storage, StorageError};

use crate::rule::ActionOutcome;
use crate::store::RuleStore;

/// Transmit retry budget: 100 polls of 100 us
const FORWARD_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MitmStats {
    pub forwarded: u64,
    pub transformed: u64,
    pub dropped: u64,
}

pub struct Mitm<B1: CanBus, B2: CanBus, S: Storage> {
    bus1: B1,
    bus2: B2,
    store: RuleStore<S>,
    stats: MitmStats,
}

impl<B1: CanBus, B2: CanBus, S: Storage> Mitm<B1, B2, S> {
    pub fn new(bus1: B1, bus2: B2, store: RuleStore<S>) -> Self {
        Self {
            bus1,
            bus2,
            store,
            stats: MitmStats::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> MitmStats {
        self.stats
    }

    pub fn store_mut(&mut self) -> &mut RuleStore<S> {
        &mut self.store
    }

    /// One polling pass over both directions; returns true when neither bus
    /// had a frame. Polling both every pass keeps a burst on one bus from
    /// starving the other.
    pub fn step(&mut self) -> Result<bool, StorageError> {
        let mut idle = true;
        if let Ok(Some(frame)) = self.bus1.try_recv() {
            idle = false;
            self.process(&frame, 1)?;
        }
        if let Ok(Some(frame)) = self.bus2.try_recv() {
            idle = false;
            self.process(&frame, 2)?;
        }
        Ok(idle)
    }

    /// Forward frames between the buses until `running` goes false
    pub fn run(&mut self, running: &AtomicBool) -> Result<MitmStats, StorageError> {
        while running.load(Ordering::Relaxed) {
            if self.step()? {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        tracing::info!(
            "MITM stopped: {} forwarded, {} transformed, {} dropped",
            self.stats.forwarded,
            self.stats.transformed,
            self.stats.dropped
        );
        Ok(self.stats)
    }

    /// Handle one frame arriving on `source_bus`
    pub fn process(&mut self, frame: &CanFrame, source_bus: u8) -> Result<(), StorageError> {
        let outgoing = match self.transform(frame)? {
            Some(frame) => frame,
            None => {
                self.stats.dropped += 1;
                return Ok(());
            }
        };
        let result = if source_bus == 1 {
            self.bus2.send(&outgoing, FORWARD_TIMEOUT)
        } else {
            self.bus1.send(&outgoing, FORWARD_TIMEOUT)
        };
        if let Err(e) = result {
            tracing::warn!("Dropping frame {outgoing}: {e}");
        }
        Ok(())
    }

    /// Apply the first matching rule; `None` means the frame is swallowed
    fn transform(&mut self, frame: &CanFrame) -> Result<Option<CanFrame>, StorageError> {
        let format = self.store.format();
        let pass_through = Some(frame.with_format(format));

        let Some(offset) = self.store.lookup(frame.id) else {
            self.stats.forwarded += 1;
            return Ok(pass_through);
        };

        for slot in 0..crate::store::RULES_PER_TARGET {
            let Some(rule) = self.store.rule_at(offset, slot)? else {
                break;
            };
            match rule.matches(frame.data()) {
                Some(false) => continue,
                Some(true) => match rule.apply(frame.data()) {
                    ActionOutcome::Transform(payload) => {
                        self.stats.transformed += 1;
                        let outgoing = CanFrame::new(frame.id, &payload).with_format(format);
                        return Ok(Some(outgoing));
                    }
                    ActionOutcome::Drop => return Ok(None),
                    ActionOutcome::Unknown => {
                        self.stats.forwarded += 1;
                        return Ok(pass_through);
                    }
                },
                // unknown condition type: stop walking, forward as-is
                None => {
                    self.stats.forwarded += 1;
                    return Ok(pass_through);
                }
            }
        }
        self.stats.forwarded += 1;
        Ok(pass_through)
    }
}

#[cfg(test)]
mod tests {
    use canbadger_core::{FrameFormat, MemStorage, SimBus, bus_pair};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::rule::{Rule, action, condition, parse_rules};

    /// An engine between two bus pairs; returns the far ends for injection
    /// and observation
    fn engine_with_rules(text: &str) -> (Mitm<SimBus, SimBus, MemStorage>, SimBus, SimBus) {
        let (side1, far1) = bus_pair();
        let (side2, far2) = bus_pair();
        let mut store = RuleStore::new(MemStorage::new(), FrameFormat::Standard).unwrap();
        for (target, rule) in parse_rules(text) {
            store.insert(target, &rule).unwrap();
        }
        (Mitm::new(side1, side2, store), far1, far2)
    }

    #[test]
    fn test_unindexed_frame_forwards_verbatim() {
        let (mut mitm, far1, far2) = engine_with_rules("");
        let frame = CanFrame::new(0x555, &[0xDE, 0xAD]);
        far1.try_send(&frame).unwrap();
        let incoming = mitm.bus1.try_recv().unwrap().unwrap();
        mitm.process(&incoming, 1).unwrap();
        assert_eq!(far2.try_recv().unwrap(), Some(frame));
        assert_eq!(mitm.stats().forwarded, 1);
    }

    #[test]
    fn test_masked_swap_scenario() {
        // swap byte 0 to 0xFF when it equals 0x00 on ID 0x100
        let (mut mitm, far1, far2) =
            engine_with_rules("0x0101,0x100,0,0,0,0,0,0,0,0,0x0101,0xFF,0,0,0,0,0,0,0");

        let matching = CanFrame::new(0x100, &[0x00, 0x11, 0x22]);
        far1.try_send(&matching).unwrap();
        let incoming = mitm.bus1.try_recv().unwrap().unwrap();
        mitm.process(&incoming, 1).unwrap();
        let out = far2.try_recv().unwrap().unwrap();
        assert_eq!(out.data(), &[0xFF, 0x11, 0x22]);
        assert_eq!(out.id, 0x100);

        // a frame failing the condition passes unchanged
        let unmatched = CanFrame::new(0x100, &[0x05, 0x11, 0x22]);
        far1.try_send(&unmatched).unwrap();
        let incoming = mitm.bus1.try_recv().unwrap().unwrap();
        mitm.process(&incoming, 1).unwrap();
        assert_eq!(far2.try_recv().unwrap(), Some(unmatched));
        assert_eq!(mitm.stats().transformed, 1);
        assert_eq!(mitm.stats().forwarded, 1);
    }

    #[test]
    fn test_drop_rule_swallows_frame() {
        let (mut mitm, far1, far2) =
            engine_with_rules("0x0000,0x200,0,0,0,0,0,0,0,0,8,0,0,0,0,0,0,0,0");
        let frame = CanFrame::new(0x200, &[0x01]);
        far1.try_send(&frame).unwrap();
        let incoming = mitm.bus1.try_recv().unwrap().unwrap();
        mitm.process(&incoming, 1).unwrap();
        assert_eq!(far2.try_recv().unwrap(), None);
        assert_eq!(mitm.stats().dropped, 1);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut store = RuleStore::new(MemStorage::new(), FrameFormat::Standard).unwrap();
        let first = Rule {
            condition_mask: 0x01,
            condition_type: condition::MASKED_EXACT,
            condition_payload: [0x01, 0, 0, 0, 0, 0, 0, 0],
            action_mask: 0x01,
            action_type: action::REPLACE_MASKED,
            action_payload: [0xAA, 0, 0, 0, 0, 0, 0, 0],
        };
        let second = Rule {
            action_payload: [0xBB, 0, 0, 0, 0, 0, 0, 0],
            ..first
        };
        store.insert(0x300, &first).unwrap();
        store.insert(0x300, &second).unwrap();

        let (side1, _far1) = bus_pair();
        let (side2, far2) = bus_pair();
        let mut mitm = Mitm::new(side1, side2, store);
        mitm.process(&CanFrame::new(0x300, &[0x01, 0x02]), 1).unwrap();
        let out = far2.try_recv().unwrap().unwrap();
        assert_eq!(out.data(), &[0xAA, 0x02]);
    }

    #[test]
    fn test_reverse_direction_forwards_to_bus1() {
        let (mut mitm, far1, far2) = engine_with_rules("");
        let frame = CanFrame::new(0x42, &[0x99]);
        far2.try_send(&frame).unwrap();
        let incoming = mitm.bus2.try_recv().unwrap().unwrap();
        mitm.process(&incoming, 2).unwrap();
        assert_eq!(far1.try_recv().unwrap(), Some(frame));
    }

    #[test]
    fn test_run_honors_stop_flag() {
        let (mut mitm, far1, far2) = engine_with_rules("");
        let running = AtomicBool::new(true);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..10u8 {
                    far1.try_send(&CanFrame::new(0x10, &[i])).unwrap();
                }
                std::thread::sleep(Duration::from_millis(50));
                running.store(false, Ordering::Relaxed);
            });
            let stats = mitm.run(&running).unwrap();
            assert_eq!(stats.forwarded, 10);
        });
        for i in 0..10u8 {
            assert_eq!(far2.try_recv().unwrap().unwrap().data(), &[i]);
        }
    }
}
