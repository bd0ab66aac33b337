//! The capability struct: every peripheral the command handlers touch,
//! constructed once at startup. Tests build it from in-memory fakes.

use std::sync::atomic::{AtomicBool, Ordering};

use canbadger_core::{CanBus, Eeprom, SdCard};
use canbadger_settings::Settings;

pub struct Device<B: CanBus, E: Eeprom> {
    pub can1: B,
    pub can2: B,
    pub sd: SdCard,
    pub eeprom: E,
    pub settings: Settings,
    /// Cleared by STOP_CURRENT_ACTION; every long-running routine polls it
    pub running: AtomicBool,
}

impl<B: CanBus, E: Eeprom> Device<B, E> {
    pub fn new(can1: B, can2: B, sd: SdCard, mut eeprom: E) -> Self {
        let settings = Settings::restore(&sd, &mut eeprom);
        Self {
            can1,
            can2,
            sd,
            eeprom,
            settings,
            running: AtomicBool::new(false),
        }
    }

    /// Bus 1 or 2 by its wire number
    pub fn bus(&self, interface: u8) -> Option<&B> {
        match interface {
            1 => Some(&self.can1),
            2 => Some(&self.can2),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }
}
