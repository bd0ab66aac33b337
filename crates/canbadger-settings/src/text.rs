//! The line-oriented `key: value` settings file kept on the SD card.

use std::fmt::Write;

use crate::{Settings, StatusBit};

impl Settings {
    /// Render the settings file: the ID, the 30 status bits, the interface
    /// speeds, and the IP (or `DHCP`) last.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "id: {}", self.id);
        for bit in StatusBit::ALL {
            let _ = writeln!(out, "{}: {}", bit.key(), u8::from(self.get(bit)));
        }
        let _ = writeln!(out, "SPISpeed: {}", self.spi_speed);
        let _ = writeln!(out, "CAN1Speed: {}", self.can1_speed);
        let _ = writeln!(out, "CAN2Speed: {}", self.can2_speed);
        let _ = writeln!(out, "KLINE1Speed: {}", self.kline1_speed);
        let _ = writeln!(out, "KLINE2Speed: {}", self.kline2_speed);
        let _ = writeln!(out, "IP: {}", self.ip);
        out
    }

    /// Apply `key: value` lines on top of the current values.
    ///
    /// Unknown keys and lines without a separator are ignored; keys and
    /// values are whitespace-trimmed so DOS line endings survive.
    pub fn apply_text(&mut self, text: &str) {
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "id" => self.id = value.to_string(),
                "IP" => self.ip = value.to_string(),
                "SPISpeed" => self.spi_speed = parse_or_keep(value, self.spi_speed),
                "CAN1Speed" => self.can1_speed = parse_or_keep(value, self.can1_speed),
                "CAN2Speed" => self.can2_speed = parse_or_keep(value, self.can2_speed),
                "KLINE1Speed" => self.kline1_speed = parse_or_keep(value, self.kline1_speed),
                "KLINE2Speed" => self.kline2_speed = parse_or_keep(value, self.kline2_speed),
                other => match StatusBit::from_key(other) {
                    Some(bit) => self.set(bit, value != "0"),
                    None => tracing::trace!("Ignoring unknown settings key {other:?}"),
                },
            }
        }
    }
}

fn parse_or_keep(value: &str, current: u32) -> u32 {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!("Unparseable numeric setting {value:?}, keeping {current}");
            current
        }
    }
}
