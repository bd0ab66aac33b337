pub mod eeprom;
pub mod status;
pub mod text;

pub use status::StatusBit;

use canbadger_core::{Eeprom, SdCard};

/// Default settings file on the SD card
pub const DEFAULT_PATH: &str = "/canbadger_settings.txt";
/// Dropping this file on the card wipes the EEPROM on the next restore
pub const RESET_SENTINEL: &str = "/RESET_SETTINGS.txt";

pub const MAX_ID_LEN: usize = 32;
pub const MAX_IP_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Device name broadcast in the discovery beacon
    pub id: String,
    /// Static address, or "DHCP"
    pub ip: String,
    pub status: u32,
    pub spi_speed: u32,
    pub can1_speed: u32,
    pub can2_speed: u32,
    pub kline1_speed: u32,
    pub kline2_speed: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let mut settings = Self {
            id: String::from("CANBADGER"),
            ip: String::from("DHCP"),
            status: 0,
            spi_speed: 20_000_000,
            can1_speed: 500_000,
            can2_speed: 500_000,
            kline1_speed: 10_400,
            kline2_speed: 10_400,
        };
        settings.set(StatusBit::Can1Standard, true);
        settings.set(StatusBit::Can2Standard, true);
        settings
    }
}

impl Settings {
    /// Defaults with the device ID derived from the EEPROM unique ID
    pub fn with_uid(uid: &[u8; 6]) -> Self {
        Self {
            id: format!("{:X}{:X}{:X}{:X}", uid[0], uid[2], uid[4], uid[5]),
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, bit: StatusBit) -> bool {
        self.status & bit.mask() != 0
    }

    pub fn set(&mut self, bit: StatusBit, on: bool) {
        if on {
            self.status |= bit.mask();
        } else {
            self.status &= !bit.mask();
        }
    }

    #[inline]
    #[must_use]
    pub fn use_dhcp(&self) -> bool {
        self.ip == "DHCP"
    }

    /// Truncate the ID and IP to their wire limits
    pub fn clamp_lengths(&mut self) {
        self.id.truncate(MAX_ID_LEN);
        self.ip.truncate(MAX_IP_LEN);
    }

    /// Bring the settings up from persistent storage, in the firmware's
    /// precedence order: a `RESET_SETTINGS.txt` sentinel wipes the EEPROM
    /// first; then the EEPROM-named settings file, the default settings
    /// file, and the EEPROM blob are tried in turn; finally defaults apply
    /// and a best-effort persist writes them back out.
    pub fn restore<E: Eeprom>(sd: &SdCard, eeprom: &mut E) -> Self {
        if sd.exists(RESET_SENTINEL) {
            tracing::info!("Settings reset requested, clearing EEPROM");
            if let Err(e) = eeprom.clear() {
                tracing::warn!("EEPROM clear failed: {e}");
            }
            let _eat_err = sd.remove(RESET_SENTINEL);
        }

        let defaults = match eeprom.uid() {
            Ok(uid) => Settings::with_uid(&uid),
            Err(_) => Settings::default(),
        };

        let mut candidates = Vec::new();
        if let Some(name) = eeprom::settings_filename(eeprom) {
            candidates.push(name);
        }
        candidates.push(String::from(DEFAULT_PATH));

        for path in &candidates {
            let Ok(raw) = sd.read_all(path) else {
                continue;
            };
            let content = String::from_utf8_lossy(&raw);
            let mut settings = defaults.clone();
            settings.apply_text(&content);
            settings.clamp_lengths();
            tracing::debug!("Settings restored from {path}");
            return settings;
        }

        match eeprom::load(eeprom) {
            Ok(Some(settings)) => {
                tracing::debug!("Settings restored from EEPROM");
                return settings;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Ignoring EEPROM settings: {e}"),
        }

        let settings = defaults;
        if let Err(e) = settings.persist(sd, eeprom) {
            tracing::debug!("Could not persist default settings: {e}");
        }
        settings
    }

    /// Write the text form to the SD, honoring the EEPROM filename override
    pub fn persist<E: Eeprom>(
        &self,
        sd: &SdCard,
        eeprom: &mut E,
    ) -> Result<(), canbadger_core::StorageError> {
        let path = eeprom::settings_filename(eeprom).unwrap_or_else(|| String::from(DEFAULT_PATH));
        sd.write_all(&path, self.to_text().as_bytes())
    }
}

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
