//! The compact settings blob kept in EEPROM behind a CRC-32 trailer, plus
//! the settings-filename override stored after it.
//!
//! EEPROM layout:
//!
//! | offset | size | contents                                  |
//! |--------|------|-------------------------------------------|
//! | 0      | 120  | compact settings blob, zero padded        |
//! | 120    | 4    | CRC-32 over bytes 0..120, big-endian      |
//! | 128    | 1    | settings filename length (0xFF = unset)   |
//! | 129    | ≤49  | settings filename                         |

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use canbadger_core::{Eeprom, StorageError};

use crate::{MAX_ID_LEN, MAX_IP_LEN, Settings};

/// Bytes covered by the checksum
pub const BLOB_REGION: u32 = 120;
pub const CRC_OFFSET: u32 = BLOB_REGION;
pub const FILENAME_OFFSET: u32 = 128;
pub const MAX_FILENAME_LEN: usize = 49;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

impl Settings {
    /// The compact wire form used for EEPROM storage and the SETTINGS
    /// control-plane payload:
    /// `id_len | id | ip_len | ip | status | spi | can1 | can2 | kline1 | kline2`
    /// with all integers little-endian.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let id = &self.id.as_bytes()[..self.id.len().min(MAX_ID_LEN)];
        let ip = &self.ip.as_bytes()[..self.ip.len().min(MAX_IP_LEN)];
        let mut blob = Vec::with_capacity(id.len() + ip.len() + 26);
        blob.push(id.len() as u8);
        blob.extend_from_slice(id);
        blob.push(ip.len() as u8);
        blob.extend_from_slice(ip);
        for value in [
            self.status,
            self.spi_speed,
            self.can1_speed,
            self.can2_speed,
            self.kline1_speed,
            self.kline2_speed,
        ] {
            blob.extend_from_slice(&value.to_le_bytes());
        }
        blob
    }

    /// Parse [Settings::to_blob] output; `None` when the framing is off
    #[must_use]
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        let id_len = *blob.first()? as usize;
        if id_len > MAX_ID_LEN || blob.len() < id_len + 2 {
            return None;
        }
        let id = String::from_utf8_lossy(&blob[1..1 + id_len]).into_owned();
        let ip_len = blob[1 + id_len] as usize;
        let integers_start = id_len + ip_len + 2;
        if ip_len > MAX_IP_LEN || blob.len() < integers_start + 24 {
            return None;
        }
        let ip = String::from_utf8_lossy(&blob[id_len + 2..id_len + 2 + ip_len]).into_owned();
        let words = &blob[integers_start..integers_start + 24];
        Some(Self {
            id,
            ip,
            status: LittleEndian::read_u32(&words[0..4]),
            spi_speed: LittleEndian::read_u32(&words[4..8]),
            can1_speed: LittleEndian::read_u32(&words[8..12]),
            can2_speed: LittleEndian::read_u32(&words[12..16]),
            kline1_speed: LittleEndian::read_u32(&words[16..20]),
            kline2_speed: LittleEndian::read_u32(&words[20..24]),
        })
    }
}

/// Write the blob and its checksum
pub fn store<E: Eeprom>(settings: &Settings, eeprom: &mut E) -> Result<(), StorageError> {
    let mut region = [0u8; BLOB_REGION as usize];
    let blob = settings.to_blob();
    region[..blob.len()].copy_from_slice(&blob);
    let crc = CRC32.checksum(&region);
    eeprom.write(0, &region)?;
    let mut trailer = [0u8; 4];
    BigEndian::write_u32(&mut trailer, crc);
    eeprom.write(CRC_OFFSET, &trailer)
}

/// Read the blob back.
///
/// `Ok(None)` means the region is erased (never written); a checksum
/// mismatch on a written region is an error so callers can tell corruption
/// from absence.
pub fn load<E: Eeprom>(eeprom: &mut E) -> Result<Option<Settings>, StorageError> {
    // the extra byte past the checksum is read along with it, matching the
    // hardware tool's access pattern; its value is ignored
    let mut raw = [0u8; BLOB_REGION as usize + 5];
    eeprom.read(0, &mut raw)?;
    if raw[0] == 0xFF {
        return Ok(None);
    }
    let stored = BigEndian::read_u32(&raw[CRC_OFFSET as usize..CRC_OFFSET as usize + 4]);
    let computed = CRC32.checksum(&raw[..BLOB_REGION as usize]);
    if stored != computed {
        return Err(StorageError::EepromCrcMismatch { stored, computed });
    }
    Ok(Settings::from_blob(&raw[..BLOB_REGION as usize]))
}

/// The settings-filename override, if one is stored
pub fn settings_filename<E: Eeprom>(eeprom: &mut E) -> Option<String> {
    let mut len = [0u8];
    eeprom.read(FILENAME_OFFSET, &mut len).ok()?;
    let len = len[0];
    if len == 0 || len == 0xFF {
        return None;
    }
    let len = (len as usize).min(MAX_FILENAME_LEN);
    let mut name = vec![0u8; len];
    eeprom.read(FILENAME_OFFSET + 1, &mut name).ok()?;
    Some(String::from_utf8_lossy(&name).into_owned())
}

/// Store a settings-filename override
pub fn store_settings_filename<E: Eeprom>(eeprom: &mut E, name: &str) -> Result<(), StorageError> {
    let bytes = &name.as_bytes()[..name.len().min(MAX_FILENAME_LEN)];
    eeprom.write(FILENAME_OFFSET, &[bytes.len() as u8])?;
    eeprom.write(FILENAME_OFFSET + 1, bytes)
}

#[cfg(test)]
mod tests {
    use canbadger_core::MemEeprom;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::StatusBit;

    fn sample() -> Settings {
        let mut settings = Settings::default();
        settings.id = String::from("bench-badger");
        settings.ip = String::from("192.168.1.9");
        settings.can1_speed = 250_000;
        settings.set(StatusBit::EthernetEnabled, true);
        settings
    }

    #[test]
    fn test_blob_roundtrip() {
        let settings = sample();
        let blob = settings.to_blob();
        assert_eq!(blob.len(), 12 + 11 + 26);
        assert_eq!(Settings::from_blob(&blob), Some(settings));
    }

    #[test]
    fn test_blob_rejects_bad_framing() {
        assert_eq!(Settings::from_blob(&[]), None);
        assert_eq!(Settings::from_blob(&[200, 1, 2]), None);
        let mut blob = sample().to_blob();
        blob.truncate(blob.len() - 1);
        assert_eq!(Settings::from_blob(&blob), None);
    }

    #[test]
    fn test_eeprom_roundtrip() {
        let mut eeprom = MemEeprom::new();
        assert_eq!(load(&mut eeprom).unwrap(), None);
        store(&sample(), &mut eeprom).unwrap();
        assert_eq!(load(&mut eeprom).unwrap(), Some(sample()));
    }

    #[test]
    fn test_corrupt_blob_fails_the_checksum() {
        let mut eeprom = MemEeprom::new();
        store(&sample(), &mut eeprom).unwrap();
        eeprom.write(4, &[0x00]).unwrap();
        let err = load(&mut eeprom).unwrap_err();
        assert!(matches!(err, StorageError::EepromCrcMismatch { .. }));
    }

    #[test]
    fn test_filename_override_roundtrip() {
        let mut eeprom = MemEeprom::new();
        assert_eq!(settings_filename(&mut eeprom), None);
        store_settings_filename(&mut eeprom, "/alt_settings.txt").unwrap();
        assert_eq!(
            settings_filename(&mut eeprom),
            Some(String::from("/alt_settings.txt"))
        );
    }

    #[test]
    fn test_long_filename_is_clamped() {
        let mut eeprom = MemEeprom::new();
        let long = "x".repeat(80);
        store_settings_filename(&mut eeprom, &long).unwrap();
        assert_eq!(settings_filename(&mut eeprom).unwrap().len(), MAX_FILENAME_LEN);
    }
}
