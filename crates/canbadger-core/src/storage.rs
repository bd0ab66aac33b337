//! Contracts for the external memories the board carries: the SPI SRAM used
//! as a rule arena and the EEPROM holding settings. The chip drivers
//! themselves live outside this crate; tests and the daemon use the
//! memory-backed fakes.

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{len}-byte access at {addr:#X} exceeds capacity {capacity:#X}")]
    OutOfBounds { addr: u32, len: usize, capacity: u32 },
    #[error("SD card is full")]
    SdFull,
    #[error("SD I/O failed: {0}")]
    SdIo(#[from] std::io::Error),
    #[error("EEPROM checksum mismatch: stored {stored:#010X}, computed {computed:#010X}")]
    EepromCrcMismatch { stored: u32, computed: u32 },
}

/// Byte-addressed external SRAM
pub trait Storage: Send {
    fn capacity(&self) -> u32;

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), StorageError>;

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Fill the entire address space with `byte`
    fn fill(&mut self, byte: u8) -> Result<(), StorageError>;
}

/// Byte-addressed EEPROM with a factory-programmed unique ID
pub trait Eeprom: Send {
    fn capacity(&self) -> u32;

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), StorageError>;

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Erase everything back to 0xFF
    fn clear(&mut self) -> Result<(), StorageError>;

    /// The 48-bit EUI burned into the chip
    fn uid(&mut self) -> Result<[u8; 6], StorageError>;
}

fn check_bounds(addr: u32, len: usize, capacity: u32) -> Result<(), StorageError> {
    if addr as usize + len > capacity as usize {
        return Err(StorageError::OutOfBounds { addr, len, capacity });
    }
    Ok(())
}

/// In-memory [Storage], sized like the 1 MiB external SRAM by default
pub struct MemStorage {
    bytes: Vec<u8>,
}

impl MemStorage {
    pub const DEFAULT_CAPACITY: u32 = 1 << 20;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            bytes: vec![0xFF; capacity as usize],
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(addr, out.len(), self.capacity())?;
        out.copy_from_slice(&self.bytes[addr as usize..addr as usize + out.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(addr, data.len(), self.capacity())?;
        self.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn fill(&mut self, byte: u8) -> Result<(), StorageError> {
        self.bytes.fill(byte);
        Ok(())
    }
}

/// In-memory [Eeprom], sized like the 2 Kbit settings EEPROM by default
pub struct MemEeprom {
    bytes: Vec<u8>,
    uid: [u8; 6],
}

impl MemEeprom {
    pub const DEFAULT_CAPACITY: u32 = 256;

    pub fn new() -> Self {
        Self {
            bytes: vec![0xFF; Self::DEFAULT_CAPACITY as usize],
            uid: [0x00, 0x04, 0xA3, 0x12, 0x34, 0x56],
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: [u8; 6]) -> Self {
        self.uid = uid;
        self
    }
}

impl Default for MemEeprom {
    fn default() -> Self {
        Self::new()
    }
}

impl Eeprom for MemEeprom {
    fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(addr, out.len(), self.capacity())?;
        out.copy_from_slice(&self.bytes[addr as usize..addr as usize + out.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(addr, data.len(), self.capacity())?;
        self.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.bytes.fill(0xFF);
        Ok(())
    }

    fn uid(&mut self) -> Result<[u8; 6], StorageError> {
        Ok(self.uid)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_mem_storage_roundtrip() {
        let mut ram = MemStorage::with_capacity(0x1000);
        ram.write(0x800, &[1, 2, 3, 4]).unwrap();
        let mut out = [0; 4];
        ram.read(0x800, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_mem_storage_bounds() {
        let mut ram = MemStorage::with_capacity(16);
        let err = ram.write(14, &[0; 4]).unwrap_err();
        assert!(matches!(err, StorageError::OutOfBounds { .. }));
    }

    #[test]
    fn test_eeprom_erases_to_ff() {
        let mut eep = MemEeprom::new();
        eep.write(0, &[0x00; 8]).unwrap();
        eep.clear().unwrap();
        let mut out = [0; 8];
        eep.read(0, &mut out).unwrap();
        assert_eq!(out, [0xFF; 8]);
    }
}
