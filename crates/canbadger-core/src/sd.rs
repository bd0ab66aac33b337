//! SD card file access, rooted at a host directory.
//!
//! Paths use the firmware convention of absolute `/dir/file` names relative
//! to the card root, so `tempfile::tempdir()` stands in for a card in tests.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::StorageError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

pub struct SdCard {
    root: PathBuf,
}

impl SdCard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    pub fn file_size(&self, path: &str) -> Result<u64, StorageError> {
        Ok(fs::metadata(self.resolve(path))?.len())
    }

    pub fn read_all(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.resolve(path))?)
    }

    /// Read up to `length` bytes starting at `offset`
    pub fn read_at(&self, path: &str, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let mut file = File::open(self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; length];
        let mut filled = 0;
        while filled < length {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Create or truncate `path` with the given contents
    pub fn write_all(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, data).map_err(map_write_err)?;
        Ok(())
    }

    /// Write at `offset` into an existing (or new) file without truncating
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).open(full)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data).map_err(map_write_err)?;
        Ok(())
    }

    pub fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(full)?;
        file.write_all(data).map_err(map_write_err)?;
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<(), StorageError> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    pub fn make_dir(&self, path: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    /// Entries of a directory, sorted by name for stable output
    pub fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type()?.is_dir();
            entries.push(DirEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// First `{base}{n}.{ext}` name that does not exist yet, like the
    /// logger's `RAW_1.BIN`, `RAW_2.BIN`, ... sequence
    pub fn next_sequential_name(&self, base: &str, ext: &str) -> String {
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}{n}.{ext}");
            if !self.exists(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn map_write_err(e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        StorageError::SdFull
    } else {
        StorageError::SdIo(e)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn card() -> (tempfile::TempDir, SdCard) {
        let dir = tempfile::tempdir().unwrap();
        let sd = SdCard::new(dir.path());
        (dir, sd)
    }

    #[test]
    fn test_absolute_paths_resolve_under_root() {
        let (_dir, sd) = card();
        sd.write_all("/MITM/rules.txt", b"hello").unwrap();
        assert!(sd.exists("/MITM/rules.txt"));
        assert!(sd.is_dir("/MITM"));
        assert_eq!(sd.read_all("/MITM/rules.txt").unwrap(), b"hello");
    }

    #[test]
    fn test_read_at_clamps_to_eof() {
        let (_dir, sd) = card();
        sd.write_all("/log.bin", &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(sd.read_at("/log.bin", 3, 10).unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_append_and_size() {
        let (_dir, sd) = card();
        sd.append("/seeds.bin", &[0xAA; 4]).unwrap();
        sd.append("/seeds.bin", &[0xBB; 4]).unwrap();
        assert_eq!(sd.file_size("/seeds.bin").unwrap(), 8);
    }

    #[test]
    fn test_sequential_names_skip_existing() {
        let (_dir, sd) = card();
        sd.write_all("RAW_1.BIN", b"").unwrap();
        sd.write_all("RAW_2.BIN", b"").unwrap();
        assert_eq!(sd.next_sequential_name("RAW_", "BIN"), "RAW_3.BIN");
    }

    #[test]
    fn test_list_dir_is_sorted() {
        let (_dir, sd) = card();
        sd.write_all("/b.txt", b"").unwrap();
        sd.write_all("/a.txt", b"").unwrap();
        sd.make_dir("/LOGS").unwrap();
        let entries = sd.list_dir("/").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["LOGS", "a.txt", "b.txt"]);
        assert!(entries[0].is_dir);
    }
}
