//! Paced, acknowledged file movement between the SD card and the server.

use byteorder::{BigEndian, ByteOrder};
use canbadger_core::SdCard;

use crate::manager::EthernetManager;
use crate::message::{ActionKind, ControlError, Message};

/// File downloads travel in chunks of this many payload bytes
pub const DOWNLOAD_CHUNK: usize = 200;

/// Directory-listing type bytes
pub const TYPE_DIR: u8 = 0xF0;
pub const TYPE_FILE: u8 = 0x0F;

/// Stream a file to the server as `(packet u32 BE, length u16 BE, bytes)`
/// chunks, closing with an empty ACK. The final chunk is short (possibly
/// empty), which is how the receiver knows the stream ended.
pub fn send_download(
    manager: &mut EthernetManager,
    sd: &SdCard,
    path: &str,
) -> Result<(), ControlError> {
    let mut packet = 0u32;
    let mut offset = 0u64;
    loop {
        let chunk = sd.read_at(path, offset, DOWNLOAD_CHUNK)?;
        let mut data = vec![0; 6 + chunk.len()];
        BigEndian::write_u32(&mut data[0..4], packet);
        BigEndian::write_u16(&mut data[4..6], chunk.len() as u16);
        data[6..].copy_from_slice(&chunk);
        manager.send(&Message::data(ActionKind::NoType, data))?;

        offset += chunk.len() as u64;
        packet += 1;
        if chunk.len() < DOWNLOAD_CHUNK {
            break;
        }
    }
    manager.send_ack()
}

/// Upload the SD tree: one message per directory, depth-first, each
/// `<parent_path>\0 [type_byte name\0]...`, closed by a single `\0`.
/// A missing card root sends just the terminator.
pub fn send_sd_tree(manager: &mut EthernetManager, sd: &SdCard) -> Result<(), ControlError> {
    if sd.root().is_dir() {
        send_dir(manager, sd, "/")?;
    }
    manager.send(&Message::data(ActionKind::NoType, vec![0]))
}

fn send_dir(manager: &mut EthernetManager, sd: &SdCard, path: &str) -> Result<(), ControlError> {
    let entries = sd.list_dir(path)?;
    if !entries.is_empty() {
        let mut data = Vec::new();
        data.extend_from_slice(path.as_bytes());
        data.push(0);
        for entry in &entries {
            data.push(if entry.is_dir { TYPE_DIR } else { TYPE_FILE });
            data.extend_from_slice(entry.name.as_bytes());
            data.push(0);
        }
        manager.send(&Message::data(ActionKind::NoType, data))?;
    }
    for entry in entries.iter().filter(|e| e.is_dir) {
        let child = if path == "/" {
            format!("/{}", entry.name)
        } else {
            format!("{path}/{}", entry.name)
        };
        send_dir(manager, sd, &child)?;
    }
    Ok(())
}

/// Strip everything at and after the first NUL of a C-string payload
#[must_use]
pub fn c_string(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}
