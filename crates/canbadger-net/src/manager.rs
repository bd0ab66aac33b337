//! UDP control-plane endpoint: discovery broadcast until a server connects,
//! then a command inbox and data path to the connected server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::FIRMWARE_VERSION;
use crate::message::{ControlError, Message, MessageKind};

/// Servers listen for beacons here
pub const DISCOVERY_PORT: u16 = 13370;
/// The device listens for commands here
pub const COMMAND_PORT: u16 = 13371;
/// Beacon cadence while unconnected
pub const BEACON_INTERVAL: Duration = Duration::from_secs(2);

pub struct EthernetManager {
    socket: UdpSocket,
    /// `CB|<id>|<version>|`
    identifier: String,
    beacon_target: SocketAddr,
    next_beacon: Instant,
    /// Where DATA/ACK traffic goes once a server connected
    peer: Option<SocketAddr>,
    recv_buf: Vec<u8>,
}

impl EthernetManager {
    /// Bind the command socket on the standard port and broadcast beacons
    pub fn new(device_id: &str) -> Result<Self, ControlError> {
        Self::with_ports(
            device_id,
            COMMAND_PORT,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
        )
    }

    /// Test hook: bind an ephemeral port and beacon at a specific address
    pub fn with_ports(
        device_id: &str,
        bind_port: u16,
        beacon_target: SocketAddr,
    ) -> Result<Self, ControlError> {
        let socket = UdpSocket::bind(("0.0.0.0", bind_port))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            identifier: identifier(device_id),
            beacon_target,
            next_beacon: Instant::now(),
            peer: None,
            recv_buf: vec![0; crate::message::HEADER_LEN + crate::message::MAX_DATA_LEN],
        })
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    /// Refresh the beacon string after a settings update renamed the device
    pub fn reacquire_identifier(&mut self, device_id: &str) {
        self.identifier = identifier(device_id);
    }

    pub fn disconnect(&mut self) {
        self.peer = None;
        self.next_beacon = Instant::now();
    }

    /// One pump of the socket: broadcast the beacon when due, then poll for
    /// one datagram. Returns an ACTION message for the dispatcher; CONNECT
    /// is handled here.
    pub fn run(&mut self) -> Result<Option<Message>, ControlError> {
        if self.peer.is_none() && Instant::now() >= self.next_beacon {
            self.next_beacon = Instant::now() + BEACON_INTERVAL;
            if let Err(e) = self
                .socket
                .send_to(self.identifier.as_bytes(), self.beacon_target)
            {
                tracing::debug!("Beacon send failed: {e}");
            }
        }

        let (received, source) = match self.socket.recv_from(&mut self.recv_buf) {
            Ok(ok) => ok,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let message = match Message::decode(&self.recv_buf[..received]) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed datagram from {source}: {e}");
                return Err(e);
            }
        };

        match message.kind {
            MessageKind::Connect => {
                // the payload names the port the server opened for us
                if message.data.len() < 4 {
                    tracing::warn!("CONNECT from {source} without a data port");
                    return Ok(None);
                }
                let port = LittleEndian::read_u32(&message.data[..4]) as u16;
                let peer = SocketAddr::new(source.ip(), port);
                tracing::info!("Server connected: commands from {source}, data to {peer}");
                self.peer = Some(peer);
                self.send_ack()?;
                Ok(None)
            }
            MessageKind::Action => match self.peer {
                Some(peer) if peer.ip() == source.ip() => Ok(Some(message)),
                Some(_) => {
                    tracing::warn!("Ignoring ACTION from unconnected host {source}");
                    Ok(None)
                }
                None => {
                    tracing::trace!("Ignoring ACTION before a server connected");
                    Ok(None)
                }
            },
            other => {
                tracing::trace!("Ignoring inbound {other:?} message");
                Ok(None)
            }
        }
    }

    /// Send to the connected server
    pub fn send(&mut self, message: &Message) -> Result<(), ControlError> {
        let Some(peer) = self.peer else {
            return Err(ControlError::NotConnected);
        };
        self.socket.send_to(&message.encode(), peer)?;
        Ok(())
    }

    pub fn send_ack(&mut self) -> Result<(), ControlError> {
        self.send(&Message::ack())
    }

    pub fn send_nack(&mut self) -> Result<(), ControlError> {
        self.send(&Message::nack())
    }

    pub fn send_debug(&mut self, text: &str) -> Result<(), ControlError> {
        self.send(&Message::debug(text))
    }
}

fn identifier(device_id: &str) -> String {
    format!("CB|{device_id}|{FIRMWARE_VERSION}|")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::ActionKind;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A manager beaconing at an ephemeral "server" socket
    fn manager_and_server() -> (EthernetManager, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let beacon_target = localhost(server.local_addr().unwrap().port());
        let manager = EthernetManager::with_ports("testbadger", 0, beacon_target).unwrap();
        (manager, server)
    }

    fn connect(manager: &mut EthernetManager, server: &UdpSocket) {
        let mut payload = vec![0; 4];
        let port = server.local_addr().unwrap().port() as u32;
        LittleEndian::write_u32(&mut payload, port);
        let connect = Message {
            kind: MessageKind::Connect,
            action: ActionKind::NoType,
            data: payload,
        };
        server
            .send_to(&connect.encode(), localhost(manager.local_port()))
            .unwrap();
        // pump until the CONNECT is in
        for _ in 0..100 {
            manager.run().unwrap();
            if manager.is_connected() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("manager never saw the CONNECT");
    }

    fn recv_message(server: &UdpSocket) -> Message {
        let mut buf = vec![0; 4096];
        let (received, _) = server.recv_from(&mut buf).unwrap();
        Message::decode(&buf[..received]).unwrap()
    }

    #[test]
    fn test_beacon_until_connect() {
        let (mut manager, server) = manager_and_server();
        manager.run().unwrap();
        let mut buf = vec![0; 128];
        let (received, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"CB|testbadger|2|");

        connect(&mut manager, &server);
        // the CONNECT is answered with an ACK
        let ack = recv_message(&server);
        assert_eq!(ack.kind, MessageKind::Ack);
    }

    #[test]
    fn test_actions_reach_the_dispatcher() {
        let (mut manager, server) = manager_and_server();
        connect(&mut manager, &server);
        recv_message(&server); // eat the ACK

        let action = Message::action(ActionKind::Led, vec![0x01]);
        server
            .send_to(&action.encode(), localhost(manager.local_port()))
            .unwrap();
        let mut got = None;
        for _ in 0..100 {
            if let Some(msg) = manager.run().unwrap() {
                got = Some(msg);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(got, Some(action));
    }

    #[test]
    fn test_send_requires_connection() {
        let (mut manager, _server) = manager_and_server();
        assert!(matches!(
            manager.send_ack(),
            Err(ControlError::NotConnected)
        ));
    }

    #[test]
    fn test_identifier_updates_after_rename() {
        let (mut manager, server) = manager_and_server();
        manager.reacquire_identifier("renamed");
        manager.run().unwrap();
        let mut buf = vec![0; 128];
        let (received, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"CB|renamed|2|");
    }
}
