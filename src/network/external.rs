//! External device gateway
//!
//! Remote controls that are not group members talk a small datagram
//! protocol on the external port. Each frame starts with a two byte marker
//! and a four letter ASCII tag:
//!
//! ```text
//! inbound:  [0xAA 0xAA] TAG name...          (marker optional)
//! outbound:  0xAA 0xAA  TAG ipv4(4) size(u16 BE) payload...
//! ```
//!
//! `DISC` is answered with `SYNC`. `ACKN<name>` registers the device as an
//! external pseudo-peer and is answered with the `LIST` roster. `PLAY`,
//! `STOP` and `NEXT` become stream requests for the device's zone.

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::NetworkError;
use crate::network::messenger::Messenger;
use crate::peers::PeerRegistry;
use crate::protocol::{GroupMessage, Peer, StreamCommand, ZoneId};

/// Frame marker
pub const MARKER: [u8; 2] = [0xAA, 0xAA];

const TAG_LEN: usize = 4;

/// Stream request raised on behalf of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRequest {
    pub zone: ZoneId,
    pub command: StreamCommand,
}

/// Parsed inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDatagram {
    Discover,
    Register { name: String },
    Transport { name: String, command: StreamCommand },
    Unknown(String),
}

impl DeviceDatagram {
    pub fn parse(data: &[u8]) -> Result<Self, NetworkError> {
        let data = data.strip_prefix(&MARKER[..]).unwrap_or(data);
        if data.len() < TAG_LEN {
            return Err(NetworkError::InvalidPacket);
        }

        let tag = String::from_utf8_lossy(&data[..TAG_LEN]).to_ascii_uppercase();
        let name = String::from_utf8_lossy(&data[TAG_LEN..])
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string();

        Ok(match tag.as_str() {
            "DISC" => DeviceDatagram::Discover,
            "ACKN" => DeviceDatagram::Register { name },
            "PLAY" => DeviceDatagram::Transport {
                name,
                command: StreamCommand::Play,
            },
            "STOP" => DeviceDatagram::Transport {
                name,
                command: StreamCommand::Pause,
            },
            "NEXT" => DeviceDatagram::Transport {
                name,
                command: StreamCommand::Next,
            },
            _ => DeviceDatagram::Unknown(tag),
        })
    }
}

/// Build an outbound frame
pub fn encode_reply(tag: &str, local: Ipv4Addr, size: u16, payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + TAG_LEN + 4 + 2 + payload.len());
    buf.put_slice(&MARKER);
    buf.put_slice(tag.as_bytes());
    buf.put_slice(&local.octets());
    buf.put_u16(size);
    buf.put_slice(payload.as_bytes());
    buf.freeze()
}

/// Pseudo-peer id of a device
pub fn device_id(name: &str, ip: IpAddr) -> String {
    format!("{}/{}", name, ip)
}

/// Registers remote controls as external peers and forwards their commands
pub struct ExternalDeviceGateway {
    registry: Arc<PeerRegistry>,
    messenger: Messenger,
    requests: mpsc::UnboundedSender<ZoneRequest>,
    local_ip: Ipv4Addr,
    port: u16,
    devices: DashSet<IpAddr>,
}

impl ExternalDeviceGateway {
    pub fn new(
        registry: Arc<PeerRegistry>,
        messenger: Messenger,
        requests: mpsc::UnboundedSender<ZoneRequest>,
        local_ip: Ipv4Addr,
        port: u16,
    ) -> Self {
        Self {
            registry,
            messenger,
            requests,
            local_ip,
            port,
            devices: DashSet::new(),
        }
    }

    /// Addresses of every device that registered
    pub fn devices(&self) -> Vec<IpAddr> {
        self.devices.iter().map(|ip| *ip.key()).collect()
    }

    /// Handle one datagram; returns the replies to send back
    pub fn handle(&self, data: &[u8], from: IpAddr) -> Vec<Bytes> {
        let datagram = match DeviceDatagram::parse(data) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::trace!("Ignoring datagram from {}: {}", from, e);
                return Vec::new();
            }
        };

        match datagram {
            DeviceDatagram::Discover => {
                tracing::trace!("Responding to external discovery from {} with SYNC", from);
                vec![encode_reply("SYNC", self.local_ip, 0, "")]
            }
            DeviceDatagram::Register { name } => {
                let reply = self.roster();
                self.register(&name, from);
                vec![reply]
            }
            DeviceDatagram::Transport { name, command } => {
                let id = device_id(&name, from);
                match self.registry.lookup(&id) {
                    Some(peer) => {
                        tracing::debug!("Device {} requests {} in zone {}", id, command.as_str(), peer.zone);
                        let request = ZoneRequest {
                            zone: peer.zone,
                            command,
                        };
                        if self.requests.send(request).is_err() {
                            tracing::warn!("Stream request from {} dropped, node is shutting down", id);
                        }
                    }
                    None => tracing::warn!("{} from unregistered device {}", command.as_str(), id),
                }
                Vec::new()
            }
            DeviceDatagram::Unknown(tag) => {
                tracing::trace!("Unknown device command {} from {}", tag, from);
                Vec::new()
            }
        }
    }

    /// `LIST<n><ip>,<ip>...` of every peer with a known ip
    fn roster(&self) -> Bytes {
        let ips: Vec<String> = self
            .registry
            .all()
            .into_iter()
            .filter_map(|p| p.ip.map(|ip| ip.to_string()))
            .collect();
        let payload = format!("LIST{}{}", ips.len(), ips.join(","));
        tracing::trace!("Sending roster of {} peers to external device", ips.len());
        encode_reply("LIST", self.local_ip, ips.len() as u16, &payload)
    }

    fn register(&self, name: &str, ip: IpAddr) {
        self.devices.insert(ip);
        let id = device_id(name, ip);
        if self.registry.lookup(&id).is_some() {
            return;
        }

        let mut peer = Peer::new(id.clone(), name);
        peer.ip = Some(ip);
        peer.external = true;
        tracing::info!("Registered external device {}", id);
        self.registry.add_or_replace(peer.clone());
        self.messenger.broadcast_logged(&GroupMessage::PeerData(peer));
    }

    /// Serve datagrams until the socket fails
    pub async fn run(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; 65_535];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("Connection to external devices lost: {}", e);
                    return;
                }
            };

            for reply in self.handle(&buf[..len], src.ip()) {
                let target = SocketAddr::new(src.ip(), self.port);
                if let Err(e) = socket.send_to(&reply, target).await {
                    tracing::warn!("Failed to reply to device {}: {}", target, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notifier;
    use crate::network::memory::MemoryHub;
    use crate::network::messenger::ExternalMembers;

    const DEVICE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

    fn gateway() -> (ExternalDeviceGateway, Arc<PeerRegistry>, mpsc::UnboundedReceiver<ZoneRequest>, Arc<crate::network::memory::MemoryTransport>) {
        let hub = MemoryHub::new();
        let transport = hub.join("node");
        let registry = Arc::new(PeerRegistry::new(Notifier::new()));
        let messenger = Messenger::new(transport.clone(), Arc::new(ExternalMembers::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = ExternalDeviceGateway::new(registry.clone(), messenger, tx, Ipv4Addr::new(192, 168, 1, 2), 9997);
        (gateway, registry, rx, transport)
    }

    #[test]
    fn test_parse_with_and_without_marker() {
        assert_eq!(DeviceDatagram::parse(b"DISC").unwrap(), DeviceDatagram::Discover);
        assert_eq!(
            DeviceDatagram::parse(&[0xAA, 0xAA, b'a', b'c', b'k', b'n', b'r', b'c']).unwrap(),
            DeviceDatagram::Register { name: "rc".to_string() }
        );
        assert!(DeviceDatagram::parse(b"NE").is_err());
    }

    #[test]
    fn test_discover_replies_sync() {
        let (gateway, _, _, _) = gateway();
        let replies = gateway.handle(b"DISC", DEVICE);
        assert_eq!(replies.len(), 1);
        assert_eq!(&replies[0][..], &[0xAA, 0xAA, b'S', b'Y', b'N', b'C', 192, 168, 1, 2, 0, 0][..]);
    }

    #[test]
    fn test_register_replies_roster_and_broadcasts_peer() {
        let (gateway, registry, _, transport) = gateway();
        let mut desktop = Peer::new("desk", "Desk");
        desktop.ip = Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        registry.add_or_replace(desktop);
        transport.take_sent();

        let replies = gateway.handle(b"ACKNremote", DEVICE);
        let reply = &replies[0];
        assert_eq!(&reply[2..6], b"LIST");
        assert_eq!(&reply[10..12], &[0, 1]);
        assert_eq!(&reply[12..], b"LIST1192.168.1.10");

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].message {
            GroupMessage::PeerData(peer) => {
                assert!(peer.external);
                assert_eq!(peer.id, device_id("remote", DEVICE));
                assert_eq!(peer.ip, Some(DEVICE));
            }
            other => panic!("expected peer data, got {:?}", other),
        }
        assert_eq!(gateway.devices(), vec![DEVICE]);
    }

    #[test]
    fn test_transport_commands_target_device_zone() {
        let (gateway, registry, mut requests, _) = gateway();
        let mut device = Peer::new(device_id("remote", DEVICE), "remote");
        device.external = true;
        let zone = device.zone;
        registry.add_or_replace(device);

        assert!(gateway.handle(b"PLAYremote", DEVICE).is_empty());
        gateway.handle(b"STOPremote", DEVICE);
        gateway.handle(b"NEXTremote", DEVICE);
        // unknown device is ignored
        gateway.handle(b"PLAYother", DEVICE);

        let commands: Vec<StreamCommand> = std::iter::from_fn(|| requests.try_recv().ok())
            .map(|r| {
                assert_eq!(r.zone, zone);
                r.command
            })
            .collect();
        assert_eq!(commands, vec![StreamCommand::Play, StreamCommand::Pause, StreamCommand::Next]);
    }

    #[test]
    fn test_registered_device_is_known_without_group_echo() {
        let (gateway, registry, mut requests, _) = gateway();
        gateway.handle(b"ACKNremote", DEVICE);

        // The broadcast is never dispatched back here, yet the device can play
        let device = registry.lookup(&device_id("remote", DEVICE)).unwrap();
        assert!(device.external);
        assert_eq!(device.ip, Some(DEVICE));

        gateway.handle(b"PLAYremote", DEVICE);
        let request = requests.try_recv().unwrap();
        assert_eq!(request.zone, device.zone);
        assert_eq!(request.command, StreamCommand::Play);

        // Registering again keeps the same peer
        gateway.handle(b"ACKNremote", DEVICE);
        assert_eq!(registry.lookup(&device.id).unwrap().zone, device.zone);
        assert_eq!(registry.len(), 1);
    }
}
