//! Stream links
//!
//! A publisher session owns one transmitter; a receiver session owns one
//! listener. Both are created through a [`StreamLinks`] factory so sessions
//! can run against in-process links in tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::packet::StreamPacket;
use crate::network::udp;

/// Sends stream packets to a fixed set of targets
pub trait FrameTransmitter: Send {
    fn transmit(&mut self, packet: &StreamPacket) -> Result<(), NetworkError>;

    /// Packets handed to the network so far
    fn packets_sent(&self) -> u64;
}

/// Receives stream packets for one group
pub trait FrameListener: Send {
    /// Next packet, or `None` if nothing arrived within the poll interval
    fn poll(&mut self) -> Result<Option<StreamPacket>, NetworkError>;
}

/// Creates the links sessions stream over
pub trait StreamLinks: Send + Sync {
    fn transmitter(&self, targets: Vec<SocketAddr>) -> Result<Box<dyn FrameTransmitter>, NetworkError>;

    fn listener(&self, group: Ipv4Addr, port: u16) -> Result<Box<dyn FrameListener>, NetworkError>;
}

/// Transmitter over a plain UDP socket
pub struct UdpTransmitter {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    packets_sent: u64,
    bytes_sent: u64,
}

impl UdpTransmitter {
    pub fn new(ttl: u32, targets: Vec<SocketAddr>) -> Result<Self, NetworkError> {
        Ok(Self {
            socket: udp::create_sender_socket(ttl)?,
            targets,
            packets_sent: 0,
            bytes_sent: 0,
        })
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl FrameTransmitter for UdpTransmitter {
    fn transmit(&mut self, packet: &StreamPacket) -> Result<(), NetworkError> {
        let data = packet.encode()?;
        for target in &self.targets {
            self.socket
                .send_to(&data, target)
                .map_err(|e| NetworkError::SendFailed(format!("{}: {}", target, e)))?;
            self.bytes_sent += data.len() as u64;
        }
        self.packets_sent += 1;
        Ok(())
    }

    fn packets_sent(&self) -> u64 {
        self.packets_sent
    }
}

/// Listener on a multicast group
pub struct UdpListener {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpListener {
    pub fn new(group: Ipv4Addr, port: u16, poll_interval: Duration) -> Result<Self, NetworkError> {
        let socket = udp::create_multicast_socket(group, port)?;
        udp::set_read_timeout(&socket, poll_interval)?;
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }
}

impl FrameListener for UdpListener {
    fn poll(&mut self) -> Result<Option<StreamPacket>, NetworkError> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, _)) => StreamPacket::decode(&self.buf[..len]).map(Some),
            Err(e) if udp::is_timeout(&e) => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }
}

/// Real UDP links
pub struct UdpLinks {
    ttl: u32,
    poll_interval: Duration,
}

impl UdpLinks {
    pub fn new(ttl: u32) -> Self {
        Self {
            ttl,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl StreamLinks for UdpLinks {
    fn transmitter(&self, targets: Vec<SocketAddr>) -> Result<Box<dyn FrameTransmitter>, NetworkError> {
        Ok(Box::new(UdpTransmitter::new(self.ttl, targets)?))
    }

    fn listener(&self, group: Ipv4Addr, port: u16) -> Result<Box<dyn FrameListener>, NetworkError> {
        Ok(Box::new(UdpListener::new(group, port, self.poll_interval)?))
    }
}

/// Multicast target for a group
pub fn group_target(group: Ipv4Addr, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(group, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_unicast_transmitter_reaches_target() {
        let receiver = udp::create_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = receiver.local_addr().unwrap();
        let mut transmitter = UdpTransmitter::new(1, vec![target]).unwrap();

        let packet = StreamPacket::new(3, 9, 1_000, Bytes::from_static(b"frame"));
        transmitter.transmit(&packet).unwrap();
        assert_eq!(transmitter.packets_sent(), 1);
        assert_eq!(transmitter.bytes_sent(), packet.encoded_len() as u64);

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(StreamPacket::decode(&buf[..len]).unwrap(), packet);
    }
}
