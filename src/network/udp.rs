//! UDP socket setup
//!
//! All sockets are built through socket2 so address reuse, buffer sizes and
//! multicast options can be set before binding.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

const SOCKET_BUFFER_SIZE: usize = 1 << 20;

fn new_socket() -> Result<Socket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // Larger buffers ride out scheduling hiccups; not fatal if refused
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);
    Ok(socket)
}

/// Plain UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket()?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    Ok(socket.into())
}

/// Socket joined to `group` and receiving on `port`.
/// On unix the socket binds the group address itself so sockets of
/// different groups sharing a port do not see each other's traffic.
pub fn create_multicast_socket(group: Ipv4Addr, port: u16) -> Result<UdpSocket, NetworkError> {
    let socket = new_socket()?;
    #[cfg(unix)]
    let bind = SocketAddrV4::new(group, port);
    #[cfg(not(unix))]
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&SockAddr::from(bind))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind, e)))?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| NetworkError::BindFailed(format!("join {}: {}", group, e)))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    Ok(socket.into())
}

/// Ephemeral socket for sending to multicast groups and unicast targets
pub fn create_sender_socket(ttl: u32) -> Result<UdpSocket, NetworkError> {
    let socket = create_socket(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
    socket
        .set_multicast_ttl_v4(ttl)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    Ok(socket)
}

/// Bound the time a blocking receive may wait
pub fn set_read_timeout(socket: &UdpSocket, timeout: Duration) -> Result<(), NetworkError> {
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))
}

/// Hand a std socket to tokio
pub fn into_tokio(socket: UdpSocket) -> Result<tokio::net::UdpSocket, NetworkError> {
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    tokio::net::UdpSocket::from_std(socket).map_err(|e| NetworkError::BindFailed(e.to_string()))
}

/// True for receive errors that only mean "nothing arrived in time"
pub fn is_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_loopback_send_receive() {
        let receiver = create_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = create_sender_socket(1).unwrap();

        sender.send_to(b"ping", target).unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[test]
    fn test_read_timeout_expires() {
        let socket = create_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        set_read_timeout(&socket, Duration::from_millis(50)).unwrap();

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
