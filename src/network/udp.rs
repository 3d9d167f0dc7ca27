//! UDP socket construction
//!
//! Sockets are built with `socket2` so buffer sizes can be raised before
//! the first datagram arrives, then handed over as `std::net::UdpSocket`.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Resolve `ip:port` from endpoint configuration
pub fn parse_remote(ip: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(ip.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Socket for sending to `remote`, bound to an ephemeral local port
pub fn create_send_socket(
    remote: SocketAddr,
    send_buffer_bytes: usize,
) -> Result<UdpSocket, NetworkError> {
    let domain = Domain::for_address(remote);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    if let Err(e) = socket.set_send_buffer_size(send_buffer_bytes) {
        tracing::warn!("Could not raise send buffer to {} bytes: {}", send_buffer_bytes, e);
    }

    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    };
    socket
        .bind(&SockAddr::from(local))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

/// Socket listening on `port` on all interfaces
///
/// `poll` becomes the read timeout so a receive loop can notice
/// cancellation without a datagram arriving.
pub fn create_recv_socket(
    port: u16,
    recv_buffer_bytes: usize,
    poll: Duration,
) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_bytes) {
        tracing::warn!("Could not raise receive buffer to {} bytes: {}", recv_buffer_bytes, e);
    }

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(poll.max(Duration::from_millis(1))))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket)
}
