//! Interface discovery and socket construction.
//!
//! Discovery is IPv4 multicast with TTL 1, so beacons never leave the local
//! segment. Two sockets per engine:
//! - the multicast listener, bound to the discovery port and shared between
//!   every engine on the host (SO_REUSEADDR / SO_REUSEPORT)
//! - the unicast socket, bound to an ephemeral port on the chosen interface,
//!   which sends beacons and carries pairing traffic

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Find the local IPv4 address the OS would use to reach `target`.
///
/// `connect` on a UDP socket only selects a route; nothing is sent.
pub fn probe_interface(target: &str) -> io::Result<Ipv4Addr> {
    let target = target
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no IPv4 address for target"))?;
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(target)?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("route to target uses IPv6 address {ip}"),
        )),
    }
}

/// Create a UDP socket joined to `group` on `interface`, bound to `port`.
pub fn multicast_listener(
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &interface)?;

    Ok(socket.into())
}

/// Create the unicast socket on `interface` with an OS-assigned port.
pub fn unicast_socket(interface: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Loop on so several engines on one host see each other
    socket.set_multicast_loop_v4(true)?;
    // TTL 1, never routed off the local segment
    socket.set_multicast_ttl_v4(1)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(interface, 0);
    socket.bind(&bind_addr.into())?;

    Ok(socket.into())
}

/// Dedicated socket for one outbound pairing, `connect`ed to `remote` so it
/// only ever hears from that peer.
pub async fn dedicated_socket(interface: Ipv4Addr, remote: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(interface, 0)).await?;
    socket.connect(remote).await?;
    Ok(socket)
}
