//! Socket construction for the responder.
//!
//! Each interface address gets three sockets: a listener joined to the
//! multicast group on that interface, a unicast reply client on an
//! ephemeral port, and a multicast reply client bound to the interface
//! address. Tying group membership to a single interface per listener is
//! what lets the responder know which interface a datagram arrived on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::net::platform;
use crate::utils::BridgeResult;

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// The socket trio serving one interface address.
pub struct SocketUnit {
    pub interface: String,
    pub local_addr: IpAddr,
    pub listener: UdpSocket,
    pub unicast: UdpSocket,
    pub multicast: UdpSocket,
    /// Group endpoint (with scope id for v6) the multicast client sends to.
    pub multicast_target: SocketAddr,
}

pub fn build_unit(ifname: &str, ifindex: u32, local: IpAddr) -> BridgeResult<SocketUnit> {
    let (listener, unicast, multicast, multicast_target) = match local {
        IpAddr::V4(v4) => {
            let listener = {
                let socket = new_socket(Domain::IPV4)?;
                socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), MDNS_PORT).into())?;
                socket.join_multicast_v4(&MDNS_GROUP_V4, &v4)?;
                socket.set_multicast_loop_v4(true)?;
                into_tokio(socket)?
            };
            let unicast = {
                let socket = new_socket(Domain::IPV4)?;
                socket.bind(&SocketAddr::new(local, 0).into())?;
                into_tokio(socket)?
            };
            let multicast = {
                let socket = new_socket(Domain::IPV4)?;
                socket.bind(&SocketAddr::new(local, MDNS_PORT).into())?;
                socket.set_multicast_if_v4(&v4)?;
                socket.set_multicast_ttl_v4(255)?;
                socket.set_multicast_loop_v4(true)?;
                into_tokio(socket)?
            };
            let target = SocketAddr::new(MDNS_GROUP_V4.into(), MDNS_PORT);
            (listener, unicast, multicast, target)
        }
        IpAddr::V6(v6) => {
            let scope = if is_link_local(&v6) { ifindex } else { 0 };
            let listener = {
                let socket = new_socket(Domain::IPV6)?;
                socket.set_only_v6(true)?;
                socket.bind(
                    &SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), MDNS_PORT).into(),
                )?;
                socket.join_multicast_v6(&MDNS_GROUP_V6, ifindex)?;
                socket.set_multicast_loop_v6(true)?;
                into_tokio(socket)?
            };
            let unicast = {
                let socket = new_socket(Domain::IPV6)?;
                socket.set_only_v6(true)?;
                socket.bind(&SocketAddrV6::new(v6, 0, 0, scope).into())?;
                into_tokio(socket)?
            };
            let multicast = {
                let socket = new_socket(Domain::IPV6)?;
                socket.set_only_v6(true)?;
                socket.bind(&SocketAddrV6::new(v6, MDNS_PORT, 0, scope).into())?;
                socket.set_multicast_if_v6(ifindex)?;
                socket.set_multicast_hops_v6(255)?;
                socket.set_multicast_loop_v6(true)?;
                into_tokio(socket)?
            };
            let target = SocketAddrV6::new(MDNS_GROUP_V6, MDNS_PORT, 0, ifindex).into();
            (listener, unicast, multicast, target)
        }
    };

    Ok(SocketUnit {
        interface: ifname.to_string(),
        local_addr: local,
        listener,
        unicast,
        multicast,
        multicast_target,
    })
}

fn new_socket(domain: Domain) -> std::io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    platform::allow_any_interface(&socket)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn into_tokio(socket: Socket) -> std::io::Result<UdpSocket> {
    UdpSocket::from_std(socket.into())
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_link_local_addresses() {
        assert!(is_link_local(&"fe80::1".parse().unwrap()));
        assert!(is_link_local(&"febf::1".parse().unwrap()));
        assert!(!is_link_local(&"fec0::1".parse().unwrap()));
        assert!(!is_link_local(&Ipv6Addr::LOCALHOST));
    }
}
