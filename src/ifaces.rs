use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use crate::{http::MAX_ADDRS, socket::Socket};

/// A network interface and the IP addresses assigned to it.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Queries the system's network interfaces.
pub fn query() -> io::Result<Vec<Interface>> {
    let mut ifaces: Vec<Interface> = Vec::new();
    for if_addr in get_if_addrs::get_if_addrs()? {
        match ifaces.iter_mut().find(|i| i.name == if_addr.name) {
            Some(iface) => iface.addrs.push(if_addr.ip()),
            None => ifaces.push(Interface {
                name: if_addr.name,
                addrs: vec![if_addr.addr.ip()],
            }),
        }
    }
    Ok(ifaces)
}

/// The default self-address enumerator: every local interface address paired
/// with the socket's port. One of the addresses the wire format allows is
/// reserved for the observed address.
///
/// This runs on every dial or accept, so a replacement should be quick
/// (ideally well under 100ms). Override it in
/// [`ClientConfig`](crate::ClientConfig) if port mapping protocols or static
/// candidate lists are needed.
pub fn default_self_addrs(socket: &Socket) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    let if_addrs = get_if_addrs::get_if_addrs().unwrap_or_default();
    for if_addr in if_addrs {
        if addrs.len() >= MAX_ADDRS - 1 {
            break;
        }
        addrs.push(SocketAddr::new(if_addr.ip(), socket.port()));
    }
    addrs
}
