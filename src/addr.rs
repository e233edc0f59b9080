use std::{
    fmt,
    net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr},
    ops::{BitOr, BitOrAssign},
};

use crate::error::AddrError;

/// An IP address space derived from an IP address. Spaces are used to reason
/// about connectivity, so they don't cover multicast and the like beyond
/// lumping them into [`AddrSpace::INVALID`].
///
/// Spaces combine into masks with `|`, and a mask is queried with
/// [`AddrSpace::includes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrSpace(u32);

impl AddrSpace {
    /// Denotes addresses unusable for connectivity.
    pub const INVALID: AddrSpace = AddrSpace(0);

    /// Public IPv4 addrs, extremely common and useful for remote connectivity when available.
    pub const PUBLIC4: AddrSpace = AddrSpace(1 << 1);

    /// Public IPv6 addrs, very common and very useful for both local and remote connectivity.
    pub const PUBLIC6: AddrSpace = AddrSpace(1 << 2);

    /// Private IPv4 addrs are very common and useful for local connectivity.
    pub const PRIVATE4: AddrSpace = AddrSpace(1 << 3);

    /// ULA ipv6 addrs are not common (although link-local are).
    pub const PRIVATE6: AddrSpace = AddrSpace(1 << 4);

    /// Link-local ipv4 addrs are not common in most setups.
    pub const LINK4: AddrSpace = AddrSpace(1 << 5);

    /// Link-local ipv6 addrs are not recommended with rdv due to zones.
    pub const LINK6: AddrSpace = AddrSpace(1 << 6);

    /// Loopback addresses are mostly useful for testing.
    pub const LOOPBACK: AddrSpace = AddrSpace(1 << 7);

    /// A mask that won't match any space.
    pub const NO_SPACES: AddrSpace = AddrSpace(1 << 31);

    /// Public IPs only.
    pub const PUBLIC_SPACES: AddrSpace = AddrSpace(Self::PUBLIC4.0 | Self::PUBLIC6.0);

    /// Sensible defaults for most users, includes private and public spaces.
    pub const DEFAULT_SPACES: AddrSpace =
        AddrSpace(Self::PUBLIC4.0 | Self::PUBLIC6.0 | Self::PRIVATE4.0 | Self::PRIVATE6.0);

    /// All IP spaces.
    pub const ALL_SPACES: AddrSpace = AddrSpace(!Self::NO_SPACES.0);

    /// Returns whether `space` is part of this mask.
    pub fn includes(self, space: AddrSpace) -> bool {
        space.0 & self.0 != 0
    }
}

impl BitOr for AddrSpace {
    type Output = AddrSpace;

    fn bitor(self, rhs: AddrSpace) -> AddrSpace {
        AddrSpace(self.0 | rhs.0)
    }
}

impl BitOrAssign for AddrSpace {
    fn bitor_assign(&mut self, rhs: AddrSpace) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            AddrSpace::PUBLIC4 => "public4",
            AddrSpace::PUBLIC6 => "public6",
            AddrSpace::PRIVATE4 => "private4",
            AddrSpace::PRIVATE6 => "private6",
            AddrSpace::LINK4 => "link4",
            AddrSpace::LINK6 => "link6",
            AddrSpace::LOOPBACK => "loopback",
            _ => "invalid",
        };
        f.write_str(name)
    }
}

/// Classifies an IP address into its [`AddrSpace`].
///
/// IPv4-mapped IPv6 addresses are classified with IPv4 semantics but count as
/// IPv6 for the 4-vs-6 split, so `::ffff:192.0.2.128` lands in
/// [`AddrSpace::PUBLIC6`].
pub fn space_of(ip: IpAddr) -> AddrSpace {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4, false),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(v4, true),
            None => classify_v6(v6),
        },
    }
}

fn classify_v4(ip: Ipv4Addr, six: bool) -> AddrSpace {
    let pick = |v4: AddrSpace, v6: AddrSpace| if six { v6 } else { v4 };

    if ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast() {
        return AddrSpace::INVALID;
    }
    if ip.is_loopback() {
        return AddrSpace::LOOPBACK;
    }
    if ip.is_link_local() {
        return pick(AddrSpace::LINK4, AddrSpace::LINK6);
    }
    if ip.is_private() {
        return pick(AddrSpace::PRIVATE4, AddrSpace::PRIVATE6);
    }
    pick(AddrSpace::PUBLIC4, AddrSpace::PUBLIC6)
}

fn classify_v6(ip: std::net::Ipv6Addr) -> AddrSpace {
    if ip.is_unspecified() || ip.is_multicast() {
        return AddrSpace::INVALID;
    }
    if ip.is_loopback() {
        return AddrSpace::LOOPBACK;
    }
    let seg0 = ip.segments()[0];
    // fe80::/10
    if seg0 & 0xffc0 == 0xfe80 {
        return AddrSpace::LINK6;
    }
    // fc00::/7, unique local
    if seg0 & 0xfe00 == 0xfc00 {
        return AddrSpace::PRIVATE6;
    }
    AddrSpace::PUBLIC6
}

/// Checks that a candidate address is usable for connectivity at all:
/// a valid unicast IP with a non-privileged port.
pub fn acceptable(addr: SocketAddr) -> Result<(), AddrError> {
    if addr.port() < 1024 {
        return Err(AddrError::PrivilegedPort);
    }
    if space_of(addr.ip()) == AddrSpace::INVALID {
        return Err(AddrError::InvalidAddr);
    }
    Ok(())
}

/// Checks that an address is worth advertising as a self address.
///
/// On top of [`acceptable`], ULA IPv6 is too uncommon to help and link-local
/// IPv6 needs zone information the wire format can't carry, so both are
/// rejected. Loopback stays in: it is the only space that works in
/// loopback-only setups.
pub fn good_self(addr: SocketAddr) -> Result<(), AddrError> {
    acceptable(addr)?;
    match space_of(addr.ip()) {
        AddrSpace::PRIVATE6 | AddrSpace::LINK6 => Err(AddrError::DontUse),
        _ => Ok(()),
    }
}

/// Checks that an address is usable as an observed address, which must be
/// the public IPv4 the server saw.
pub fn good_observed(addr: SocketAddr) -> Result<(), AddrError> {
    acceptable(addr)?;
    match space_of(addr.ip()) {
        AddrSpace::PUBLIC4 => Ok(()),
        _ => Err(AddrError::DontUse),
    }
}

/// Formats addresses the way the `Rdv-Self-Addrs` and `Rdv-Peer-Addrs`
/// headers carry them: `ip:port, ip:port, ...`.
pub(crate) fn format_addrs(addrs: &[SocketAddr]) -> String {
    let parts: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
    parts.join(", ")
}

/// Parses a comma-separated address list. The empty string is an empty list.
pub(crate) fn parse_addrs(s: &str) -> Result<Vec<SocketAddr>, AddrParseError> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',').map(|part| part.trim().parse()).collect()
}
