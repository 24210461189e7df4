use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::ops::RangeInclusive;

use systemstat::{Platform, System};
use tracing::debug;

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface is
/// returned, or `None` if the host has none.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = system.networks().ok()?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

/// Bind a UDP socket on the first free port of the range.
///
/// `0..=0` binds an ephemeral port.
pub fn bind_in_range(host: IpAddr, range: RangeInclusive<u16>) -> Option<UdpSocket> {
    for port in range {
        match UdpSocket::bind(SocketAddr::new(host, port)) {
            Ok(socket) => return Some(socket),
            Err(e) => debug!("UDP port {} unavailable: {}", port, e),
        }
    }
    None
}
