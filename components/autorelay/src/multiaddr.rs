use std::net::IpAddr;

use libp2p::PeerId;
use libp2p::multiaddr::{Multiaddr, Protocol};

/// Whether the address routes through a relay circuit.
pub fn is_relay_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Whether the address points into a private network: RFC1918, link-local,
/// unique-local or loopback. Peers behind the same NAT can still dial these.
pub fn is_private_addr(addr: &Multiaddr) -> bool {
    ip_component(addr).is_some_and(is_private_ip)
}

/// Filter a relay's advertised address set down to entries a remote peer could
/// actually dial: circuit addresses and non-public addresses are dropped, DNS
/// addresses are kept as-is.
pub fn cleanup_address_set(addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter(|addr| !is_relay_addr(addr) && (is_dns_addr(addr) || ip_component(addr).is_some_and(is_public_ip)))
        .cloned()
        .collect()
}

/// Append the `/p2p/<relay>/p2p-circuit` suffix denoting "reach me through this
/// relay". The relay's peer id is only inserted when the address doesn't carry
/// one already.
pub fn encapsulate_circuit(addr: &Multiaddr, relay: PeerId) -> Multiaddr {
    let mut out = addr.clone();
    if !out.iter().any(|p| matches!(p, Protocol::P2p(_))) {
        out.push(Protocol::P2p(relay));
    }
    out.push(Protocol::P2pCircuit);
    out
}

fn ip_component(addr: &Multiaddr) -> Option<IpAddr> {
    let mut ip = None;
    for protocol in addr.iter() {
        match protocol {
            Protocol::Ip4(v4) => ip = Some(IpAddr::V4(v4)),
            Protocol::Ip6(v6) => ip = Some(IpAddr::V6(v6)),
            _ => {}
        }
    }
    ip
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback() || (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

fn is_public_ip(ip: IpAddr) -> bool {
    !ip.is_unspecified() && !ip.is_multicast() && !is_private_ip(ip)
}

fn is_dns_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_)))
}
