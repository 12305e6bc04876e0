//! Endpoint discovery for the pairing payload.
//!
//! Classifies local IPv4 addresses as LAN (RFC 1918) or Tailscale
//! (CGNAT `100.64.0.0/10`) and turns the first of each into a `ws://` URL.

use std::net::{IpAddr, Ipv4Addr};

use agentlink_proto::pairing::{EndpointKind, Endpoints};

/// Classifies an address, or `None` if clients cannot use it.
#[must_use]
pub fn classify_ipv4(ip: Ipv4Addr) -> Option<EndpointKind> {
    let [a, b, ..] = ip.octets();
    match (a, b) {
        (10, _) | (192, 168) => Some(EndpointKind::Lan),
        (172, 16..=31) => Some(EndpointKind::Lan),
        (100, 64..=127) => Some(EndpointKind::Tailscale),
        _ => None,
    }
}

/// Builds the WebSocket URL for an address and port.
#[must_use]
pub fn endpoint_url(ip: Ipv4Addr, port: u16) -> String {
    format!("ws://{ip}:{port}/ws")
}

/// Picks the first LAN and first Tailscale address from `candidates`.
#[must_use]
pub fn endpoints_from_addrs(candidates: impl IntoIterator<Item = Ipv4Addr>, port: u16) -> Endpoints {
    let mut endpoints = Endpoints::default();
    for ip in candidates {
        match classify_ipv4(ip) {
            Some(EndpointKind::Lan) if endpoints.lan.is_none() => {
                endpoints.lan = Some(endpoint_url(ip, port));
            }
            Some(EndpointKind::Tailscale) if endpoints.tailscale.is_none() => {
                endpoints.tailscale = Some(endpoint_url(ip, port));
            }
            _ => {}
        }
    }
    endpoints
}

/// Discovers the endpoints this relay can be reached at.
///
/// When bound to a specific address, only that address is advertised.
/// When bound to the unspecified address, every non-loopback IPv4
/// interface is considered.
#[must_use]
pub fn resolve_endpoints(host: &str, port: u16) -> Endpoints {
    if let Ok(ip) = host.parse::<Ipv4Addr>()
        && !ip.is_unspecified()
    {
        return endpoints_from_addrs([ip], port);
    }

    let addrs = match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces,
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate network interfaces");
            return Endpoints::default();
        }
    };
    let candidates = addrs.iter().filter(|iface| !iface.is_loopback()).filter_map(|iface| {
        match iface.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    });
    endpoints_from_addrs(candidates, port)
}
