//! Client-identity resolver (§4.9): `x-forwarded-for` → `x-real-ip` →
//! transport peer address, needed because TLS terminates at a proxy whose
//! peer address would otherwise bucket every client together.

use std::net::SocketAddr;

/// Resolves the client address from request headers, falling back to the
/// transport-level peer address.
pub fn resolve_client_address(forwarded_for: Option<&str>, real_ip: Option<&str>, peer: SocketAddr) -> String {
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(real_ip) = real_ip {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 443)
    }

    #[test]
    fn prefers_first_forwarded_for_entry() {
        let addr = resolve_client_address(Some("203.0.113.5, 10.0.0.2"), Some("10.0.0.3"), peer());
        assert_eq!(addr, "203.0.113.5");
    }

    #[test]
    fn falls_back_to_real_ip_when_forwarded_for_absent() {
        let addr = resolve_client_address(None, Some("203.0.113.9"), peer());
        assert_eq!(addr, "203.0.113.9");
    }

    #[test]
    fn falls_back_to_peer_address_when_no_headers_present() {
        let addr = resolve_client_address(None, None, peer());
        assert_eq!(addr, "10.0.0.1");
    }

    #[test]
    fn blank_forwarded_for_falls_through_to_real_ip() {
        let addr = resolve_client_address(Some("  "), Some("203.0.113.9"), peer());
        assert_eq!(addr, "203.0.113.9");
    }
}
