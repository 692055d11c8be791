//! Client address resolution behind trusted proxies.
//!
//! Forwarded headers are only honoured when the connecting address is on the
//! trusted proxy list. Anything that fails to parse counts as untrusted.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const REAL_IP: &str = "x-real-ip";

/// Address used when the connection address is unknown.
pub const UNKNOWN_ADDR: &str = "0.0.0.0";

/// Upstream addresses allowed to supply the client address, as literal IPs or
/// `address/prefix` blocks.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    entries: Vec<String>,
}

impl TrustedProxies {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(Into::into)
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `remote` is a listed proxy or falls inside a listed block.
    pub fn is_trusted(&self, remote: &str) -> bool {
        if remote.is_empty() {
            return false;
        }

        if self.entries.iter().any(|entry| entry == remote) {
            return true;
        }

        self.entries
            .iter()
            .filter(|entry| entry.contains('/'))
            .any(|cidr| ip_in_cidr(remote, cidr))
    }
}

/// The client address for `request`.
///
/// Without a trusted proxy in front this is the connecting address. Behind
/// one, the first `X-Forwarded-For` entry wins, then `X-Real-IP`, then the
/// connecting address again.
pub fn resolve_client_ip(request: &Request, proxies: &TrustedProxies) -> String {
    let remote = remote_addr(request);

    if !proxies.is_trusted(&remote) {
        return remote;
    }

    forwarded_ip(request.headers()).unwrap_or(remote)
}

/// The address of the immediate peer.
pub fn remote_addr(request: &Request) -> String {
    let extensions = request.extensions();

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .or_else(|| extensions.get::<SocketAddr>().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_ADDR.to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let from_forwarded_for = headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(well_formed_ip);

    from_forwarded_for.or_else(|| {
        headers
            .get(REAL_IP)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .and_then(well_formed_ip)
    })
}

fn well_formed_ip(value: &str) -> Option<String> {
    value.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Whether `ip` lies inside `cidr` (`address/prefix`).
///
/// Both sides must be the same family and the prefix must be in range for
/// it. Malformed input never matches.
pub fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    let Some((subnet, prefix)) = cidr.trim().split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.trim().parse::<u32>() else {
        return false;
    };
    let (Ok(ip), Ok(subnet)) = (ip.trim().parse::<IpAddr>(), subnet.trim().parse::<IpAddr>()) else {
        return false;
    };

    match (ip, subnet) {
        (IpAddr::V4(ip), IpAddr::V4(subnet)) => prefix_matches(&ip.octets(), &subnet.octets(), prefix),
        (IpAddr::V6(ip), IpAddr::V6(subnet)) => prefix_matches(&ip.octets(), &subnet.octets(), prefix),
        _ => false,
    }
}

/// Compare the leading `prefix` bits of two addresses of equal width.
fn prefix_matches(addr: &[u8], subnet: &[u8], prefix: u32) -> bool {
    if addr.len() != subnet.len() || prefix as usize > addr.len() * 8 {
        return false;
    }

    let whole = (prefix / 8) as usize;
    let bits = prefix % 8;

    if addr[..whole] != subnet[..whole] {
        return false;
    }
    if bits == 0 {
        return true;
    }

    let mask = 0xFFu8 << (8 - bits);
    addr[whole] & mask == subnet[whole] & mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn request_from(remote: &str, headers: &[(&'static str, &'static str)]) -> Request {
        let mut request = Request::new(Body::empty());
        let addr: SocketAddr = match remote.parse::<IpAddr>().unwrap() {
            IpAddr::V4(ip) => (ip, 4000).into(),
            IpAddr::V6(ip) => (ip, 4000).into(),
        };
        request.extensions_mut().insert(ConnectInfo(addr));
        for (name, value) in headers {
            request.headers_mut().insert(*name, HeaderValue::from_static(value));
        }
        request
    }

    #[test]
    fn test_ipv4_cidr_matching() {
        assert!(ip_in_cidr("10.1.2.3", "10.0.0.0/8"));
        assert!(!ip_in_cidr("11.1.2.3", "10.0.0.0/8"));
        assert!(ip_in_cidr("192.168.1.130", "192.168.1.128/25"));
        assert!(!ip_in_cidr("192.168.1.127", "192.168.1.128/25"));
        assert!(ip_in_cidr("203.0.113.9", "0.0.0.0/0"));
        assert!(ip_in_cidr("203.0.113.9", "203.0.113.9/32"));
        assert!(!ip_in_cidr("203.0.113.8", "203.0.113.9/32"));
    }

    #[test]
    fn test_ipv6_cidr_matching() {
        assert!(ip_in_cidr("2001:db8::1234", "2001:db8::/32"));
        assert!(!ip_in_cidr("2001:db9::1", "2001:db8::/32"));
        assert!(ip_in_cidr("2001:db8:ff00::1", "2001:db8:ff00::/39"));
        assert!(!ip_in_cidr("2001:db8:fc00::1", "2001:db8:ff00::/39"));
        assert!(ip_in_cidr("::1", "::1/128"));
    }

    #[test]
    fn test_malformed_cidr_never_matches() {
        assert!(!ip_in_cidr("10.0.0.1", "10.0.0.0"));
        assert!(!ip_in_cidr("10.0.0.1", "/8"));
        assert!(!ip_in_cidr("10.0.0.1", "10.0.0.0/abc"));
        assert!(!ip_in_cidr("10.0.0.1", "10.0.0.0/33"));
        assert!(!ip_in_cidr("10.0.0.1", "10.0.0.0/-1"));
        assert!(!ip_in_cidr("2001:db8::1", "2001:db8::/129"));
        assert!(!ip_in_cidr("not-an-ip", "10.0.0.0/8"));
        assert!(!ip_in_cidr("10.0.0.1", "2001:db8::/32"));
        assert!(!ip_in_cidr("2001:db8::1", "10.0.0.0/8"));
    }

    #[test]
    fn test_trusted_proxies_exact_and_cidr() {
        let proxies = TrustedProxies::new(["10.0.0.1", "172.16.0.0/12", " ", "garbage/x"]);

        assert!(proxies.is_trusted("10.0.0.1"));
        assert!(proxies.is_trusted("172.20.3.4"));
        assert!(!proxies.is_trusted("10.0.0.2"));
        assert!(!proxies.is_trusted(""));
    }

    #[test]
    fn test_uses_remote_addr_when_proxy_untrusted() {
        let request = request_from("10.0.0.2", &[(FORWARDED_FOR, "203.0.113.5")]);
        let proxies = TrustedProxies::new(["10.0.0.1"]);

        assert_eq!(resolve_client_ip(&request, &proxies), "10.0.0.2");
    }

    #[test]
    fn test_uses_forwarded_for_when_proxy_trusted() {
        let request = request_from("10.0.0.1", &[(FORWARDED_FOR, "203.0.113.5, 10.0.0.1")]);
        let proxies = TrustedProxies::new(["10.0.0.1"]);

        assert_eq!(resolve_client_ip(&request, &proxies), "203.0.113.5");
    }

    #[test]
    fn test_uses_forwarded_for_when_proxy_trusted_by_cidr() {
        let request = request_from("10.20.0.7", &[(FORWARDED_FOR, "203.0.113.5, 10.20.0.7")]);
        let proxies = TrustedProxies::new(["10.0.0.0/8"]);
        assert_eq!(resolve_client_ip(&request, &proxies), "203.0.113.5");

        let request = request_from("2001:db8::1", &[(FORWARDED_FOR, "2001:db8::1234, 2001:db8::1")]);
        let proxies = TrustedProxies::new(["2001:db8::/32"]);
        assert_eq!(resolve_client_ip(&request, &proxies), "2001:db8::1234");
    }

    #[test]
    fn test_falls_back_to_real_ip_then_remote() {
        let proxies = TrustedProxies::new(["10.0.0.1"]);

        let request = request_from("10.0.0.1", &[(REAL_IP, "198.51.100.4")]);
        assert_eq!(resolve_client_ip(&request, &proxies), "198.51.100.4");

        let request = request_from(
            "10.0.0.1",
            &[(FORWARDED_FOR, "not-an-ip, 1.2.3.4"), (REAL_IP, "198.51.100.4")],
        );
        assert_eq!(resolve_client_ip(&request, &proxies), "198.51.100.4");

        let request = request_from("10.0.0.1", &[(REAL_IP, "")]);
        assert_eq!(resolve_client_ip(&request, &proxies), "10.0.0.1");
    }

    #[test]
    fn test_unknown_remote_addr() {
        let request = Request::new(Body::empty());
        assert_eq!(remote_addr(&request), UNKNOWN_ADDR);
    }
}
