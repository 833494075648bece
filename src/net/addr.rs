//! Address helpers and local interface enumeration.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::Mutex;

/// Normalizes an IP for indexing: IPv4-mapped IPv6 collapses to IPv4.
#[inline]
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

/// Splits `host[:port]` into host and port.
///
/// Unlike a strict parser, the port may be missing, in which case
/// `default_port` is returned. Bracketed and bare IPv6 literals are understood.
///
/// ```rust
/// use tunproxy::net::split_host_port;
///
/// assert_eq!(split_host_port("example.com:8080", "80"), ("example.com", "8080"));
/// assert_eq!(split_host_port("example.com", "80"), ("example.com", "80"));
/// assert_eq!(split_host_port("[::1]:22", ""), ("::1", "22"));
/// assert_eq!(split_host_port("::1", "22"), ("::1", "22"));
/// ```
pub fn split_host_port<'a>(hostport: &'a str, default_port: &'a str) -> (&'a str, &'a str) {
    if let Some(rest) = hostport.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':') {
                return (host, port);
            }
            if tail.is_empty() {
                return (host, default_port);
            }
        }
        return (hostport, default_port);
    }

    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, port),
        _ => (hostport, default_port),
    }
}

/// Appends `default_port` to `hostport` unless it already carries a port.
///
/// ```rust
/// use tunproxy::net::with_default_port;
///
/// assert_eq!(with_default_port("tunnel.example.net", 22), "tunnel.example.net:22");
/// assert_eq!(with_default_port("tunnel.example.net:2222", 22), "tunnel.example.net:2222");
/// assert_eq!(with_default_port("fe80::1", 22), "[fe80::1]:22");
/// ```
pub fn with_default_port(hostport: &str, default_port: u16) -> String {
    let default = default_port.to_string();
    let (host, port) = split_host_port(hostport, &default);
    if port.is_empty() {
        return host.to_string();
    }
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Source of the set of IP addresses currently assigned to local interfaces.
///
/// Returned addresses must already be normalized with [`normalize_ip`].
pub trait AddressSource: Send + Sync + 'static {
    /// Enumerates local addresses.
    fn local_addresses(&self) -> io::Result<HashSet<IpAddr>>;
}

/// Enumerates addresses from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddresses;

impl AddressSource for SystemAddresses {
    fn local_addresses(&self) -> io::Result<HashSet<IpAddr>> {
        Ok(if_addrs::get_if_addrs()?
            .into_iter()
            .map(|iface| normalize_ip(iface.ip()))
            .collect())
    }
}

/// Externally controlled address set.
///
/// For hosts that learn about addresses from their own notifier, and for
/// simulating interface churn.
#[derive(Debug, Default)]
pub struct StaticAddresses {
    addrs: Mutex<HashSet<IpAddr>>,
}

impl StaticAddresses {
    /// Starts with `addrs`.
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: Mutex::new(addrs.into_iter().map(normalize_ip).collect()),
        }
    }

    /// Adds an address.
    pub fn insert(&self, ip: IpAddr) {
        self.lock().insert(normalize_ip(ip));
    }

    /// Removes an address.
    pub fn remove(&self, ip: IpAddr) {
        self.lock().remove(&normalize_ip(ip));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<IpAddr>> {
        self.addrs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AddressSource for StaticAddresses {
    fn local_addresses(&self) -> io::Result<HashSet<IpAddr>> {
        Ok(self.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn mapped_v6_collapses_to_v4() {
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped());
        assert_eq!(normalize_ip(mapped), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert_eq!(normalize_ip(v6), v6);
    }

    #[test]
    fn split_keeps_malformed_input_as_host() {
        assert_eq!(split_host_port("[::1", "80"), ("[::1", "80"));
        assert_eq!(split_host_port("[::1]x", "80"), ("[::1]x", "80"));
        assert_eq!(split_host_port("", "80"), ("", "80"));
    }

    #[test]
    fn static_addresses_track_changes() {
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let lan = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let src = StaticAddresses::new([lo]);
        src.insert(lan);
        src.remove(lo);
        let got = src.local_addresses().expect("addresses");
        assert_eq!(got, HashSet::from([lan]));
    }

    #[test]
    fn system_addresses_include_loopback() {
        let got = SystemAddresses.local_addresses().expect("addresses");
        assert!(got.iter().any(IpAddr::is_loopback));
    }
}
