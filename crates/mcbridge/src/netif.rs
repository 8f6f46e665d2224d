// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network interface enumeration.
//!
//! Walks `getifaddrs` once and folds the per-address entries into one
//! [`NetInterface`] per OS interface, carrying the MAC, the best IPv4 and
//! IPv6 addresses and the IPv6 link-local address. "Best" prefers global
//! addresses over link-local (169.254/16, fe80::/10) and unique-local
//! (fc00::/7) ones.

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A snapshot of one OS interface.
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    pub mac: [u8; 6],
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_ll: Option<Ipv6Addr>,
    pub up: bool,
    pub multicast: bool,
}

impl NetInterface {
    fn new(name: &str, index: u32) -> NetInterface {
        NetInterface {
            name: name.to_string(),
            index,
            mac: [0; 6],
            ipv4: None,
            ipv6: None,
            ipv6_ll: None,
            up: false,
            multicast: false,
        }
    }
}

/// True for 169.254.0.0/16.
fn is_ipv4_link_local(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 169 && o[1] == 254
}

/// True for fe80::/10.
fn is_ipv6_link_local(addr: &Ipv6Addr) -> bool {
    let o = addr.octets();
    o[0] == 0xfe && (o[1] & 0xc0) == 0x80
}

/// True for fc00::/7.
fn is_ipv6_unique_local(addr: &Ipv6Addr) -> bool {
    (addr.octets()[0] & 0xfe) == 0xfc
}

/// Enumerate the host's interfaces.
pub fn enumerate() -> io::Result<Vec<NetInterface>> {
    let mut interfaces: Vec<NetInterface> = Vec::new();

    for entry in getifaddrs().map_err(io::Error::from)? {
        let idx = match interfaces.iter().position(|i| i.name == entry.interface_name) {
            Some(idx) => idx,
            None => {
                let index = nix::net::if_::if_nametoindex(entry.interface_name.as_str())
                    .unwrap_or_default();
                interfaces.push(NetInterface::new(&entry.interface_name, index));
                interfaces.len() - 1
            }
        };
        let iface = &mut interfaces[idx];

        iface.up |= entry.flags.contains(InterfaceFlags::IFF_UP);
        iface.multicast |= entry.flags.contains(InterfaceFlags::IFF_MULTICAST);

        let addr = match entry.address {
            Some(addr) => addr,
            None => continue,
        };

        if let Some(link) = addr.as_link_addr() {
            if let Some(mac) = link.addr() {
                iface.mac = mac;
            }
            if link.ifindex() != 0 {
                iface.index = link.ifindex() as u32;
            }
        } else if let Some(sin) = addr.as_sockaddr_in() {
            let ip = sin.ip();
            // Favor global addresses over link-local ones
            if iface.ipv4.is_some() && is_ipv4_link_local(ip) {
                continue;
            }
            iface.ipv4 = Some(ip);
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            let ip = sin6.ip();
            if iface.ipv6_ll.is_none() && is_ipv6_link_local(&ip) {
                iface.ipv6_ll = Some(ip);
            }
            // Favor global addresses over link-local or unique-local ones
            if iface.ipv6.is_some() && (is_ipv6_link_local(&ip) || is_ipv6_unique_local(&ip)) {
                continue;
            }
            iface.ipv6 = Some(ip);
        }
    }

    Ok(interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_classes() {
        assert!(is_ipv4_link_local(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!is_ipv4_link_local(Ipv4Addr::new(10, 0, 0, 5)));

        let ll: Ipv6Addr = "fe80::1".parse().unwrap();
        let ula: Ipv6Addr = "fd00::1".parse().unwrap();
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(is_ipv6_link_local(&ll));
        assert!(!is_ipv6_link_local(&global));
        assert!(is_ipv6_unique_local(&ula));
        assert!(!is_ipv6_unique_local(&global));
    }

    #[test]
    fn enumerate_finds_loopback() {
        let interfaces = enumerate().expect("getifaddrs should succeed");
        assert!(
            interfaces.iter().any(|i| i.name == "lo" || i.name.starts_with("lo")),
            "no loopback interface in {:?}",
            interfaces.iter().map(|i| &i.name).collect::<Vec<_>>()
        );
    }
}
