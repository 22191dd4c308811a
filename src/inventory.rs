//! Host address inventory.
//!
//! Enumerates local interface addresses at startup and keeps the
//! global-unicast ones. The overlay datapath does not consume the list; it is
//! held for future direct-connection and NAT-traversal logic.

use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{info, warn};

/// Classification of a local interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Loopback,
    Multicast,
    LinkLocalUnicast,
    LinkLocalMulticast,
    InterfaceLocalMulticast,
    GlobalUnicast,
    Unknown,
}

impl AddressScope {
    pub fn classify(ip: &IpAddr) -> AddressScope {
        match ip {
            IpAddr::V4(v4) => classify_v4(v4),
            IpAddr::V6(v6) => classify_v6(v6),
        }
    }
}

fn classify_v4(ip: &Ipv4Addr) -> AddressScope {
    let octets = ip.octets();
    if ip.is_loopback() {
        AddressScope::Loopback
    } else if octets[0] == 224 && octets[1] == 0 && octets[2] == 0 {
        AddressScope::LinkLocalMulticast
    } else if ip.is_multicast() {
        AddressScope::Multicast
    } else if ip.is_link_local() {
        AddressScope::LinkLocalUnicast
    } else if ip.is_unspecified() || ip.is_broadcast() {
        AddressScope::Unknown
    } else {
        AddressScope::GlobalUnicast
    }
}

fn classify_v6(ip: &Ipv6Addr) -> AddressScope {
    if ip.is_loopback() {
        AddressScope::Loopback
    } else if ip.is_multicast() {
        // multicast scope lives in the low nibble of the first segment
        match ip.segments()[0] & 0x000f {
            0x1 => AddressScope::InterfaceLocalMulticast,
            0x2 => AddressScope::LinkLocalMulticast,
            _ => AddressScope::Multicast,
        }
    } else if (ip.segments()[0] & 0xffc0) == 0xfe80 {
        AddressScope::LinkLocalUnicast
    } else if ip.is_unspecified() {
        AddressScope::Unknown
    } else {
        AddressScope::GlobalUnicast
    }
}

/// Enumerate host addresses, logging each classification decision, and return
/// the global-unicast ones. Enumeration failure is recoverable and yields an
/// empty list.
pub fn collect() -> Vec<IpAddr> {
    let mut saved = Vec::new();
    info!("looking for available network interfaces");

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        warn!(
            "failed to retrieve list of network interfaces: {}",
            std::io::Error::last_os_error()
        );
        return saved;
    }

    let mut cursor = ifap;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        if let Some(ip) = unsafe { sockaddr_to_ip(entry.ifa_addr) } {
            let name = unsafe { CStr::from_ptr(entry.ifa_name) }.to_string_lossy();
            let scope = AddressScope::classify(&ip);
            let keep = scope == AddressScope::GlobalUnicast;
            info!(
                "interface {}: {} type {:?}, {}",
                name,
                ip,
                scope,
                if keep { "saving" } else { "ignoring" }
            );
            if keep {
                saved.push(ip);
            }
        }
        cursor = entry.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };

    info!("{} addresses were saved", saved.len());
    saved
}

unsafe fn sockaddr_to_ip(sa: *const libc::sockaddr) -> Option<IpAddr> {
    if sa.is_null() {
        return None;
    }
    match (*sa).sa_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}
