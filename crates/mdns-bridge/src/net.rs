//! OS-facing pieces: interface validation and multicast socket setup.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use anyhow::{Context, Result, bail};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};

use crate::config::InterfaceConfig;
use crate::interface::{Family, Interface};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// What the OS knows about one configured interface.
#[derive(Debug)]
pub struct OsInterface {
    pub if_index: u32,
    pub addr: [Option<IpAddr>; 2],
}

// IPv6 link-local (fe80::/10) and unique-local (fc00::/7).
fn is_ipv6_link_local(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

fn is_ipv6_unique_local(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xfe00 == 0xfc00
}

/// Resolve every configured interface against the system interface list:
/// interface index, plus one address per family, preferring global addresses
/// over link-local (and, for IPv6, unique-local) ones.
pub fn validate_interfaces(configs: &[InterfaceConfig]) -> Result<Vec<OsInterface>> {
    let system = if_addrs::get_if_addrs().context("unable to list system interfaces")?;

    let mut resolved = Vec::with_capacity(configs.len());
    for config in configs {
        let entries: Vec<&if_addrs::Interface> =
            system.iter().filter(|i| i.name == config.name).collect();
        if entries.is_empty() {
            bail!("interface {:?} does not exist", config.name);
        }

        let if_index = entries
            .iter()
            .find_map(|entry| entry.index)
            .with_context(|| format!("interface {:?} has no interface index", config.name))?;

        let mut addr: [Option<IpAddr>; 2] = [None, None];
        for entry in &entries {
            match entry.ip() {
                IpAddr::V4(ip) => {
                    // Keep the first address, then let globals displace
                    // link-local ones.
                    let slot = &mut addr[Family::V4.index()];
                    if slot.is_none() || !ip.is_link_local() {
                        *slot = Some(IpAddr::V4(ip));
                    }
                }
                IpAddr::V6(ip) => {
                    let slot = &mut addr[Family::V6.index()];
                    if slot.is_none() || !(is_ipv6_link_local(ip) || is_ipv6_unique_local(ip)) {
                        *slot = Some(IpAddr::V6(ip));
                    }
                }
            }
        }

        resolved.push(OsInterface { if_index, addr });
    }

    for (index, os) in resolved.iter().enumerate() {
        for (other_index, other) in resolved.iter().enumerate().take(index) {
            if os.if_index == other.if_index {
                bail!(
                    "interfaces {:?} and {:?} are identical",
                    configs[index].name,
                    configs[other_index].name
                );
            }
        }
    }

    Ok(resolved)
}

/// Create the mDNS multicast socket for one interface and family: bound to
/// the device, joined to the group, TTL 255, loopback off, non-blocking.
pub fn bind_multicast(family: Family, iface: &Interface) -> Result<UdpSocket> {
    match family {
        Family::V4 => bind_multicast_v4(iface),
        Family::V6 => bind_multicast_v6(iface),
    }
}

fn bind_multicast_v4(iface: &Interface) -> Result<UdpSocket> {
    let Some(IpAddr::V4(addr)) = iface.addr[Family::V4.index()] else {
        bail!("interface {:?} has no IPv4 address", iface.name);
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    #[cfg(target_os = "linux")]
    socket.bind_device(Some(iface.name.as_bytes()))?;

    socket.set_multicast_ttl_v4(255)?;
    socket.set_multicast_if_v4(&addr)?;
    socket.set_multicast_loop_v4(false)?;

    socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), MDNS_PORT).into())?;
    socket.join_multicast_v4_n(
        &MDNS_GROUP_V4,
        &InterfaceIndexOrAddress::Index(iface.if_index),
    )?;

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_multicast_v6(iface: &Interface) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    #[cfg(target_os = "linux")]
    socket.bind_device(Some(iface.name.as_bytes()))?;

    socket.set_multicast_hops_v6(255)?;
    socket.set_multicast_if_v6(iface.if_index)?;
    socket.set_multicast_loop_v6(false)?;

    socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), MDNS_PORT).into())?;
    socket.join_multicast_v6(&MDNS_GROUP_V6, iface.if_index)?;

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
