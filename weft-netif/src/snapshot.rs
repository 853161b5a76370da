use super::{Flags, InterfaceIndex, NetworkEvent};
use nix::ifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

/// Obtain the current list of network interfaces
///
/// Returns a snapshot: one [`NetworkEvent::NewLink`] per interface,
/// followed (not necessarily adjacently) by a [`NetworkEvent::NewAddr`]
/// for each address on it. No `DelLink`/`DelAddr` events are produced.
/// Linux interface aliases ("eth0:1") are folded onto the base interface.
///
/// ```no_run
/// for e in weft_netif::get_interfaces()? {
///     println!("{e:?}");
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
pub fn get_interfaces() -> Result<impl Iterator<Item = NetworkEvent>, std::io::Error>
{
    let addrs = ifaddrs::getifaddrs()?;
    Ok(collect(addrs).into_iter())
}

fn collect(
    addrs: impl Iterator<Item = ifaddrs::InterfaceAddress>,
) -> Vec<NetworkEvent> {
    let mut links = Vec::new();
    let mut ips = Vec::new();
    let mut indexes = HashMap::<String, u32>::new();

    for ifaddr in addrs {
        // Undo Linux aliasing: "eth0:1" is "eth0" really.
        let name = match ifaddr.interface_name.split_once(':') {
            None => ifaddr.interface_name.clone(),
            Some((base, _alias)) => base.to_string(),
        };

        let next = indexes.len() as u32 + 1;
        let index = *indexes.entry(name.clone()).or_insert_with(|| {
            links.push(NetworkEvent::NewLink(
                InterfaceIndex(next),
                name,
                flags_of(&ifaddr.flags),
            ));
            next
        });

        if let Some(event) = addr_event(InterfaceIndex(index), &ifaddr) {
            ips.push(event);
        }
    }

    links.extend(ips);
    links
}

/// Interpret one getifaddrs entry as an address, if it carries one
///
/// Entries without both an IP address and a matching-family netmask
/// (packet sockets, mismatched results) yield nothing.
fn addr_event(
    index: InterfaceIndex,
    ifaddr: &ifaddrs::InterfaceAddress,
) -> Option<NetworkEvent> {
    let addr = ifaddr.address.as_ref()?;
    let mask = ifaddr.netmask.as_ref()?;
    if let (Some(a4), Some(m4)) = (addr.as_sockaddr_in(), mask.as_sockaddr_in())
    {
        return Some(NetworkEvent::NewAddr(
            index,
            IpAddr::from(Ipv4Addr::from(a4.ip())),
            u32::from(m4.ip()).leading_ones() as u8,
        ));
    }
    if let (Some(a6), Some(m6)) =
        (addr.as_sockaddr_in6(), mask.as_sockaddr_in6())
    {
        return Some(NetworkEvent::NewAddr(
            index,
            IpAddr::from(a6.ip()),
            u128::from_be_bytes(m6.as_ref().sin6_addr.s6_addr).leading_ones()
                as u8,
        ));
    }
    None
}

fn flags_of(flags: &InterfaceFlags) -> Flags {
    let mut out = Flags::NONE;
    for (iff, f) in [
        (InterfaceFlags::IFF_UP, Flags::UP),
        (InterfaceFlags::IFF_BROADCAST, Flags::BROADCAST),
        (InterfaceFlags::IFF_LOOPBACK, Flags::LOOPBACK),
        (InterfaceFlags::IFF_POINTOPOINT, Flags::POINTTOPOINT),
        (InterfaceFlags::IFF_RUNNING, Flags::RUNNING),
        (InterfaceFlags::IFF_MULTICAST, Flags::MULTICAST),
    ] {
        if flags.contains(iff) {
            out |= f;
        }
    }
    out
}
