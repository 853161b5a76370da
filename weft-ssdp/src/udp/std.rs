use nix::cmsg_space;
use nix::sys::socket::sockopt::Ipv4PacketInfo;
use nix::sys::socket::{
    setsockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrStorage,
};
use std::io::{IoSlice, IoSliceMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use weft_netif::InterfaceIndex;

/// Create a UDP socket suitable for the SSDP traits
///
/// Nonblocking, address-reusing (several SSDP processes can coexist on
/// port 1900), bound to INADDR_ANY, with `IP_PKTINFO` enabled so
/// [`receive_to`] can see arrival addresses.
pub(crate) fn setup_socket(
    port: u16,
) -> Result<std::net::UdpSocket, std::io::Error> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        None,
    )?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        port,
    )))?;
    setsockopt(&socket, Ipv4PacketInfo, &true)?;
    Ok(socket.into())
}

/// Join or leave (op is `IP_ADD_MEMBERSHIP`/`IP_DROP_MEMBERSHIP`) a group
/// on one particular interface
///
/// The std::net API joins by IP address, but that's not robust when
/// interfaces share address ranges; Linux has long supported joining by
/// interface index, reachable only through the lower-level `ip_mreqn`.
#[allow(clippy::cast_possible_truncation)] // socklen_t
#[allow(clippy::cast_possible_wrap)] // ifindex
pub(crate) fn ipv4_multicast_operation(
    fd: RawFd,
    op: libc::c_int,
    multicast_address: &IpAddr,
    interface: InterfaceIndex,
) -> Result<(), std::io::Error> {
    let IpAddr::V4(group) = multicast_address else {
        return Err(std::io::ErrorKind::Unsupported.into());
    };
    let mreqn = libc::ip_mreqn {
        imr_multiaddr: libc::in_addr {
            s_addr: u32::from_ne_bytes(group.octets()),
        },
        imr_address: libc::in_addr { s_addr: 0 },
        imr_ifindex: interface.0 as libc::c_int,
    };
    // SAFETY: mreqn outlives the call and its size is passed alongside
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            op,
            std::ptr::addr_of!(mreqn).cast::<libc::c_void>(),
            std::mem::size_of_val(&mreqn) as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// sendmsg with an `IP_PKTINFO` control message pinning the source address
pub(crate) fn send_from(
    fd: RawFd,
    buffer: &[u8],
    to: &SocketAddr,
    from: &IpAddr,
) -> Result<(), std::io::Error> {
    let IpAddr::V4(from) = from else {
        return Err(std::io::ErrorKind::Unsupported.into());
    };
    let iov = [IoSlice::new(buffer)];
    let pi = libc::in_pktinfo {
        ipi_ifindex: 0,
        ipi_addr: libc::in_addr { s_addr: 0 },
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::to_be((*from).into()),
        },
    };
    let cmsg = ControlMessage::Ipv4PacketInfo(&pi);
    let dest = match to {
        SocketAddr::V4(v4) => SockaddrStorage::from(*v4),
        SocketAddr::V6(v6) => SockaddrStorage::from(*v6),
    };
    nix::sys::socket::sendmsg(
        fd,
        &iov,
        &[cmsg],
        MsgFlags::empty(),
        Some(&dest),
    )?;
    Ok(())
}

/// recvmsg, returning (size, arrival address, sender)
pub(crate) fn receive_to(
    fd: RawFd,
    buffer: &mut [u8],
) -> Result<(usize, IpAddr, SocketAddr), std::io::Error> {
    let mut cmsgspace = cmsg_space!(libc::in_pktinfo);
    let mut iov = [IoSliceMut::new(buffer)];
    let r = nix::sys::socket::recvmsg::<SockaddrStorage>(
        fd,
        &mut iov,
        Some(&mut cmsgspace),
        MsgFlags::empty(),
    )?;

    let mut cmsgs = r.cmsgs()?;
    let Some(ControlMessageOwned::Ipv4PacketInfo(pi)) = cmsgs.next() else {
        return Err(std::io::ErrorKind::InvalidData.into());
    };
    let rxon = IpAddr::V4(Ipv4Addr::from(u32::from_be(pi.ipi_spec_dst.s_addr)));

    let sender = r
        .address
        .as_ref()
        .and_then(SockaddrStorage::as_sockaddr_in)
        .map(|sin| SocketAddrV4::new(Ipv4Addr::from(sin.ip()), sin.port()))
        .ok_or(std::io::ErrorKind::InvalidData)?;

    Ok((r.bytes, rxon, SocketAddr::V4(sender)))
}
