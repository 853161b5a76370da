//! UDP socket facilities that SSDP needs and `std::net` doesn't offer
//!
//! SSDP on a multi-homed host has to care which interface and address
//! every datagram arrives on and leaves from: replies must originate from
//! the address the peer talked to, and multicast groups are joined per
//! interface. These traits capture exactly that, so the
//! [`Engine`](crate::engine::Engine) can stay agnostic about whether MIO
//! or Tokio (or a test fixture) owns the sockets.

use ::std::net::{IpAddr, SocketAddr};
use weft_netif::InterfaceIndex;

/// The system calls which can fail underneath the UDP traits
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Syscall {
    /// recvmsg() returned an error
    Recvmsg,
    /// sendmsg() returned an error
    Sendmsg,
    /// setsockopt(IP_ADD_MEMBERSHIP) returned an error
    JoinMulticast,
    /// setsockopt(IP_DROP_MEMBERSHIP) returned an error
    LeaveMulticast,
}

/// The errors which can be returned from UDP trait methods
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// recvmsg didn't return packet info as expected
    #[error("recvmsg: no pktinfo returned")]
    NoPacketInfo,

    /// IPv6 attempted (not implemented)
    #[error("IPv6 not implemented")]
    Ipv6NotImplemented,

    /// A system call returned an error
    #[error("error from syscall {0:?}")]
    Syscall(Syscall, #[source] ::std::io::Error),
}

/// Sending UDP datagrams from a specific source IP
pub trait TargetedSend {
    /// Send a UDP datagram from a specific source IP (and interface)
    ///
    /// Works even if two interfaces share the same IP range (169.254/16,
    /// for instance), so long as they have different addresses. The
    /// datagram is built by the callback directly in the transmit buffer;
    /// the callback returns the number of bytes it used.
    ///
    /// For how this works see
    /// <https://man7.org/linux/man-pages/man7/ip.7.html> -- this facility
    /// probably only works on Linux. The interface is agnostic about
    /// IPv4/IPv6, but the current implementation is IPv4-only.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the underlying sendmsg call fails, or (currently)
    /// if IPv6 is attempted.
    fn send_with<F>(
        &self,
        size: usize,
        to: &SocketAddr,
        from: &IpAddr,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut [u8]) -> usize;
}

/// Receiving UDP datagrams, recording which IP we received it on
pub trait TargetedReceive {
    /// Receive a UDP datagram, recording which IP we received it on
    ///
    /// This is not the same as which IP it was addressed to (e.g. in the
    /// case of multicast packets); it's the IP from which the peer would
    /// be expecting a reply to originate.
    ///
    /// The socket must have its `Ipv4PacketInfo` option enabled, using
    /// some equivalent of `nix::sys::socket::setsockopt(&s,
    /// nix::sys::socket::sockopt::Ipv4PacketInfo, &true)`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the underlying recvmsg call fails, if no packet
    /// info is received (check the `setsockopt`), or (currently) if IPv6
    /// is attempted.
    fn receive_to(
        &self,
        buffer: &mut [u8],
    ) -> Result<(usize, IpAddr, SocketAddr), Error>;
}

/// Joining and leaving multicast groups (by interface number)
pub trait Multicast {
    /// Join a particular multicast group on a particular network interface
    ///
    /// # Errors
    ///
    /// Can only fail if the underlying system call fails.
    fn join_multicast_group(
        &self,
        multicast_address: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error>;

    /// Leave a particular multicast group on a particular network interface
    ///
    /// # Errors
    ///
    /// Can only fail if the underlying system call fails.
    fn leave_multicast_group(
        &self,
        multicast_address: &IpAddr,
        interface: InterfaceIndex,
    ) -> Result<(), Error>;
}

/// Utilities common to all implementations using `std::net` underneath
pub mod std;

/// Trait implementations for MIO sockets
#[cfg(feature = "sync")]
pub mod mio;

/// Trait implementations for Tokio sockets
#[cfg(feature = "async")]
pub mod tokio;
