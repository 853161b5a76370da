//! Enumerating network interfaces and their IP addresses
//!
//! The weft-netif crate obtains the host's network interfaces and the
//! addresses configured on them, presenting the result as a sequence of
//! [`NetworkEvent`] values. The same event type is used by consumers
//! (such as weft-ssdp) that want to track interfaces over time, so a
//! one-off snapshot and a future live watcher share a vocabulary.

use bitflags::bitflags;
use std::net::IpAddr;

/// Kernel network interface index (1-based)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceIndex(pub u32);

bitflags! {
    /// Interface status flags, a subset of Linux's IFF_*
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Flags: u32 {
        const NONE = 0;
        const UP = 0x1;
        const BROADCAST = 0x2;
        const LOOPBACK = 0x4;
        const POINTTOPOINT = 0x8; // not preserving Posix misspelling
        const RUNNING = 0x40;
        const PROMISCUOUS = 0x100;
        const MULTICAST = 0x1000;
    }
}

/// A change (or, in a snapshot, a fact) about a network interface
///
/// A `NewLink` describing an interface always precedes any `NewAddr`
/// carrying one of that interface's addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// An interface exists (or changed flags)
    NewLink(InterfaceIndex, String, Flags),
    /// An interface went away
    DelLink(InterfaceIndex),
    /// An address appeared on an interface (with prefix length)
    NewAddr(InterfaceIndex, IpAddr, u8),
    /// An address disappeared from an interface
    DelAddr(InterfaceIndex, IpAddr, u8),
}

#[cfg(unix)]
mod snapshot;

#[cfg(unix)]
pub use snapshot::get_interfaces;
