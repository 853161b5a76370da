//! The core of an SSDP implementation, with no sockets or clock of its own

use crate::refresh::RefreshTimer;
use crate::target::target_match;
use crate::udp;
use crate::wire;
use crate::{Advertisement, Notification, SSDP_GROUP, SSDP_PORT};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use weft_netif::{Flags, InterfaceIndex, NetworkEvent};

const MAX_PACKET_SIZE: usize = 512;

/// A callback made by [`Engine`] when notification messages arrive
///
/// See the implementations in [`crate::Service`] and
/// [`crate::AsyncService`].
pub trait Callback {
    /// An SSDP notification has been received
    fn on_notification(&self, notification: &Notification);
}

struct Interface {
    ips: Vec<IpAddr>,
    up: bool,
}

struct ActiveSearch<CB: Callback> {
    target: String,
    callback: CB,
}

slotmap::new_key_type! { struct SearchKey; }

/// The protocol core of an SSDP implementation
///
/// This low-level facility is usually wrapped up in [`crate::Service`]
/// or [`crate::AsyncService`] for use in larger programs, but can also be
/// driven directly when needed.
///
/// The `Engine` handles parsing and emitting SSDP messages; it does not
/// own or define the UDP sockets themselves, which are left to its
/// owner. The owner should pass incoming UDP packets to
/// [`Engine::on_data`], and changes to available network interfaces to
/// [`Engine::on_network_event`]. The owner should also implement a timer
/// facility: the `Engine` can be asked at any time when it next needs a
/// timer callback ([`Engine::next_wakeup`]), and, when that time comes,
/// [`Engine::wakeup`] must be called.
pub struct Engine<CB: Callback> {
    interfaces: HashMap<InterfaceIndex, Interface>,
    searches: SlotMap<SearchKey, ActiveSearch<CB>>,
    advertisements: HashMap<String, Advertisement>,
    refresh: RefreshTimer,
}

impl<CB: Callback> Default for Engine<CB> {
    fn default() -> Self {
        Self::new()
    }
}

impl<CB: Callback> Engine<CB> {
    /// Create a new `Engine`, parameterised by callback type
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a new `Engine` with a fixed retransmit-jitter seed
    #[must_use]
    pub fn with_seed(seed: u32) -> Self {
        Engine {
            interfaces: HashMap::default(),
            searches: SlotMap::with_key(),
            advertisements: HashMap::default(),
            refresh: RefreshTimer::new(seed, Instant::now()),
        }
    }

    /// Obtain the desired delay before the next [`Engine::wakeup`]
    #[must_use]
    pub fn next_wakeup(&self) -> std::time::Duration {
        self.refresh
            .next_salvo()
            .saturating_duration_since(Instant::now())
    }

    /// Notify the `Engine` that its timeout has expired
    ///
    /// Retransmits all current advertisements and searches. The desired
    /// timeout duration can be obtained from [`Engine::next_wakeup`]; a
    /// premature call does nothing.
    pub fn wakeup<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        socket: &SCK,
    ) {
        if !self.next_wakeup().is_zero() {
            return;
        }
        self.refresh.update(Instant::now());

        for (usn, advertisement) in &self.advertisements {
            self.notify_on_all(usn, advertisement, socket);
        }

        // One ssdp:all search subsumes all the specific ones
        if self.searches.values().any(|s| s.target == "ssdp:all") {
            self.search_on_all("ssdp:all", socket);
        } else {
            for s in self.searches.values() {
                self.search_on_all(&s.target, socket);
            }
        }
    }

    /// Subscribe to notifications of a particular resource type
    ///
    /// Sends searches immediately, then re-sends them periodically.
    pub fn subscribe<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        notification_type: String,
        callback: CB,
        socket: &SCK,
    ) {
        self.search_on_all(&notification_type, socket);
        self.searches.insert(ActiveSearch {
            target: notification_type,
            callback,
        });
    }

    /// Advertise a local resource to SSDP peers
    pub fn advertise<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        unique_service_name: String,
        advertisement: Advertisement,
        socket: &SCK,
    ) {
        self.notify_on_all(&unique_service_name, &advertisement, socket);
        self.advertisements
            .insert(unique_service_name, advertisement);
    }

    /// Withdraw an advertisement for a local resource
    ///
    /// It is polite to call this when shutting down cleanly; peers
    /// otherwise only notice once the advertisement's max-age runs out.
    pub fn deadvertise<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        unique_service_name: &str,
        socket: &SCK,
    ) {
        if let Some(advertisement) =
            self.advertisements.remove(unique_service_name)
        {
            for interface in self.interfaces.values() {
                if interface.up {
                    for ip in &interface.ips {
                        Self::byebye_on(
                            &advertisement.notification_type,
                            unique_service_name,
                            ip,
                            socket,
                        );
                    }
                }
            }
        }
    }

    /// Notify the `Engine` that data is ready on one of its sockets
    ///
    /// `wasto` is the local address the packet arrived on (which is where
    /// any reply must originate), `wasfrom` the peer's address.
    pub fn on_data<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        buf: &[u8],
        socket: &SCK,
        wasto: IpAddr,
        wasfrom: SocketAddr,
    ) {
        let Ok(m) = wire::parse(buf) else {
            return; // not SSDP; not our problem
        };
        match m {
            wire::Message::Alive {
                notification_type,
                unique_service_name,
                location,
                max_age,
            } => self.call_subscribers(&Notification::Alive {
                notification_type,
                unique_service_name,
                location,
                max_age,
            }),
            wire::Message::ByeBye {
                notification_type,
                unique_service_name,
            } => self.call_subscribers(&Notification::ByeBye {
                notification_type,
                unique_service_name,
            }),
            wire::Message::Response {
                search_target,
                unique_service_name,
                location,
                max_age,
            } => self.call_subscribers(&Notification::Alive {
                notification_type: search_target,
                unique_service_name,
                location,
                max_age,
            }),
            wire::Message::Search { search_target, .. } => {
                self.respond(&search_target, socket, wasto, wasfrom);
            }
        }
    }

    fn respond<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        search_target: &str,
        socket: &SCK,
        wasto: IpAddr,
        wasfrom: SocketAddr,
    ) {
        for (usn, advertisement) in &self.advertisements {
            if target_match(search_target, &advertisement.notification_type) {
                let mut url = advertisement.location.clone();
                let _ = url.set_ip_host(wasto);

                // An ssdp:all response names the concrete type
                let response_type = if search_target == "ssdp:all" {
                    &advertisement.notification_type
                } else {
                    search_target
                };
                let _ = socket.send_with(
                    MAX_PACKET_SIZE,
                    &wasfrom,
                    &wasto,
                    |b| {
                        wire::build_response(b, response_type, usn, url.as_str())
                    },
                );
            }
        }
    }

    fn call_subscribers(&self, notification: &Notification) {
        let notification_type = match notification {
            Notification::Alive {
                notification_type, ..
            }
            | Notification::ByeBye {
                notification_type, ..
            } => notification_type,
        };
        for s in self.searches.values() {
            if target_match(&s.target, notification_type) {
                s.callback.on_notification(notification);
            }
        }
    }

    /// Notify the `Engine` of a network interface change
    ///
    /// Multicast-capable interfaces have the SSDP group joined as they
    /// appear, and left as they disappear; anything currently advertised
    /// or searched for is re-sent as addresses come up.
    ///
    /// # Errors
    ///
    /// Passes on errors from the underlying system calls for joining (and
    /// leaving) multicast groups.
    pub fn on_network_event<SCK: udp::TargetedSend + udp::Multicast>(
        &mut self,
        event: &NetworkEvent,
        multicast: &SCK,
        search: &SCK,
    ) -> Result<(), udp::Error> {
        match event {
            NetworkEvent::NewLink(ix, _name, flags) => {
                if flags.contains(Flags::MULTICAST) {
                    let up =
                        flags.contains(Flags::RUNNING | Flags::UP);
                    if let Some(v) = self.interfaces.get_mut(ix) {
                        let came_up = up && !v.up;
                        v.up = up;
                        if came_up {
                            self.refresh.reset(Instant::now());
                            self.send_all(&self.interfaces[ix].ips, search);
                        }
                    } else {
                        multicast.join_multicast_group(&SSDP_GROUP, *ix)?;
                        self.interfaces.insert(
                            *ix,
                            Interface {
                                ips: Vec::new(),
                                up,
                            },
                        );
                    }
                }
            }
            NetworkEvent::DelLink(ix) => {
                if self.interfaces.remove(ix).is_some() {
                    multicast.leave_multicast_group(&SSDP_GROUP, *ix)?;
                }
            }
            NetworkEvent::NewAddr(ix, addr, _prefix) => {
                if addr.is_ipv4() {
                    // a NewLink always precedes the interface's NewAddrs
                    if let Some(v) = self.interfaces.get_mut(ix) {
                        if !v.ips.contains(addr) {
                            v.ips.push(*addr);
                            if v.up {
                                self.send_all(&[*addr], search);
                            }
                        }
                    }
                }
            }
            NetworkEvent::DelAddr(ix, addr, _prefix) => {
                if let Some(v) = self.interfaces.get_mut(ix) {
                    if let Some(n) = v.ips.iter().position(|a| a == addr) {
                        v.ips.swap_remove(n);
                    }
                }
            }
        }
        Ok(())
    }

    fn send_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        ips: &[IpAddr],
        socket: &SCK,
    ) {
        for ip in ips {
            if self.searches.values().any(|s| s.target == "ssdp:all") {
                Self::search_on("ssdp:all", ip, socket);
            } else {
                for s in self.searches.values() {
                    Self::search_on(&s.target, ip, socket);
                }
            }
            for (usn, advertisement) in &self.advertisements {
                Self::notify_on(usn, advertisement, ip, socket);
            }
        }
    }

    fn multicast_dest() -> SocketAddr {
        SocketAddr::new(SSDP_GROUP, SSDP_PORT)
    }

    fn search_on<SCK: udp::TargetedSend + udp::Multicast>(
        search_target: &str,
        source: &IpAddr,
        socket: &SCK,
    ) {
        let _ = socket.send_with(
            MAX_PACKET_SIZE,
            &Self::multicast_dest(),
            source,
            |b| wire::build_search(b, search_target),
        );
    }

    fn search_on_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        search_target: &str,
        socket: &SCK,
    ) {
        for interface in self.interfaces.values() {
            if interface.up {
                for ip in &interface.ips {
                    Self::search_on(search_target, ip, socket);
                }
            }
        }
    }

    fn notify_on<SCK: udp::TargetedSend + udp::Multicast>(
        unique_service_name: &str,
        advertisement: &Advertisement,
        source: &IpAddr,
        socket: &SCK,
    ) {
        let mut url = advertisement.location.clone();
        let _ = url.set_ip_host(*source);
        let _ = socket.send_with(
            MAX_PACKET_SIZE,
            &Self::multicast_dest(),
            source,
            |b| {
                wire::build_alive(
                    b,
                    &advertisement.notification_type,
                    unique_service_name,
                    url.as_str(),
                )
            },
        );
    }

    fn notify_on_all<SCK: udp::TargetedSend + udp::Multicast>(
        &self,
        unique_service_name: &str,
        advertisement: &Advertisement,
        socket: &SCK,
    ) {
        for interface in self.interfaces.values() {
            if interface.up {
                for ip in &interface.ips {
                    Self::notify_on(
                        unique_service_name,
                        advertisement,
                        ip,
                        socket,
                    );
                }
            }
        }
    }

    fn byebye_on<SCK: udp::TargetedSend + udp::Multicast>(
        notification_type: &str,
        unique_service_name: &str,
        source: &IpAddr,
        socket: &SCK,
    ) {
        let _ = socket.send_with(
            MAX_PACKET_SIZE,
            &Self::multicast_dest(),
            source,
            |b| {
                wire::build_byebye(b, notification_type, unique_service_name)
            },
        );
    }
}
