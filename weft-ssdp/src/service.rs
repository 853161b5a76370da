use crate::engine::{Callback, Engine};
use crate::udp::TargetedReceive;
use crate::{Advertisement, Notification, ServiceError, SSDP_PORT};
use std::time::Duration;

fn new_socket(port: u16) -> Result<mio::net::UdpSocket, std::io::Error> {
    Ok(mio::net::UdpSocket::from_std(crate::udp::std::setup_socket(
        port,
    )?))
}

struct SyncCallback {
    callback: Box<dyn Fn(&Notification)>,
}

impl Callback for SyncCallback {
    fn on_notification(&self, n: &Notification) {
        (self.callback)(n);
    }
}

/// High-level synchronous SSDP service for MIO event loops
///
/// Owns the two UDP sockets (the shared multicast one on port 1900, and
/// a unicast one for searches and replies) and registers them with the
/// caller's [`mio::Registry`]; the caller's poll loop hands readiness
/// events back via [`Service::multicast_ready`] and
/// [`Service::search_ready`], and drives retransmission with
/// [`Service::next_wakeup`]/[`Service::wakeup`].
pub struct Service {
    engine: Engine<SyncCallback>,
    multicast_socket: mio::net::UdpSocket,
    search_socket: mio::net::UdpSocket,
}

impl Service {
    /// Create a new `Service`, registering its sockets with `registry`
    ///
    /// The current network interfaces are snapshotted once, here; an
    /// interface whose multicast group cannot be joined is skipped (with
    /// a warning) rather than failing the whole service.
    ///
    /// # Errors
    ///
    /// Can return a `std::io::Error` if socket setup fails.
    pub fn new(
        registry: &mio::Registry,
        tokens: (mio::Token, mio::Token),
    ) -> Result<Self, ServiceError> {
        let mut multicast_socket = new_socket(SSDP_PORT)?;
        let mut search_socket = new_socket(0)?; // ephemeral port
        let mut engine = Engine::new();

        for event in weft_netif::get_interfaces()? {
            if let Err(e) = engine.on_network_event(
                &event,
                &multicast_socket,
                &search_socket,
            ) {
                tracing::warn!("skipping interface event {event:?}: {e}");
            }
        }

        registry.register(
            &mut multicast_socket,
            tokens.0,
            mio::Interest::READABLE,
        )?;
        registry.register(
            &mut search_socket,
            tokens.1,
            mio::Interest::READABLE,
        )?;

        Ok(Self {
            engine,
            multicast_socket,
            search_socket,
        })
    }

    /// Subscribe to SSDP notifications for a resource type
    ///
    /// The callback is invoked (on the polling thread) for each matching
    /// notification, possibly repeatedly for the same resource.
    pub fn subscribe<A>(
        &mut self,
        notification_type: A,
        callback: Box<dyn Fn(&Notification)>,
    ) where
        A: Into<String>,
    {
        self.engine.subscribe(
            notification_type.into(),
            SyncCallback { callback },
            &self.search_socket,
        );
    }

    /// Announce a new resource, and start answering searches for it
    pub fn advertise<USN>(
        &mut self,
        unique_service_name: USN,
        advertisement: Advertisement,
    ) where
        USN: Into<String>,
    {
        self.engine.advertise(
            unique_service_name.into(),
            advertisement,
            &self.search_socket,
        );
    }

    /// Announce the disappearance of a resource, and stop answering
    pub fn deadvertise(&mut self, unique_service_name: &str) {
        self.engine
            .deadvertise(unique_service_name, &self.search_socket);
    }

    /// Deal with a readiness event on the multicast socket
    pub fn multicast_ready(&mut self, event: &mio::event::Event) {
        if event.is_readable() {
            let mut buf = [0u8; 1500];
            if let Ok((n, wasto, wasfrom)) =
                self.multicast_socket.receive_to(&mut buf)
            {
                self.engine.on_data(
                    &buf[0..n],
                    &self.search_socket,
                    wasto,
                    wasfrom,
                );
            }
        }
    }

    /// Deal with a readiness event on the search socket
    pub fn search_ready(&mut self, event: &mio::event::Event) {
        if event.is_readable() {
            let mut buf = [0u8; 1500];
            if let Ok((n, wasto, wasfrom)) =
                self.search_socket.receive_to(&mut buf)
            {
                self.engine.on_data(
                    &buf[0..n],
                    &self.search_socket,
                    wasto,
                    wasfrom,
                );
            }
        }
    }

    /// How long until [`Service::wakeup`] next needs calling
    ///
    /// Suitable as the poll timeout.
    #[must_use]
    pub fn next_wakeup(&self) -> Duration {
        self.engine.next_wakeup()
    }

    /// Retransmit advertisements and searches, if due
    pub fn wakeup(&mut self) {
        self.engine.wakeup(&self.search_socket);
    }

    /// The (ephemeral) port of the search socket
    ///
    /// Search replies arrive here; mostly useful for tests.
    ///
    /// # Errors
    ///
    /// Passes on failures of `getsockname`.
    pub fn search_port(&self) -> Result<u16, std::io::Error> {
        Ok(self.search_socket.local_addr()?.port())
    }
}
