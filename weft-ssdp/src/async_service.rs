use crate::engine::{Callback, Engine};
use crate::udp::TargetedReceive;
use crate::{Advertisement, Notification, ServiceError, SSDP_PORT};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

struct AsyncCallback {
    channel: mpsc::Sender<Notification>,
}

impl Callback for AsyncCallback {
    fn on_notification(&self, n: &Notification) {
        // A subscriber whose channel is full just misses a notification;
        // SSDP will repeat it later anyway.
        let _ = self.channel.try_send(n.clone());
    }
}

struct Inner {
    engine: Mutex<Engine<AsyncCallback>>,
    multicast_socket: tokio::net::UdpSocket,
    search_socket: tokio::net::UdpSocket,
}

impl Inner {
    fn new(engine: Engine<AsyncCallback>) -> Result<Inner, std::io::Error> {
        let multicast_socket = crate::udp::std::setup_socket(SSDP_PORT)?;
        let search_socket = crate::udp::std::setup_socket(0)?;
        Ok(Inner {
            engine: Mutex::new(engine),
            multicast_socket: tokio::net::UdpSocket::from_std(
                multicast_socket,
            )?,
            search_socket: tokio::net::UdpSocket::from_std(search_socket)?,
        })
    }

    fn on_socket_ready(&self, socket: &tokio::net::UdpSocket) {
        let mut buf = [0u8; 1500];
        if let Ok((n, wasto, wasfrom)) = socket.receive_to(&mut buf) {
            self.engine.lock().unwrap().on_data(
                &buf[0..n],
                &self.search_socket,
                wasto,
                wasfrom,
            );
        }
    }
}

/// High-level asynchronous SSDP service using Tokio
///
/// Handles incoming and outgoing searches and notifications on a spawned
/// task; subscriptions are delivered as a [`Stream`].
pub struct AsyncService {
    inner: Arc<Inner>,
}

impl AsyncService {
    /// Create a new `AsyncService`, including its two UDP sockets
    ///
    /// The current network interfaces are snapshotted once, here; an
    /// interface whose multicast group cannot be joined is skipped (with
    /// a warning) rather than failing the whole service.
    ///
    /// # Errors
    ///
    /// Can return a `std::io::Error` if any of the underlying socket
    /// calls fail.
    ///
    /// # Panics
    ///
    /// Will panic if the internal mutex cannot be locked; that would
    /// indicate a bug in weft-ssdp.
    pub async fn new() -> Result<Self, ServiceError> {
        let inner = Arc::new(Inner::new(Engine::new())?);

        {
            let mut engine = inner.engine.lock().unwrap();
            for event in weft_netif::get_interfaces()? {
                if let Err(e) = engine.on_network_event(
                    &event,
                    &inner.multicast_socket,
                    &inner.search_socket,
                ) {
                    tracing::warn!(
                        "skipping interface event {event:?}: {e}"
                    );
                }
            }
        }

        let task_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let wakeup = task_inner.engine.lock().unwrap().next_wakeup();
                tokio::select! {
                    r = task_inner.multicast_socket.readable() => {
                        if r.is_ok() {
                            task_inner.on_socket_ready(
                                &task_inner.multicast_socket);
                        }
                    },
                    r = task_inner.search_socket.readable() => {
                        if r.is_ok() {
                            task_inner.on_socket_ready(
                                &task_inner.search_socket);
                        }
                    },
                    () = tokio::time::sleep(wakeup) => {
                        task_inner.engine.lock().unwrap().wakeup(
                            &task_inner.search_socket);
                    },
                }
            }
        });

        Ok(AsyncService { inner })
    }

    /// Subscribe to SSDP notifications for a resource type
    ///
    /// Returns a stream of matching notifications, possibly including
    /// repeats for the same resource.
    ///
    /// # Panics
    ///
    /// Will panic if the internal mutex cannot be locked; that would
    /// indicate a bug in weft-ssdp.
    pub fn subscribe<A>(
        &mut self,
        notification_type: A,
    ) -> impl Stream<Item = Notification>
    where
        A: Into<String>,
    {
        let (snd, rcv) = mpsc::channel(100);
        self.inner.engine.lock().unwrap().subscribe(
            notification_type.into(),
            AsyncCallback { channel: snd },
            &self.inner.search_socket,
        );
        ReceiverStream::new(rcv)
    }

    /// Announce a new resource, and start answering searches for it
    ///
    /// # Panics
    ///
    /// Will panic if the internal mutex cannot be locked; that would
    /// indicate a bug in weft-ssdp.
    pub fn advertise<USN>(
        &mut self,
        unique_service_name: USN,
        advertisement: Advertisement,
    ) where
        USN: Into<String>,
    {
        self.inner.engine.lock().unwrap().advertise(
            unique_service_name.into(),
            advertisement,
            &self.inner.search_socket,
        );
    }

    /// Announce the disappearance of a resource, and stop answering
    ///
    /// # Panics
    ///
    /// Will panic if the internal mutex cannot be locked; that would
    /// indicate a bug in weft-ssdp.
    pub fn deadvertise(&mut self, unique_service_name: &str) {
        self.inner
            .engine
            .lock()
            .unwrap()
            .deadvertise(unique_service_name, &self.inner.search_socket);
    }

    /// The (ephemeral) port of the search socket
    ///
    /// Search replies arrive here; mostly useful for tests.
    ///
    /// # Errors
    ///
    /// Passes on failures of `getsockname`.
    pub fn search_port(&self) -> Result<u16, std::io::Error> {
        Ok(self.inner.search_socket.local_addr()?.port())
    }
}
