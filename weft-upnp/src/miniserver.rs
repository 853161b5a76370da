//! The mini-server: one accept-and-dispatch point for all TCP requests
//!
//! Every incoming request -- description fetch, SOAP control call, GENA
//! subscription traffic -- arrives at one listening socket. A poll loop
//! accepts connections and hands each one to a worker thread, which
//! reads the request, applies the numeric-Host guard, and dispatches by
//! method to the registered handler for that class of request.
//!
//! The loop is stopped by a datagram: a UDP socket bound to localhost
//! listens for the exact payload "ShutDown" from 127.0.0.1, so
//! [`MiniServer::stop`] works from any thread but nothing off-host can
//! ever stop the server.

use crate::http::{self, Method, RequestHead};
use crate::workers::WorkerPool;
use mio::unix::SourceFd;
use std::io::{Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener,
    TcpStream, UdpSocket,
};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// First port of the IANA dynamic/private range the port hunt walks
///
/// Listeners deliberately leave SO_REUSEADDR off (a half-closed old
/// instance must not steal requests), so restarts need fresh port
/// numbers; hunting starts from a random point in the range.
pub const DYNAMIC_PORT_BASE: u16 = 49152;

const SHUTDOWN_MAGIC: &[u8] = b"ShutDown";

const ACCEPT: mio::Token = mio::Token(0);
const STOP: mio::Token = mio::Token(1);

const SERVER: &str = concat!(
    "unix/5 UPnP/1.0 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION")
);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopping,
}

struct StateCell {
    state: Mutex<State>,
    cond: Condvar,
}

impl StateCell {
    fn set(&self, new: State) {
        *self.state.lock().unwrap() = new;
        self.cond.notify_all();
    }
}

/// Ways the mini-server can fail to start
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MiniServerError {
    /// No listening socket could be bound (port busy, or range exhausted)
    #[error("no listening socket could be bound")]
    OutOfSockets(#[source] std::io::Error),

    /// The localhost stop socket could not be created
    #[error("could not create the stop socket")]
    StopSocket(#[source] std::io::Error),

    /// The poll loop could not be set up
    #[error("could not set up the poll loop")]
    Poll(#[source] std::io::Error),

    /// The accept loop never reported itself running
    #[error("the accept loop did not start in time")]
    StartTimeout,
}

/// Configuration for [`MiniServer::start`], builder style
#[derive(Debug, Clone)]
pub struct MiniServerConfig {
    address: Ipv4Addr,
    port: u16,
    workers: usize,
    allow_literal_host_redirection: bool,
    read_timeout: Duration,
}

impl Default for MiniServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MiniServerConfig {
    /// Defaults: all interfaces, hunted port, 4 workers, 20 s timeout
    #[must_use]
    pub fn new() -> MiniServerConfig {
        MiniServerConfig {
            address: Ipv4Addr::UNSPECIFIED,
            port: 0,
            workers: 4,
            allow_literal_host_redirection: false,
            read_timeout: Duration::from_secs(20),
        }
    }

    /// Bind to one specific address instead of all interfaces
    #[must_use]
    pub fn address(mut self, address: Ipv4Addr) -> Self {
        self.address = address;
        self
    }

    /// Listen on one specific port; 0 (the default) hunts for a free
    /// port in the dynamic range
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// How many worker threads serve connections
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Answer non-numeric Host headers with a 307 redirect to the
    /// numeric address, instead of rejecting them outright
    #[must_use]
    pub fn allow_literal_host_redirection(mut self, allow: bool) -> Self {
        self.allow_literal_host_redirection = allow;
        self
    }

    /// Per-connection socket timeout for reading the request
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// One received request, as passed to a [`RequestHandler`]
#[derive(Debug)]
pub struct Request {
    /// The parsed request head
    pub head: RequestHead,
    /// The request body (empty if none was sent)
    pub body: Vec<u8>,
    /// The remote control point's address
    pub peer: SocketAddr,
    /// The local address the request arrived on
    pub local: SocketAddr,
}

/// What a [`RequestHandler`] answers with
#[derive(Debug)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Extra headers (Content-Length and Connection are added for you)
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// A bare status with no body
    #[must_use]
    pub fn empty(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// A body with its content type
    #[must_use]
    pub fn with_body(
        status: u16,
        content_type: &str,
        body: Vec<u8>,
    ) -> Response {
        Response {
            status,
            headers: vec![(
                "CONTENT-TYPE".to_string(),
                content_type.to_string(),
            )],
            body,
        }
    }

    /// Append a header, builder style
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Response {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Serves one class of request (web, SOAP, or GENA)
///
/// Handlers run on worker threads, so they must be `Send + Sync`; a
/// handler that needs mutable state wraps it in a mutex.
pub trait RequestHandler: Send + Sync {
    /// Produce the response for one request
    fn handle(&self, request: &Request) -> Response;
}

impl std::fmt::Debug for dyn RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestHandler")
    }
}

/// The registered handlers, by request class
///
/// A request whose class has no handler is answered
/// `500 Internal Server Error`.
#[derive(Default, Clone)]
pub struct Dispatch {
    /// GET/HEAD: description documents and presentation pages
    pub web: Option<Arc<dyn RequestHandler>>,
    /// POST/M-POST: SOAP control
    pub soap: Option<Arc<dyn RequestHandler>>,
    /// SUBSCRIBE/UNSUBSCRIBE/NOTIFY: GENA eventing
    pub gena: Option<Arc<dyn RequestHandler>>,
}

impl Dispatch {
    fn route(&self, method: Method) -> Result<&Arc<dyn RequestHandler>, u16> {
        let handler = match method {
            Method::Get | Method::Head => &self.web,
            Method::Post | Method::MPost => &self.soap,
            Method::Subscribe | Method::Unsubscribe | Method::Notify => {
                &self.gena
            }
            Method::Unknown => return Err(501),
        };
        handler.as_ref().ok_or(500)
    }
}

/// A running mini-server
///
/// Stops (politely, via the stop socket) when dropped.
pub struct MiniServer {
    state: Arc<StateCell>,
    local_addr: SocketAddr,
    stop_port: u16,
    thread: Option<thread::JoinHandle<()>>,
}

impl MiniServer {
    /// Bind the listener and stop socket, spawn the accept loop, and
    /// wait for it to report itself running
    ///
    /// # Errors
    ///
    /// See [`MiniServerError`].
    pub fn start(
        config: MiniServerConfig,
        dispatch: Dispatch,
    ) -> Result<MiniServer, MiniServerError> {
        let listener = bind_listener(config.address, config.port)
            .map_err(MiniServerError::OutOfSockets)?;
        let local_addr = listener
            .local_addr()
            .map_err(MiniServerError::OutOfSockets)?;

        let stop_socket =
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
                .map_err(MiniServerError::StopSocket)?;
        stop_socket
            .set_nonblocking(true)
            .map_err(MiniServerError::StopSocket)?;
        let stop_port = stop_socket
            .local_addr()
            .map_err(MiniServerError::StopSocket)?
            .port();

        let poll = mio::Poll::new().map_err(MiniServerError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                ACCEPT,
                mio::Interest::READABLE,
            )
            .map_err(MiniServerError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&stop_socket.as_raw_fd()),
                STOP,
                mio::Interest::READABLE,
            )
            .map_err(MiniServerError::Poll)?;

        let state = Arc::new(StateCell {
            state: Mutex::new(State::Idle),
            cond: Condvar::new(),
        });
        let loop_state = state.clone();
        let thread = thread::Builder::new()
            .name("weft-miniserver".to_string())
            .spawn(move || {
                run_loop(
                    &listener,
                    &stop_socket,
                    poll,
                    &Arc::new(dispatch),
                    &config,
                    &loop_state,
                );
            })
            .map_err(MiniServerError::Poll)?;

        // wait for the loop thread to come up
        let guard = state.state.lock().unwrap();
        let (_guard, timeout) = state
            .cond
            .wait_timeout_while(guard, Duration::from_secs(10), |s| {
                *s == State::Idle
            })
            .unwrap();
        if timeout.timed_out() {
            return Err(MiniServerError::StartTimeout);
        }
        drop(_guard);

        tracing::info!("miniserver listening on {local_addr}");
        Ok(MiniServer {
            state,
            local_addr,
            stop_port,
            thread: Some(thread),
        })
    }

    /// The address requests should be sent to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listening port (hunted or configured)
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The localhost port the stop socket is bound to
    #[must_use]
    pub fn stop_port(&self) -> u16 {
        self.stop_port
    }

    /// Whether the accept loop is currently running
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.state.state.lock().unwrap() == State::Running
    }

    /// Stop the accept loop and wait for it to finish
    ///
    /// Safe to call from any thread, and idempotent. Sends "ShutDown"
    /// datagrams to the stop socket until the loop acknowledges.
    pub fn stop(&mut self) {
        {
            let mut s = self.state.state.lock().unwrap();
            match *s {
                State::Running => *s = State::Stopping,
                State::Stopping => {}
                State::Idle => {
                    if let Some(thread) = self.thread.take() {
                        let _ = thread.join();
                    }
                    return;
                }
            }
        }
        tracing::info!("stopping miniserver on {}", self.local_addr);
        if let Ok(socket) =
            UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        {
            for _ in 0..200 {
                let _ = socket.send_to(
                    SHUTDOWN_MAGIC,
                    SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.stop_port),
                );
                let guard = self.state.state.lock().unwrap();
                let (guard, _) = self
                    .state
                    .cond
                    .wait_timeout_while(
                        guard,
                        Duration::from_millis(50),
                        |s| *s != State::Idle,
                    )
                    .unwrap();
                if *guard == State::Idle {
                    break;
                }
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MiniServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the listening socket, hunting for a port if none was fixed
///
/// SO_REUSEADDR stays off, so a busy port means moving on, not sharing.
fn bind_listener(
    address: Ipv4Addr,
    port: u16,
) -> Result<TcpListener, std::io::Error> {
    if port != 0 {
        return try_listen(address, port);
    }
    let range = u16::MAX - DYNAMIC_PORT_BASE + 1;
    let start: u16 = rand::random_range(0..range);
    let mut last = std::io::Error::from(std::io::ErrorKind::AddrInUse);
    for offset in 0..range {
        let port = DYNAMIC_PORT_BASE + (start + offset) % range;
        match try_listen(address, port) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => last = e,
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

fn try_listen(
    address: Ipv4Addr,
    port: u16,
) -> Result<TcpListener, std::io::Error> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        None,
    )?;
    socket.bind(&socket2::SockAddr::from(SocketAddrV4::new(address, port)))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn run_loop(
    listener: &TcpListener,
    stop_socket: &UdpSocket,
    mut poll: mio::Poll,
    dispatch: &Arc<Dispatch>,
    config: &MiniServerConfig,
    state: &Arc<StateCell>,
) {
    let pool = WorkerPool::new(config.workers);
    let mut events = mio::Events::with_capacity(64);
    state.set(State::Running);

    'run: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!("miniserver poll: {e}");
            break;
        }
        for event in &events {
            match event.token() {
                ACCEPT => accept_ready(listener, &pool, dispatch, config),
                STOP => {
                    if stop_requested(stop_socket) {
                        break 'run;
                    }
                }
                _ => {}
            }
        }
    }

    drop(pool); // waits for in-progress connections
    state.set(State::Idle);
    tracing::info!("miniserver loop finished");
}

fn accept_ready(
    listener: &TcpListener,
    pool: &WorkerPool,
    dispatch: &Arc<Dispatch>,
    config: &MiniServerConfig,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("connection from {peer}");
                let dispatch = dispatch.clone();
                let allow_redirect = config.allow_literal_host_redirection;
                let timeout = config.read_timeout;
                if !pool.execute(move || {
                    handle_connection(
                        stream,
                        peer,
                        &dispatch,
                        allow_redirect,
                        timeout,
                    );
                }) {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::warn!("accept: {e}");
                return;
            }
        }
    }
}

/// Check the stop socket; true only for "ShutDown" from 127.0.0.1
///
/// Anything else (wrong payload, wrong source) is logged and ignored; a
/// hard receive error also stops the loop, since the stop socket is
/// then unusable and the server could never again be shut down.
fn stop_requested(stop_socket: &UdpSocket) -> bool {
    let mut buf = [0u8; 16];
    loop {
        match stop_socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                if peer.ip() == IpAddr::V4(Ipv4Addr::LOCALHOST)
                    && &buf[0..n] == SHUTDOWN_MAGIC
                {
                    tracing::info!("stop datagram received from {peer}");
                    return true;
                }
                tracing::warn!(
                    "ignoring stop datagram from {peer} ({n} bytes)"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return false;
            }
            Err(e) => {
                tracing::error!("stop socket unusable: {e}");
                return true;
            }
        }
    }
}

enum ServeError {
    /// Answer with this status code
    Status(u16),
    /// Socket-level failure; sending a status would be pointless
    Dropped,
}

fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatch: &Dispatch,
    allow_redirect: bool,
    timeout: Duration,
) {
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    match serve(&mut stream, peer, dispatch, allow_redirect) {
        Ok(()) => tracing::debug!("{peer}: served"),
        Err(ServeError::Status(code)) => {
            tracing::debug!("{peer}: rejected with {code}");
            let head = http::build_response_head(code, 1, 1, &[], 0);
            let _ = stream.write_all(head.as_bytes());
        }
        Err(ServeError::Dropped) => {
            tracing::debug!("{peer}: connection dropped");
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

fn serve(
    stream: &mut TcpStream,
    peer: SocketAddr,
    dispatch: &Dispatch,
    allow_redirect: bool,
) -> Result<(), ServeError> {
    let (head, body) = read_request(stream)?;

    // The Host header must be numeric: a request addressed to us by DNS
    // name did not learn our address from SSDP, and is likely a DNS
    // rebinding attack from a browser.
    let host = head.header("Host").ok_or(ServeError::Status(400))?;
    if !host_is_numeric(host) {
        if allow_redirect {
            let local =
                stream.local_addr().map_err(|_| ServeError::Dropped)?;
            let redirect = http::build_response_head(
                307,
                head.major,
                head.minor,
                &[("LOCATION".to_string(), format!("http://{local}"))],
                0,
            );
            let _ = stream.write_all(redirect.as_bytes());
            return Ok(());
        }
        tracing::warn!(
            "{peer}: non-numeric Host {host:?}, possible DNS rebind"
        );
        return Err(ServeError::Status(400));
    }

    let handler = dispatch
        .route(head.method)
        .map_err(ServeError::Status)?;
    let local = stream.local_addr().map_err(|_| ServeError::Dropped)?;
    let request = Request {
        head,
        body,
        peer,
        local,
    };
    let mut response = handler.handle(&request);
    if request.head.method == Method::Head {
        response.body.clear();
    }
    response
        .headers
        .push(("SERVER".to_string(), SERVER.to_string()));

    let head = http::build_response_head(
        response.status,
        request.head.major,
        request.head.minor,
        &response.headers,
        response.body.len(),
    );
    stream
        .write_all(head.as_bytes())
        .and_then(|()| stream.write_all(&response.body))
        .map_err(|_| ServeError::Dropped)
}

fn read_request(
    stream: &mut TcpStream,
) -> Result<(RequestHead, Vec<u8>), ServeError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 2048];

    let head_end = loop {
        if let Some(end) = http::find_head_end(&buf) {
            break end;
        }
        if buf.len() > http::MAX_HEAD_SIZE {
            return Err(ServeError::Status(400));
        }
        let n = stream.read(&mut chunk).map_err(|_| ServeError::Dropped)?;
        if n == 0 {
            return Err(ServeError::Dropped);
        }
        buf.extend_from_slice(&chunk[0..n]);
    };

    let head = RequestHead::parse(&buf[0..head_end])
        .map_err(|_| ServeError::Status(400))?;
    let mut body = buf.split_off(head_end);

    let length = head
        .content_length()
        .map_err(|_| ServeError::Status(400))?
        .unwrap_or(0);
    if length > http::MAX_BODY_SIZE {
        return Err(ServeError::Status(400));
    }
    while body.len() < length {
        let n = stream.read(&mut chunk).map_err(|_| ServeError::Dropped)?;
        if n == 0 {
            return Err(ServeError::Dropped);
        }
        body.extend_from_slice(&chunk[0..n]);
    }
    body.truncate(length);

    Ok((head, body))
}

/// Is this Host header value a literal address (with optional port)?
///
/// The unspecified addresses don't count; nobody was told to talk to
/// "0.0.0.0".
fn host_is_numeric(host: &str) -> bool {
    let ip = if let Ok(sockaddr) = host.parse::<SocketAddr>() {
        Some(sockaddr.ip())
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        Some(ip)
    } else {
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .and_then(|h| h.parse().ok())
    };
    ip.is_some_and(|ip| !ip.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_hosts_accepted() {
        assert!(host_is_numeric("192.168.1.2:54321"));
        assert!(host_is_numeric("192.168.1.2"));
        assert!(host_is_numeric("[2001:db8::ab]:50044"));
        assert!(host_is_numeric("[2001:db8::ab]"));
    }

    #[test]
    fn non_numeric_hosts_rejected() {
        assert!(!host_is_numeric(""));
        assert!(!host_is_numeric("router.example.com"));
        assert!(!host_is_numeric("router.example.com:8080"));
        assert!(!host_is_numeric("0.0.0.0"));
        assert!(!host_is_numeric("0.0.0.0:1234"));
        assert!(!host_is_numeric("[::]"));
        assert!(!host_is_numeric("[::]:80"));
    }

    #[test]
    fn route_by_method_class() {
        struct Teapot;
        impl RequestHandler for Teapot {
            fn handle(&self, _request: &Request) -> Response {
                Response::empty(200)
            }
        }
        let dispatch = Dispatch {
            web: Some(Arc::new(Teapot)),
            soap: None,
            gena: Some(Arc::new(Teapot)),
        };
        assert!(dispatch.route(Method::Get).is_ok());
        assert!(dispatch.route(Method::Head).is_ok());
        assert!(dispatch.route(Method::Subscribe).is_ok());
        assert_eq!(dispatch.route(Method::Post).unwrap_err(), 500);
        assert_eq!(dispatch.route(Method::Unknown).unwrap_err(), 501);
    }

    #[test]
    fn port_hunt_lands_in_dynamic_range() {
        let listener =
            bind_listener(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port >= DYNAMIC_PORT_BASE);
    }

    #[test]
    fn fixed_port_is_honoured_or_refused() {
        let first = bind_listener(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = first.local_addr().unwrap().port();
        // same fixed port again must fail, not hunt elsewhere
        let second = bind_listener(Ipv4Addr::LOCALHOST, port);
        assert!(second.is_err());
    }
}
