//! Building and delivering NOTIFY event messages
//!
//! Event bodies are UPnP property sets; delivery is one short-lived HTTP
//! request to the subscriber's callback URL, carrying the SID and the
//! per-subscription SEQ so the receiver can spot losses.

use super::table::ServiceKey;
use super::Sid;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// An event waiting in one subscription's queue
#[derive(Debug)]
pub(crate) struct PendingEvent {
    pub(crate) seq: u32,
    pub(crate) body: Arc<Vec<u8>>,
}

/// One NOTIFY claimed for delivery via [`super::ServiceTable::next_job`]
#[derive(Debug)]
pub struct NotifyJob {
    /// Which service the event belongs to
    pub key: ServiceKey,
    /// Which subscription it is for
    pub sid: Sid,
    /// The per-subscription sequence number (0 = initial event)
    pub seq: u32,
    /// Candidate delivery URLs, in the control point's preference order
    pub urls: Vec<url::Url>,
    /// The property-set document
    pub body: Arc<Vec<u8>>,
}

/// Render a property-set document from variable names and values
///
/// The standard GENA body: one `<e:property>` per changed variable.
#[must_use]
pub fn property_set(variables: &[(&str, &str)]) -> Vec<u8> {
    fn escape(s: &str) -> String {
        s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
    }
    let mut body = String::from(
        "<?xml version=\"1.0\"?>\r\n\
<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\r\n",
    );
    for (name, value) in variables {
        body.push_str(&format!(
            "<e:property>\r\n<{name}>{}</{name}>\r\n</e:property>\r\n",
            escape(value)
        ));
    }
    body.push_str("</e:propertyset>\r\n");
    body.into_bytes()
}

/// Render the NOTIFY request for one callback URL
#[must_use]
pub fn build_notify_request(
    url: &url::Url,
    sid: &Sid,
    seq: u32,
    body: &[u8],
) -> Vec<u8> {
    let host = url.host_str().unwrap_or("");
    let port = url.port_or_known_default().unwrap_or(80);
    let path = url.path();
    let mut out = format!(
        "NOTIFY {path} HTTP/1.1\r\n\
HOST: {host}:{port}\r\n\
CONTENT-TYPE: text/xml; charset=\"utf-8\"\r\n\
CONTENT-LENGTH: {}\r\n\
NT: upnp:event\r\n\
NTS: upnp:propchange\r\n\
SID: {sid}\r\n\
SEQ: {seq}\r\n\
\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Deliver one NOTIFY, trying each callback URL in order
///
/// Returns the HTTP status the first reachable subscriber answered
/// with. Pass the result to
/// [`super::ServiceTable::complete_job`] either way; a failed delivery
/// is not retried (the next event carries a later SEQ, so the receiver
/// can tell it missed one).
///
/// # Errors
///
/// The last connection or read error, if no URL was reachable.
pub fn deliver(
    job: &NotifyJob,
    timeout: Duration,
) -> Result<u16, std::io::Error> {
    let mut last_error =
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no usable URL");
    for url in &job.urls {
        let Some(host) = url.host_str() else { continue };
        let port = url.port_or_known_default().unwrap_or(80);
        match deliver_one(url, host, port, job, timeout) {
            Ok(status) => return Ok(status),
            Err(e) => {
                tracing::debug!(
                    "notify {} seq {} to {url}: {e}",
                    job.sid,
                    job.seq
                );
                last_error = e;
            }
        }
    }
    Err(last_error)
}

fn deliver_one(
    url: &url::Url,
    host: &str,
    port: u16,
    job: &NotifyJob,
    timeout: Duration,
) -> Result<u16, std::io::Error> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or(std::io::ErrorKind::AddrNotAvailable)?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let request = build_notify_request(url, &job.sid, job.seq, &job.body);
    stream.write_all(&request)?;

    // Only the status line matters
    let mut response = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[0..n]);
        if response.windows(2).any(|w| w == b"\r\n") {
            break;
        }
    }
    parse_status_line(&response)
        .ok_or_else(|| std::io::ErrorKind::InvalidData.into())
}

fn parse_status_line(response: &[u8]) -> Option<u16> {
    let text = core::str::from_utf8(response).ok()?;
    let line = text.lines().next()?;
    if !line.starts_with("HTTP/1.") {
        return None;
    }
    line.split_ascii_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn property_set_escapes_values() {
        let body = property_set(&[
            ("Volume", "42"),
            ("Title", "Cake & <Pie>"),
        ]);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("<Volume>42</Volume>"));
        assert!(text.contains("<Title>Cake &amp; &lt;Pie&gt;</Title>"));
        assert!(text.contains("urn:schemas-upnp-org:event-1-0"));
    }

    #[test]
    fn notify_request_carries_gena_headers() {
        let url = url::Url::parse("http://192.168.0.9:3333/listener").unwrap();
        let sid = Sid::new();
        let request = build_notify_request(&url, &sid, 7, b"<body/>");
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("NOTIFY /listener HTTP/1.1\r\n"));
        assert!(text.contains("HOST: 192.168.0.9:3333\r\n"));
        assert!(text.contains("NT: upnp:event\r\n"));
        assert!(text.contains("NTS: upnp:propchange\r\n"));
        assert!(text.contains(&format!("SID: {sid}\r\n")));
        assert!(text.contains("SEQ: 7\r\n"));
        assert!(text.contains("CONTENT-LENGTH: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n<body/>"));
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(
            parse_status_line(b"HTTP/1.0 412 Precondition Failed\r\n"),
            Some(412)
        );
        assert_eq!(parse_status_line(b"SIP/2.0 200 OK\r\n"), None);
        assert_eq!(parse_status_line(b""), None);
    }

    #[test]
    fn delivers_to_a_listening_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let mut request = Vec::new();
            loop {
                let n = conn.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[0..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let job = NotifyJob {
            key: ServiceKey::new("uuid:dev", "svc"),
            sid: Sid::new(),
            seq: 3,
            urls: vec![
                // unreachable first choice falls through to the live one
                url::Url::parse("http://127.0.0.1:1/listener").unwrap(),
                url::Url::parse(&format!("http://127.0.0.1:{port}/cb"))
                    .unwrap(),
            ],
            body: Arc::new(b"<set/>".to_vec()),
        };

        let status = deliver(&job, Duration::from_secs(5)).unwrap();
        assert_eq!(status, 200);

        let request = server.join().unwrap();
        assert!(request.starts_with("NOTIFY /cb HTTP/1.1"));
        assert!(request.contains("SEQ: 3"));
    }

    #[test]
    fn unreachable_subscriber_is_an_error() {
        let job = NotifyJob {
            key: ServiceKey::new("uuid:dev", "svc"),
            sid: Sid::new(),
            seq: 0,
            urls: vec![url::Url::parse("http://127.0.0.1:1/cb").unwrap()],
            body: Arc::new(Vec::new()),
        };
        assert!(deliver(&job, Duration::from_millis(200)).is_err());
    }
}
