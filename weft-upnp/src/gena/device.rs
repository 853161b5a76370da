//! Handling SUBSCRIBE and UNSUBSCRIBE requests against a service table
//!
//! The wire rules, GENA-style: a fresh subscription carries NT and
//! CALLBACK and no SID; a renewal carries SID and nothing else; mixing
//! the two is a 400. Requests that are well-formed but unsatisfiable
//! (unknown SID, missing CALLBACK, wrong NT) are 412 Precondition
//! Failed.

use super::table::{GenaError, ServiceTable};
use super::{Sid, Timeout};
use crate::http::{Method, RequestHead};
use crate::miniserver::{Request, RequestHandler, Response};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Plugs a shared [`ServiceTable`] into the mini-server's GENA slot
///
/// ```no_run
/// # use std::sync::{Arc, Mutex};
/// # use weft_upnp::gena::{device::GenaHandler, ServiceTable};
/// # use weft_upnp::{Dispatch, MiniServer, MiniServerConfig};
/// let table = Arc::new(Mutex::new(ServiceTable::new()));
/// let dispatch = Dispatch {
///     gena: Some(Arc::new(GenaHandler::new(table.clone()))),
///     ..Dispatch::default()
/// };
/// let _server = MiniServer::start(MiniServerConfig::new(), dispatch)?;
/// # Ok::<(), weft_upnp::miniserver::MiniServerError>(())
/// ```
pub struct GenaHandler {
    table: Arc<Mutex<ServiceTable>>,
}

impl GenaHandler {
    /// Serve subscription requests against `table`
    #[must_use]
    pub fn new(table: Arc<Mutex<ServiceTable>>) -> GenaHandler {
        GenaHandler { table }
    }
}

impl RequestHandler for GenaHandler {
    fn handle(&self, request: &Request) -> Response {
        let mut table = self.table.lock().unwrap();
        match request.head.method {
            Method::Subscribe => {
                on_subscribe(&mut table, &request.head, Instant::now())
            }
            Method::Unsubscribe => on_unsubscribe(&mut table, &request.head),
            // NOTIFY arrives at control points, not at devices
            _ => Response::empty(501),
        }
    }
}

/// Split a CALLBACK header ("<url><url>...") into its usable HTTP URLs
fn parse_callback(header: &str) -> Vec<url::Url> {
    let mut urls = Vec::new();
    let mut rest = header;
    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>') else { break };
        if let Ok(url) = url::Url::parse(&rest[start + 1..start + end]) {
            if url.scheme() == "http" && url.host_str().is_some() {
                urls.push(url);
            }
        }
        rest = &rest[start + end + 1..];
    }
    urls
}

fn grant_response(grant: &super::table::Grant) -> Response {
    Response::empty(200)
        .header("SID", grant.sid.as_str())
        .header("TIMEOUT", &grant.timeout.to_string())
}

fn error_response(error: &GenaError) -> Response {
    Response::empty(match error {
        GenaError::NoSuchService | GenaError::ServiceInactive => 404,
        GenaError::TooManySubscribers => 503,
        GenaError::NoSuchSid | GenaError::BadCallback => 412,
    })
}

/// Handle SUBSCRIBE: either a fresh subscription or a renewal
pub fn on_subscribe(
    table: &mut ServiceTable,
    head: &RequestHead,
    now: Instant,
) -> Response {
    let Some((key, _)) = table.find_by_event_path(&head.target) else {
        return Response::empty(404);
    };
    let key = key.clone();

    let timeout =
        head.header("Timeout").and_then(Timeout::parse);

    if let Some(sid) = head.header("SID") {
        // renewal: must not also propose NT or CALLBACK
        if head.header("NT").is_some() || head.header("Callback").is_some() {
            return Response::empty(400);
        }
        let Some(sid) = Sid::parse(sid) else {
            return Response::empty(412);
        };
        return match table.renew(&key, &sid, timeout, now) {
            Ok(grant) => grant_response(&grant),
            Err(e) => error_response(&e),
        };
    }

    if head.header("NT") != Some("upnp:event") {
        return Response::empty(412);
    }
    let Some(callback) = head.header("Callback") else {
        return Response::empty(412);
    };
    let urls = parse_callback(callback);

    match table.subscribe(&key, urls, timeout, now) {
        Ok(grant) => grant_response(&grant),
        Err(e) => error_response(&e),
    }
}

/// Handle UNSUBSCRIBE
pub fn on_unsubscribe(
    table: &mut ServiceTable,
    head: &RequestHead,
) -> Response {
    let Some((key, _)) = table.find_by_event_path(&head.target) else {
        return Response::empty(404);
    };
    let key = key.clone();

    if head.header("NT").is_some() || head.header("Callback").is_some() {
        return Response::empty(400);
    }
    let Some(sid) = head.header("SID").and_then(Sid::parse) else {
        return Response::empty(412);
    };
    match table.unsubscribe(&key, &sid) {
        Ok(()) => Response::empty(200),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gena::table::{ServiceInfo, ServiceKey};

    fn table() -> ServiceTable {
        let mut t = ServiceTable::new();
        t.register(
            ServiceKey::new("uuid:device-1", "urn:upnp-org:serviceId:cd1"),
            ServiceInfo::new(
                "urn:schemas-upnp-org:service:ContentDirectory:1",
                "/scpd/cd.xml",
                "/control/cd",
                "/events/cd",
            ),
        );
        t
    }

    fn head(text: &str) -> RequestHead {
        RequestHead::parse(text.as_bytes()).unwrap()
    }

    fn subscribe_head() -> RequestHead {
        head(
            "SUBSCRIBE /events/cd HTTP/1.1\r\n\
Host: 192.168.0.2:49152\r\n\
NT: upnp:event\r\n\
CALLBACK: <http://192.168.0.9:3333/listener>\r\n\
TIMEOUT: Second-300\r\n\
\r\n",
        )
    }

    #[test]
    fn subscribe_grants_sid_and_timeout() {
        let mut t = table();
        let response = on_subscribe(&mut t, &subscribe_head(), Instant::now());
        assert_eq!(response.status, 200);
        let sid = response
            .headers
            .iter()
            .find(|(n, _)| n == "SID")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(sid.starts_with("uuid:"));
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "TIMEOUT" && v == "Second-300"));
    }

    #[test]
    fn subscribe_unknown_path_is_404() {
        let mut t = table();
        let response = on_subscribe(
            &mut t,
            &head("SUBSCRIBE /events/nope HTTP/1.1\r\nNT: upnp:event\r\nCALLBACK: <http://10.0.0.1/cb>\r\n\r\n"),
            Instant::now(),
        );
        assert_eq!(response.status, 404);
    }

    #[test]
    fn subscribe_wrong_nt_is_412() {
        let mut t = table();
        let response = on_subscribe(
            &mut t,
            &head("SUBSCRIBE /events/cd HTTP/1.1\r\nNT: upnp:rootdevice\r\nCALLBACK: <http://10.0.0.1/cb>\r\n\r\n"),
            Instant::now(),
        );
        assert_eq!(response.status, 412);
    }

    #[test]
    fn subscribe_without_callback_is_412() {
        let mut t = table();
        let response = on_subscribe(
            &mut t,
            &head("SUBSCRIBE /events/cd HTTP/1.1\r\nNT: upnp:event\r\n\r\n"),
            Instant::now(),
        );
        assert_eq!(response.status, 412);

        // a CALLBACK with no usable URL is no better
        let response = on_subscribe(
            &mut t,
            &head("SUBSCRIBE /events/cd HTTP/1.1\r\nNT: upnp:event\r\nCALLBACK: <ftp://10.0.0.1/cb>\r\n\r\n"),
            Instant::now(),
        );
        assert_eq!(response.status, 412);
    }

    #[test]
    fn renewal_echoes_sid() {
        let mut t = table();
        let now = Instant::now();
        let granted = on_subscribe(&mut t, &subscribe_head(), now);
        let sid = granted
            .headers
            .iter()
            .find(|(n, _)| n == "SID")
            .map(|(_, v)| v.clone())
            .unwrap();

        let response = on_subscribe(
            &mut t,
            &head(&format!(
                "SUBSCRIBE /events/cd HTTP/1.1\r\nHost: x\r\nSID: {sid}\r\nTIMEOUT: Second-600\r\n\r\n"
            )),
            now,
        );
        assert_eq!(response.status, 200);
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "SID" && *v == sid));
        assert!(response
            .headers
            .iter()
            .any(|(n, v)| n == "TIMEOUT" && v == "Second-600"));
    }

    #[test]
    fn renewal_with_nt_is_400() {
        let mut t = table();
        let response = on_subscribe(
            &mut t,
            &head("SUBSCRIBE /events/cd HTTP/1.1\r\nSID: uuid:x\r\nNT: upnp:event\r\n\r\n"),
            Instant::now(),
        );
        assert_eq!(response.status, 400);
    }

    #[test]
    fn renewal_of_unknown_sid_is_412() {
        let mut t = table();
        let response = on_subscribe(
            &mut t,
            &head("SUBSCRIBE /events/cd HTTP/1.1\r\nSID: uuid:never-issued\r\n\r\n"),
            Instant::now(),
        );
        assert_eq!(response.status, 412);
    }

    #[test]
    fn unsubscribe_round_trip() {
        let mut t = table();
        let now = Instant::now();
        let granted = on_subscribe(&mut t, &subscribe_head(), now);
        let sid = granted
            .headers
            .iter()
            .find(|(n, _)| n == "SID")
            .map(|(_, v)| v.clone())
            .unwrap();

        let response = on_unsubscribe(
            &mut t,
            &head(&format!(
                "UNSUBSCRIBE /events/cd HTTP/1.1\r\nHost: x\r\nSID: {sid}\r\n\r\n"
            )),
        );
        assert_eq!(response.status, 200);

        // a second cancellation finds nothing
        let response = on_unsubscribe(
            &mut t,
            &head(&format!(
                "UNSUBSCRIBE /events/cd HTTP/1.1\r\nHost: x\r\nSID: {sid}\r\n\r\n"
            )),
        );
        assert_eq!(response.status, 412);
    }

    #[test]
    fn unsubscribe_without_sid_is_412() {
        let mut t = table();
        let response = on_unsubscribe(
            &mut t,
            &head("UNSUBSCRIBE /events/cd HTTP/1.1\r\nHost: x\r\n\r\n"),
        );
        assert_eq!(response.status, 412);
    }

    #[test]
    fn unsubscribe_with_nt_is_400() {
        let mut t = table();
        let response = on_unsubscribe(
            &mut t,
            &head("UNSUBSCRIBE /events/cd HTTP/1.1\r\nSID: uuid:x\r\nNT: upnp:event\r\n\r\n"),
        );
        assert_eq!(response.status, 400);
    }

    #[test]
    fn callback_parsing() {
        assert_eq!(
            parse_callback("<http://10.0.0.1:99/cb>"),
            vec![url::Url::parse("http://10.0.0.1:99/cb").unwrap()]
        );
        assert_eq!(
            parse_callback(
                "<http://10.0.0.1/a><https://10.0.0.1/no><http://10.0.0.2/b>"
            )
            .len(),
            2
        );
        assert!(parse_callback("").is_empty());
        assert!(parse_callback("http://10.0.0.1/bare").is_empty());
        assert!(parse_callback("<not a url>").is_empty());
    }
}
