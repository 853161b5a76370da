//! Just enough HTTP/1.x to serve UPnP
//!
//! The mini-server handles a small, closed set of request shapes --
//! description GETs, SOAP POSTs, GENA SUBSCRIBE/UNSUBSCRIBE/NOTIFY --
//! so a full HTTP implementation would be dead weight. This module
//! parses a request head into a method, target and header map, and
//! formats simple responses.

use std::collections::BTreeMap;

/// Cap on the size of a request head we are willing to parse
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Cap on the size of a request body we are willing to read
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// The request methods the mini-server can dispatch
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    /// Plain fetch (description documents, presentation pages)
    Get,
    /// Headers-only fetch
    Head,
    /// SOAP control call
    Post,
    /// SOAP control call with mandatory extensions
    MPost,
    /// GENA subscription request or renewal
    Subscribe,
    /// GENA subscription cancellation
    Unsubscribe,
    /// GENA event (device-to-control-point)
    Notify,
    /// Anything else; dispatch answers 501
    Unknown,
}

impl Method {
    fn parse(s: &str) -> Method {
        match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "M-POST" => Method::MPost,
            "SUBSCRIBE" => Method::Subscribe,
            "UNSUBSCRIBE" => Method::Unsubscribe,
            "NOTIFY" => Method::Notify,
            _ => Method::Unknown,
        }
    }
}

/// Why a request head failed to parse
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum HttpError {
    /// Head is not UTF-8
    #[error("request head is not UTF-8")]
    NotUtf8,

    /// No request line, or one that isn't `METHOD target HTTP/x.y`
    #[error("malformed request line")]
    BadRequestLine,

    /// Not an HTTP/1.x version
    #[error("unsupported HTTP version")]
    BadVersion,

    /// A Content-Length that isn't a number
    #[error("malformed Content-Length")]
    BadContentLength,
}

/// A parsed request head: everything before the blank line
#[derive(Debug)]
pub struct RequestHead {
    /// The request method
    pub method: Method,
    /// The request target, e.g. "/eventing/service1"
    pub target: String,
    /// HTTP major version (always 1)
    pub major: u8,
    /// HTTP minor version
    pub minor: u8,
    headers: BTreeMap<String, String>,
}

impl RequestHead {
    /// Parse a request head (excluding any body bytes)
    ///
    /// Header names are case-insensitive; later duplicates overwrite
    /// earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] if the request line or a needed header is
    /// malformed.
    pub fn parse(head: &[u8]) -> Result<RequestHead, HttpError> {
        let text =
            core::str::from_utf8(head).map_err(|_| HttpError::NotUtf8)?;
        let mut lines = text.lines();
        let request_line =
            lines.next().ok_or(HttpError::BadRequestLine)?;

        let mut parts = request_line.split_ascii_whitespace();
        let method = parts.next().ok_or(HttpError::BadRequestLine)?;
        let target = parts.next().ok_or(HttpError::BadRequestLine)?;
        let version = parts.next().ok_or(HttpError::BadRequestLine)?;
        if parts.next().is_some() {
            return Err(HttpError::BadRequestLine);
        }

        let (major, minor) = version
            .strip_prefix("HTTP/")
            .and_then(|v| v.split_once('.'))
            .and_then(|(maj, min)| {
                Some((maj.parse().ok()?, min.parse().ok()?))
            })
            .ok_or(HttpError::BadVersion)?;
        if major != 1 {
            return Err(HttpError::BadVersion);
        }

        let mut headers = BTreeMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(
                    name.trim().to_ascii_uppercase(),
                    value.trim().to_string(),
                );
            }
        }

        Ok(RequestHead {
            method: Method::parse(method),
            target: target.to_string(),
            major,
            minor,
            headers,
        })
    }

    /// Look up a header by (case-insensitive) name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// The declared body length, if any
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::BadContentLength`] for a non-numeric value.
    pub fn content_length(&self) -> Result<Option<usize>, HttpError> {
        match self.header("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| HttpError::BadContentLength),
        }
    }
}

/// Find the end of the request head in a byte stream
///
/// Returns the offset just past the `\r\n\r\n` (or lone `\n\n`)
/// separator, or `None` if the head hasn't all arrived yet.
#[must_use]
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|n| n + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|n| n + 2))
}

/// The status codes the mini-server and GENA tables produce
#[must_use]
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        404 => "Not Found",
        412 => "Precondition Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Format a response head; `headers` must not include Content-Length
#[must_use]
pub fn build_response_head(
    code: u16,
    major: u8,
    minor: u8,
    headers: &[(String, String)],
    body_len: usize,
) -> String {
    use std::fmt::Write;
    let mut out = format!(
        "HTTP/{major}.{minor} {code} {}\r\n",
        reason_phrase(code)
    );
    for (name, value) in headers {
        let _ = write!(out, "{name}: {value}\r\n");
    }
    let _ = write!(out, "Content-Length: {body_len}\r\nConnection: close\r\n\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_head() {
        let head = RequestHead::parse(
            b"SUBSCRIBE /events/cd HTTP/1.1\r\n\
Host: 192.168.0.2:49152\r\n\
CALLBACK: <http://192.168.0.9:3333/listener>\r\n\
NT: upnp:event\r\n\
TIMEOUT: Second-1800\r\n\
\r\n",
        )
        .unwrap();
        assert_eq!(head.method, Method::Subscribe);
        assert_eq!(head.target, "/events/cd");
        assert_eq!((head.major, head.minor), (1, 1));
        assert_eq!(head.header("host"), Some("192.168.0.2:49152"));
        assert_eq!(head.header("NT"), Some("upnp:event"));
        assert_eq!(head.content_length().unwrap(), None);
    }

    #[test]
    fn parses_content_length() {
        let head = RequestHead::parse(
            b"POST /control/cd HTTP/1.0\r\nContent-Length: 42\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, Method::Post);
        assert_eq!(head.minor, 0);
        assert_eq!(head.content_length().unwrap(), Some(42));
    }

    #[test]
    fn rejects_bad_content_length() {
        let head = RequestHead::parse(
            b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            head.content_length(),
            Err(HttpError::BadContentLength)
        );
    }

    #[test]
    fn unknown_method_still_parses() {
        let head =
            RequestHead::parse(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.method, Method::Unknown);
    }

    #[test]
    fn rejects_malformed_request_lines() {
        assert_eq!(
            RequestHead::parse(b"").unwrap_err(),
            HttpError::BadRequestLine
        );
        assert_eq!(
            RequestHead::parse(b"GET /\r\n\r\n").unwrap_err(),
            HttpError::BadRequestLine
        );
        assert_eq!(
            RequestHead::parse(b"GET / HTTP/1.1 extra\r\n\r\n").unwrap_err(),
            HttpError::BadRequestLine
        );
        assert_eq!(
            RequestHead::parse(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            HttpError::BadVersion
        );
        assert_eq!(
            RequestHead::parse(b"GET / FTP/1.0\r\n\r\n").unwrap_err(),
            HttpError::BadVersion
        );
        assert_eq!(
            RequestHead::parse(&[0x80, 0x80]).unwrap_err(),
            HttpError::NotUtf8
        );
    }

    #[test]
    fn finds_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\n\nbody"), Some(16));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn builds_response_head() {
        let head = build_response_head(
            400,
            1,
            1,
            &[("SERVER".to_string(), "weft".to_string())],
            0,
        );
        assert_eq!(
            head,
            "HTTP/1.1 400 Bad Request\r\nSERVER: weft\r\n\
Content-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(412), "Precondition Failed");
        assert_eq!(reason_phrase(299), "Unknown");
    }
}
