//! The SSDP packet format: HTTP-like datagrams, parsed and built in place
//!
//! Four packet types exist on the wire: alive and byebye notifications
//! (`NOTIFY * HTTP/1.1`, distinguished by the NTS header), searches
//! (`M-SEARCH * HTTP/1.1`), and unicast search responses
//! (`HTTP/1.1 200 OK`). Anything else is not SSDP and is rejected.

use core::fmt::Write;
use std::collections::BTreeMap;

/// Default and advertised cache lifetime, seconds
pub const DEFAULT_MAX_AGE: u32 = 1800;

/// A decoded SSDP datagram
#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    /// NOTIFY with NTS: ssdp:alive
    Alive {
        /// Resource type (NT header)
        notification_type: String,
        /// Unique identifier (USN header)
        unique_service_name: String,
        /// Resource URL (LOCATION header)
        location: String,
        /// CACHE-CONTROL max-age, or [`DEFAULT_MAX_AGE`]
        max_age: u32,
    },
    /// NOTIFY with NTS: ssdp:byebye
    ByeBye {
        /// Resource type (NT header)
        notification_type: String,
        /// Unique identifier (USN header)
        unique_service_name: String,
    },
    /// M-SEARCH
    Search {
        /// Search target (ST header)
        search_target: String,
        /// Response spreading interval (MX header), clamped to 1..=5
        maximum_wait_sec: u8,
    },
    /// Unicast response to an earlier M-SEARCH
    Response {
        /// Echo of the search target (ST header)
        search_target: String,
        /// Unique identifier (USN header)
        unique_service_name: String,
        /// Resource URL (LOCATION header)
        location: String,
        /// CACHE-CONTROL max-age, or [`DEFAULT_MAX_AGE`]
        max_age: u32,
    },
}

/// Why a datagram failed to decode
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    /// Not UTF-8
    #[error("packet is not UTF-8")]
    NotUtf8,

    /// Empty packet, or no start line
    #[error("packet is truncated")]
    Truncated,

    /// The start line is not one of the three SSDP ones
    #[error("unrecognised start line")]
    UnknownStartLine,

    /// A header the packet type requires is absent or unusable
    #[error("missing or invalid header {0}")]
    BadHeader(&'static str),
}

fn max_age_of(headers: &BTreeMap<String, &str>) -> u32 {
    // "CACHE-CONTROL: max-age=1800"; anything unparseable gets the default
    headers
        .get("CACHE-CONTROL")
        .and_then(|v| {
            v.split(',')
                .filter_map(|d| d.trim().split_once('='))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("max-age"))
                .and_then(|(_, n)| n.trim().parse().ok())
        })
        .unwrap_or(DEFAULT_MAX_AGE)
}

/// Decode one datagram
///
/// Header names are case-insensitive and unknown headers are skipped, but
/// the packet type's required headers must be present.
///
/// # Errors
///
/// Returns [`WireError`] on anything that isn't a well-formed SSDP packet.
pub fn parse(buf: &[u8]) -> Result<Message, WireError> {
    let packet = core::str::from_utf8(buf).map_err(|_| WireError::NotUtf8)?;

    let mut lines = packet.lines();
    let start = lines.next().ok_or(WireError::Truncated)?;

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.to_ascii_uppercase(), value.trim());
        }
    }

    let want = |name: &'static str| {
        headers
            .get(name)
            .copied()
            .ok_or(WireError::BadHeader(name))
    };

    match start {
        "NOTIFY * HTTP/1.1" => match want("NTS")? {
            "ssdp:alive" => Ok(Message::Alive {
                notification_type: want("NT")?.to_string(),
                unique_service_name: want("USN")?.to_string(),
                location: want("LOCATION")?.to_string(),
                max_age: max_age_of(&headers),
            }),
            "ssdp:byebye" => Ok(Message::ByeBye {
                notification_type: want("NT")?.to_string(),
                unique_service_name: want("USN")?.to_string(),
            }),
            _ => Err(WireError::BadHeader("NTS")),
        },
        "M-SEARCH * HTTP/1.1" => {
            if want("MAN")? != "\"ssdp:discover\"" {
                return Err(WireError::BadHeader("MAN"));
            }
            let mx = want("MX")?
                .parse::<u8>()
                .map_err(|_| WireError::BadHeader("MX"))?;
            Ok(Message::Search {
                search_target: want("ST")?.to_string(),
                maximum_wait_sec: mx.clamp(1, 5),
            })
        }
        "HTTP/1.1 200 OK" => Ok(Message::Response {
            search_target: want("ST")?.to_string(),
            unique_service_name: want("USN")?.to_string(),
            location: want("LOCATION")?.to_string(),
            max_age: max_age_of(&headers),
        }),
        _ => Err(WireError::UnknownStartLine),
    }
}

/// Writes into a borrowed byte buffer, tracking how far it has got
///
/// Writes that would overflow the buffer are dropped; an oversized
/// datagram goes out truncated and fails to parse at the receiver.
struct Cursor<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8]) -> Cursor<'a> {
        Cursor { buf, used: 0 }
    }

    const fn position(&self) -> usize {
        self.used
    }
}

impl core::fmt::Write for Cursor<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let n = s.len();
        if self.used + n > self.buf.len() {
            return Err(core::fmt::Error);
        }
        self.buf[self.used..self.used + n].copy_from_slice(s.as_bytes());
        self.used += n;
        Ok(())
    }
}

const SERVER: &str = concat!(
    "unix/5 UPnP/1.0 ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION")
);

/// Encode an M-SEARCH into `buf`, returning the bytes used
pub fn build_search(buf: &mut [u8], search_target: &str) -> usize {
    let mut cursor = Cursor::new(buf);
    let _ = write!(
        cursor,
        "M-SEARCH * HTTP/1.1\r
HOST: 239.255.255.250:1900\r
MAN: \"ssdp:discover\"\r
MX: 5\r
ST: {search_target}\r
\r\n"
    );
    cursor.position()
}

/// Encode a search response into `buf`, returning the bytes used
pub fn build_response(
    buf: &mut [u8],
    search_target: &str,
    unique_service_name: &str,
    location: &str,
) -> usize {
    let mut cursor = Cursor::new(buf);
    let _ = write!(
        cursor,
        "HTTP/1.1 200 OK\r
CACHE-CONTROL: max-age={DEFAULT_MAX_AGE}\r
EXT:\r
ST: {search_target}\r
USN: {unique_service_name}\r
LOCATION: {location}\r
SERVER: {SERVER}\r
\r\n"
    );
    cursor.position()
}

/// Encode an ssdp:alive notification into `buf`, returning the bytes used
pub fn build_alive(
    buf: &mut [u8],
    notification_type: &str,
    unique_service_name: &str,
    location: &str,
) -> usize {
    let mut cursor = Cursor::new(buf);
    let _ = write!(
        cursor,
        "NOTIFY * HTTP/1.1\r
HOST: 239.255.255.250:1900\r
CACHE-CONTROL: max-age={DEFAULT_MAX_AGE}\r
LOCATION: {location}\r
NT: {notification_type}\r
NTS: ssdp:alive\r
USN: {unique_service_name}\r
SERVER: {SERVER}\r
\r\n"
    );
    cursor.position()
}

/// Encode an ssdp:byebye notification into `buf`, returning the bytes used
pub fn build_byebye(
    buf: &mut [u8],
    notification_type: &str,
    unique_service_name: &str,
) -> usize {
    let mut cursor = Cursor::new(buf);
    let _ = write!(
        cursor,
        "NOTIFY * HTTP/1.1\r
HOST: 239.255.255.250:1900\r
NT: {notification_type}\r
NTS: ssdp:byebye\r
USN: {unique_service_name}\r
SERVER: {SERVER}\r
\r\n"
    );
    cursor.position()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_utf8() {
        assert_eq!(parse(&[0x80, 0x80]), Err(WireError::NotUtf8));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(parse(&[]), Err(WireError::Truncated));
    }

    #[test]
    fn rejects_non_ssdp() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\nHost: 10.0.0.1\r\n\r\n"),
            Err(WireError::UnknownStartLine)
        );
    }

    #[test]
    fn accepts_alive() {
        let r = parse(
            b"NOTIFY * HTTP/1.1\r\n\
NTS: ssdp:alive\r\n\
NT: fnord\r\n\
USN: prod37\r\n\
Cache-Control: max-age=120\r\n\
Location: http://foo\r\n\
\r\n",
        )
        .unwrap();
        assert_eq!(
            r,
            Message::Alive {
                notification_type: "fnord".to_string(),
                unique_service_name: "prod37".to_string(),
                location: "http://foo".to_string(),
                max_age: 120,
            }
        );
    }

    #[test]
    fn alive_defaults_max_age() {
        let r = parse(
            b"NOTIFY * HTTP/1.1\r\n\
NTS: ssdp:alive\r\n\
NT: fnord\r\n\
USN: prod37\r\n\
Cache-Control: no-store\r\n\
Location: http://foo\r\n\
\r\n",
        )
        .unwrap();
        assert!(
            matches!(r, Message::Alive { max_age, .. } if max_age == 1800)
        );
    }

    #[test]
    fn rejects_alive_missing_fields() {
        for omit in ["NT", "USN", "LOCATION"] {
            let mut packet = String::from("NOTIFY * HTTP/1.1\r\nNTS: ssdp:alive\r\n");
            for (name, value) in
                [("NT", "fnord"), ("USN", "prod37"), ("LOCATION", "http://foo")]
            {
                if name != omit {
                    packet.push_str(&format!("{name}: {value}\r\n"));
                }
            }
            packet.push_str("\r\n");
            assert_eq!(
                parse(packet.as_bytes()),
                Err(WireError::BadHeader(omit)),
                "omitting {omit}"
            );
        }
    }

    #[test]
    fn rejects_notify_bad_nts() {
        let r = parse(
            b"NOTIFY * HTTP/1.1\r\n\
NTS: potato\r\n\
NT: fnord\r\n\
USN: prod37\r\n\
\r\n",
        );
        assert_eq!(r, Err(WireError::BadHeader("NTS")));
    }

    #[test]
    fn accepts_byebye() {
        let r = parse(
            b"NOTIFY * HTTP/1.1\r\n\
NTS: ssdp:byebye\r\n\
NT: fnord\r\n\
USN: prod37\r\n\
\r\n",
        )
        .unwrap();
        assert_eq!(
            r,
            Message::ByeBye {
                notification_type: "fnord".to_string(),
                unique_service_name: "prod37".to_string(),
            }
        );
    }

    #[test]
    fn accepts_search_and_clamps_mx() {
        let r = parse(
            b"M-SEARCH * HTTP/1.1\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: ssdp:all\r\n\
MX: 120\r\n\
\r\n",
        )
        .unwrap();
        assert_eq!(
            r,
            Message::Search {
                search_target: "ssdp:all".to_string(),
                maximum_wait_sec: 5,
            }
        );

        let r = parse(
            b"M-SEARCH * HTTP/1.1\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: ssdp:all\r\n\
MX: 0\r\n\
\r\n",
        )
        .unwrap();
        assert!(
            matches!(r, Message::Search { maximum_wait_sec, .. } if maximum_wait_sec == 1)
        );
    }

    #[test]
    fn rejects_search_without_man() {
        let r = parse(
            b"M-SEARCH * HTTP/1.1\r\n\
ST: ssdp:all\r\n\
MX: 3\r\n\
\r\n",
        );
        assert_eq!(r, Err(WireError::BadHeader("MAN")));
    }

    #[test]
    fn rejects_search_bad_mx() {
        let r = parse(
            b"M-SEARCH * HTTP/1.1\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: ssdp:all\r\n\
MX: soon\r\n\
\r\n",
        );
        assert_eq!(r, Err(WireError::BadHeader("MX")));
    }

    #[test]
    fn accepts_response_case_insensitively() {
        let r = parse(
            b"HTTP/1.1 200 OK\r\n\
st: fnord\r\n\
usn: prod37\r\n\
location: http://foo\r\n\
\r\n",
        )
        .unwrap();
        assert_eq!(
            r,
            Message::Response {
                search_target: "fnord".to_string(),
                unique_service_name: "prod37".to_string(),
                location: "http://foo".to_string(),
                max_age: 1800,
            }
        );
    }

    #[test]
    fn search_round_trip() {
        let mut buf = [0u8; 512];
        let n = build_search(&mut buf, "upnp:rootdevice");
        let msg = parse(&buf[0..n]).unwrap();
        assert!(matches!(msg,
                         Message::Search { search_target, maximum_wait_sec }
                         if search_target == "upnp:rootdevice"
                         && maximum_wait_sec == 5));
    }

    #[test]
    fn response_round_trip() {
        let mut buf = [0u8; 512];
        let n =
            build_response(&mut buf, "upnp:rootdevice", "uuid:xyz", "https://you");
        let msg = parse(&buf[0..n]).unwrap();
        assert!(matches!(msg,
                         Message::Response { search_target, unique_service_name, location, max_age }
                         if search_target == "upnp:rootdevice"
                         && unique_service_name == "uuid:xyz"
                         && location == "https://you"
                         && max_age == 1800));
    }

    #[test]
    fn alive_round_trip() {
        let mut buf = [0u8; 512];
        let n = build_alive(&mut buf, "upnp:rootdevice", "uuid:xyz", "https://you");
        let msg = parse(&buf[0..n]).unwrap();
        assert!(matches!(msg,
                         Message::Alive { notification_type, unique_service_name, location, .. }
                         if notification_type == "upnp:rootdevice"
                         && unique_service_name == "uuid:xyz"
                         && location == "https://you"));
    }

    #[test]
    fn byebye_round_trip() {
        let mut buf = [0u8; 512];
        let n = build_byebye(&mut buf, "upnp:rootdevice", "uuid:xyz");
        let msg = parse(&buf[0..n]).unwrap();
        assert!(matches!(msg,
                         Message::ByeBye { notification_type, unique_service_name }
                         if notification_type == "upnp:rootdevice"
                         && unique_service_name == "uuid:xyz"));
    }

    #[test]
    fn overflowing_build_is_truncated() {
        let mut buf = [0u8; 6];
        let n = build_response(&mut buf, "foo", "bar", "wurdle");
        assert!(n <= 6);
    }
}
