//! GENA: which control points asked to hear about state changes
//!
//! A device publishes services; control points SUBSCRIBE to a service's
//! event URL and are sent NOTIFY requests when its state variables
//! change. This module holds the device-side bookkeeping: the
//! [`table::ServiceTable`] of services and their subscriptions, the
//! [`events`] queue of outgoing notifications, and the
//! [`device::GenaHandler`] that plugs it all into the mini-server.

pub mod device;
pub mod events;
pub mod table;

pub use table::{GenaError, ServiceInfo, ServiceKey, ServiceTable};

use std::fmt;

/// A subscription identifier, "uuid:" + UUID
///
/// Allocated by the device on subscription, quoted by the control point
/// on renewal and cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(String);

impl Sid {
    /// Mint a fresh, universally-unique SID
    #[must_use]
    pub fn new() -> Sid {
        Sid(format!("uuid:{}", uuid::Uuid::new_v4()))
    }

    /// Accept a SID quoted back by a control point
    ///
    /// Only the "uuid:" prefix is checked; the rest is an opaque token.
    #[must_use]
    pub fn parse(s: &str) -> Option<Sid> {
        let s = s.trim();
        s.starts_with("uuid:").then(|| Sid(s.to_string()))
    }

    /// The SID as it appears in SID: headers
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A subscription duration, as in TIMEOUT: headers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timeout {
    /// A lease of this many seconds
    Seconds(u32),
    /// No expiry requested
    Infinite,
}

impl Timeout {
    /// Parse a TIMEOUT: header value ("Second-1800" or "infinite")
    #[must_use]
    pub fn parse(s: &str) -> Option<Timeout> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("infinite") {
            return Some(Timeout::Infinite);
        }
        let (word, n) = s.split_once('-')?;
        if !word.eq_ignore_ascii_case("second") {
            return None;
        }
        n.parse().ok().map(Timeout::Seconds)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Seconds(n) => write!(f, "Second-{n}"),
            Timeout::Infinite => f.write_str("infinite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sids_are_unique_and_prefixed() {
        let a = Sid::new();
        let b = Sid::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("uuid:"));
    }

    #[test]
    fn sid_round_trips_through_header() {
        let a = Sid::new();
        assert_eq!(Sid::parse(a.as_str()), Some(a.clone()));
        assert_eq!(Sid::parse(&format!("  {a} ")), Some(a));
    }

    #[test]
    fn sid_rejects_other_tokens() {
        assert_eq!(Sid::parse("urn:not-a-sid"), None);
        assert_eq!(Sid::parse(""), None);
    }

    #[test]
    fn timeout_grammar() {
        assert_eq!(Timeout::parse("Second-1800"), Some(Timeout::Seconds(1800)));
        assert_eq!(Timeout::parse("second-5"), Some(Timeout::Seconds(5)));
        assert_eq!(Timeout::parse("infinite"), Some(Timeout::Infinite));
        assert_eq!(Timeout::parse("Infinite"), Some(Timeout::Infinite));
        assert_eq!(Timeout::parse("Minute-3"), None);
        assert_eq!(Timeout::parse("Second-soon"), None);
        assert_eq!(Timeout::parse(""), None);
    }

    #[test]
    fn timeout_formats_like_the_header() {
        assert_eq!(Timeout::Seconds(1800).to_string(), "Second-1800");
        assert_eq!(Timeout::Infinite.to_string(), "infinite");
    }
}
