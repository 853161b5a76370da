//! Implementing SSDP, the Simple Service Discovery Protocol
//!
//! The weft-ssdp crate encapsulates a client and server for the Simple
//! Service Discovery Protocol (SSDP), the discovery half of UPnP: a
//! mechanism for advertising and finding resources on local networks.
//! What is advertised, or discovered, is, for each resource, a unique
//! identifier (Unique Service Name, USN), an identifier for the type of
//! resource (Notification Type, NT), and the location of the resource in
//! the form of a URL.
//!
//! The crate provides two interfaces for working with SSDP, [`Service`]
//! and [`AsyncService`]. Either one can be used both to discover other
//! devices ([`Service::subscribe`]) and to advertise resources itself
//! ([`Service::advertise`]). Client code using the MIO crate, or a custom
//! polling loop, should use plain [`Service`]; client code using the
//! Tokio crate might wish to use [`AsyncService`] instead, which
//! integrates with that system.
//!
//! The protocol core lives in [`engine::Engine`], which owns no sockets
//! and no clock and can be driven directly where neither wrapper fits.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::net::IpAddr;

/// Incoming SSDP notification, obtained from [`Service::subscribe`]
///
/// Sent in response to searches, and when new resources are made
/// available, and periodically otherwise just in case.
///
/// Neither [`Service`] nor [`AsyncService`] de-duplicates these
/// notifications; a subscriber is likely to receive multiple copies of
/// each. The `unique_service_name` field can be used to distinguish
/// genuinely new resources (e.g., as the key in a `HashMap`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The resource in question is now active (at this location/URL)
    Alive {
        /// Resource type, e.g. "urn:schemas-upnp-org:service:ContentDirectory:1"
        notification_type: String,

        /// Unique identifier for this particular resource instance
        unique_service_name: String,

        /// URL of the resource (for UPnP, the device description document)
        location: String,

        /// How long, in seconds, the sender vouches for this information
        max_age: u32,
    },

    /// The resource in question is (becoming) inactive
    ByeBye {
        /// Resource type
        notification_type: String,

        /// Unique identifier for this particular resource instance
        unique_service_name: String,
    },
}

/// Outgoing SSDP announcement, passed to [`Service::advertise`]
///
/// The location URL's host is rewritten, per network interface, to the
/// address the announcement leaves from, so advertising
/// `http://127.0.0.1:3333/desc.xml` works even on multi-homed hosts.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Resource type
    pub notification_type: String,

    /// Resource location
    pub location: url::Url,
}

/// Error type for service construction and socket plumbing
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A socket could not be created or configured
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A UDP trait operation failed
    #[error(transparent)]
    Udp(#[from] udp::Error),
}

pub mod engine;
pub mod refresh;
pub mod target;
pub mod udp;
pub mod wire;

#[cfg(feature = "sync")]
mod service;
#[cfg(feature = "sync")]
pub use service::Service;

#[cfg(feature = "async")]
mod async_service;
#[cfg(feature = "async")]
pub use async_service::AsyncService;

/// The well-known SSDP multicast group, 239.255.255.250
pub const SSDP_GROUP: IpAddr =
    IpAddr::V4(std::net::Ipv4Addr::new(239, 255, 255, 250));

/// The well-known SSDP port
pub const SSDP_PORT: u16 = 1900;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_is_cloneable_and_comparable() {
        let n = Notification::Alive {
            notification_type: "upnp:rootdevice".to_string(),
            unique_service_name: "uuid:37".to_string(),
            location: "http://example/".to_string(),
            max_age: 1800,
        };
        assert_eq!(n.clone(), n);
        assert_ne!(
            n,
            Notification::ByeBye {
                notification_type: "upnp:rootdevice".to_string(),
                unique_service_name: "uuid:37".to_string(),
            }
        );
    }
}
