//! UPnP device plumbing: the TCP mini-server and GENA eventing tables
//!
//! The weft-upnp crate supplies the device side of a UPnP stack that
//! weft-ssdp's discovery doesn't cover:
//!
//! - [`miniserver`]: the single TCP accept-and-dispatch point for all
//!   incoming requests -- description fetches, SOAP control calls, and
//!   GENA eventing -- with its start/stop lifecycle and worker pool.
//! - [`gena`]: the service table a device publishes, and the
//!   subscription table recording which control points asked to be told
//!   about state changes, with per-subscription event queues.
//! - [`http`]: the small HTTP/1.x request parser and response builder
//!   both of those share.
//!
//! Discovery itself lives in weft-ssdp; a complete device advertises its
//! description URL there and serves it here.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod gena;
pub mod http;
pub mod miniserver;
mod workers;

pub use miniserver::{
    Dispatch, MiniServer, MiniServerConfig, Request, RequestHandler, Response,
};
