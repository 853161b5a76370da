//! Watching for SSDP resources, MIO flavour
//!
//! Prints every notification heard on the local network; try
//! `cargo run --example ssdp-search` on a network with a media server.

use std::error::Error;
use weft_ssdp::Service;

const MULTICAST: mio::Token = mio::Token(0);
const SEARCH: mio::Token = mio::Token(1);

fn main() -> Result<(), Box<dyn Error>> {
    let mut poll = mio::Poll::new()?;
    let mut ssdp = Service::new(poll.registry(), (MULTICAST, SEARCH))?;

    ssdp.subscribe(
        "ssdp:all",
        Box::new(|notification| println!("{notification:?}")),
    );

    let mut events = mio::Events::with_capacity(64);
    loop {
        poll.poll(&mut events, Some(ssdp.next_wakeup()))?;
        for event in &events {
            match event.token() {
                MULTICAST => ssdp.multicast_ready(event),
                SEARCH => ssdp.search_ready(event),
                _ => {}
            }
        }
        ssdp.wakeup();
    }
}
