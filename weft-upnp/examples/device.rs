//! A toy UPnP device: SSDP advertising, a mini-server, GENA eventing
//!
//! Run it, then from another machine (or terminal) search for
//! `upnp:rootdevice` -- `RUST_LOG=debug` shows the traffic. Every few
//! seconds the device bumps a state variable and notifies subscribers.

use std::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use weft_upnp::gena::device::GenaHandler;
use weft_upnp::gena::{events, ServiceInfo, ServiceKey, ServiceTable};
use weft_upnp::{
    Dispatch, MiniServer, MiniServerConfig, Request, RequestHandler, Response,
};

const UDN: &str = "uuid:4f1e0ed4-7f6b-4a9e-8f3a-weft-demo-001";
const SERVICE_ID: &str = "urn:upnp-org:serviceId:Counter1";

struct Description;

impl RequestHandler for Description {
    fn handle(&self, request: &Request) -> Response {
        match request.head.target.as_str() {
            "/description.xml" => Response::with_body(
                200,
                "text/xml",
                format!(
                    "<?xml version=\"1.0\"?>\
<root xmlns=\"urn:schemas-upnp-org:device-1-0\">\
<device><UDN>{UDN}</UDN>\
<serviceList><service>\
<serviceId>{SERVICE_ID}</serviceId>\
<SCPDURL>/scpd/counter.xml</SCPDURL>\
<controlURL>/control/counter</controlURL>\
<eventSubURL>/events/counter</eventSubURL>\
</service></serviceList></device></root>"
                )
                .into_bytes(),
            ),
            _ => Response::empty(404),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let table = Arc::new(Mutex::new(ServiceTable::new()));
    let key = ServiceKey::new(UDN, SERVICE_ID);
    table.lock().unwrap().register(
        key.clone(),
        ServiceInfo::new(
            "urn:schemas-upnp-org:service:Counter:1",
            "/scpd/counter.xml",
            "/control/counter",
            "/events/counter",
        ),
    );

    let server = MiniServer::start(
        MiniServerConfig::new(),
        Dispatch {
            web: Some(Arc::new(Description)),
            soap: None,
            gena: Some(Arc::new(GenaHandler::new(table.clone()))),
        },
    )?;
    println!("device description on port {}", server.port());

    // Deliver queued NOTIFYs and sweep expired leases
    let pump_table = table.clone();
    std::thread::spawn(move || loop {
        let job = pump_table.lock().unwrap().next_job();
        match job {
            Some(job) => {
                if let Err(e) = events::deliver(&job, Duration::from_secs(30))
                {
                    tracing::warn!("notify {}: {e}", job.sid);
                }
                pump_table.lock().unwrap().complete_job(&job.key, &job.sid);
            }
            None => std::thread::sleep(Duration::from_millis(200)),
        }
        pump_table.lock().unwrap().expire(Instant::now());
    });

    // Bump a state variable periodically
    let counter = Arc::new(AtomicU32::new(0));
    let tick_table = table.clone();
    let tick_key = key.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(5));
        let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let body = events::property_set(&[(
            "Count",
            value.to_string().as_str(),
        )]);
        let _ = tick_table.lock().unwrap().queue_event(
            &tick_key,
            Arc::new(body),
            Instant::now(),
        );
    });

    // SSDP advertising
    let mut poll = mio::Poll::new()?;
    let mut ssdp = weft_ssdp::Service::new(
        poll.registry(),
        (mio::Token(0), mio::Token(1)),
    )?;
    ssdp.advertise(
        UDN,
        weft_ssdp::Advertisement {
            notification_type: "upnp:rootdevice".to_string(),
            location: url::Url::parse(&format!(
                "http://127.0.0.1:{}/description.xml",
                server.port()
            ))?,
        },
    );

    let mut events_buf = mio::Events::with_capacity(64);
    loop {
        poll.poll(&mut events_buf, Some(ssdp.next_wakeup()))?;
        for event in &events_buf {
            ssdp.multicast_ready(event);
            ssdp.search_ready(event);
        }
        ssdp.wakeup();
    }
}
