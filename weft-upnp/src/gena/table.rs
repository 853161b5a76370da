//! The service table: what a device publishes, and who subscribed
//!
//! Services are keyed by (UDN, service id). Each carries its URL paths
//! (description, control, eventing) and its list of live subscriptions;
//! each subscription carries the SID the device minted for it, its
//! lease expiry, its SEQ event-key counter, the control point's
//! delivery URLs, and a bounded queue of outgoing events of which at
//! most one is in flight at a time.

use super::events::{NotifyJob, PendingEvent};
use super::{Sid, Timeout};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunable bounds on subscription behaviour
#[derive(Debug, Clone)]
pub struct Limits {
    /// Most subscriptions one service will accept
    pub max_subscriptions_per_service: usize,
    /// Longest lease that will be granted
    pub max_timeout: Duration,
    /// Lease granted when the control point doesn't ask for one
    pub default_timeout: Duration,
    /// Whether "TIMEOUT: infinite" is honoured (else clamped to default)
    pub allow_infinite: bool,
    /// Most events queued per subscription before old ones are shed
    pub max_queued_events: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_subscriptions_per_service: 128,
            max_timeout: Duration::from_secs(7200),
            default_timeout: Duration::from_secs(1800),
            allow_infinite: false,
            max_queued_events: 16,
        }
    }
}

/// Identifies one service of one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    /// The device's Unique Device Name, "uuid:..."
    pub udn: String,
    /// The service id within the device
    pub service_id: String,
}

impl ServiceKey {
    /// Convenience constructor
    #[must_use]
    pub fn new(udn: &str, service_id: &str) -> ServiceKey {
        ServiceKey {
            udn: udn.to_string(),
            service_id: service_id.to_string(),
        }
    }
}

/// One subscription: a control point that asked to hear about changes
#[derive(Debug)]
pub struct Subscription {
    sid: Sid,
    expires: Option<Instant>,
    event_key: u32,
    delivery_urls: Vec<url::Url>,
    outgoing: std::collections::VecDeque<PendingEvent>,
    in_flight: bool,
}

impl Subscription {
    /// The subscription's identifier
    #[must_use]
    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    /// When the lease runs out (`None` for an infinite lease)
    #[must_use]
    pub fn expires(&self) -> Option<Instant> {
        self.expires
    }

    /// The next SEQ value this subscription will be sent
    #[must_use]
    pub fn event_key(&self) -> u32 {
        self.event_key
    }

    /// Where NOTIFYs are delivered (first reachable URL wins)
    #[must_use]
    pub fn delivery_urls(&self) -> &[url::Url] {
        &self.delivery_urls
    }

    /// How many events are queued (including any in flight)
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.outgoing.len()
    }

    fn live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |e| e > now)
    }

    /// Allocate the next SEQ: 0 only ever means "initial event", so the
    /// counter wraps to 1, not 0
    fn next_seq(&mut self) -> u32 {
        let seq = self.event_key;
        self.event_key = self.event_key.checked_add(1).unwrap_or(1);
        seq
    }
}

/// One published service
#[derive(Debug)]
pub struct ServiceInfo {
    /// Service type, e.g. "urn:schemas-upnp-org:service:ContentDirectory:1"
    pub service_type: String,
    /// URL path of the service description document
    pub scpd_path: String,
    /// URL path SOAP control requests arrive on
    pub control_path: String,
    /// URL path SUBSCRIBE/UNSUBSCRIBE requests arrive on
    pub event_path: String,
    /// Inactive services refuse new subscriptions
    pub active: bool,
    subscriptions: Vec<Subscription>,
}

impl ServiceInfo {
    /// Describe a service; it starts active with no subscribers
    #[must_use]
    pub fn new(
        service_type: &str,
        scpd_path: &str,
        control_path: &str,
        event_path: &str,
    ) -> ServiceInfo {
        ServiceInfo {
            service_type: service_type.to_string(),
            scpd_path: scpd_path.to_string(),
            control_path: control_path.to_string(),
            event_path: event_path.to_string(),
            active: true,
            subscriptions: Vec::new(),
        }
    }

    /// Current subscriptions, expired ones included until swept
    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    fn find_sub(&mut self, sid: &Sid) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| s.sid == *sid)
    }
}

/// Ways a GENA operation can fail
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenaError {
    /// The (UDN, service id) pair names nothing in the table
    #[error("no such service")]
    NoSuchService,

    /// The service exists but is not accepting subscriptions
    #[error("service is inactive")]
    ServiceInactive,

    /// The per-service subscription cap has been reached
    #[error("too many subscribers")]
    TooManySubscribers,

    /// The SID names no live subscription of this service
    #[error("no such subscription")]
    NoSuchSid,

    /// No usable delivery URL was offered
    #[error("no usable callback URL")]
    BadCallback,
}

/// What a successful subscribe or renew grants
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    /// The subscription's identifier (fresh on subscribe, echoed on renew)
    pub sid: Sid,
    /// The lease actually granted, after clamping
    pub timeout: Timeout,
}

/// The table of a device's services and their subscriptions
#[derive(Debug, Default)]
pub struct ServiceTable {
    limits: Limits,
    services: HashMap<ServiceKey, ServiceInfo>,
}

impl ServiceTable {
    /// An empty table with default [`Limits`]
    #[must_use]
    pub fn new() -> ServiceTable {
        ServiceTable::default()
    }

    /// An empty table with explicit [`Limits`]
    #[must_use]
    pub fn with_limits(limits: Limits) -> ServiceTable {
        ServiceTable {
            limits,
            services: HashMap::new(),
        }
    }

    /// Publish a service (replacing any previous one under the same key)
    pub fn register(&mut self, key: ServiceKey, info: ServiceInfo) {
        self.services.insert(key, info);
    }

    /// Withdraw one service, dropping its subscriptions
    pub fn deregister(&mut self, key: &ServiceKey) -> Option<ServiceInfo> {
        self.services.remove(key)
    }

    /// Withdraw every service of one device, returning how many
    pub fn remove_device(&mut self, udn: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|k, _| k.udn != udn);
        before - self.services.len()
    }

    /// Look up a service by key
    #[must_use]
    pub fn find(&self, key: &ServiceKey) -> Option<&ServiceInfo> {
        self.services.get(key)
    }

    /// Find the service whose eventing URL path this is
    #[must_use]
    pub fn find_by_event_path(
        &self,
        path: &str,
    ) -> Option<(&ServiceKey, &ServiceInfo)> {
        self.services.iter().find(|(_, s)| s.event_path == path)
    }

    /// Find the service whose control URL path this is
    #[must_use]
    pub fn find_by_control_path(
        &self,
        path: &str,
    ) -> Option<(&ServiceKey, &ServiceInfo)> {
        self.services.iter().find(|(_, s)| s.control_path == path)
    }

    fn grant_timeout(&self, requested: Option<Timeout>) -> Timeout {
        let max = self.limits.max_timeout.as_secs() as u32;
        let default = self.limits.default_timeout.as_secs() as u32;
        match requested {
            None => Timeout::Seconds(default),
            Some(Timeout::Infinite) => {
                if self.limits.allow_infinite {
                    Timeout::Infinite
                } else {
                    Timeout::Seconds(default)
                }
            }
            Some(Timeout::Seconds(n)) => {
                Timeout::Seconds(n.clamp(1, max))
            }
        }
    }

    fn expiry(grant: Timeout, now: Instant) -> Option<Instant> {
        match grant {
            Timeout::Infinite => None,
            Timeout::Seconds(n) => Some(now + Duration::from_secs(n.into())),
        }
    }

    /// Accept a new subscription
    ///
    /// The requested lease is clamped to the table's limits; the granted
    /// value is returned and must be quoted back to the control point.
    ///
    /// # Errors
    ///
    /// [`GenaError::NoSuchService`], [`GenaError::ServiceInactive`],
    /// [`GenaError::TooManySubscribers`], or [`GenaError::BadCallback`]
    /// if no delivery URL was offered.
    pub fn subscribe(
        &mut self,
        key: &ServiceKey,
        delivery_urls: Vec<url::Url>,
        requested: Option<Timeout>,
        now: Instant,
    ) -> Result<Grant, GenaError> {
        if delivery_urls.is_empty() {
            return Err(GenaError::BadCallback);
        }
        let grant = self.grant_timeout(requested);
        let max_subscriptions = self.limits.max_subscriptions_per_service;
        let service = self
            .services
            .get_mut(key)
            .ok_or(GenaError::NoSuchService)?;
        if !service.active {
            return Err(GenaError::ServiceInactive);
        }
        if service.subscriptions.len() >= max_subscriptions {
            return Err(GenaError::TooManySubscribers);
        }
        let sid = Sid::new();
        service.subscriptions.push(Subscription {
            sid: sid.clone(),
            expires: Self::expiry(grant, now),
            event_key: 0,
            delivery_urls,
            outgoing: std::collections::VecDeque::new(),
            in_flight: false,
        });
        tracing::info!(
            "service {}/{}: new subscription {sid}",
            key.udn,
            key.service_id
        );
        Ok(Grant { sid, timeout: grant })
    }

    /// Renew an existing subscription's lease
    ///
    /// The SID and the SEQ counter are preserved; only the expiry moves.
    ///
    /// # Errors
    ///
    /// [`GenaError::NoSuchService`], or [`GenaError::NoSuchSid`] if the
    /// SID is unknown or the lease has already run out.
    pub fn renew(
        &mut self,
        key: &ServiceKey,
        sid: &Sid,
        requested: Option<Timeout>,
        now: Instant,
    ) -> Result<Grant, GenaError> {
        let grant = self.grant_timeout(requested);
        let service = self
            .services
            .get_mut(key)
            .ok_or(GenaError::NoSuchService)?;
        let sub = service.find_sub(sid).ok_or(GenaError::NoSuchSid)?;
        if !sub.live(now) {
            return Err(GenaError::NoSuchSid);
        }
        sub.expires = Self::expiry(grant, now);
        Ok(Grant {
            sid: sid.clone(),
            timeout: grant,
        })
    }

    /// Cancel a subscription
    ///
    /// # Errors
    ///
    /// [`GenaError::NoSuchService`] or [`GenaError::NoSuchSid`].
    pub fn unsubscribe(
        &mut self,
        key: &ServiceKey,
        sid: &Sid,
    ) -> Result<(), GenaError> {
        let service = self
            .services
            .get_mut(key)
            .ok_or(GenaError::NoSuchService)?;
        let before = service.subscriptions.len();
        service.subscriptions.retain(|s| s.sid != *sid);
        if service.subscriptions.len() == before {
            return Err(GenaError::NoSuchSid);
        }
        tracing::info!(
            "service {}/{}: dropped subscription {sid}",
            key.udn,
            key.service_id
        );
        Ok(())
    }

    /// Drop every subscription whose lease has run out
    ///
    /// Returns how many were dropped. Callers should run this off
    /// [`ServiceTable::next_expiry`], or just periodically.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        for service in self.services.values_mut() {
            let before = service.subscriptions.len();
            service.subscriptions.retain(|s| s.live(now));
            dropped += before - service.subscriptions.len();
        }
        if dropped > 0 {
            tracing::debug!("expired {dropped} subscription(s)");
        }
        dropped
    }

    /// The soonest lease expiry in the table, if any lease is finite
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.services
            .values()
            .flat_map(|s| s.subscriptions.iter())
            .filter_map(Subscription::expires)
            .min()
    }

    /// Queue an event (a property-set document) to every live
    /// subscription of one service
    ///
    /// Each subscription tags the event with its own next SEQ. When a
    /// subscription's queue is full, the oldest event not currently in
    /// flight is shed to make room.
    ///
    /// Returns how many subscriptions the event was queued to.
    ///
    /// # Errors
    ///
    /// [`GenaError::NoSuchService`].
    pub fn queue_event(
        &mut self,
        key: &ServiceKey,
        body: Arc<Vec<u8>>,
        now: Instant,
    ) -> Result<usize, GenaError> {
        let max_queued = self.limits.max_queued_events;
        let service = self
            .services
            .get_mut(key)
            .ok_or(GenaError::NoSuchService)?;
        let mut queued = 0;
        for sub in &mut service.subscriptions {
            if !sub.live(now) {
                continue;
            }
            if sub.outgoing.len() >= max_queued {
                // the front entry may be mid-delivery; shed behind it
                let victim = usize::from(sub.in_flight);
                if sub.outgoing.remove(victim).is_some() {
                    tracing::warn!(
                        "subscription {}: event queue full, shedding",
                        sub.sid
                    );
                }
            }
            let seq = sub.next_seq();
            sub.outgoing.push_back(PendingEvent {
                seq,
                body: body.clone(),
            });
            queued += 1;
        }
        Ok(queued)
    }

    /// Claim the next NOTIFY to deliver, if any subscription has one
    /// queued and none already in flight
    ///
    /// The job stays at the front of its queue until
    /// [`ServiceTable::complete_job`] is called for it, so at most one
    /// NOTIFY per subscription is ever in flight.
    pub fn next_job(&mut self) -> Option<NotifyJob> {
        for (key, service) in &mut self.services {
            for sub in &mut service.subscriptions {
                if sub.in_flight {
                    continue;
                }
                if let Some(event) = sub.outgoing.front() {
                    sub.in_flight = true;
                    return Some(NotifyJob {
                        key: key.clone(),
                        sid: sub.sid.clone(),
                        seq: event.seq,
                        urls: sub.delivery_urls.clone(),
                        body: event.body.clone(),
                    });
                }
            }
        }
        None
    }

    /// Report a claimed NOTIFY finished (delivered or given up on),
    /// releasing the subscription's next queued event
    pub fn complete_job(&mut self, key: &ServiceKey, sid: &Sid) {
        if let Some(service) = self.services.get_mut(key) {
            if let Some(sub) = service.find_sub(sid) {
                if sub.in_flight {
                    sub.in_flight = false;
                    sub.outgoing.pop_front();
                }
            }
        }
    }
}
