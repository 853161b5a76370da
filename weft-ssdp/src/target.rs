//! Classifying search targets and matching them against notification types
//!
//! UPnP defines five kinds of search target: everything, root devices
//! only, one particular device by UDN, a device type, and a service type.
//! Typed device and service searches match down-level: a search for
//! version N of a type must be answered by devices implementing version N
//! or above (UPnP DA 1.0 s1.2.3).

/// A parsed search target (ST header) or notification type (NT header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTarget {
    /// "ssdp:all": every resource
    All,
    /// "upnp:rootdevice": root devices only
    RootDevice,
    /// "uuid:...": one particular device
    Udn(String),
    /// "urn:<domain>:device:<type>:<version>", version split out
    DeviceType(String, u32),
    /// "urn:<domain>:service:<type>:<version>", version split out
    ServiceType(String, u32),
}

impl SearchTarget {
    /// Classify a target string; `None` if it fits no known form
    #[must_use]
    pub fn parse(s: &str) -> Option<SearchTarget> {
        match s {
            "ssdp:all" => return Some(SearchTarget::All),
            "upnp:rootdevice" => return Some(SearchTarget::RootDevice),
            _ => {}
        }
        if s.starts_with("uuid:") {
            return Some(SearchTarget::Udn(s.to_string()));
        }
        if s.starts_with("urn:") {
            let (base, version) = s.rsplit_once(':')?;
            let version = version.parse().ok()?;
            if base.contains(":device:") {
                return Some(SearchTarget::DeviceType(
                    base.to_string(),
                    version,
                ));
            }
            if base.contains(":service:") {
                return Some(SearchTarget::ServiceType(
                    base.to_string(),
                    version,
                ));
            }
        }
        None
    }

    /// Does a notification of type `candidate` satisfy this search?
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            SearchTarget::All => true,
            SearchTarget::RootDevice => candidate == "upnp:rootdevice",
            SearchTarget::Udn(udn) => candidate == udn,
            SearchTarget::DeviceType(base, version) => {
                matches!(SearchTarget::parse(candidate),
                         Some(SearchTarget::DeviceType(cbase, cversion))
                         if cbase == *base && cversion >= *version)
            }
            SearchTarget::ServiceType(base, version) => {
                matches!(SearchTarget::parse(candidate),
                         Some(SearchTarget::ServiceType(cbase, cversion))
                         if cbase == *base && cversion >= *version)
            }
        }
    }
}

/// Match a raw search string against a raw notification type
///
/// Exact string equality always matches, so ad hoc non-UPnP target names
/// still work; otherwise the typed down-level rules apply.
#[must_use]
pub fn target_match(search: &str, candidate: &str) -> bool {
    if search == candidate {
        return true;
    }
    SearchTarget::parse(search).is_some_and(|t| t.matches(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_five_forms() {
        assert_eq!(SearchTarget::parse("ssdp:all"), Some(SearchTarget::All));
        assert_eq!(
            SearchTarget::parse("upnp:rootdevice"),
            Some(SearchTarget::RootDevice)
        );
        assert_eq!(
            SearchTarget::parse("uuid:0ed4"),
            Some(SearchTarget::Udn("uuid:0ed4".to_string()))
        );
        assert_eq!(
            SearchTarget::parse("urn:schemas-upnp-org:device:MediaServer:1"),
            Some(SearchTarget::DeviceType(
                "urn:schemas-upnp-org:device:MediaServer".to_string(),
                1
            ))
        );
        assert_eq!(
            SearchTarget::parse(
                "urn:schemas-upnp-org:service:ContentDirectory:2"
            ),
            Some(SearchTarget::ServiceType(
                "urn:schemas-upnp-org:service:ContentDirectory".to_string(),
                2
            ))
        );
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(SearchTarget::parse("fnord"), None);
        assert_eq!(
            SearchTarget::parse("urn:schemas-upnp-org:device:MediaServer:X"),
            None
        );
        assert_eq!(SearchTarget::parse("urn:odd-form"), None);
    }

    #[test]
    fn ssdp_all_matches_everything() {
        assert!(target_match("ssdp:all", "upnp:rootdevice"));
        assert!(target_match("ssdp:all", "uuid:0ed4"));
        assert!(!target_match("upnp:rootdevice", "ssdp:all"));
    }

    #[test]
    fn equality_matches() {
        assert!(target_match("upnp:rootdevice", "upnp:rootdevice"));
        assert!(target_match("fnord", "fnord")); // non-UPnP names still work
        assert!(!target_match("fnord", "blewit"));
    }

    #[test]
    fn downlevel_matches() {
        // Searching for CD:1 should pick up CD:2, but not vice versa
        assert!(target_match(
            "urn:schemas-upnp-org:service:ContentDirectory:1",
            "urn:schemas-upnp-org:service:ContentDirectory:2"
        ));
        assert!(!target_match(
            "urn:schemas-upnp-org:service:ContentDirectory:2",
            "urn:schemas-upnp-org:service:ContentDirectory:1"
        ));
        assert!(target_match(
            "urn:schemas-upnp-org:device:MediaServer:1",
            "urn:schemas-upnp-org:device:MediaServer:3"
        ));
    }

    #[test]
    fn device_and_service_do_not_cross_match() {
        assert!(!target_match(
            "urn:schemas-upnp-org:device:ContentDirectory:1",
            "urn:schemas-upnp-org:service:ContentDirectory:1"
        ));
    }

    #[test]
    fn udn_matches_exactly() {
        assert!(target_match("uuid:0ed4", "uuid:0ed4"));
        assert!(!target_match("uuid:0ed4", "uuid:0ed5"));
    }
}
