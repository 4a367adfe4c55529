//! Scanner: fuses registry, hub enumerator, and port enumerator into a new
//! cache snapshot.
//!
//! One pass classifies every serial-identified device as direct, indirect,
//! or no-hub (or leaves it offline), applies port-collision eviction, stamps
//! `last_seen`, and persists the cache atomically.

use std::collections::HashSet;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::cache::{Link, LocationCache, LocationRecord};
use crate::config::Config;
use crate::error::Result;
use crate::ports::{self, PortSnapshot};
use crate::registry::Registry;
use crate::tracing::prelude::*;
use crate::uhub::{self, HubSnapshot};

/// Placeholder hub/port for devices with no governing controllable hub.
pub const NO_HUB: &str = "-";

/// Live topology evidence for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub hub: String,
    pub port: String,
    pub link: Link,
    pub dev: String,
}

/// Classify one serial identifier against the two live snapshots.
///
/// Direct beats indirect beats no-hub; `None` means the device is offline.
pub fn locate(identifier: &str, hubs: &HubSnapshot, ports: &PortSnapshot) -> Option<Located> {
    // Direct: the power-control tool enumerated the device itself.
    if let Some((hub, port)) = hubs.find_identifier(identifier) {
        let dev = ports
            .by_serial(identifier)
            .map(|p| p.device.clone())
            .unwrap_or_default();
        return Some(Located {
            hub: hub.to_string(),
            port: port.to_string(),
            link: Link::Direct,
            dev,
        });
    }

    // Indirect / no-hub: the OS sees a serial port for it.
    let port_rec = ports.by_serial(identifier)?;
    if let Some(location) = &port_rec.location {
        if let Some(hub) = hubs.governing_hub(location) {
            // First topology segment past the hub prefix is the hub port.
            let remainder = &location[hub.len() + 1..];
            let port = remainder.split('.').next().unwrap_or(remainder);
            return Some(Located {
                hub: hub.to_string(),
                port: port.to_string(),
                link: Link::Indirect,
                dev: port_rec.device.clone(),
            });
        }
    }

    Some(Located {
        hub: NO_HUB.to_string(),
        port: NO_HUB.to_string(),
        link: Link::NoHub,
        dev: port_rec.device.clone(),
    })
}

/// Per-device outcome of a scan pass.
#[derive(Debug, Clone)]
pub enum ScanStatus {
    /// Seen live this pass; the record was written to the cache.
    Found(LocationRecord),
    /// Location-identified device; topology comes from the registry alone.
    Static { hub: String, port: String },
    /// Not seen; any previous record is retained untouched.
    Offline(Option<LocationRecord>),
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub name: String,
    pub status: ScanStatus,
}

/// Outcome of one full scan pass.
#[derive(Debug)]
pub struct ScanOutcome {
    pub results: Vec<ScanResult>,
    /// Names evicted by port-collision.
    pub evicted: Vec<String>,
}

impl ScanOutcome {
    /// Devices seen live this pass.
    pub fn found_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, ScanStatus::Found(_)))
            .count()
    }
}

/// Split a registry `location=` value into `(hub, port)` at the last dot.
pub fn split_static_location(location: &str) -> (String, String) {
    match location.rsplit_once('.') {
        Some((hub, port)) => (hub.to_string(), port.to_string()),
        None => (location.to_string(), NO_HUB.to_string()),
    }
}

/// Run one scan pass over pre-taken snapshots, mutating the cache in place.
///
/// Pure with respect to I/O so the eviction and tie-break rules are unit
/// testable; [`run`] wraps it with live snapshots and persistence.
pub fn scan_pass(
    registry: &Registry,
    cache: &mut LocationCache,
    hubs: &HubSnapshot,
    ports: &PortSnapshot,
    now: &str,
) -> ScanOutcome {
    let mut results = Vec::new();
    let mut evicted = Vec::new();
    // Names whose record was written this pass; earlier registry order wins
    // any same-pass port collision.
    let mut written: HashSet<String> = HashSet::new();

    for device in &registry.devices {
        let status = match device.serial() {
            None => {
                // Static devices never join scan evidence.
                let (hub, port) = split_static_location(device.location().unwrap_or_default());
                ScanStatus::Static { hub, port }
            }
            Some(identifier) => match locate(identifier, hubs, ports) {
                None => ScanStatus::Offline(cache.get(&device.name).cloned()),
                Some(loc) => {
                    let record = LocationRecord {
                        mac: identifier.to_string(),
                        hub: loc.hub.clone(),
                        port: loc.port.clone(),
                        link: loc.link,
                        dev: loc.dev.clone(),
                        last_seen: now.to_string(),
                    };

                    let mut blocked = false;
                    if loc.hub != NO_HUB {
                        if let Some(holder) = cache.by_hub_port(&loc.hub, &loc.port).cloned() {
                            if holder != device.name {
                                if written.contains(&holder) {
                                    // Same-pass collision: the earlier
                                    // registry entry keeps the port.
                                    warn!(
                                        port = %format!("{}:{}", loc.hub, loc.port),
                                        winner = %holder,
                                        loser = %device.name,
                                        "Two devices claim one port, keeping earlier registration"
                                    );
                                    blocked = true;
                                } else {
                                    debug!(
                                        evicted = %holder,
                                        replacement = %device.name,
                                        port = %format!("{}:{}", loc.hub, loc.port),
                                        "Port reassigned, evicting stale record"
                                    );
                                    cache.delete(&holder);
                                    evicted.push(holder);
                                }
                            }
                        }
                    }

                    if blocked {
                        ScanStatus::Offline(cache.get(&device.name).cloned())
                    } else {
                        cache.put(&device.name, record.clone());
                        written.insert(device.name.clone());
                        ScanStatus::Found(record)
                    }
                }
            },
        };

        results.push(ScanResult {
            name: device.name.clone(),
            status,
        });
    }

    ScanOutcome { results, evicted }
}

/// Take live snapshots, run a pass, and persist the cache.
pub async fn run(config: &Config, registry: &Registry) -> Result<ScanOutcome> {
    let (hubs, port_snapshot) = tokio::join!(uhub::enumerate(), ports::enumerate(&config.python));
    let port_snapshot = port_snapshot?;

    let mut cache = LocationCache::load(&config.db_path)?;
    let now = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&Rfc3339)
        .unwrap_or_default();

    let outcome = scan_pass(registry, &mut cache, &hubs, &port_snapshot, &now);
    cache.save()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uhub::HubSnapshot;
    use std::path::PathBuf;

    const MAC_A: &str = "AA:AA:AA:AA:AA:AA";
    const MAC_B: &str = "BB:BB:BB:BB:BB:BB";

    fn registry(text: &str) -> Registry {
        Registry::parse(text, &PathBuf::from("devices.conf")).unwrap()
    }

    fn empty_cache() -> (tempfile::TempDir, LocationCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocationCache::load(&dir.path().join("locations.json")).unwrap();
        (dir, cache)
    }

    fn hub_with(identifier: &str, hub: &str, port: &str) -> HubSnapshot {
        HubSnapshot::parse(&format!(
            "Current status for hub {hub} [05e3:0610 USB2.0 Hub, 4 ports, ppps]\n  \
             Port {port}: 0503 power enable connect [Espressif device {identifier}]\n"
        ))
    }

    #[test]
    fn direct_link_recorded() {
        let reg = registry(&format!("Device A={MAC_A}\n"));
        let (_dir, mut cache) = empty_cache();
        let hubs = hub_with(MAC_A, "20-2", "1");
        let ports = PortSnapshot::parse(&format!("{MAC_A}|/dev/cu.usbmodem101|20-2.1\n"));

        let outcome = scan_pass(&reg, &mut cache, &hubs, &ports, "2026-01-01T00:00:00Z");

        assert_eq!(outcome.found_count(), 1);
        let rec = cache.get("Device A").unwrap();
        assert_eq!(rec.hub, "20-2");
        assert_eq!(rec.port, "1");
        assert_eq!(rec.link, Link::Direct);
        assert_eq!(rec.dev, "/dev/cu.usbmodem101");
        assert_eq!(rec.last_seen, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn no_hub_still_counts_as_found() {
        let reg = registry(&format!("Device A={MAC_A}\n"));
        let (_dir, mut cache) = empty_cache();
        let hubs = HubSnapshot::default();
        let ports = PortSnapshot::parse(&format!("{MAC_A}|/dev/cu.usbmodem101|20-1\n"));

        let outcome = scan_pass(&reg, &mut cache, &hubs, &ports, "2026-01-01T00:00:00Z");

        assert_eq!(outcome.found_count(), 1);
        let rec = cache.get("Device A").unwrap();
        assert_eq!(rec.link, Link::NoHub);
        assert_eq!(rec.hub, NO_HUB);
        assert_eq!(rec.port, NO_HUB);
    }

    #[test]
    fn indirect_link_via_topology_prefix() {
        let reg = registry(&format!("Device A={MAC_A}\n"));
        let (_dir, mut cache) = empty_cache();
        // Hub sees only a sub-hub; the device location disambiguates.
        let hubs = HubSnapshot::parse(
            "Current status for hub 20-2 [05e3:0610 USB2.0 Hub, 4 ports, ppps]\n  \
             Port 2: 0303 power enable connect [05e3:0610 USB2.0 Hub]\n",
        );
        let ports = PortSnapshot::parse(&format!("{MAC_A}|/dev/ttyACM0|20-2.2.1\n"));

        scan_pass(&reg, &mut cache, &hubs, &ports, "2026-01-01T00:00:00Z");

        let rec = cache.get("Device A").unwrap();
        assert_eq!(rec.link, Link::Indirect);
        assert_eq!(rec.hub, "20-2");
        assert_eq!(rec.port, "2");
    }

    #[test]
    fn moved_device_evicts_previous_claimant() {
        let reg = registry(&format!("Device A={MAC_A}\nDevice B={MAC_B}\n"));
        let (_dir, mut cache) = empty_cache();

        // Pre-existing: Device A held 20-2 port 1.
        cache.put(
            "Device A",
            LocationRecord {
                mac: MAC_A.into(),
                hub: "20-2".into(),
                port: "1".into(),
                link: Link::Direct,
                dev: String::new(),
                last_seen: "2025-12-31T00:00:00Z".into(),
            },
        );

        // New scan sees only Device B on that port.
        let hubs = hub_with(MAC_B, "20-2", "1");
        let ports = PortSnapshot::parse(&format!("{MAC_B}|/dev/ttyACM1|20-2.1\n"));

        let outcome = scan_pass(&reg, &mut cache, &hubs, &ports, "2026-01-01T00:00:00Z");

        assert_eq!(outcome.evicted, vec!["Device A".to_string()]);
        assert!(cache.get("Device A").is_none());
        assert_eq!(cache.get("Device B").unwrap().port, "1");
    }

    #[test]
    fn same_pass_collision_earlier_registration_wins() {
        // Both devices resolve to the same (hub, port); shouldn't happen
        // with unique identifiers, but the tie-break is registry order.
        let reg = registry(&format!("Device A={MAC_A}\nDevice B={MAC_B}\n"));
        let (_dir, mut cache) = empty_cache();

        let hubs = HubSnapshot::parse(&format!(
            "Current status for hub 20-2 [hub, ppps]\n  \
             Port 1: 0503 power enable connect [dev {MAC_A}]\n"
        ));
        // Device B lands on the same port via the indirect path.
        let ports = PortSnapshot::parse(&format!(
            "{MAC_A}|/dev/ttyACM0|20-2.1\n{MAC_B}|/dev/ttyACM1|20-2.1.2\n"
        ));

        let outcome = scan_pass(&reg, &mut cache, &hubs, &ports, "2026-01-01T00:00:00Z");

        assert_eq!(cache.get("Device A").unwrap().port, "1");
        assert!(cache.get("Device B").is_none());
        assert!(outcome.evicted.is_empty());
    }

    #[test]
    fn offline_device_retains_prior_record() {
        let reg = registry(&format!("Device A={MAC_A}\n"));
        let (_dir, mut cache) = empty_cache();
        cache.put(
            "Device A",
            LocationRecord {
                mac: MAC_A.into(),
                hub: "20-2".into(),
                port: "1".into(),
                link: Link::Direct,
                dev: String::new(),
                last_seen: "2025-12-31T00:00:00Z".into(),
            },
        );

        let outcome = scan_pass(
            &reg,
            &mut cache,
            &HubSnapshot::default(),
            &PortSnapshot::default(),
            "2026-01-01T00:00:00Z",
        );

        assert_eq!(outcome.found_count(), 0);
        let rec = cache.get("Device A").unwrap();
        assert_eq!(rec.last_seen, "2025-12-31T00:00:00Z");
    }

    #[test]
    fn static_devices_never_join_evidence() {
        let reg = registry("[Charger A]\nlocation=20-2.3\ntype=power\n");
        let (_dir, mut cache) = empty_cache();

        let outcome = scan_pass(
            &reg,
            &mut cache,
            &HubSnapshot::default(),
            &PortSnapshot::default(),
            "2026-01-01T00:00:00Z",
        );

        assert!(matches!(
            &outcome.results[0].status,
            ScanStatus::Static { hub, port } if hub == "20-2" && port == "3"
        ));
        assert!(cache.get("Charger A").is_none());
    }

    #[test]
    fn split_static_location_at_last_dot() {
        assert_eq!(
            split_static_location("20-2.3"),
            ("20-2".to_string(), "3".to_string())
        );
        assert_eq!(
            split_static_location("20-2.2.1"),
            ("20-2.2".to_string(), "1".to_string())
        );
        assert_eq!(
            split_static_location("20-2"),
            ("20-2".to_string(), NO_HUB.to_string())
        );
    }
}
