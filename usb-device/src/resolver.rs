//! Name resolution: fuzzy queries to registered devices with topology.
//!
//! Matching runs in three tiers (exact, substring, regular expression), all
//! case-insensitive; the first tier with any match wins. Topology comes from
//! the registry for static devices, from live enumeration when requested,
//! and from the location cache otherwise.

use regex::RegexBuilder;

use crate::cache::{Link, LocationCache, LocationRecord};
use crate::error::{Error, Result};
use crate::ports;
use crate::registry::{Device, Registry};
use crate::scanner::{self, NO_HUB};
use crate::tracing::prelude::*;
use crate::uhub;

/// Cap on the candidate list shown on a failed lookup.
const NOT_FOUND_LIST_CAP: usize = 20;

/// A device plus whatever topology evidence resolution produced.
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    pub device: Device,
    /// `None` when the device is offline and has never been cached.
    pub topology: Option<LocationRecord>,
}

impl ResolvedDevice {
    pub fn hub(&self) -> &str {
        self.topology.as_ref().map_or(NO_HUB, |t| t.hub.as_str())
    }

    pub fn port(&self) -> &str {
        self.topology.as_ref().map_or(NO_HUB, |t| t.port.as_str())
    }

    /// Current serial device path, if known.
    pub fn dev(&self) -> Option<&str> {
        self.topology
            .as_ref()
            .map(|t| t.dev.as_str())
            .filter(|d| !d.is_empty())
    }
}

/// Match a query against registered names, returning candidates in registry
/// order. Hub-config sections are not devices and can never match.
pub fn match_name<'a>(registry: &'a Registry, query: &str) -> Vec<&'a Device> {
    let q = query.to_lowercase();

    let exact: Vec<&Device> = registry
        .devices
        .iter()
        .filter(|d| d.name.to_lowercase() == q)
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let substring: Vec<&Device> = registry
        .devices
        .iter()
        .filter(|d| d.name.to_lowercase().contains(&q))
        .collect();
    if !substring.is_empty() {
        return substring;
    }

    // Tier 3: the query as a regular expression. An invalid pattern is
    // simply no match, not an error.
    let Ok(re) = RegexBuilder::new(query).case_insensitive(true).build() else {
        return Vec::new();
    };
    registry
        .devices
        .iter()
        .filter(|d| re.is_match(&d.name))
        .collect()
}

/// Pick the winning device for a query, or fail with the registered-name
/// list. Ambiguity picks the first in registry order with a diagnostic.
pub fn select<'a>(registry: &'a Registry, query: &str) -> Result<&'a Device> {
    let matches = match_name(registry, query);
    match matches.len() {
        0 => Err(not_found(registry, query)),
        1 => Ok(matches[0]),
        n => {
            let names: Vec<&str> = matches.iter().map(|d| d.name.as_str()).collect();
            warn!(
                query,
                matches = n,
                candidates = names.join(", "),
                using = %matches[0].name,
                "Ambiguous device name"
            );
            Ok(matches[0])
        }
    }
}

fn not_found(registry: &Registry, query: &str) -> Error {
    let mut msg = format!("no device matches '{query}'");
    if registry.devices.is_empty() {
        msg.push_str("\n  (registry is empty)");
    } else {
        msg.push_str("\nRegistered devices:");
        for d in registry.devices.iter().take(NOT_FOUND_LIST_CAP) {
            msg.push_str(&format!("\n  {}", d.name));
        }
        let extra = registry.devices.len().saturating_sub(NOT_FOUND_LIST_CAP);
        if extra > 0 {
            msg.push_str(&format!("\n  ... and {extra} more"));
        }
    }
    Error::Resolution(msg)
}

/// Resolve a query to a device and its topology.
///
/// With `live`, the enumerators are consulted for fresh evidence (falling
/// back to the cache, tagged `cached`, when the device is offline). Without
/// it, cache hits are tagged `cached` since no live pass vouched for them.
/// Static devices are computed from the registry alone either way.
pub async fn resolve(
    query: &str,
    registry: &Registry,
    cache: &LocationCache,
    live: bool,
    python: &str,
) -> Result<ResolvedDevice> {
    let device = select(registry, query)?.clone();
    let topology = resolve_topology(&device, cache, live, python).await?;
    Ok(ResolvedDevice { device, topology })
}

async fn resolve_topology(
    device: &Device,
    cache: &LocationCache,
    live: bool,
    python: &str,
) -> Result<Option<LocationRecord>> {
    // Static location: registry is the sole authority.
    if let Some(location) = device.location() {
        let (hub, port) = scanner::split_static_location(location);
        return Ok(Some(LocationRecord {
            mac: NO_HUB.to_string(),
            hub,
            port,
            link: Link::Static,
            dev: String::new(),
            last_seen: String::new(),
        }));
    }

    let identifier = device.serial().unwrap_or_default();

    if live {
        let (hubs, port_snapshot) = tokio::join!(uhub::enumerate(), ports::enumerate(python));
        let port_snapshot = port_snapshot?;
        if let Some(loc) = scanner::locate(identifier, &hubs, &port_snapshot) {
            return Ok(Some(LocationRecord {
                mac: identifier.to_string(),
                hub: loc.hub,
                port: loc.port,
                link: loc.link,
                dev: loc.dev,
                last_seen: String::new(),
            }));
        }
        debug!(device = %device.name, "Not seen live, falling back to cache");
    }

    Ok(cache.get(&device.name).map(|r| r.as_cached()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn registry() -> Registry {
        Registry::parse(
            "[MPCB 1.9 Development]\nmac=B8:F8:62:D2:2A:FC\ntype=esp32\n\
             [MPCB 2.0 Development]\nmac=B8:F8:62:D2:2A:FD\ntype=esp32\n\
             [Charger A]\nlocation=20-2.3\ntype=power\n\
             [hub:insight]\nlocation=20-3.3\n",
            &PathBuf::from("devices.conf"),
        )
        .unwrap()
    }

    #[test]
    fn exact_match_beats_substring() {
        let reg = Registry::parse(
            "Dev=AA:AA:AA:AA:AA:AA\nDevelopment=BB:BB:BB:BB:BB:BB\n",
            &PathBuf::from("devices.conf"),
        )
        .unwrap();
        let m = match_name(&reg, "dev");
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].name, "Dev");
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let reg = registry();
        let m = match_name(&reg, "charger");
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].name, "Charger A");
    }

    #[test]
    fn regex_tier_matches() {
        let reg = registry();
        let m = match_name(&reg, r"mpcb [0-9]\.[0-9]");
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn invalid_regex_is_no_match() {
        let reg = registry();
        assert!(match_name(&reg, "mpcb [").is_empty());
    }

    #[test]
    fn ambiguous_query_picks_registry_order() {
        let reg = registry();
        let d = select(&reg, "mpcb").unwrap();
        assert_eq!(d.name, "MPCB 1.9 Development");
    }

    #[test]
    fn hub_sections_never_resolve() {
        let reg = registry();
        assert!(match_name(&reg, "insight").is_empty());
    }

    #[test]
    fn not_found_lists_candidates() {
        let reg = registry();
        let err = select(&reg, "nonexistent-xyz").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no device matches"), "{msg}");
        assert!(msg.contains("MPCB 1.9 Development"), "{msg}");
        assert!(msg.contains("Charger A"), "{msg}");
    }

    #[tokio::test]
    async fn static_topology_from_registry_split() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let cache = LocationCache::load(&dir.path().join("x.json")).unwrap();

        let resolved = resolve("Charger", &reg, &cache, false, "python3")
            .await
            .unwrap();
        let t = resolved.topology.unwrap();
        assert_eq!(t.hub, "20-2");
        assert_eq!(t.port, "3");
        assert_eq!(t.link, Link::Static);
    }

    #[tokio::test]
    async fn cache_hit_without_live_pass_is_tagged_cached() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocationCache::load(&dir.path().join("x.json")).unwrap();
        cache.put(
            "MPCB 1.9 Development",
            LocationRecord {
                mac: "B8:F8:62:D2:2A:FC".into(),
                hub: "20-2".into(),
                port: "1".into(),
                link: Link::Direct,
                dev: "/dev/ttyACM0".into(),
                last_seen: "2026-01-01T00:00:00Z".into(),
            },
        );

        let resolved = resolve("1.9", &reg, &cache, false, "python3").await.unwrap();
        let t = resolved.topology.unwrap();
        assert_eq!(t.link, Link::Cached);
        assert_eq!(t.hub, "20-2");
    }

    #[tokio::test]
    async fn unknown_device_offline_resolves_to_no_topology() {
        let reg = registry();
        let dir = tempfile::tempdir().unwrap();
        let cache = LocationCache::load(&dir.path().join("x.json")).unwrap();

        let resolved = resolve("2.0", &reg, &cache, false, "python3").await.unwrap();
        assert!(resolved.topology.is_none());
        assert_eq!(resolved.hub(), NO_HUB);
    }
}
