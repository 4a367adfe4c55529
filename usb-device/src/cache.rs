//! Persistent location cache.
//!
//! Maps device names to their last-known topology. The cache is a single
//! JSON document replaced atomically (write-to-temp, fsync, rename), so
//! readers see either the pre- or post-state, never a torn file. Writers are
//! serialized by the scanner; this layer does not lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How a device's topology was established.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, Default,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Link {
    /// The power-control tool enumerated the device at this port itself.
    Direct,
    /// A sub-hub intervenes; the port was inferred from the topology prefix.
    Indirect,
    /// Reachable via the port enumerator, but no controllable hub governs it.
    NoHub,
    /// Derived from a registry `location=` field.
    Static,
    /// Last-known values from a previous scan; device currently offline.
    #[default]
    Cached,
}

/// One cached topology record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocationRecord {
    /// Serial identifier ("-" for location-identified devices).
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub hub: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub link: Link,
    /// Serial device path last seen for this device (may be empty).
    #[serde(default)]
    pub dev: String,
    /// RFC-3339 UTC timestamp of the last scan that saw the device.
    #[serde(default)]
    pub last_seen: String,
}

impl LocationRecord {
    /// Copy with the link re-tagged `cached`, for reads without live evidence.
    pub fn as_cached(&self) -> LocationRecord {
        LocationRecord {
            link: Link::Cached,
            ..self.clone()
        }
    }
}

/// The on-disk cache plus its path.
#[derive(Debug)]
pub struct LocationCache {
    path: PathBuf,
    entries: BTreeMap<String, LocationRecord>,
}

impl LocationCache {
    /// Load the cache; a missing file is the valid empty state.
    pub fn load(path: &Path) -> Result<LocationCache> {
        let entries = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(LocationCache {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn get(&self, name: &str) -> Option<&LocationRecord> {
        self.entries.get(name)
    }

    pub fn put(&mut self, name: &str, record: LocationRecord) {
        self.entries.insert(name.to_string(), record);
    }

    pub fn delete(&mut self, name: &str) -> Option<LocationRecord> {
        self.entries.remove(name)
    }

    pub fn list(&self) -> impl Iterator<Item = (&String, &LocationRecord)> {
        self.entries.iter()
    }

    /// Name currently claiming `(hub, port)`, if any.
    pub fn by_hub_port(&self, hub: &str, port: &str) -> Option<&String> {
        self.entries
            .iter()
            .find(|(_, r)| r.hub == hub && r.port == port)
            .map(|(name, _)| name)
    }

    /// Persist atomically: temp file in the same directory, fsync, rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(serde_json::to_string_pretty(&self.entries)?.as_bytes())?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
