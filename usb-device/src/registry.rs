//! Device registry parser.
//!
//! The registry (`devices.conf`) mixes two dialects freely:
//!
//! - flat lines `NAME=VALUE` registering a generic device whose serial
//!   identifier is `VALUE`;
//! - INI-style sections `[NAME]` followed by `key=value` lines.
//!
//! Sections named `hub:<suffix>` are not devices; they are opaque
//! configuration records addressed by specific consumers (the display-hub
//! agent reads `hub:insight`).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

/// Display hardware renders at most this many characters per line.
pub const MAX_DISPLAY_LEN: usize = 14;

/// Truncate a display string to [`MAX_DISPLAY_LEN`] characters.
pub fn truncate_display(s: &str) -> String {
    s.chars().take(MAX_DISPLAY_LEN).collect()
}

/// How a device is identified in the physical world.
///
/// `mac` and `serial` registry keys are aliases; both denote the serial
/// identifier visible to the port enumerator. `location` pins a device to a
/// fixed topology path instead (power strips and other serial-less hardware).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Serial(String),
    Location(String),
}

/// One registered device.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub identity: Identity,
    /// Type tag, `generic` unless registered otherwise.
    pub kind: String,
    /// Chip string handed to type plugins.
    pub chip: Option<String>,
    /// Display-name override for the hub.
    pub hub_name: Option<String>,
}

impl Device {
    /// Serial identifier, if this device has one.
    pub fn serial(&self) -> Option<&str> {
        match &self.identity {
            Identity::Serial(s) => Some(s),
            Identity::Location(_) => None,
        }
    }

    /// Static topology location, if this device is location-identified.
    pub fn location(&self) -> Option<&str> {
        match &self.identity {
            Identity::Serial(_) => None,
            Identity::Location(l) => Some(l),
        }
    }

    /// Name shown on the display hub, truncated to the panel width.
    pub fn display_name(&self) -> String {
        truncate_display(self.hub_name.as_deref().unwrap_or(&self.name))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Parsed registry: devices in declaration order plus hub config sections.
#[derive(Debug, Default)]
pub struct Registry {
    pub devices: Vec<Device>,
    hubs: HashMap<String, HashMap<String, String>>,
}

const DEVICE_KEYS: &[&str] = &["mac", "serial", "location", "type", "chip", "hub_name"];

impl Registry {
    /// Load and parse the registry file.
    pub fn load(path: &Path) -> Result<Registry> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read registry {}: {}", path.display(), e))
        })?;
        Registry::parse(&text, path)
    }

    /// Parse registry text. All errors are collected and reported together.
    pub fn parse(text: &str, path: &Path) -> Result<Registry> {
        let mut reg = Registry::default();
        let mut errors: Vec<String> = Vec::new();

        // Section accumulator: (name, keys, header line number)
        let mut section: Option<(String, HashMap<String, String>, usize)> = None;

        let flush = |sec: Option<(String, HashMap<String, String>, usize)>,
                         reg: &mut Registry,
                         errors: &mut Vec<String>| {
            let Some((name, keys, line)) = sec else {
                return;
            };
            if let Some(suffix) = name.strip_prefix("hub:") {
                reg.hubs.insert(suffix.to_string(), keys);
                return;
            }
            match device_from_section(&name, &keys) {
                Ok(dev) => {
                    if reg.devices.iter().any(|d| d.name == dev.name) {
                        errors.push(format!(
                            "{}:{}: duplicate device name '{}'",
                            path.display(),
                            line,
                            dev.name
                        ));
                    } else {
                        reg.devices.push(dev);
                    }
                }
                Err(msg) => errors.push(format!("{}:{}: {}", path.display(), line, msg)),
            }
        };

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                flush(section.take(), &mut reg, &mut errors);
                section = Some((header.trim().to_string(), HashMap::new(), lineno));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                errors.push(format!(
                    "{}:{}: expected 'key=value', got '{}'",
                    path.display(),
                    lineno,
                    line
                ));
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match &mut section {
                Some((name, keys, _)) => {
                    if !name.starts_with("hub:") && !DEVICE_KEYS.contains(&key) {
                        errors.push(format!(
                            "{}:{}: unknown key '{}' in section [{}]",
                            path.display(),
                            lineno,
                            key,
                            name
                        ));
                        continue;
                    }
                    keys.insert(key.to_string(), value.to_string());
                }
                None => {
                    // Flat dialect: NAME=VALUE registers a generic device.
                    if reg.devices.iter().any(|d| d.name == key) {
                        errors.push(format!(
                            "{}:{}: duplicate device name '{}'",
                            path.display(),
                            lineno,
                            key
                        ));
                    } else {
                        reg.devices.push(Device {
                            name: key.to_string(),
                            identity: Identity::Serial(value.to_string()),
                            kind: "generic".to_string(),
                            chip: None,
                            hub_name: None,
                        });
                    }
                }
            }
        }
        flush(section.take(), &mut reg, &mut errors);

        if errors.is_empty() {
            Ok(reg)
        } else {
            Err(Error::Config(errors.join("\n")))
        }
    }

    /// Look up a `hub:<suffix>` configuration section.
    pub fn hub_config(&self, suffix: &str) -> Option<&HashMap<String, String>> {
        self.hubs.get(suffix)
    }

    /// Device by exact (case-sensitive) name.
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }
}

fn device_from_section(
    name: &str,
    keys: &HashMap<String, String>,
) -> std::result::Result<Device, String> {
    let serial = keys.get("mac").or_else(|| keys.get("serial"));
    let location = keys.get("location");

    let identity = match (serial, location) {
        (Some(_), Some(_)) => {
            return Err(format!(
                "section [{name}] declares both a serial identifier and a location"
            ));
        }
        (Some(s), None) => Identity::Serial(s.clone()),
        (None, Some(l)) => Identity::Location(l.clone()),
        (None, None) => {
            return Err(format!(
                "section [{name}] has no identifier (expected mac=, serial=, or location=)"
            ));
        }
    };

    Ok(Device {
        name: name.to_string(),
        identity,
        kind: keys
            .get("type")
            .cloned()
            .unwrap_or_else(|| "generic".to_string()),
        chip: keys.get("chip").cloned(),
        hub_name: keys.get("hub_name").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(text: &str) -> Result<Registry> {
        Registry::parse(text, &PathBuf::from("devices.conf"))
    }

    #[test]
    fn flat_and_section_dialects_are_equivalent() {
        let flat = parse("Device A=AA:BB:CC:DD:EE:FF\n").unwrap();
        let sect = parse("[Device A]\nmac=AA:BB:CC:DD:EE:FF\n").unwrap();

        let (a, b) = (&flat.devices[0], &sect.devices[0]);
        assert_eq!(a.name, b.name);
        assert_eq!(a.identity, b.identity);
        assert_eq!(a.kind, "generic");
        assert_eq!(b.kind, "generic");
    }

    #[test]
    fn section_keys_parsed() {
        let reg = parse(
            "[MPCB 1.9 Development]\n\
             mac=B8:F8:62:D2:2A:FC\n\
             type=esp32\n\
             chip=esp32s3\n\
             hub_name=MPCB 1.9\n",
        )
        .unwrap();
        let d = &reg.devices[0];
        assert_eq!(d.name, "MPCB 1.9 Development");
        assert_eq!(d.serial(), Some("B8:F8:62:D2:2A:FC"));
        assert_eq!(d.kind, "esp32");
        assert_eq!(d.chip.as_deref(), Some("esp32s3"));
        assert_eq!(d.display_name(), "MPCB 1.9");
    }

    #[test]
    fn hub_sections_are_not_devices() {
        let reg = parse(
            "[hub:insight]\n\
             port=/dev/cu.usbmodemXXXX\n\
             location=20-3.3\n\
             [Board]\n\
             serial=1234\n",
        )
        .unwrap();
        assert_eq!(reg.devices.len(), 1);
        assert_eq!(
            reg.hub_config("insight").unwrap().get("location").unwrap(),
            "20-3.3"
        );
    }

    #[test]
    fn comments_and_blanks_ignored() {
        let reg = parse("# comment\n; another\n\nA=1\n").unwrap();
        assert_eq!(reg.devices.len(), 1);
    }

    #[test]
    fn duplicate_name_rejected_with_line() {
        let err = parse("A=1\n[A]\nserial=2\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate device name 'A'"), "{msg}");
        assert!(msg.contains("devices.conf:2"), "{msg}");
    }

    #[test]
    fn serial_and_location_conflict_rejected() {
        let err = parse("[X]\nmac=1\nlocation=20-2.1\n").unwrap_err();
        assert!(err.to_string().contains("both"), "{err}");
    }

    #[test]
    fn unknown_key_rejected() {
        let err = parse("[X]\nserial=1\nbogus=2\n").unwrap_err();
        assert!(err.to_string().contains("unknown key 'bogus'"), "{err}");
    }

    #[test]
    fn missing_identifier_rejected() {
        let err = parse("[X]\ntype=esp32\n").unwrap_err();
        assert!(err.to_string().contains("no identifier"), "{err}");
    }

    #[test]
    fn errors_are_collected_not_first_only() {
        let err = parse("[X]\nbogus=1\nserial=2\n[Y]\ntype=power\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogus") && msg.contains("no identifier"), "{msg}");
    }

    #[test]
    fn display_name_truncates_to_panel_width() {
        let reg = parse("[A Very Long Device Name Indeed]\nserial=1\n").unwrap();
        assert_eq!(reg.devices[0].display_name().chars().count(), 14);
    }
}
