//! Serial-port enumerator.
//!
//! Enumeration is delegated to pyserial, the same source of truth the rest of
//! the toolchain uses, so serial numbers and OS topology strings agree with
//! what flashing tools see. The interpreter comes from `USB_DEVICE_PYTHON`
//! (default `python3`); the inline script prints one pipe-separated record
//! per port:
//!
//! ```text
//! identifier|device|location[|vid:pid|product]
//! ```
//!
//! The parser accepts three or more fields so older wrappers that only emit
//! the first three keep working.

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

const ENUM_SCRIPT: &str = "\
import serial.tools.list_ports as lp\n\
for p in sorted(lp.comports(), key=lambda p: p.device):\n\
    vid = '%04x:%04x' % (p.vid, p.pid) if p.vid is not None else ''\n\
    print('|'.join([p.serial_number or '', p.device or '', p.location or '', vid, p.product or p.description or '']))\n";

/// One serial-capable USB device as the OS sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    /// Serial identifier (chip MAC or USB serial string), if exposed.
    pub serial: Option<String>,
    /// Device node, e.g. `/dev/ttyACM0` or `/dev/cu.usbmodem101`.
    pub device: String,
    /// Full OS topology string, e.g. `20-2.2.1`.
    pub location: Option<String>,
    pub vid_pid: Option<(u16, u16)>,
    pub product: Option<String>,
}

/// A point-in-time enumeration of all serial ports.
#[derive(Debug, Default)]
pub struct PortSnapshot {
    pub ports: Vec<PortRecord>,
}

impl PortSnapshot {
    /// Parse enumerator output. Duplicate identifiers (dual-CDC devices)
    /// keep their first occurrence; the rest are reported and dropped.
    pub fn parse(text: &str) -> PortSnapshot {
        let mut ports: Vec<PortRecord> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('|').collect();
            if fields.len() < 3 {
                warn!(line, "Malformed port-enumerator record");
                continue;
            }
            let record = PortRecord {
                serial: non_empty(fields[0]),
                device: fields[1].to_string(),
                location: non_empty(fields[2]),
                vid_pid: fields.get(3).and_then(|&f| parse_vid_pid(f)),
                product: fields.get(4).and_then(|&f| non_empty(f)),
            };
            if record.device.is_empty() {
                continue;
            }
            if let Some(id) = &record.serial {
                if let Some(first) = ports
                    .iter()
                    .find(|p| p.serial.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(id)))
                {
                    warn!(
                        identifier = %id,
                        kept = %first.device,
                        dropped = %record.device,
                        "Identifier appears on multiple ports, keeping first"
                    );
                    continue;
                }
            }
            ports.push(record);
        }
        PortSnapshot { ports }
    }

    /// First port whose identifier matches (case-insensitive).
    pub fn by_serial(&self, identifier: &str) -> Option<&PortRecord> {
        self.ports.iter().find(|p| {
            p.serial
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(identifier))
        })
    }
}

/// Run the enumerator and parse its output.
pub async fn enumerate(python: &str) -> Result<PortSnapshot> {
    let output = Command::new(python)
        .arg("-c")
        .arg(ENUM_SCRIPT)
        .output()
        .await
        .map_err(|e| {
            Error::Environment(format!(
                "cannot run port enumerator '{python}': {e} \
                 (set USB_DEVICE_PYTHON to a python with pyserial installed)"
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Environment(format!(
            "port enumerator failed: {} \
             (is pyserial installed for '{python}'?)",
            stderr.trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let snapshot = PortSnapshot::parse(&text);
    trace!(ports = snapshot.ports.len(), "Serial-port enumeration complete");
    Ok(snapshot)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_vid_pid(s: &str) -> Option<(u16, u16)> {
    let (vid, pid) = s.split_once(':')?;
    Some((
        u16::from_str_radix(vid, 16).ok()?,
        u16::from_str_radix(pid, 16).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_field_records() {
        let snap = PortSnapshot::parse("AA:AA:AA:AA:AA:AA|/dev/cu.usbmodem101|20-2.1\n");
        assert_eq!(snap.ports.len(), 1);
        let p = &snap.ports[0];
        assert_eq!(p.serial.as_deref(), Some("AA:AA:AA:AA:AA:AA"));
        assert_eq!(p.device, "/dev/cu.usbmodem101");
        assert_eq!(p.location.as_deref(), Some("20-2.1"));
        assert!(p.vid_pid.is_none());
    }

    #[test]
    fn parses_extended_records() {
        let snap = PortSnapshot::parse(
            "B8:F8:62:D2:2A:FC|/dev/ttyACM0|20-2.2.1|303a:1001|InsightHUB Controller\n",
        );
        let p = &snap.ports[0];
        assert_eq!(p.vid_pid, Some((0x303a, 0x1001)));
        assert_eq!(p.product.as_deref(), Some("InsightHUB Controller"));
    }

    #[test]
    fn duplicate_identifier_keeps_first() {
        let snap = PortSnapshot::parse(
            "AA:AA:AA:AA:AA:AA|/dev/ttyACM0|20-2.1\n\
             AA:AA:AA:AA:AA:AA|/dev/ttyACM1|20-2.1\n",
        );
        assert_eq!(snap.ports.len(), 1);
        assert_eq!(snap.ports[0].device, "/dev/ttyACM0");
    }

    #[test]
    fn by_serial_is_case_insensitive() {
        let snap = PortSnapshot::parse("b8:f8:62:d2:2a:fc|/dev/ttyACM0|20-2.1\n");
        assert!(snap.by_serial("B8:F8:62:D2:2A:FC").is_some());
    }

    #[test]
    fn ports_without_identifier_are_kept() {
        let snap = PortSnapshot::parse("|/dev/ttyUSB0|\n");
        assert_eq!(snap.ports.len(), 1);
        assert!(snap.ports[0].serial.is_none());
        assert!(snap.ports[0].location.is_none());
    }

    #[test]
    fn malformed_lines_skipped() {
        let snap = PortSnapshot::parse("garbage\nAA|/dev/ttyACM0|20-1\n");
        assert_eq!(snap.ports.len(), 1);
    }
}
