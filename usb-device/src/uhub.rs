//! Power-controllable hub enumerator and power operations.
//!
//! Wraps the external `uhubctl` tool. Its output is a human-readable tree,
//! so the parser is deliberately tolerant: variant headers, extra
//! whitespace, and hubs without per-port power switching all pass through.
//!
//! A workstation without switchable hubs (or without the tool installed)
//! must keep working for serial-only tasks, so enumeration failure is
//! silent and yields an empty snapshot.

use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// What the hub tool sees on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortState {
    /// A device whose identifier could be extracted from the descriptor.
    Device(String),
    /// A downstream hub.
    Hub,
    /// Nothing attached.
    Empty,
    /// Something attached, but no identifier is visible.
    Unknown,
}

/// One `(hub, port)` observation.
#[derive(Debug, Clone)]
pub struct HubPort {
    /// Hub topology id, e.g. `20-2` or `2-1.4`.
    pub hub: String,
    /// Port number as a string (ports are compared textually throughout).
    pub port: String,
    pub state: PortState,
    /// Raw descriptor text, for diagnostics.
    pub descriptor: String,
}

/// A point-in-time enumeration of all controllable hubs.
#[derive(Debug, Default)]
pub struct HubSnapshot {
    pub ports: Vec<HubPort>,
}

impl HubSnapshot {
    /// Parse `uhubctl` tree output.
    pub fn parse(text: &str) -> HubSnapshot {
        static HEADER: OnceLock<Regex> = OnceLock::new();
        static PORT: OnceLock<Regex> = OnceLock::new();
        let header = HEADER.get_or_init(|| {
            Regex::new(r"^Current status for hub ([0-9][0-9.\-]*)\s*(?:\[(.*)\])?").unwrap()
        });
        let port_re = PORT
            .get_or_init(|| Regex::new(r"^\s+Port\s+(\d+):\s+([0-9a-fA-F]{4})\s*(.*)$").unwrap());

        let mut ports = Vec::new();
        let mut current_hub: Option<String> = None;

        for line in text.lines() {
            if let Some(cap) = header.captures(line) {
                current_hub = Some(cap[1].trim_end_matches('.').to_string());
                continue;
            }
            let Some(hub) = &current_hub else { continue };
            let Some(cap) = port_re.captures(line) else {
                continue;
            };

            let rest = cap[3].trim();
            let descriptor = rest
                .find('[')
                .and_then(|start| rest.rfind(']').map(|end| &rest[start + 1..end]))
                .unwrap_or("")
                .to_string();

            let state = if descriptor.is_empty() {
                if rest.contains("connect") {
                    PortState::Unknown
                } else {
                    PortState::Empty
                }
            } else if descriptor.to_ascii_lowercase().contains("hub") {
                PortState::Hub
            } else if let Some(id) = extract_identifier(&descriptor) {
                PortState::Device(id)
            } else {
                PortState::Unknown
            };

            ports.push(HubPort {
                hub: hub.clone(),
                port: cap[1].to_string(),
                state,
                descriptor,
            });
        }

        HubSnapshot { ports }
    }

    /// `(hub, port)` where `identifier` is directly enumerated, if anywhere.
    pub fn find_identifier(&self, identifier: &str) -> Option<(&str, &str)> {
        self.ports.iter().find_map(|p| match &p.state {
            PortState::Device(id) if id.eq_ignore_ascii_case(identifier) => {
                Some((p.hub.as_str(), p.port.as_str()))
            }
            _ => None,
        })
    }

    /// Distinct hub ids in observation order.
    pub fn hubs(&self) -> Vec<&str> {
        let mut hubs: Vec<&str> = Vec::new();
        for p in &self.ports {
            if !hubs.contains(&p.hub.as_str()) {
                hubs.push(&p.hub);
            }
        }
        hubs
    }

    /// The hub id (from this snapshot) that `location` sits behind, longest
    /// prefix first so nested controllable hubs resolve to the nearest one.
    pub fn governing_hub(&self, location: &str) -> Option<&str> {
        let mut best: Option<&str> = None;
        for hub in self.hubs() {
            if location.starts_with(&format!("{hub}.")) {
                match best {
                    Some(b) if b.len() >= hub.len() => {}
                    _ => best = Some(hub),
                }
            }
        }
        best
    }
}

/// Extract a device identifier from a port descriptor.
///
/// Prefers a MAC-shaped token; falls back to a trailing serial-looking token
/// (hex or alphanumeric-with-digits, 6+ chars).
fn extract_identifier(descriptor: &str) -> Option<String> {
    static MAC: OnceLock<Regex> = OnceLock::new();
    let mac =
        MAC.get_or_init(|| Regex::new(r"\b([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})\b").unwrap());

    if let Some(cap) = mac.captures(descriptor) {
        return Some(cap[1].to_string());
    }

    let last = descriptor.split_whitespace().last()?;
    let serial_like = last.len() >= 6
        && last.chars().all(|c| c.is_ascii_alphanumeric())
        && last.chars().any(|c| c.is_ascii_digit());
    serial_like.then(|| last.to_string())
}

/// Run `uhubctl` and parse its tree. Missing tool or empty output yields an
/// empty snapshot; serial-only workstations have no switchable hubs.
pub async fn enumerate() -> HubSnapshot {
    let output = match Command::new("uhubctl").output().await {
        Ok(o) => o,
        Err(e) => {
            debug!(error = %e, "uhubctl not available, no controllable hubs");
            return HubSnapshot::default();
        }
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let snapshot = HubSnapshot::parse(&text);
    trace!(ports = snapshot.ports.len(), "Hub enumeration complete");
    snapshot
}

/// Power action passed to the hub tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Cycle,
}

/// Switch power on one port, or on every port of the hub when `port` is None.
pub async fn power(hub: &str, port: Option<&str>, action: PowerAction) -> Result<()> {
    let mut cmd = Command::new("uhubctl");
    cmd.arg("-l").arg(hub);
    if let Some(p) = port {
        cmd.arg("-p").arg(p);
    }
    cmd.arg("-a").arg(action.to_string());

    let output = cmd.output().await.map_err(|e| {
        Error::Environment(format!(
            "cannot run uhubctl: {e} (install uhubctl to control hub power)"
        ))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Environment(format!(
            "uhubctl -l {hub}{} -a {action} failed: {}",
            port.map(|p| format!(" -p {p}")).unwrap_or_default(),
            stderr.trim()
        )));
    }
    debug!(hub, ?port, %action, "Hub power action complete");
    Ok(())
}
