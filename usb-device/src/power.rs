//! Power engine: port power switching with hub-cycle escalation.
//!
//! `reset` cycles the device's port and waits for the identifier to
//! re-enumerate. When that fails, it escalates to cycling the whole hub,
//! which takes down every device sharing it, so the caller must confirm
//! (or pass `force`). Locks are advisory: a foreign live holder produces a
//! warning, never a refusal.

use std::time::Duration;

use crate::cache::LocationCache;
use crate::error::{Error, Result};
use crate::locks::LockManager;
use crate::ports;
use crate::resolver::ResolvedDevice;
use crate::scanner::NO_HUB;
use crate::tracing::prelude::*;
use crate::uhub::{self, PowerAction};

/// How long a cycled device gets to re-enumerate.
const REENUMERATION_WAIT: Duration = Duration::from_secs(10);
const REENUMERATION_POLL: Duration = Duration::from_millis(500);

/// How a `reset` concluded.
#[derive(Debug, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Port cycle was enough; the device re-enumerated.
    PortCycled,
    /// Escalated to a hub cycle and the device re-enumerated.
    HubCycled,
    /// Power was cycled but the device never re-enumerated. Reported, not
    /// fatal: some devices come back slowly or enumerate elsewhere.
    NotReenumerated,
    /// The device has no serial identity, so there is nothing to wait for.
    NoVerification,
}

/// Emit the advisory-lock warning for a mutating operation.
fn warn_if_locked(locks: &LockManager, name: &str) {
    if let Some(holder) = locks.holder(name) {
        if holder.pid != std::process::id() as i32 {
            warn!(
                device = name,
                owner = %holder.owner,
                purpose = %holder.purpose,
                "Device is checked out by another holder, proceeding anyway"
            );
        }
    }
}

fn hub_port(resolved: &ResolvedDevice) -> Result<(String, String)> {
    let hub = resolved.hub();
    let port = resolved.port();
    if hub == NO_HUB || port == NO_HUB {
        return Err(Error::Resolution(format!(
            "'{}' has no known power-controllable hub/port (run 'usb-device scan' first, \
             or the device is not behind a switchable hub)",
            resolved.device.name
        )));
    }
    Ok((hub.to_string(), port.to_string()))
}

/// Cut power to the device's port.
pub async fn off(resolved: &ResolvedDevice, locks: &LockManager) -> Result<()> {
    warn_if_locked(locks, &resolved.device.name);
    let (hub, port) = hub_port(resolved)?;
    uhub::power(&hub, Some(&port), PowerAction::Off).await
}

/// Restore power to the device's port.
pub async fn on(resolved: &ResolvedDevice, locks: &LockManager) -> Result<()> {
    warn_if_locked(locks, &resolved.device.name);
    let (hub, port) = hub_port(resolved)?;
    uhub::power(&hub, Some(&port), PowerAction::On).await
}

/// Poll the port enumerator until `identifier` reappears or the wait
/// elapses. Interruptible by Ctrl-C; enumeration hiccups mid-cycle count
/// as "not seen yet".
async fn wait_for_reappearance(identifier: &str, python: &str) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + REENUMERATION_WAIT;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                return Err(Error::Transient("reset interrupted".to_string()));
            }
            _ = tokio::time::sleep(REENUMERATION_POLL) => {}
        }
        if let Ok(snapshot) = ports::enumerate(python).await {
            if snapshot.by_serial(identifier).is_some() {
                return Ok(true);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
    }
}

/// Names of other devices the cache places on the same hub.
pub fn hub_cohabitants(cache: &LocationCache, hub: &str, except: &str) -> Vec<String> {
    cache
        .list()
        .filter(|(name, r)| r.hub == hub && r.hub != NO_HUB && name.as_str() != except)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Cycle the device's port, escalating to a hub cycle if it does not come
/// back. `confirm` is consulted (with the list of cohabitant devices) before
/// the hub-wide cycle unless `force` is set.
pub async fn reset(
    resolved: &ResolvedDevice,
    cache: &LocationCache,
    locks: &LockManager,
    python: &str,
    force: bool,
    confirm: impl FnOnce(&[String]) -> bool,
) -> Result<ResetOutcome> {
    warn_if_locked(locks, &resolved.device.name);
    let (hub, port) = hub_port(resolved)?;

    info!(device = %resolved.device.name, hub, port, "Cycling port power");
    uhub::power(&hub, Some(&port), PowerAction::Cycle).await?;

    let Some(identifier) = resolved.device.serial() else {
        // Location-identified devices expose no serial identity to wait on.
        return Ok(ResetOutcome::NoVerification);
    };

    if wait_for_reappearance(identifier, python).await? {
        return Ok(ResetOutcome::PortCycled);
    }

    // Escalation takes down everything on the hub.
    if !force {
        let others = hub_cohabitants(cache, &hub, &resolved.device.name);
        if !confirm(&others) {
            return Err(Error::Transient(format!(
                "'{}' did not re-enumerate and hub cycle was declined",
                resolved.device.name
            )));
        }
    }

    info!(device = %resolved.device.name, hub, "Escalating to hub-wide power cycle");
    uhub::power(&hub, None, PowerAction::Cycle).await?;

    if wait_for_reappearance(identifier, python).await? {
        Ok(ResetOutcome::HubCycled)
    } else {
        warn!(
            device = %resolved.device.name,
            "Device did not re-enumerate after hub cycle"
        );
        Ok(ResetOutcome::NotReenumerated)
    }
}
