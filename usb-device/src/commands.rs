//! CLI command implementations.
//!
//! Commands never panic across the CLI boundary: every failure becomes a
//! stderr diagnostic and exit code 1 (handled in `main`). Machine-readable
//! output (`port`, `version`) goes to stdout bare; human-readable listings
//! use stdout with status markers.

use std::io::Write as _;
use std::time::Duration;

use colored::Colorize;

use crate::agent::{service, HubAgent};
use crate::cache::{Link, LocationCache};
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::locks::{CheckoutOptions, LockManager};
use crate::monitor::{self, MonitorOptions};
use crate::plugin::Dispatcher;
use crate::power::{self, ResetOutcome};
use crate::registry::Registry;
use crate::resolver::{self, ResolvedDevice};
use crate::scanner::{self, ScanStatus, NO_HUB};

fn load_registry(config: &Config) -> Result<Registry> {
    Registry::load(&config.conf_path).map_err(|e| {
        Error::Config(format!(
            "{e}\n  (registry expected at {}; set USB_DEVICE_CONF to override)",
            config.conf_path.display()
        ))
    })
}

async fn resolve(config: &Config, query: &str, live: bool) -> Result<ResolvedDevice> {
    let registry = load_registry(config)?;
    let cache = LocationCache::load(&config.db_path)?;
    resolver::resolve(query, &registry, &cache, live, &config.python).await
}

/// `list`: registry plus current status per device.
pub async fn list(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    let cache = LocationCache::load(&config.db_path)?;
    let locks = LockManager::new(&config.lock_dir);

    for device in &registry.devices {
        let id = device.serial().or(device.location()).unwrap_or(NO_HUB);
        let mut line = format!("{:<30} {:<8} {}", device.name, device.kind, id);
        if let Some(holder) = locks.holder(&device.name) {
            line.push_str(&format!(" {}", format!("[LOCKED by {}]", holder.owner).red()));
        }
        println!("{line}");

        if let Some(location) = device.location() {
            let (hub, port) = scanner::split_static_location(location);
            println!("    hub={hub} port={port} link={}", Link::Static);
        } else if let Some(rec) = cache.get(&device.name) {
            let dev = if rec.dev.is_empty() { NO_HUB } else { &rec.dev };
            println!(
                "    hub={} port={} link={} dev={} last_seen={}",
                rec.hub, rec.port, rec.link, dev, rec.last_seen
            );
        } else {
            println!("    (not yet scanned)");
        }
    }
    Ok(())
}

/// `scan`: one full pass, printed per device.
pub async fn scan(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    let outcome = scanner::run(config, &registry).await?;

    for result in &outcome.results {
        match &result.status {
            ScanStatus::Found(rec) if rec.link == Link::NoHub => {
                println!(
                    "{} {} dev={} (no power-switchable hub)",
                    "[found]".green(),
                    result.name,
                    if rec.dev.is_empty() { NO_HUB } else { &rec.dev },
                );
            }
            ScanStatus::Found(rec) => {
                println!(
                    "{} {} hub={} port={} link={}",
                    "[found]".green(),
                    result.name,
                    rec.hub,
                    rec.port,
                    rec.link
                );
            }
            ScanStatus::Static { hub, port } => {
                println!("[static] {} hub={hub} port={port}", result.name);
            }
            ScanStatus::Offline(prev) => {
                let detail = prev
                    .as_ref()
                    .filter(|r| !r.last_seen.is_empty())
                    .map(|r| format!(" (offline, last seen {})", r.last_seen))
                    .unwrap_or_else(|| " (offline)".to_string());
                println!("[     ] {}{detail}", result.name);
            }
        }
    }

    for name in &outcome.evicted {
        println!("[evict] {name} (port reassigned)");
    }

    println!("Scan complete: {} device(s) found", outcome.found_count());
    Ok(())
}

/// `check`: verify external dependencies; exit 0 iff everything passes.
pub async fn check(config: &Config) -> Result<()> {
    let mut failures = 0usize;
    let mut report = |name: &str, ok: bool, detail: &str| {
        if ok {
            println!("{} {name}: {detail}", "[ok]".green());
        } else {
            failures += 1;
            println!("{} {name}: {detail}", "[FAIL]".red());
        }
    };

    match load_registry(config) {
        Ok(reg) => report(
            "devices.conf",
            true,
            &format!("{} device(s) registered", reg.devices.len()),
        ),
        Err(e) => report("devices.conf", false, &e.to_string()),
    }

    let uhubctl_ok = tokio::process::Command::new("uhubctl")
        .arg("-v")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    report(
        "uhubctl",
        uhubctl_ok,
        if uhubctl_ok {
            "hub power control available"
        } else {
            "not found; power commands unavailable (serial-only mode)"
        },
    );

    match crate::ports::enumerate(&config.python).await {
        Ok(snap) => report(
            "port enumerator",
            true,
            &format!("{} serial port(s) visible", snap.ports.len()),
        ),
        Err(e) => report("port enumerator", false, &e.to_string()),
    }

    for item in Dispatcher::new(config).check_all().await {
        report(&item.name, item.ok, &item.detail);
    }

    if failures > 0 {
        Err(Error::Environment(format!(
            "{failures} dependency check(s) failed"
        )))
    } else {
        Ok(())
    }
}

/// `find NAME`: resolved topology, one field per line.
pub async fn find(config: &Config, query: &str) -> Result<()> {
    let resolved = resolve(config, query, false).await?;
    let d = &resolved.device;

    println!("name: {}", d.name);
    println!("hub: {}", resolved.hub());
    println!("port: {}", resolved.port());
    println!(
        "link: {}",
        resolved
            .topology
            .as_ref()
            .map(|t| t.link.to_string())
            .unwrap_or_else(|| NO_HUB.to_string())
    );
    println!("type: {}", d.kind);
    println!("id: {}", d.serial().unwrap_or(NO_HUB));
    println!("dev: {}", resolved.dev().unwrap_or(NO_HUB));
    Ok(())
}

/// `type NAME`: just the type tag.
pub async fn type_tag(config: &Config, query: &str) -> Result<()> {
    let resolved = resolve(config, query, false).await?;
    println!("{}", resolved.device.kind);
    Ok(())
}

/// `port NAME`: current device path on stdout, nothing else.
pub async fn port(config: &Config, query: &str) -> Result<()> {
    let resolved = resolve(config, query, true).await?;
    if resolved.device.serial().is_none() {
        return Err(Error::Resolution(format!(
            "'{}' has no serial number (location-identified device)",
            resolved.device.name
        )));
    }
    match resolved.dev() {
        Some(dev) => {
            println!("{dev}");
            Ok(())
        }
        None => Err(Error::Resolution(format!(
            "'{}' has no active serial port (is it connected?)",
            resolved.device.name
        ))),
    }
}

/// `reset NAME [-f]`: port cycle with hub-cycle escalation.
pub async fn reset(config: &Config, query: &str, force: bool) -> Result<()> {
    let resolved = resolve(config, query, false).await?;
    let cache = LocationCache::load(&config.db_path)?;
    let locks = LockManager::new(&config.lock_dir);
    let name = resolved.device.name.clone();

    println!("Resetting {name} (hub={} port={})...", resolved.hub(), resolved.port());

    let confirm = |others: &[String]| {
        if others.is_empty() {
            eprintln!("'{name}' did not re-enumerate after the port cycle.");
        } else {
            eprintln!(
                "'{name}' did not re-enumerate. Cycling the whole hub will also power-cycle: {}",
                others.join(", ")
            );
        }
        eprint!("Cycle the whole hub? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes" | "YES")
    };

    match power::reset(&resolved, &cache, &locks, &config.python, force, confirm).await? {
        ResetOutcome::PortCycled => println!("{} {name} re-enumerated", "[ok]".green()),
        ResetOutcome::HubCycled => {
            println!("{} {name} re-enumerated after hub cycle", "[ok]".green())
        }
        ResetOutcome::NotReenumerated => println!(
            "{} {name} did not re-enumerate after hub cycle",
            "[warn]".yellow()
        ),
        ResetOutcome::NoVerification => {
            println!("{} power cycled (no serial identity to verify)", "[ok]".green())
        }
    }
    Ok(())
}

/// `on NAME` / `off NAME`.
pub async fn power_switch(config: &Config, query: &str, on: bool) -> Result<()> {
    let resolved = resolve(config, query, false).await?;
    let locks = LockManager::new(&config.lock_dir);
    if on {
        power::on(&resolved, &locks).await?;
        println!("{} {} powered on", "[ok]".green(), resolved.device.name);
    } else {
        power::off(&resolved, &locks).await?;
        println!("{} {} powered off", "[ok]".green(), resolved.device.name);
    }
    Ok(())
}

/// `checkout NAME`.
pub async fn checkout(
    config: &Config,
    query: &str,
    opts: CheckoutOptions,
) -> Result<()> {
    let registry = load_registry(config)?;
    let device = resolver::select(&registry, query)?;
    let locks = LockManager::new(&config.lock_dir);

    let outcome = locks.checkout(&device.name, &opts).await?;
    if let Some(old) = outcome.reclaimed {
        println!(
            "Reclaiming stale lock (was held by {}, pid {})",
            old.owner, old.pid
        );
    }
    println!("Checked out: {}", device.name);
    Ok(())
}

/// `checkin NAME [-f]`.
pub async fn checkin(config: &Config, query: &str, force: bool) -> Result<()> {
    let registry = load_registry(config)?;
    let device = resolver::select(&registry, query)?;
    let locks = LockManager::new(&config.lock_dir);

    if let Err(e) = locks.checkin(&device.name, force) {
        if matches!(e, Error::LockConflict { .. }) {
            eprintln!("hint: use -f to force release");
        }
        return Err(e);
    }
    println!("Checked in: {}", device.name);
    Ok(())
}

/// `locks`: table of all locks, stale ones flagged.
pub async fn locks(config: &Config) -> Result<()> {
    let manager = LockManager::new(&config.lock_dir);
    let entries = manager.list()?;
    if entries.is_empty() {
        println!("No locks.");
        return Ok(());
    }

    println!(
        "{:<26} {:<20} {:>8} {:>6}  {}",
        "DEVICE", "OWNER", "PID", "TTL", "PURPOSE"
    );
    for entry in entries {
        let device = if entry.stale {
            format!("{} {}", entry.slug, "(stale)".yellow())
        } else {
            entry.slug.clone()
        };
        let purpose = if entry.info.purpose.is_empty() {
            NO_HUB
        } else {
            &entry.info.purpose
        };
        println!(
            "{:<26} {:<20} {:>8} {:>6}  {}",
            device, entry.info.owner, entry.info.pid, entry.info.ttl, purpose
        );
    }
    Ok(())
}

/// `version`: `usb-device X.Y.Z` on stdout.
pub fn version() {
    println!("usb-device {}", config::version());
}

/// `monitor NAME` (also reachable as a chained device command).
pub async fn monitor_cmd(config: &Config, query: &str, opts: MonitorOptions) -> Result<()> {
    // Accept a raw device path to bypass resolution, mirroring `port`.
    let path = if query.starts_with("/dev/") {
        query.to_string()
    } else {
        let resolved = resolve(config, query, true).await?;
        resolved
            .dev()
            .map(|d| d.to_string())
            .ok_or_else(|| {
                Error::Resolution(format!(
                    "'{}' has no active serial port (is it connected?)",
                    resolved.device.name
                ))
            })?
    };
    monitor::run(&path, opts).await
}

/// Device-first chain: `usb-device NAME cmd [cmd…]`.
///
/// Built-in actions run first; anything else goes to the type plugin
/// dispatcher. A bare `-f` anywhere in the chain applies force to the
/// commands after it.
pub async fn device_chain(config: &Config, name: &str, actions: &[String]) -> Result<()> {
    if actions.is_empty() {
        return Err(Error::Resolution(format!(
            "no command given for device '{name}' (try: usb-device '{name}' reset)"
        )));
    }

    let mut force = false;
    for action in actions {
        match action.as_str() {
            "-f" | "--force" => force = true,
            "find" => find(config, name).await?,
            "type" => type_tag(config, name).await?,
            "port" => port(config, name).await?,
            "reset" => reset(config, name, force).await?,
            "on" => power_switch(config, name, true).await?,
            "off" => power_switch(config, name, false).await?,
            "checkout" => checkout(config, name, CheckoutOptions::default()).await?,
            "checkin" => checkin(config, name, force).await?,
            "monitor" => monitor_cmd(config, name, MonitorOptions::default()).await?,
            other => {
                let resolved = resolve(config, name, true).await?;
                let dispatcher = Dispatcher::new(config);
                dispatcher.run(&resolved, other).await?;
                println!("{} {} {other}", "[ok]".green(), resolved.device.name);
            }
        }
    }
    Ok(())
}

/// `hub` subcommands.
pub async fn hub_status(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    HubAgent::new(config, &registry).status().await
}

pub async fn hub_sync(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    HubAgent::new(config, &registry).sync().await
}

pub async fn hub_watch(config: &Config) -> Result<()> {
    let registry = load_registry(config)?;
    HubAgent::new(config, &registry).watch().await
}

pub async fn hub_install(config: &Config) -> Result<()> {
    service::install(config).await
}

pub async fn hub_uninstall() -> Result<()> {
    service::uninstall().await
}

pub async fn hub_log() -> Result<()> {
    service::log().await
}

/// Options shared by `checkout` flags.
pub fn checkout_options(
    owner: Option<String>,
    purpose: Option<String>,
    ttl: Option<u64>,
    wait: bool,
    timeout: Option<u64>,
) -> CheckoutOptions {
    CheckoutOptions {
        owner,
        purpose,
        ttl,
        wait,
        wait_timeout: timeout.map(Duration::from_secs),
    }
}
