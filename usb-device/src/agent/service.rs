//! Autostart wiring for the agent (`hub install` / `hub uninstall` /
//! `hub log`).
//!
//! Installs a systemd user unit running `usb-device hub watch`. Logs land
//! in the user journal (the tracing layer switches to journald when systemd
//! provides `JOURNAL_STREAM`).

use std::path::PathBuf;

use tokio::process::Command;

use crate::config::Config;
use crate::error::{Error, Result};

const UNIT_NAME: &str = "usb-device-hub.service";

fn unit_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("systemd")
        .join("user")
        .join(UNIT_NAME)
}

fn unit_contents(config: &Config) -> String {
    format!(
        "[Unit]\n\
         Description=USB device display-hub agent\n\
         \n\
         [Service]\n\
         ExecStart={} hub watch\n\
         Restart=always\n\
         RestartSec=10\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        config.bin_path.display()
    )
}

async fn systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl")
        .arg("--user")
        .args(args)
        .status()
        .await
        .map_err(|e| {
            Error::Environment(format!(
                "cannot run systemctl: {e} (autostart requires a systemd user session)"
            ))
        })?;
    if !status.success() {
        return Err(Error::Environment(format!(
            "systemctl --user {} failed with {status}",
            args.join(" ")
        )));
    }
    Ok(())
}

/// Write the unit, reload, and enable it now.
pub async fn install(config: &Config) -> Result<()> {
    let path = unit_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, unit_contents(config))?;

    systemctl(&["daemon-reload"]).await?;
    systemctl(&["enable", "--now", UNIT_NAME]).await?;

    println!("[ok] Installed and started {UNIT_NAME}");
    println!("     Unit: {}", path.display());
    println!("     Logs: usb-device hub log");
    Ok(())
}

/// Stop the unit and remove its file.
pub async fn uninstall() -> Result<()> {
    let path = unit_path();
    if !path.exists() {
        println!("Not installed ({} does not exist).", path.display());
        return Ok(());
    }

    // Best-effort stop; the unit may already be dead.
    let _ = systemctl(&["disable", "--now", UNIT_NAME]).await;
    std::fs::remove_file(&path)?;
    let _ = systemctl(&["daemon-reload"]).await;

    println!("[ok] Uninstalled {UNIT_NAME}");
    Ok(())
}

/// Follow the agent's journal.
pub async fn log() -> Result<()> {
    let status = Command::new("journalctl")
        .args(["--user", "-u", UNIT_NAME, "-n", "100", "-f"])
        .status()
        .await
        .map_err(|e| {
            Error::Environment(format!(
                "cannot run journalctl: {e} (agent logs require the systemd journal)"
            ))
        })?;
    if !status.success() {
        return Err(Error::Environment(format!(
            "journalctl exited with {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_contents_reference_binary() {
        let config = Config {
            conf_path: PathBuf::new(),
            db_path: PathBuf::new(),
            lock_dir: PathBuf::new(),
            python: String::new(),
            install_dir: PathBuf::new(),
            bin_path: PathBuf::from("/usr/local/bin/usb-device"),
        };
        let unit = unit_contents(&config);
        assert!(unit.contains("ExecStart=/usr/local/bin/usb-device hub watch"));
        assert!(unit.contains("Restart=always"));
    }
}
