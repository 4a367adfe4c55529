//! Filesystem locations and environment overrides.
//!
//! Every path the tool touches can be redirected through an environment
//! variable, which is how the test suite points commands at fixtures.

use std::env;
use std::path::PathBuf;

/// Resolved locations for the registry, cache, locks, and plugin dirs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device registry (`devices.conf`).
    pub conf_path: PathBuf,
    /// Location cache (`locations.json`).
    pub db_path: PathBuf,
    /// Root directory for per-device lock directories.
    pub lock_dir: PathBuf,
    /// Interpreter used to run the serial-port enumerator.
    pub python: String,
    /// Installation root; bundled plugins live under `<dir>/plugins`.
    pub install_dir: PathBuf,
    /// Path to this binary, exported to plugin scripts.
    pub bin_path: PathBuf,
}

impl Config {
    /// Resolve from environment, falling back to `~/.config/usb-devices/`.
    pub fn from_env() -> Self {
        let base = config_base();

        Config {
            conf_path: env_path("USB_DEVICE_CONF").unwrap_or_else(|| base.join("devices.conf")),
            db_path: env_path("USB_DEVICE_DB").unwrap_or_else(|| base.join("locations.json")),
            lock_dir: env_path("USB_DEVICE_LOCK_DIR").unwrap_or_else(|| base.join("locks")),
            python: env::var("USB_DEVICE_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            install_dir: env_path("USB_DEVICE_DIR").unwrap_or_else(install_dir_default),
            bin_path: env_path("USB_DEVICE_BIN")
                .or_else(|| env::current_exe().ok())
                .unwrap_or_else(|| PathBuf::from("usb-device")),
        }
    }

    /// Bundled plugin directory, searched before the user plugin directory.
    pub fn bundled_plugin_dir(&self) -> PathBuf {
        self.install_dir.join("plugins")
    }

    /// User plugin directory.
    pub fn user_plugin_dir(&self) -> PathBuf {
        config_base().join("plugins")
    }

    /// Log file written by `hub watch` when installed as a service.
    pub fn agent_log_path(&self) -> PathBuf {
        config_base().join("hub-agent.log")
    }
}

/// Version string reported by `usb-device version`.
pub fn version() -> String {
    env::var("USB_DEVICE_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
}

/// Default owner string for locks: `user@host`.
pub fn default_owner() -> String {
    let user = env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host}")
}

fn config_base() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("usb-devices")
}

fn install_dir_default() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}
