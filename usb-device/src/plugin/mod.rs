//! Type plugin dispatcher.
//!
//! Device types extend the command surface beyond the built-in action set.
//! An implementation of action `A` for type `T` is found in this order,
//! first match wins:
//!
//! 1. executable `<T>.<A>` in the bundled plugins directory
//!    (`$USB_DEVICE_DIR/plugins`);
//! 2. executable `<T>.<A>` in the user plugins directory
//!    (`~/.config/usb-devices/plugins`);
//! 3. a compiled-in plugin registered through [`inventory`].
//!
//! External scripts therefore shadow compiled-in implementations, so the
//! built-in `esp32` actions can be replaced without rebuilding.
//!
//! ## Script contract
//!
//! Scripts are invoked as `<script> <port> <name> <chip>` (empty strings for
//! unknown values) with `USB_DEVICE_PORT`, `USB_DEVICE_NAME`,
//! `USB_DEVICE_CHIP`, and `USB_DEVICE_BIN` in the environment. Exit status 0
//! is success. `<T>.commands` (if present) prints extra action names;
//! `<T>.check` contributes to `usb-device check`.

pub mod esp32;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::process::Command;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::resolver::ResolvedDevice;
use crate::tracing::prelude::*;

/// Action names with reserved meaning; never dispatched as device actions.
const META_ACTIONS: &[&str] = &["commands", "check"];

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a plugin action gets to see.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub name: String,
    /// Resolved serial port path, when the device has one.
    pub port: Option<String>,
    /// Registry `chip=` string.
    pub chip: Option<String>,
    pub action: String,
    /// Path to the `usb-device` binary, for plugins that call back in.
    pub bin: PathBuf,
}

/// One dependency verdict for `usb-device check`.
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

pub type PluginRunFn = fn(PluginContext) -> BoxFuture<'static, Result<()>>;
pub type PluginCheckFn = fn() -> BoxFuture<'static, Vec<CheckItem>>;

/// A compiled-in type plugin, registered via `inventory::submit!`.
pub struct PluginDescriptor {
    /// Device type this plugin extends.
    pub type_tag: &'static str,
    /// Actions the plugin adds.
    pub commands: &'static [&'static str],
    pub run: PluginRunFn,
    pub check: PluginCheckFn,
}

inventory::collect!(PluginDescriptor);

/// Find the compiled-in plugin for a type tag.
pub fn builtin(type_tag: &str) -> Option<&'static PluginDescriptor> {
    inventory::iter::<PluginDescriptor>().find(|d| d.type_tag == type_tag)
}

/// Dispatcher bound to the two plugin search directories.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    bundled: PathBuf,
    user: PathBuf,
    bin: PathBuf,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Dispatcher {
        Dispatcher {
            bundled: config.bundled_plugin_dir(),
            user: config.user_plugin_dir(),
            bin: config.bin_path.clone(),
        }
    }

    /// Locate an executable `<type>.<action>` script, bundled dir first.
    fn script_for(&self, type_tag: &str, action: &str) -> Option<PathBuf> {
        let file = format!("{type_tag}.{action}");
        [&self.bundled, &self.user]
            .into_iter()
            .map(|dir| dir.join(&file))
            .find(|p| is_executable(p))
    }

    /// All actions available for a type: compiled-in commands plus script
    /// files, plus whatever a `<type>.commands` script declares.
    pub async fn commands_for(&self, type_tag: &str) -> Vec<String> {
        let mut actions: Vec<String> = builtin(type_tag)
            .map(|d| d.commands.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        for dir in [&self.bundled, &self.user] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(action) = name.strip_prefix(&format!("{type_tag}.")) {
                    if !META_ACTIONS.contains(&action) && is_executable(&entry.path()) {
                        actions.push(action.to_string());
                    }
                }
            }
        }

        if let Some(script) = self.script_for(type_tag, "commands") {
            if let Ok(output) = Command::new(&script).output().await {
                let text = String::from_utf8_lossy(&output.stdout);
                actions.extend(text.split_whitespace().map(|s| s.to_string()));
            }
        }

        actions.sort();
        actions.dedup();
        actions
    }

    /// Dispatch one action on a resolved device.
    pub async fn run(&self, resolved: &ResolvedDevice, action: &str) -> Result<()> {
        let type_tag = resolved.device.kind.as_str();
        if META_ACTIONS.contains(&action) {
            return Err(Error::Resolution(format!(
                "'{action}' is not a device action"
            )));
        }

        let ctx = PluginContext {
            name: resolved.device.name.clone(),
            port: resolved.dev().map(|d| d.to_string()),
            chip: resolved.device.chip.clone(),
            action: action.to_string(),
            bin: self.bin.clone(),
        };

        if let Some(script) = self.script_for(type_tag, action) {
            debug!(script = %script.display(), "Running external plugin");
            return self.run_script(&script, &ctx).await;
        }

        if let Some(desc) = builtin(type_tag) {
            if desc.commands.contains(&action) {
                return (desc.run)(ctx).await;
            }
        }

        Err(Error::Resolution(format!(
            "unknown action '{action}' for device type '{type_tag}'"
        )))
    }

    async fn run_script(&self, script: &Path, ctx: &PluginContext) -> Result<()> {
        let status = Command::new(script)
            .arg(ctx.port.as_deref().unwrap_or(""))
            .arg(&ctx.name)
            .arg(ctx.chip.as_deref().unwrap_or(""))
            .env("USB_DEVICE_PORT", ctx.port.as_deref().unwrap_or(""))
            .env("USB_DEVICE_NAME", &ctx.name)
            .env("USB_DEVICE_CHIP", ctx.chip.as_deref().unwrap_or(""))
            .env("USB_DEVICE_BIN", &ctx.bin)
            .status()
            .await
            .map_err(|e| {
                Error::Environment(format!("cannot run plugin {}: {e}", script.display()))
            })?;

        if !status.success() {
            return Err(Error::Environment(format!(
                "plugin {} failed with {status}",
                script.display()
            )));
        }
        Ok(())
    }

    /// Run every compiled-in plugin's dependency check plus any
    /// `<type>.check` scripts.
    pub async fn check_all(&self) -> Vec<CheckItem> {
        let mut items = Vec::new();
        for desc in inventory::iter::<PluginDescriptor>() {
            items.extend((desc.check)().await);
        }

        for dir in [&self.bundled, &self.user] {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".check") && is_executable(&entry.path()) {
                    let ok = Command::new(entry.path())
                        .status()
                        .await
                        .map(|s| s.success())
                        .unwrap_or(false);
                    items.push(CheckItem {
                        name: name.clone(),
                        ok,
                        detail: entry.path().display().to_string(),
                    });
                }
            }
        }
        items
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Device, Identity};
    use std::os::unix::fs::PermissionsExt;

    fn resolved(kind: &str) -> ResolvedDevice {
        ResolvedDevice {
            device: Device {
                name: "Board X".into(),
                identity: Identity::Serial("AA:AA:AA:AA:AA:AA".into()),
                kind: kind.into(),
                chip: Some("esp32s3".into()),
                hub_name: None,
            },
            topology: None,
        }
    }

    fn dispatcher(bundled: &Path, user: &Path) -> Dispatcher {
        Dispatcher {
            bundled: bundled.to_path_buf(),
            user: user.to_path_buf(),
            bin: PathBuf::from("usb-device"),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn unknown_action_names_type_and_action() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(&dir.path().join("a"), &dir.path().join("b"));
        let err = d.run(&resolved("generic"), "frobnicate").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("frobnicate") && msg.contains("generic"), "{msg}");
    }

    #[tokio::test]
    async fn external_script_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("bundled");
        let marker = dir.path().join("ran");
        write_script(
            &bundled,
            "widget.blink",
            &format!("echo \"$USB_DEVICE_NAME:$2\" > {}", marker.display()),
        );

        let d = dispatcher(&bundled, &dir.path().join("user"));
        d.run(&resolved("widget"), "blink").await.unwrap();

        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content.trim(), "Board X:Board X");
    }

    #[tokio::test]
    async fn failing_script_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("bundled");
        write_script(&bundled, "widget.blink", "exit 3");

        let d = dispatcher(&bundled, &dir.path().join("user"));
        let err = d.run(&resolved("widget"), "blink").await.unwrap_err();
        assert!(err.to_string().contains("widget.blink"), "{err}");
    }

    #[tokio::test]
    async fn bundled_dir_searched_before_user_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("bundled");
        let user = dir.path().join("user");
        let marker = dir.path().join("which");
        write_script(
            &bundled,
            "widget.blink",
            &format!("echo bundled > {}", marker.display()),
        );
        write_script(
            &user,
            "widget.blink",
            &format!("echo user > {}", marker.display()),
        );

        let d = dispatcher(&bundled, &user);
        d.run(&resolved("widget"), "blink").await.unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "bundled");
    }

    #[tokio::test]
    async fn commands_for_lists_scripts_and_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("user");
        write_script(&user, "esp32.flash", "exit 0");
        write_script(&user, "esp32.check", "exit 0");

        let d = dispatcher(&dir.path().join("bundled"), &user);
        let actions = d.commands_for("esp32").await;
        assert!(actions.contains(&"flash".to_string()));
        assert!(actions.contains(&"bootloader".to_string()), "{actions:?}");
        // meta operations are not actions
        assert!(!actions.contains(&"check".to_string()));
    }

    #[test]
    fn builtin_esp32_registered() {
        let desc = builtin("esp32").unwrap();
        assert!(desc.commands.contains(&"bootloader"));
        assert!(builtin("generic").is_none());
    }
}
