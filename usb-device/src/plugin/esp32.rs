//! Built-in plugin for esp32-class devices.
//!
//! Adds serial-line control actions that need no external tooling
//! (`bootloader`, `touch`) and one that defers to the chip vendor's flasher
//! (`boot`, a watchdog reset via esptool). The flasher binary itself is an
//! external collaborator; only its invocation lives here.

use std::time::Duration;

use tokio::process::Command;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

use super::{BoxFuture, CheckItem, PluginContext, PluginDescriptor};

const ESPTOOL: &str = "esptool.py";

inventory::submit! {
    PluginDescriptor {
        type_tag: "esp32",
        commands: &["bootloader", "boot", "touch"],
        run: run_boxed,
        check: check_boxed,
    }
}

fn run_boxed(ctx: PluginContext) -> BoxFuture<'static, Result<()>> {
    Box::pin(run(ctx))
}

fn check_boxed() -> BoxFuture<'static, Vec<CheckItem>> {
    Box::pin(check())
}

async fn run(ctx: PluginContext) -> Result<()> {
    let port = ctx.port.clone().ok_or_else(|| {
        Error::Resolution(format!(
            "'{}' has no serial port to act on (is it connected?)",
            ctx.name
        ))
    })?;

    match ctx.action.as_str() {
        "bootloader" => enter_bootloader(&port).await,
        "touch" => baud_touch_reset(&port).await,
        "boot" => exit_bootloader(&port, ctx.chip.as_deref()).await,
        other => Err(Error::Resolution(format!(
            "unknown action '{other}' for device type 'esp32'"
        ))),
    }
}

/// Classic DTR/RTS dance that holds IO0 low across a reset, dropping the
/// chip into its ROM bootloader.
async fn enter_bootloader(port_path: &str) -> Result<()> {
    info!(port = port_path, "Entering bootloader via DTR/RTS sequence");
    let mut port = tokio_serial::new(port_path, 115_200).open_native_async()?;

    port.write_data_terminal_ready(false)?;
    port.write_request_to_send(true)?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    port.write_data_terminal_ready(true)?;
    port.write_request_to_send(false)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    port.write_data_terminal_ready(false)?;

    drop(port);
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

/// Reset by opening the port at 1200 baud and closing it again; the USB
/// stack on these chips treats the touch as a reboot request.
async fn baud_touch_reset(port_path: &str) -> Result<()> {
    info!(port = port_path, "Resetting via 1200-baud touch");
    {
        let mut port = tokio_serial::new(port_path, 1200).open_native_async()?;
        port.write_data_terminal_ready(false)?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

/// Leave the bootloader by letting esptool trigger a watchdog reset.
async fn exit_bootloader(port_path: &str, chip: Option<&str>) -> Result<()> {
    info!(port = port_path, "Exiting bootloader via esptool watchdog reset");
    let mut cmd = Command::new(ESPTOOL);
    if let Some(chip) = chip {
        cmd.arg("--chip").arg(chip);
    }
    cmd.arg("--port").arg(port_path).arg("run");

    let status = cmd.status().await.map_err(|e| {
        Error::Environment(format!(
            "cannot run {ESPTOOL}: {e} (pip install esptool, or add it to PATH)"
        ))
    })?;
    if !status.success() {
        return Err(Error::Environment(format!("{ESPTOOL} failed with {status}")));
    }
    Ok(())
}

async fn check() -> Vec<CheckItem> {
    let ok = Command::new(ESPTOOL)
        .arg("version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    vec![CheckItem {
        name: ESPTOOL.to_string(),
        ok,
        detail: if ok {
            "bootloader control for esp32 devices".to_string()
        } else {
            "not found; esp32 'boot' action unavailable (pip install esptool)".to_string()
        },
    }]
}
