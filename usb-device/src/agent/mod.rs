//! Display-hub agent.
//!
//! A long-running loop that keeps the hub's per-channel displays in sync
//! with reality: registered device names, colored by runtime state. Two
//! producers drive it, the OS hotplug source and a keepalive timer, and
//! it must push something at least every 4.5 seconds or the hub firmware
//! clears the panels, so the keepalive interval stays at 2.

pub mod protocol;
pub mod service;

use std::collections::HashMap;
use std::time::Duration;

use futures::sink::SinkExt;
use tokio::signal::unix::{self, SignalKind};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hotplug;
use crate::ports::{self, PortRecord, PortSnapshot};
use crate::probe::{self, ProbeResult};
use crate::registry::{Device, Registry};
use crate::tracing::prelude::*;

use protocol::{channel_for, ChannelDisplay, HubCodec, RuntimeState, SetCommand, CHANNEL_COUNT};

/// Push cadence; must stay below the hub's 4.5 s display-clear watchdog.
pub const KEEPALIVE: Duration = Duration::from_secs(2);
/// Settle delay after a hotplug wake, letting enumeration finish.
const SETTLE: Duration = Duration::from_millis(500);
/// How long to wait for the hub's acknowledgement of a push.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// USB product string of the hub's CDC controller.
const HUB_PRODUCT: &str = "InsightHUB Controller";
const HUB_VID_PID: (u16, u16) = (0x303a, 0x1001);

const BAUD: u32 = 115_200;

/// The agent's full state.
pub struct HubAgent {
    python: String,
    /// Registered devices by lowercased serial identifier.
    devices: HashMap<String, Device>,
    /// Manual overrides from the `[hub:insight]` registry section.
    override_port: Option<String>,
    override_location: Option<String>,

    hub_port_path: Option<String>,
    hub_location: Option<String>,
    framed: Option<Framed<SerialStream, HubCodec>>,

    /// Identifier currently shown on each channel.
    channel_serials: Vec<Option<String>>,
    /// Last display pushed per channel, for change detection.
    channel_last: Vec<Option<ChannelDisplay>>,
    /// Probe verdicts, keyed by identifier; one probe per appearance.
    probe_cache: HashMap<String, RuntimeState>,
    hub_lost: bool,
}

impl HubAgent {
    pub fn new(config: &Config, registry: &Registry) -> HubAgent {
        let devices = registry
            .devices
            .iter()
            .filter_map(|d| {
                d.serial()
                    .map(|s| (s.to_ascii_lowercase(), d.clone()))
            })
            .collect();

        let hub_conf = registry.hub_config("insight");
        HubAgent {
            python: config.python.clone(),
            devices,
            override_port: hub_conf.and_then(|c| c.get("port").cloned()),
            override_location: hub_conf.and_then(|c| c.get("location").cloned()),
            hub_port_path: None,
            hub_location: None,
            framed: None,
            channel_serials: vec![None; CHANNEL_COUNT],
            channel_last: vec![None; CHANNEL_COUNT],
            probe_cache: HashMap::new(),
            hub_lost: false,
        }
    }

    /// Locate the hub controller port and derive the hub's topology path.
    ///
    /// The controller sits on the last port of the hub's own internal hub,
    /// so the hub path is the controller's location minus its final segment.
    /// Registry overrides win over auto-detection.
    async fn detect(&mut self) -> bool {
        if self.override_port.is_some() && self.override_location.is_some() {
            self.hub_port_path = self.override_port.clone();
            self.hub_location = self.override_location.clone();
            return true;
        }

        let snapshot = match ports::enumerate(&self.python).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Port enumeration failed during hub detection");
                return false;
            }
        };

        let found = snapshot.ports.iter().find(|p| {
            p.product.as_deref() == Some(HUB_PRODUCT) || p.vid_pid == Some(HUB_VID_PID)
        });
        let Some(found) = found else {
            return false;
        };

        self.hub_port_path = self
            .override_port
            .clone()
            .or_else(|| Some(found.device.clone()));
        self.hub_location = self.override_location.clone().or_else(|| {
            found
                .location
                .as_deref()
                .and_then(|l| l.rsplit_once('.'))
                .map(|(hub, _)| hub.to_string())
        });
        self.hub_location.is_some()
    }

    /// Open the controller port.
    fn open_hub(&mut self) -> Result<()> {
        let path = self
            .hub_port_path
            .clone()
            .ok_or_else(|| Error::Environment("display hub not found".to_string()))?;
        let mut stream = tokio_serial::new(&path, BAUD)
            .timeout(RESPONSE_TIMEOUT)
            .open_native_async()?;
        stream.write_data_terminal_ready(true)?;
        self.framed = Some(Framed::new(stream, HubCodec));
        info!(port = %path, location = ?self.hub_location, "Display hub connected");
        Ok(())
    }

    async fn connect(&mut self) -> bool {
        self.detect().await && self.open_hub().is_ok()
    }

    fn close_hub(&mut self) {
        self.framed = None;
    }

    /// Drop the connection and every piece of cached display state, then
    /// try to find the hub again (it may have moved ports).
    async fn reconnect(&mut self) -> bool {
        self.close_hub();
        self.channel_serials = vec![None; CHANNEL_COUNT];
        self.channel_last = vec![None; CHANNEL_COUNT];
        self.probe_cache.clear();

        if self.connect().await {
            self.hub_lost = false;
            true
        } else {
            false
        }
    }

    /// Registered devices present on hub channels right now.
    fn channel_occupants<'a>(
        &self,
        snapshot: &'a PortSnapshot,
    ) -> Vec<Option<(&'a str, &'a PortRecord)>> {
        let mut occupants: Vec<Option<(&str, &PortRecord)>> = vec![None; CHANNEL_COUNT];
        let Some(hub_location) = self.hub_location.as_deref() else {
            return occupants;
        };
        for p in &snapshot.ports {
            let (Some(serial), Some(location)) = (p.serial.as_deref(), p.location.as_deref())
            else {
                continue;
            };
            if let Some(ch) = channel_for(location, hub_location) {
                if occupants[ch - 1].is_none() {
                    occupants[ch - 1] = Some((serial, p));
                }
            }
        }
        occupants
    }

    /// Compute the desired display for every channel, probing newly-appeared
    /// esp32 devices when `probe_new` is set.
    async fn desired_state(
        &mut self,
        snapshot: &PortSnapshot,
        probe_new: bool,
    ) -> Vec<ChannelDisplay> {
        let occupants: Vec<Option<(String, PortRecord)>> = self
            .channel_occupants(snapshot)
            .into_iter()
            .map(|o| o.map(|(s, p)| (s.to_string(), p.clone())))
            .collect();

        let mut displays = Vec::with_capacity(CHANNEL_COUNT);
        for (idx, occupant) in occupants.into_iter().enumerate() {
            let display = match occupant {
                Some((serial, port_rec)) => {
                    let key = serial.to_ascii_lowercase();
                    match self.devices.get(&key).cloned() {
                        Some(device) => {
                            let appeared =
                                self.channel_serials[idx].as_deref() != Some(key.as_str());
                            let state = self
                                .runtime_state(&device, &port_rec, &key, appeared, probe_new)
                                .await;
                            self.channel_serials[idx] = Some(key);
                            ChannelDisplay::device(
                                &device.display_name(),
                                state,
                                &device.kind,
                                port_rec.location.as_deref(),
                            )
                        }
                        None => {
                            // Unregistered hardware gets no name on the panel.
                            self.clear_channel(idx);
                            ChannelDisplay::empty()
                        }
                    }
                }
                None => {
                    self.clear_channel(idx);
                    ChannelDisplay::empty()
                }
            };
            displays.push(display);
        }
        displays
    }

    fn clear_channel(&mut self, idx: usize) {
        if let Some(old) = self.channel_serials[idx].take() {
            // Re-probe on the next appearance.
            self.probe_cache.remove(&old);
        }
    }

    async fn runtime_state(
        &mut self,
        device: &Device,
        port_rec: &PortRecord,
        key: &str,
        appeared: bool,
        probe_new: bool,
    ) -> RuntimeState {
        if device.kind != "esp32" {
            return RuntimeState::Connected;
        }
        if appeared && probe_new {
            let state = match probe::probe(&port_rec.device).await {
                ProbeResult::Bootloader => RuntimeState::Bootloader,
                ProbeResult::Running => RuntimeState::Connected,
                ProbeResult::Unknown => RuntimeState::Unknown,
            };
            debug!(device = %device.name, state = %state, "Probed runtime state");
            self.probe_cache.insert(key.to_string(), state);
            return state;
        }
        self.probe_cache
            .get(key)
            .copied()
            .unwrap_or(RuntimeState::Connected)
    }

    /// Push one channel and await its acknowledgement.
    ///
    /// Serial I/O errors mark the hub lost; a missing or negative
    /// acknowledgement is only logged (the watchdog keepalive will retry).
    async fn push_channel(&mut self, index: usize, display: ChannelDisplay) -> bool {
        let Some(framed) = self.framed.as_mut() else {
            return false;
        };

        if let Err(e) = framed.send(SetCommand::channel(index, display)).await {
            warn!(channel = index, error = %e, "Push failed, hub lost");
            self.hub_lost = true;
            self.close_hub();
            return false;
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(resp))) if resp.is_ok() => true,
            Ok(Some(Ok(resp))) => {
                warn!(channel = index, status = ?resp.status, "Hub rejected push");
                true
            }
            Ok(Some(Err(e))) => {
                warn!(channel = index, error = %e, "Hub read error, hub lost");
                self.hub_lost = true;
                self.close_hub();
                false
            }
            Ok(None) => {
                warn!(channel = index, "Hub stream closed, hub lost");
                self.hub_lost = true;
                self.close_hub();
                false
            }
            Err(_) => {
                debug!(channel = index, "No acknowledgement from hub");
                true
            }
        }
    }

    /// Scan and push all channels in index order.
    ///
    /// Every channel is pushed each cycle (the push itself is the
    /// keepalive); state changes are what get logged.
    async fn refresh(&mut self, probe_new: bool, log_all: bool) {
        let snapshot = match ports::enumerate(&self.python).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Port enumeration failed, pushing stale state");
                PortSnapshot::default()
            }
        };

        let desired = self.desired_state(&snapshot, probe_new).await;
        for (idx, chan_display) in desired.into_iter().enumerate() {
            let changed = self.channel_last[idx].as_ref() != Some(&chan_display);
            if changed || log_all {
                info!(
                    channel = idx + 1,
                    text = %chan_display.lines.t1.txt,
                    color = ?chan_display.lines.t1.color,
                    "CH{} -> {}",
                    idx + 1,
                    chan_display.lines.t1.txt
                );
            }
            if !self.push_channel(idx + 1, chan_display.clone()).await {
                return;
            }
            self.channel_last[idx] = Some(chan_display);
        }
    }

    /// One-shot push (`hub sync`).
    pub async fn sync(&mut self) -> Result<()> {
        if !self.connect().await {
            return Err(Error::Environment(
                "display hub not found (is it connected?)".to_string(),
            ));
        }
        self.refresh(true, true).await;
        if self.hub_lost {
            return Err(Error::Transient("push to display hub failed".to_string()));
        }
        Ok(())
    }

    /// Print hub info and current channel assignments (`hub status`).
    pub async fn status(&mut self) -> Result<()> {
        if !self.detect().await {
            return Err(Error::Environment(
                "display hub not found (is it connected?)".to_string(),
            ));
        }
        println!(
            "Display hub: {}",
            self.hub_port_path.as_deref().unwrap_or("?")
        );
        println!(
            "Hub location: {}",
            self.hub_location.as_deref().unwrap_or("?")
        );
        println!("Registered devices: {}", self.devices.len());
        println!();

        let snapshot = ports::enumerate(&self.python).await?;
        let occupants = self.channel_occupants(&snapshot);
        for (idx, occupant) in occupants.into_iter().enumerate() {
            match occupant {
                Some((serial, port_rec)) => {
                    match self.devices.get(&serial.to_ascii_lowercase()) {
                        Some(device) => {
                            println!("  CH{}: {}", idx + 1, device.name);
                            println!(
                                "       dev={}  display={}",
                                port_rec.device,
                                device.display_name()
                            );
                        }
                        None => {
                            let desc = port_rec.product.as_deref().unwrap_or(serial);
                            println!("  CH{}: {} (unregistered)", idx + 1, desc);
                            println!("       dev={}", port_rec.device);
                        }
                    }
                }
                None => println!("  CH{}: (empty)", idx + 1),
            }
        }
        Ok(())
    }

    /// Daemon mode (`hub watch`): run until SIGINT/SIGTERM.
    pub async fn watch(&mut self) -> Result<()> {
        let (signal_tx, mut signal_rx) = hotplug::signal_pair();
        let mut source = hotplug::create_source();
        source.subscribe(signal_tx)?;

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        if self.connect().await {
            self.refresh(true, true).await;
        } else {
            info!("Display hub not found, will keep retrying");
            self.hub_lost = true;
        }
        info!(
            interval = KEEPALIVE.as_secs(),
            "Watching (keepalive every {}s)",
            KEEPALIVE.as_secs()
        );

        loop {
            let wake = tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                wake = tokio::time::timeout(KEEPALIVE, signal_rx.recv()) => wake,
            };
            let triggered = matches!(wake, Ok(Some(())));

            if matches!(wake, Ok(None)) {
                // Hotplug source gone; keep the timer cadence ourselves.
                tokio::time::sleep(KEEPALIVE).await;
            }

            if self.hub_lost {
                if self.reconnect().await {
                    info!("Reconnected to display hub");
                    self.refresh(true, true).await;
                }
                continue;
            }

            if triggered {
                // Let USB enumeration settle, then drop any wakes that
                // fired meanwhile; the scan below covers them.
                tokio::time::sleep(SETTLE).await;
                while signal_rx.try_recv().is_ok() {}
            }

            self.refresh(triggered, false).await;
        }

        source.close();
        self.close_hub();
        info!("Exiting.");
        Ok(())
    }
}
