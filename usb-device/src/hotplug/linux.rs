//! Linux udev-based hotplug source.
//!
//! The monitor runs in a dedicated OS thread with its own single-threaded
//! tokio runtime. udev types are !Send (they wrap raw C pointers that
//! libudev requires stay on one thread), so the monitor cannot live on the
//! multi-threaded runtime; a dedicated thread with a `current_thread`
//! runtime keeps the async code and `tokio::select!` shutdown handling
//! while satisfying that constraint.

use futures::stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{HotplugSignal, HotplugSource};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub struct UdevSource {
    cancel: Option<CancellationToken>,
}

impl UdevSource {
    pub fn new() -> UdevSource {
        UdevSource { cancel: None }
    }
}

impl HotplugSource for UdevSource {
    fn subscribe(&mut self, signal: HotplugSignal) -> Result<()> {
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || {
                if let Err(e) = monitor_blocking(signal, cancel) {
                    error!("USB hotplug monitoring failed: {}", e);
                }
                trace!("USB hotplug thread exiting");
            })
            .map_err(|e| Error::Environment(format!("cannot spawn hotplug thread: {e}")))?;

        trace!("USB hotplug thread spawned");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

fn monitor_blocking(signal: HotplugSignal, cancel: CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Environment(format!("cannot create hotplug runtime: {e}")))?;

    runtime.block_on(async {
        let builder = tokio_udev::MonitorBuilder::new()
            .map_err(|e| Error::Environment(format!("cannot create udev monitor: {e}")))?
            .match_subsystem("usb")
            .map_err(|e| Error::Environment(format!("cannot filter udev monitor: {e}")))?;

        let socket = builder
            .listen()
            .map_err(|e| Error::Environment(format!("cannot listen on udev socket: {e}")))?;

        let mut monitor = tokio_udev::AsyncMonitorSocket::new(socket)
            .map_err(|e| Error::Environment(format!("cannot create async udev socket: {e}")))?;

        debug!("udev monitor created, entering event loop");

        loop {
            tokio::select! {
                event = monitor.next() => {
                    let event = match event {
                        Some(Ok(e)) => e,
                        Some(Err(e)) => {
                            warn!("udev monitor error: {}", e);
                            continue;
                        }
                        None => {
                            warn!("udev monitor stream ended");
                            return Ok(());
                        }
                    };

                    match event.event_type() {
                        tokio_udev::EventType::Add | tokio_udev::EventType::Remove => {
                            trace!(event = ?event.event_type(), "USB change");
                            // Coalesced wake: a full channel means a wake is
                            // already pending, a closed one means the agent
                            // is gone.
                            match signal.try_send(()) {
                                Ok(()) | Err(tokio::sync::mpsc::error::TrySendError::Full(())) => {}
                                Err(tokio::sync::mpsc::error::TrySendError::Closed(())) => {
                                    debug!("Signal receiver dropped, exiting hotplug monitor");
                                    return Ok(());
                                }
                            }
                        }
                        _ => {}
                    }
                }

                _ = cancel.cancelled() => {
                    debug!("Shutdown requested, exiting hotplug monitor");
                    return Ok(());
                }
            }
        }
    })
}
