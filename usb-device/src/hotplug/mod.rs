//! OS hotplug event source.
//!
//! Delivery model: every USB arrival or departure is coalesced into a single
//! "something changed" signal. The signal is a capacity-1 channel written
//! with `try_send`, so a burst of events while a wake is already pending
//! collapses into one; consumers re-scan on wake rather than tracking
//! event identities.
//!
//! On systems without a native hotplug facility the source degrades to a
//! pure timer: the agent's wait timeout provides the same 2-second cadence,
//! just without the early wakeups.

use tokio::sync::mpsc;

use crate::error::Result;

#[cfg(target_os = "linux")]
mod linux;

/// The shared wake signal. Capacity 1; producers must use `try_send`.
pub type HotplugSignal = mpsc::Sender<()>;

/// Create the signal pair used between a source and the agent.
pub fn signal_pair() -> (HotplugSignal, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// A subscription to OS USB arrival/departure events.
pub trait HotplugSource: Send {
    /// Begin raising the signal on device changes. Spawns any platform
    /// machinery (a dedicated thread on Linux); returns immediately.
    fn subscribe(&mut self, signal: HotplugSignal) -> Result<()>;

    /// Stop the subscription and release platform resources.
    fn close(&mut self);
}

/// Pure-timer fallback: never raises the signal; the consumer's wait
/// timeout does all the work.
pub struct TimerSource;

impl HotplugSource for TimerSource {
    fn subscribe(&mut self, _signal: HotplugSignal) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Create the platform hotplug source.
pub fn create_source() -> Box<dyn HotplugSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::UdevSource::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(TimerSource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_coalesces_bursts() {
        let (tx, mut rx) = signal_pair();
        // Three rapid events; only one wake is pending.
        let _ = tx.try_send(());
        let _ = tx.try_send(());
        let _ = tx.try_send(());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn timer_source_is_inert() {
        let (tx, _rx) = signal_pair();
        let mut source = TimerSource;
        source.subscribe(tx).unwrap();
        source.close();
    }
}
