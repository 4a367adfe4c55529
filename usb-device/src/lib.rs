//! usb-device: manage a fleet of named USB devices on a workstation.
//!
//! The crate resolves user-friendly device names to physical USB topology by
//! fusing three evidence sources (a power-controllable-hub enumerator, the
//! OS serial-port enumerator, and a persistent location cache) and builds
//! power control, advisory locking, serial monitoring, and a display-hub
//! agent on top of that resolution.

pub mod agent;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod hotplug;
pub mod locks;
pub mod monitor;
pub mod plugin;
pub mod ports;
pub mod power;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod tracing;
pub mod uhub;
