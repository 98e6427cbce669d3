//! ensign-daemon - Device Identity Manager Library
//!
//! This library provides the manager that establishes a device's
//! cryptographic identity on first boot and maintains it afterwards. The
//! manager drives three goals from its periodic ensure cycle: installing
//! the system seed, becoming operational (device key generation and serial
//! registration against the device service) and recording a successful
//! boot.
//!
//! # Modules
//!
//! - [`device`]: the device manager, its task handlers and the serial
//!   registration protocol
//! - [`hooks`]: hook handler registry and the `run-hook` task dispatch
//! - [`snaps`]: snap metadata read from the shared state

pub mod device;
pub mod hooks;
pub mod snaps;
