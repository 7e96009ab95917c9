//! hwsim Core - device logic for the hardware wallet simulator.
//!
//! This crate implements:
//! - Per-device state and the pairing state machine
//! - Protocol dispatch for plain and secure requests
//! - Typed key-value record storage
//! - Out-of-band request correlation (approvals, external data)
//! - Per-device event publish/subscribe
//! - A device registry with admin entry points
//! - A client harness for integration tests

#![forbid(unsafe_code)]

// Device model
pub mod state;
pub mod session;

// Services
pub mod dispatch;
pub mod correlator;
pub mod events;
pub mod registry;

// Infrastructure
pub mod store;
pub mod pairings;
pub mod config;

// Supporting modules
pub mod errors;
pub mod types;
pub mod harness;

#[cfg(test)]
mod proptests;

pub use config::DeviceConfig;
pub use errors::{DeviceError, DeviceResult};
pub use registry::{DeviceHandle, DeviceRegistry, DeviceSnapshot, DeviceStatus};
