//! ipscan-core: Shared types for the ipscan device inventory.
//!
//! This crate provides the pieces every other component builds on:
//! - Device, inventory, interface, and scan result types
//! - IPv4 subnet arithmetic
//! - Scan lifecycle events and sinks
//! - A cancellation signal shared by all probes of a scan

pub mod cancel;
pub mod error;
pub mod events;
pub mod subnet;
pub mod types;

pub use cancel::CancelSignal;
pub use error::ValidationError;
pub use events::{EventSink, ScanEvent, ScanProgress};
pub use subnet::Subnet;
pub use types::{
    Device, DeviceId, DeviceInventory, InterfaceType, NetworkInterfaceDescriptor, ProbeResult,
    ScanFailure, ScanResult,
};
