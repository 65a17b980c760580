//! Core domain types for the device inventory.
//!
//! These cover both sides of a scan cycle: the transient results a sweep
//! produces (`ProbeResult`, `ScanResult`) and the persistent inventory the
//! results are reconciled into (`Device`, `DeviceInventory`).

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::subnet::Subnet;

// ── Device ────────────────────────────────────────────────────────

/// Stable identity of a device. Generated once, never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A device known to the inventory.
///
/// `ip_address` is the natural join key against scan results and is
/// compared case-insensitively. `consecutive_missed_scans` is always 0
/// while `is_online` is true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    pub first_discovered: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_missed_scans: u32,
    #[serde(default)]
    pub notes: String,
}

impl Device {
    /// A manually entered device: offline until a scan sees it.
    pub fn new(ip_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DeviceId::new(),
            name: String::new(),
            hostname: None,
            ip_address: ip_address.into(),
            mac_address: None,
            is_online: false,
            first_discovered: now,
            last_seen: now,
            consecutive_missed_scans: 0,
            notes: String::new(),
        }
    }

    /// A device created from its first successful probe.
    pub fn discovered(probe: &ProbeResult, now: DateTime<Utc>) -> Self {
        Self {
            id: DeviceId::new(),
            name: probe.hostname.clone().unwrap_or_default(),
            hostname: probe.hostname.clone(),
            ip_address: probe.ip_address.to_string(),
            mac_address: probe.mac_address.clone(),
            is_online: true,
            first_discovered: now,
            last_seen: now,
            consecutive_missed_scans: 0,
            notes: String::new(),
        }
    }

    /// Name, falling back to hostname, then IP.
    pub fn display_name(&self) -> &str {
        if !self.name.trim().is_empty() {
            &self.name
        } else if let Some(host) = self.hostname.as_deref().filter(|h| !h.trim().is_empty()) {
            host
        } else {
            &self.ip_address
        }
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.ip_address.eq_ignore_ascii_case(ip.trim())
    }

    /// Record a successful probe of this device.
    pub fn mark_seen(&mut self, hostname: Option<&str>, now: DateTime<Utc>) {
        self.is_online = true;
        self.last_seen = now;
        self.consecutive_missed_scans = 0;

        let has_hostname = self.hostname.as_deref().is_some_and(|h| !h.trim().is_empty());
        if !has_hostname {
            if let Some(resolved) = hostname.filter(|h| !h.trim().is_empty()) {
                self.hostname = Some(resolved.to_string());
            }
        }
    }

    /// Record a completed scan that did not see this device.
    pub fn mark_missed(&mut self) {
        self.is_online = false;
        self.consecutive_missed_scans = self.consecutive_missed_scans.saturating_add(1);
    }
}

/// Every known device plus scan bookkeeping, persisted as one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceInventory {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_scans: u64,
}

impl DeviceInventory {
    pub fn find_by_id(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn find_by_ip(&self, ip: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.has_ip(ip))
    }

    /// Replace the device with the same id, or append it.
    pub fn upsert(&mut self, device: Device) {
        match self.devices.iter_mut().find(|d| d.id == device.id) {
            Some(slot) => *slot = device,
            None => self.devices.push(device),
        }
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let index = self.devices.iter().position(|d| d.id == id)?;
        Some(self.devices.remove(index))
    }

    pub fn online_count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_online).count()
    }
}

// ── Network interfaces ───────────────────────────────────────────

/// Coarse interface classification.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Virtual,
    Vpn,
    #[default]
    Other,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ethernet => "ethernet",
            Self::Wireless => "wireless",
            Self::Loopback => "loopback",
            Self::Virtual => "virtual",
            Self::Vpn => "vpn",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// A host network interface as reported by the OS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterfaceDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub interface_type: InterfaceType,
    pub ipv4_address: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub mac_address: String,
    pub is_up: bool,
    /// Link speed in bits per second, 0 when unknown.
    #[serde(default)]
    pub speed: u64,
}

impl NetworkInterfaceDescriptor {
    pub fn is_vpn(&self) -> bool {
        self.interface_type == InterfaceType::Vpn
    }

    pub fn is_loopback(&self) -> bool {
        self.interface_type == InterfaceType::Loopback
    }

    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }
}

// ── Scanning ──────────────────────────────────────────────────────

/// A host that answered a probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    pub ip_address: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    pub round_trip: Duration,
}

impl ProbeResult {
    pub fn new(ip_address: Ipv4Addr, round_trip: Duration) -> Self {
        Self {
            ip_address,
            hostname: None,
            mac_address: None,
            round_trip,
        }
    }
}

/// Why a scan did not complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ScanFailure {
    NoInterfaceFound,
    NoSourceAddress,
    Cancelled,
    AlreadyRunning,
    Other(String),
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoInterfaceFound => f.write_str("No suitable network interface found"),
            Self::NoSourceAddress => f.write_str("Network interface has no IP address"),
            Self::Cancelled => f.write_str("Scan was cancelled"),
            Self::AlreadyRunning => f.write_str("A scan is already in progress"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

/// Outcome of one sweep.
///
/// `discovered_devices` is in completion order, not address order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScanFailure>,
    pub subnet: Option<Subnet>,
    #[serde(default)]
    pub interface_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Host addresses the sweep covered, including any left unprobed after
    /// cancellation.
    pub total_addresses_scanned: u64,
    #[serde(default)]
    pub discovered_devices: Vec<ProbeResult>,
}

impl ScanResult {
    /// An empty, not-yet-successful result stamped with the current time.
    pub fn started(subnet: Option<Subnet>, interface_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            success: false,
            error: None,
            subnet,
            interface_id: interface_id.into(),
            start_time: now,
            end_time: now,
            total_addresses_scanned: 0,
            discovered_devices: Vec::new(),
        }
    }

    /// A result for a scan that never reached the probing stage.
    pub fn failed(failure: ScanFailure) -> Self {
        let mut result = Self::started(None, String::new());
        result.error = Some(failure);
        result
    }

    pub fn duration(&self) -> chrono::TimeDelta {
        self.end_time - self.start_time
    }

    pub fn devices_found(&self) -> usize {
        self.discovered_devices.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == Some(ScanFailure::Cancelled)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}
