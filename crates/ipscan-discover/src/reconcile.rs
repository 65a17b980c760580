//! Merge a sweep's responders into the device inventory.
//!
//! Pure and synchronous: the caller loads the inventory, runs
//! [`reconcile`], emits the returned events and saves. Devices move
//! between states only here:
//!
//! ```text
//! (unknown) ──seen──▶ Online ──missed──▶ Offline ──missed × N──▶ Removed
//!                       ▲                   │
//!                       └───────seen────────┘
//! ```

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use ipscan_core::{Device, DeviceInventory, ProbeResult, ScanEvent};

use crate::config::AppSettings;

/// Auto-removal settings for one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalPolicy {
    pub enabled: bool,
    pub missed_threshold: u32,
}

impl RemovalPolicy {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            enabled: settings.auto_remove_missing_devices,
            missed_threshold: settings.missed_scans_before_removal,
        }
    }

    /// Whether `device` has been missing long enough to go.
    pub fn is_candidate(&self, device: &Device) -> bool {
        !device.is_online && device.consecutive_missed_scans >= self.missed_threshold
    }
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Created from responders with no matching device.
    pub discovered: Vec<Device>,
    /// Existing devices that responded again.
    pub updated: Vec<Device>,
    /// Existing devices that missed this scan and were kept.
    pub marked_offline: Vec<Device>,
    /// Devices dropped by auto-removal.
    pub removed: Vec<Device>,
}

impl Reconciliation {
    pub fn new_count(&self) -> u32 {
        self.discovered.len() as u32
    }

    /// Re-seen devices only; offline marking is not counted.
    pub fn updated_count(&self) -> u32 {
        self.updated.len() as u32
    }

    pub fn removed_count(&self) -> u32 {
        self.removed.len() as u32
    }

    /// Device events in emission order: responders, then offline
    /// markings, then removals.
    ///
    /// A device that goes offline and is removed in the same cycle only
    /// yields `DeviceRemoved`.
    pub fn events(&self) -> Vec<ScanEvent> {
        let mut events = Vec::with_capacity(
            self.discovered.len() + self.updated.len() + self.marked_offline.len() + self.removed.len(),
        );
        events.extend(self.discovered.iter().cloned().map(|device| ScanEvent::DeviceDiscovered { device }));
        events.extend(self.updated.iter().cloned().map(|device| ScanEvent::DeviceUpdated { device }));
        events.extend(self.marked_offline.iter().cloned().map(|device| ScanEvent::DeviceUpdated { device }));
        events.extend(self.removed.iter().cloned().map(|device| ScanEvent::DeviceRemoved { device }));
        events
    }
}

/// Apply one completed sweep to `inventory`.
///
/// Every device known beforehand ends up either online with a zero miss
/// count (it responded) or offline with its miss count bumped by one.
/// Auto-removal runs after offline marking. Scan bookkeeping
/// (`total_scans`, `last_scan_time`) is updated too.
pub fn reconcile(
    inventory: &mut DeviceInventory,
    responders: &[ProbeResult],
    policy: RemovalPolicy,
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(responders.len());
    let known_before = inventory.devices.len();

    for probe in responders {
        let ip = probe.ip_address.to_string();
        if !seen.insert(ip.to_ascii_lowercase()) {
            continue;
        }

        let mut matched = false;
        for device in inventory.devices[..known_before]
            .iter_mut()
            .filter(|d| d.has_ip(&ip))
        {
            device.mark_seen(probe.hostname.as_deref(), now);
            outcome.updated.push(device.clone());
            matched = true;
        }

        if !matched {
            let device = Device::discovered(probe, now);
            tracing::info!(
                ip = %device.ip_address,
                hostname = ?device.hostname,
                "New device discovered"
            );
            outcome.discovered.push(device.clone());
            inventory.devices.push(device);
        }
    }

    let mut missed = Vec::new();
    for device in inventory.devices[..known_before].iter_mut() {
        if !seen.contains(&device.ip_address.to_ascii_lowercase()) {
            device.mark_missed();
            missed.push(device.id);
        }
    }

    if policy.enabled {
        let (removed, kept): (Vec<Device>, Vec<Device>) = std::mem::take(&mut inventory.devices)
            .into_iter()
            .partition(|d| policy.is_candidate(d));
        inventory.devices = kept;

        for device in &removed {
            tracing::info!(
                name = %device.display_name(),
                ip = %device.ip_address,
                missed = device.consecutive_missed_scans,
                "Auto-removed device"
            );
        }
        outcome.removed = removed;
    }

    outcome.marked_offline = missed
        .iter()
        .filter_map(|id| inventory.find_by_id(*id).cloned())
        .collect();

    inventory.total_scans = inventory.total_scans.saturating_add(1);
    inventory.last_scan_time = Some(now);

    outcome
}

/// Offline devices whose miss count has reached `threshold`.
pub fn missing_device_candidates(inventory: &DeviceInventory, threshold: u32) -> Vec<Device> {
    let policy = RemovalPolicy {
        enabled: true,
        missed_threshold: threshold,
    };
    inventory
        .devices
        .iter()
        .filter(|d| policy.is_candidate(d))
        .cloned()
        .collect()
}
