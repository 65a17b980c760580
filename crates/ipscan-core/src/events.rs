//! Scan lifecycle notifications.
//!
//! Producers hold an `Arc<dyn EventSink>` handed in at construction and
//! call [`EventSink::emit`]. Probes run in parallel, so `emit` may be called
//! from many tasks at once; sinks do their own serialization.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::subnet::Subnet;
use crate::types::{Device, ProbeResult, ScanResult};

/// Snapshot of sweep progress. Counts never decrease between snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanProgress {
    pub current_address: Option<Ipv4Addr>,
    pub scanned_count: u64,
    pub total_count: u64,
    pub devices_found: u64,
}

impl ScanProgress {
    /// Whole-number percentage, 0 when there is nothing to scan.
    pub fn percent(&self) -> u8 {
        if self.total_count == 0 {
            return 0;
        }
        (self.scanned_count.saturating_mul(100) / self.total_count).min(100) as u8
    }
}

/// A notification emitted during a scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ScanEvent {
    // ── Sweep ─────────────────────────────────────────────────
    /// Probing is about to begin.
    ScanStarted {
        subnet: Subnet,
        interface_name: String,
        total_addresses: u64,
    },
    /// Periodic progress from the sweep.
    ScanProgress(ScanProgress),
    /// A single address answered its probe.
    HostResponded(ProbeResult),
    /// The cycle finished, successfully or not.
    ScanCompleted {
        result: ScanResult,
        new_devices_found: u32,
        devices_updated: u32,
        devices_auto_removed: u32,
    },

    // ── Inventory ─────────────────────────────────────────────
    DeviceDiscovered { device: Device },
    DeviceUpdated { device: Device },
    DeviceRemoved { device: Device },
}

impl ScanEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScanStarted { .. } => "ScanStarted",
            Self::ScanProgress(_) => "ScanProgress",
            Self::HostResponded(_) => "HostResponded",
            Self::ScanCompleted { .. } => "ScanCompleted",
            Self::DeviceDiscovered { .. } => "DeviceDiscovered",
            Self::DeviceUpdated { .. } => "DeviceUpdated",
            Self::DeviceRemoved { .. } => "DeviceRemoved",
        }
    }
}

/// Receiver of scan notifications.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ScanEvent);
}

impl<F> EventSink for F
where
    F: Fn(ScanEvent) + Send + Sync,
{
    fn emit(&self, event: ScanEvent) {
        self(event)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ScanEvent) {}
}

/// Forwards events into a channel for a consumer task to drain.
///
/// Emitting never blocks a probe. If the receiver is gone, events are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ScanEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ScanEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScanEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drain and return everything collected so far.
    pub fn take(&self) -> Vec<ScanEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ScanEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
