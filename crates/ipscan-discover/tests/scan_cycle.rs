//! Full scan cycles through `DeviceManager` with in-process fakes for the
//! network side and a real JSON repository on disk.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipscan_core::events::CollectingSink;
use ipscan_core::{CancelSignal, InterfaceType, NetworkInterfaceDescriptor, ProbeResult, ScanEvent};

use ipscan_discover::config::{AppSettings, StaticSettings};
use ipscan_discover::error::DiscoverError;
use ipscan_discover::interface::StaticInterfaces;
use ipscan_discover::manager::DeviceManager;
use ipscan_discover::probe::Prober;
use ipscan_discover::repository::{DeviceRepository, JsonDeviceRepository};
use ipscan_discover::scanner::NetworkScanner;

/// Answers for whichever addresses are currently "up".
#[derive(Default)]
struct Lan {
    up: Mutex<HashSet<Ipv4Addr>>,
}

impl Lan {
    fn set_up(&self, hosts: &[u8]) {
        let mut up = self.up.lock().unwrap();
        up.clear();
        up.extend(hosts.iter().map(|h| Ipv4Addr::new(192, 168, 1, *h)));
    }
}

#[async_trait]
impl Prober for Lan {
    async fn probe(&self, addr: Ipv4Addr, _timeout: Duration) -> Option<ProbeResult> {
        let up = self.up.lock().unwrap().contains(&addr);
        up.then(|| ProbeResult::new(addr, Duration::from_millis(2)))
    }
}

fn eth0() -> NetworkInterfaceDescriptor {
    NetworkInterfaceDescriptor {
        id: "eth0".to_string(),
        name: "eth0".to_string(),
        description: "Wired".to_string(),
        interface_type: InterfaceType::Ethernet,
        ipv4_address: Some(Ipv4Addr::new(192, 168, 1, 2)),
        subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 240)),
        gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
        mac_address: "02:00:00:00:00:01".to_string(),
        is_up: true,
        speed: 1_000_000_000,
    }
}

fn settings() -> AppSettings {
    AppSettings {
        scan_timeout_ms: 50,
        max_concurrent_scans: 4,
        auto_remove_missing_devices: true,
        missed_scans_before_removal: 1,
        ..AppSettings::default()
    }
}

fn manager(
    lan: Arc<Lan>,
    repository: Arc<JsonDeviceRepository>,
    sink: Arc<CollectingSink>,
) -> DeviceManager {
    DeviceManager::new(
        NetworkScanner::new(lan),
        Arc::new(StaticInterfaces::new(vec![eth0()])),
        repository,
        Arc::new(StaticSettings::new(settings())),
        sink,
    )
}

fn completed_counts(events: &[ScanEvent]) -> Option<(u32, u32, u32)> {
    events.iter().find_map(|event| match event {
        ScanEvent::ScanCompleted {
            new_devices_found,
            devices_updated,
            devices_auto_removed,
            ..
        } => Some((*new_devices_found, *devices_updated, *devices_auto_removed)),
        _ => None,
    })
}

fn lifecycle(events: &[ScanEvent]) -> Vec<(&'static str, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            ScanEvent::DeviceDiscovered { device }
            | ScanEvent::DeviceUpdated { device }
            | ScanEvent::DeviceRemoved { device } => {
                Some((event.kind(), device.ip_address.clone()))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_discover_then_update_and_auto_remove() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    let lan = Arc::new(Lan::default());
    let sink = Arc::new(CollectingSink::new());
    let manager = manager(
        lan.clone(),
        Arc::new(JsonDeviceRepository::open(&path)),
        sink.clone(),
    );
    let cancel = CancelSignal::new();

    // First sweep: two hosts answer on an empty inventory.
    lan.set_up(&[5, 9]);
    let result = manager.scan(None, &cancel).await.unwrap();
    assert!(result.success);
    assert_eq!(
        result.subnet.as_ref().map(ToString::to_string).as_deref(),
        Some("192.168.1.0/28")
    );
    assert_eq!(result.total_addresses_scanned, 14);
    assert_eq!(result.devices_found(), 2);

    let events = sink.take();
    assert!(matches!(events.first(), Some(ScanEvent::ScanStarted { .. })));
    assert!(matches!(events.last(), Some(ScanEvent::ScanCompleted { .. })));
    assert_eq!(completed_counts(&events), Some((2, 0, 0)));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ScanEvent::DeviceDiscovered { .. }))
            .count(),
        2
    );

    // Second sweep: .9 is gone and one miss is enough to drop it.
    lan.set_up(&[5]);
    let result = manager.scan(None, &cancel).await.unwrap();
    assert!(result.success);

    let events = sink.take();
    assert_eq!(completed_counts(&events), Some((0, 1, 1)));
    assert_eq!(
        lifecycle(&events),
        vec![
            ("DeviceUpdated", "192.168.1.5".to_string()),
            ("DeviceRemoved", "192.168.1.9".to_string()),
        ]
    );

    // What reached disk survives a fresh repository instance.
    let inventory = JsonDeviceRepository::open(&path).load_all().await.unwrap();
    assert_eq!(inventory.total_scans, 2);
    assert!(inventory.last_scan_time.is_some());
    assert_eq!(inventory.devices.len(), 1);
    let survivor = &inventory.devices[0];
    assert_eq!(survivor.ip_address, "192.168.1.5");
    assert!(survivor.is_online);
    assert_eq!(survivor.consecutive_missed_scans, 0);
}

#[tokio::test]
async fn test_cancelled_scan_leaves_inventory_untouched() {
    let lan = Arc::new(Lan::default());
    lan.set_up(&[11, 12, 13]);
    let repository = Arc::new(JsonDeviceRepository::memory_only());
    let sink = Arc::new(CollectingSink::new());
    let manager = manager(lan, repository.clone(), sink.clone());

    let cancel = CancelSignal::new();
    cancel.cancel();
    let result = manager.scan(None, &cancel).await.unwrap();

    assert!(!result.success);
    assert!(result.is_cancelled());
    let inventory = repository.load_all().await.unwrap();
    assert!(inventory.devices.is_empty());
    assert_eq!(inventory.total_scans, 0);

    let events = sink.take();
    assert!(lifecycle(&events).is_empty());
    assert_eq!(completed_counts(&events), Some((0, 0, 0)));
}

#[tokio::test]
async fn test_failed_save_reports_storage_error_without_completion() {
    let dir = tempfile::tempdir().unwrap();
    let parent = dir.path().join("state");
    let repository = Arc::new(JsonDeviceRepository::open(parent.join("devices.json")));
    assert!(repository.load_all().await.unwrap().devices.is_empty());

    // Block the write by putting a file where the directory should go.
    std::fs::write(&parent, "not a directory").unwrap();

    let lan = Arc::new(Lan::default());
    lan.set_up(&[13]);
    let sink = Arc::new(CollectingSink::new());
    let manager = manager(lan, repository.clone(), sink.clone());

    let outcome = manager.scan(None, &CancelSignal::new()).await;
    assert!(matches!(outcome, Err(DiscoverError::Storage(_))));
    assert!(!manager.is_scanning());

    let events = sink.take();
    assert_eq!(
        lifecycle(&events),
        vec![("DeviceDiscovered", "192.168.1.13".to_string())]
    );
    assert!(completed_counts(&events).is_none());

    // The in-memory inventory stays ahead of disk until a save succeeds.
    assert!(repository.is_dirty().await);
    let inventory = repository.load_all().await.unwrap();
    assert_eq!(inventory.devices.len(), 1);
    assert_eq!(inventory.total_scans, 1);
}
