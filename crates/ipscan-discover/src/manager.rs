//! Scan orchestration and device CRUD.
//!
//! [`DeviceManager`] ties the pieces together for one scan cycle:
//! interface selection, the sweep, reconciliation, persistence and
//! lifecycle events. Every read-modify-write of the inventory (scan
//! reconciliation and manual edits alike) runs under one async lock; the
//! sweep itself runs outside it so edits made during a long scan are not
//! blocked or lost.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use ipscan_core::subnet;
use ipscan_core::{
    CancelSignal, Device, DeviceId, EventSink, NetworkInterfaceDescriptor, ScanEvent,
    ScanFailure, ScanResult, Subnet,
};
use tokio::sync::Mutex;

use crate::config::{AppSettings, SettingsProvider};
use crate::error::{DiscoverError, Result};
use crate::interface::NetworkInterfaceProvider;
use crate::reconcile::{self, Reconciliation, RemovalPolicy};
use crate::repository::DeviceRepository;
use crate::scanner::NetworkScanner;

pub struct DeviceManager {
    scanner: NetworkScanner,
    interfaces: Arc<dyn NetworkInterfaceProvider>,
    repository: Arc<dyn DeviceRepository>,
    settings: Arc<dyn SettingsProvider>,
    sink: Arc<dyn EventSink>,
    inventory_lock: Mutex<()>,
    scanning: AtomicBool,
}

impl DeviceManager {
    pub fn new(
        scanner: NetworkScanner,
        interfaces: Arc<dyn NetworkInterfaceProvider>,
        repository: Arc<dyn DeviceRepository>,
        settings: Arc<dyn SettingsProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            scanner,
            interfaces,
            repository,
            settings,
            sink,
            inventory_lock: Mutex::new(()),
            scanning: AtomicBool::new(false),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    // ── Scanning ──────────────────────────────────────────────────

    /// Run one full scan cycle.
    ///
    /// Scan-level failures (no interface, cancellation, a scan already
    /// running) come back as `Ok` with `success == false`. `Err` means the
    /// inventory could not be loaded or saved; device events emitted before
    /// the failure stand and `ScanCompleted` is not emitted.
    pub async fn scan(&self, interface_id: Option<&str>, cancel: &CancelSignal) -> Result<ScanResult> {
        let Some(_guard) = ScanGuard::acquire(&self.scanning) else {
            tracing::warn!("Scan requested while another is running");
            return Ok(ScanResult::failed(ScanFailure::AlreadyRunning));
        };

        let settings = self.settings.settings();

        let Some(iface) = self.resolve_interface(interface_id, &settings) else {
            tracing::error!(requested = ?interface_id, "No suitable network interface found");
            let result = ScanResult::failed(ScanFailure::NoInterfaceFound);
            self.emit_completed(&result, &Reconciliation::default());
            return Ok(result);
        };

        let custom = custom_subnet(&settings);
        let mask_override = custom.map(|c| c.mask());
        let Some(subnet) = NetworkScanner::target_subnet(&iface, mask_override) else {
            tracing::error!(interface = %iface.name, "Interface has no IPv4 address");
            let mut result = ScanResult::failed(ScanFailure::NoSourceAddress);
            result.interface_id = iface.id.clone();
            self.emit_completed(&result, &Reconciliation::default());
            return Ok(result);
        };
        if let Some(custom) = custom.filter(|c| c.network() != subnet.network()) {
            tracing::warn!(
                custom = %custom,
                interface = %iface.name,
                scanning = %subnet,
                "Custom subnet is not the interface's network, only its prefix is used"
            );
        }

        tracing::info!(
            interface = %iface.name,
            %subnet,
            total = subnet.host_count(),
            "Starting scan"
        );
        self.sink.emit(ScanEvent::ScanStarted {
            subnet,
            interface_name: iface.name.clone(),
            total_addresses: u64::from(subnet.host_count()),
        });

        let result = self
            .scanner
            .scan(
                &iface,
                mask_override,
                settings.probe_timeout(),
                settings.concurrency(),
                cancel,
                Arc::clone(&self.sink),
            )
            .await;

        if !result.success {
            tracing::error!(
                error = ?result.error_message(),
                found = result.devices_found(),
                "Scan did not complete, skipping reconciliation"
            );
            self.emit_completed(&result, &Reconciliation::default());
            return Ok(result);
        }

        let outcome = {
            let _lock = self.inventory_lock.lock().await;
            let mut inventory = self.repository.load_all().await?;
            let outcome = reconcile::reconcile(
                &mut inventory,
                &result.discovered_devices,
                RemovalPolicy::from_settings(&settings),
                Utc::now(),
            );

            for event in outcome.events() {
                self.sink.emit(event);
            }

            if let Err(e) = self.repository.save_all(&inventory).await {
                tracing::error!(error = %e, "Failed to save inventory after scan");
                return Err(e.into());
            }
            outcome
        };

        tracing::info!(
            new = outcome.new_count(),
            updated = outcome.updated_count(),
            offline = outcome.marked_offline.len(),
            removed = outcome.removed_count(),
            duration_ms = result.duration().num_milliseconds(),
            "Scan complete"
        );
        self.emit_completed(&result, &outcome);

        Ok(result)
    }

    /// The explicit interface if given, else the preferred one from
    /// settings, else the default.
    pub fn resolve_interface(
        &self,
        interface_id: Option<&str>,
        settings: &AppSettings,
    ) -> Option<NetworkInterfaceDescriptor> {
        match interface_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self.interfaces.get_by_id(id),
            None => self
                .interfaces
                .preferred_interface(settings.preferred_interface()),
        }
    }

    fn emit_completed(&self, result: &ScanResult, outcome: &Reconciliation) {
        self.sink.emit(ScanEvent::ScanCompleted {
            result: result.clone(),
            new_devices_found: outcome.new_count(),
            devices_updated: outcome.updated_count(),
            devices_auto_removed: outcome.removed_count(),
        });
    }

    // ── Queries ───────────────────────────────────────────────────

    pub async fn all_devices(&self) -> Result<Vec<Device>> {
        Ok(self.repository.load_all().await?.devices)
    }

    /// `Some(true)` for online devices only, `Some(false)` for offline only.
    pub async fn devices(&self, online_only: Option<bool>) -> Result<Vec<Device>> {
        let devices = self.all_devices().await?;
        Ok(match online_only {
            Some(online) => devices.into_iter().filter(|d| d.is_online == online).collect(),
            None => devices,
        })
    }

    pub async fn device(&self, id: DeviceId) -> Result<Option<Device>> {
        Ok(self.repository.find_by_id(id).await?)
    }

    /// Look a device up by id, IP, display name or unique id prefix.
    pub async fn find_device(&self, query: &str) -> Result<Option<Device>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        let devices = self.all_devices().await?;

        if let Ok(uuid) = query.parse::<uuid::Uuid>() {
            if let Some(device) = devices.iter().find(|d| d.id == DeviceId(uuid)) {
                return Ok(Some(device.clone()));
            }
        }
        if let Some(device) = devices
            .iter()
            .find(|d| d.has_ip(query))
            .or_else(|| devices.iter().find(|d| d.display_name().eq_ignore_ascii_case(query)))
        {
            return Ok(Some(device.clone()));
        }

        let needle = query.to_ascii_lowercase();
        let mut by_prefix = devices.iter().filter(|d| d.id.to_string().starts_with(&needle));
        match (by_prefix.next(), by_prefix.next()) {
            (Some(device), None) => Ok(Some(device.clone())),
            _ => Ok(None),
        }
    }

    // ── Manual edits ──────────────────────────────────────────────

    /// Add a device by hand. The IP must be IPv4 and not already in use.
    pub async fn add_device(&self, device: Device) -> Result<Device> {
        let _lock = self.inventory_lock.lock().await;
        let device = self.validated(device).await?;
        let saved = self.repository.upsert(device).await?;

        tracing::info!(id = %saved.id, ip = %saved.ip_address, "Device added");
        self.sink.emit(ScanEvent::DeviceDiscovered {
            device: saved.clone(),
        });
        Ok(saved)
    }

    /// Replace a device's stored record.
    pub async fn update_device(&self, device: Device) -> Result<Device> {
        let _lock = self.inventory_lock.lock().await;
        let device = self.validated(device).await?;
        let saved = self.repository.upsert(device).await?;

        tracing::debug!(id = %saved.id, "Device updated");
        self.sink.emit(ScanEvent::DeviceUpdated {
            device: saved.clone(),
        });
        Ok(saved)
    }

    pub async fn remove_device(&self, id: DeviceId) -> Result<bool> {
        let _lock = self.inventory_lock.lock().await;
        let Some(device) = self.repository.find_by_id(id).await? else {
            return Ok(false);
        };

        let removed = self.repository.remove(id).await?;
        if removed {
            tracing::info!(id = %id, ip = %device.ip_address, "Device removed");
            self.sink.emit(ScanEvent::DeviceRemoved { device });
        }
        Ok(removed)
    }

    /// Offline devices that have missed at least the configured number of
    /// scans. Auto-removal does not need to be enabled.
    pub async fn missing_device_candidates(&self) -> Result<Vec<Device>> {
        let threshold = self.settings.settings().missed_scans_before_removal;
        let inventory = self.repository.load_all().await?;
        Ok(reconcile::missing_device_candidates(&inventory, threshold))
    }

    /// Remove every current missing-device candidate.
    pub async fn remove_missing_devices(&self) -> Result<Vec<Device>> {
        let _lock = self.inventory_lock.lock().await;
        let candidates = self.missing_device_candidates().await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let ids: Vec<DeviceId> = candidates.iter().map(|d| d.id).collect();
        self.repository.remove_many(&ids).await?;

        for device in &candidates {
            tracing::info!(
                name = %device.display_name(),
                ip = %device.ip_address,
                missed = device.consecutive_missed_scans,
                "Removed missing device"
            );
            self.sink.emit(ScanEvent::DeviceRemoved {
                device: device.clone(),
            });
        }
        Ok(candidates)
    }

    /// Normalize the IP and the online invariant, and reject an IP that
    /// another device already has.
    async fn validated(&self, mut device: Device) -> Result<Device> {
        let ip: Ipv4Addr = subnet::parse_ipv4(&device.ip_address)?;
        device.ip_address = ip.to_string();
        if device.is_online {
            device.consecutive_missed_scans = 0;
        }

        if let Some(other) = self.repository.find_by_ip(&device.ip_address).await? {
            if other.id != device.id {
                return Err(DiscoverError::DuplicateAddress(device.ip_address));
            }
        }
        Ok(device)
    }
}

/// The custom subnet setting, if one is configured and parses.
fn custom_subnet(settings: &AppSettings) -> Option<Subnet> {
    let cidr = settings.custom_cidr()?;
    let parsed = subnet::parse_cidr(cidr);
    if parsed.is_none() {
        tracing::warn!(cidr, "Ignoring invalid custom subnet");
    }
    parsed
}

/// Holds the single-scan flag for the lifetime of a scan.
struct ScanGuard<'a>(&'a AtomicBool);

impl<'a> ScanGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use ipscan_core::events::CollectingSink;
    use ipscan_core::{InterfaceType, ProbeResult};
    use tokio::sync::Notify;

    use crate::config::StaticSettings;
    use crate::interface::StaticInterfaces;
    use crate::probe::Prober;
    use crate::repository::JsonDeviceRepository;

    struct ScriptedProber {
        alive: std::sync::Mutex<HashSet<Ipv4Addr>>,
    }

    impl ScriptedProber {
        fn new(alive: &[&str]) -> Arc<Self> {
            let prober = Arc::new(Self {
                alive: std::sync::Mutex::new(HashSet::new()),
            });
            prober.set_alive(alive);
            prober
        }

        fn set_alive(&self, alive: &[&str]) {
            *self.alive.lock().unwrap() = alive.iter().map(|a| a.parse().unwrap()).collect();
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, addr: Ipv4Addr, _timeout: Duration) -> Option<ProbeResult> {
            let alive = self.alive.lock().unwrap().contains(&addr);
            alive.then(|| ProbeResult::new(addr, Duration::from_millis(1)))
        }
    }

    /// Blocks every probe until released.
    struct GatedProber {
        gate: Notify,
    }

    #[async_trait]
    impl Prober for GatedProber {
        async fn probe(&self, _addr: Ipv4Addr, _timeout: Duration) -> Option<ProbeResult> {
            self.gate.notified().await;
            None
        }
    }

    fn eth0() -> NetworkInterfaceDescriptor {
        NetworkInterfaceDescriptor {
            id: "eth0".to_string(),
            name: "eth0".to_string(),
            description: String::new(),
            interface_type: InterfaceType::Ethernet,
            ipv4_address: Some(Ipv4Addr::new(192, 168, 1, 100)),
            subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            mac_address: String::new(),
            is_up: true,
            speed: 0,
        }
    }

    fn manager_with(
        prober: Arc<dyn Prober>,
        interfaces: Vec<NetworkInterfaceDescriptor>,
        settings: AppSettings,
    ) -> (DeviceManager, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let manager = DeviceManager::new(
            NetworkScanner::new(prober),
            Arc::new(StaticInterfaces::new(interfaces)),
            Arc::new(JsonDeviceRepository::memory_only()),
            Arc::new(StaticSettings::new(settings)),
            sink.clone(),
        );
        (manager, sink)
    }

    fn kinds(events: &[ScanEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(ScanEvent::kind)
            .filter(|k| *k != "ScanProgress" && *k != "HostResponded")
            .collect()
    }

    #[tokio::test]
    async fn test_scan_without_interface() {
        let prober = ScriptedProber::new(&[]);
        let (manager, sink) = manager_with(prober, vec![], AppSettings::default());

        let result = manager.scan(None, &CancelSignal::new()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error, Some(ScanFailure::NoInterfaceFound));
        assert_eq!(kinds(&sink.events()), vec!["ScanCompleted"]);
        assert!(!manager.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_with_unknown_explicit_interface() {
        let prober = ScriptedProber::new(&[]);
        let (manager, _sink) = manager_with(prober, vec![eth0()], AppSettings::default());

        let result = manager.scan(Some("wlan7"), &CancelSignal::new()).await.unwrap();
        assert_eq!(result.error, Some(ScanFailure::NoInterfaceFound));
    }

    #[tokio::test]
    async fn test_custom_subnet_sets_mask() {
        let prober = ScriptedProber::new(&[]);
        let settings = AppSettings {
            subnet_mode: "custom".to_string(),
            custom_subnet: "192.168.1.0/28".to_string(),
            ..Default::default()
        };
        let (manager, sink) = manager_with(prober, vec![eth0()], settings);

        let result = manager.scan(None, &CancelSignal::new()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.subnet.unwrap().to_string(), "192.168.1.96/28");
        assert_eq!(result.total_addresses_scanned, 14);
        match &sink.events()[0] {
            ScanEvent::ScanStarted { total_addresses, interface_name, .. } => {
                assert_eq!(*total_addresses, 14);
                assert_eq!(interface_name, "eth0");
            }
            other => panic!("unexpected first event {other:?}"),
        }
    }

    /// Log output captured by a test-local subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn scan_with_custom_subnet(cidr: &str) -> (ScanResult, String) {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let settings = AppSettings {
            subnet_mode: "custom".to_string(),
            custom_subnet: cidr.to_string(),
            ..Default::default()
        };
        let (manager, _sink) = manager_with(ScriptedProber::new(&[]), vec![eth0()], settings);
        let result = manager.scan(None, &CancelSignal::new()).await.unwrap();

        let output = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        (result, output)
    }

    #[tokio::test]
    async fn test_custom_subnet_elsewhere_warns_and_keeps_interface_network() {
        let (result, logs) = scan_with_custom_subnet("192.168.5.0/24").await;

        assert!(result.success);
        assert_eq!(result.subnet.unwrap().to_string(), "192.168.1.0/24");
        assert!(logs.contains("Custom subnet is not the interface's network"), "{logs}");
        assert!(logs.contains("192.168.5.0/24"), "{logs}");
    }

    #[tokio::test]
    async fn test_custom_subnet_matching_interface_is_quiet() {
        let (result, logs) = scan_with_custom_subnet("192.168.1.0/24").await;

        assert!(result.success);
        assert!(!logs.contains("Custom subnet"), "{logs}");
    }

    #[tokio::test]
    async fn test_scan_reconciles_and_persists() {
        let prober = ScriptedProber::new(&["192.168.1.5", "192.168.1.9"]);
        let (manager, _sink) = manager_with(prober.clone(), vec![eth0()], AppSettings::default());

        manager.scan(None, &CancelSignal::new()).await.unwrap();
        prober.set_alive(&["192.168.1.9"]);
        manager.scan(None, &CancelSignal::new()).await.unwrap();

        let online = manager.devices(Some(true)).await.unwrap();
        let offline = manager.devices(Some(false)).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].ip_address, "192.168.1.9");
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].consecutive_missed_scans, 1);
        assert_eq!(manager.all_devices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_scan_while_running_is_rejected() {
        let prober = Arc::new(GatedProber { gate: Notify::new() });
        let (manager, _sink) = manager_with(prober.clone(), vec![eth0()], AppSettings::default());
        let manager = Arc::new(manager);
        let cancel = CancelSignal::new();

        let running = {
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.scan(None, &cancel).await })
        };
        while !manager.is_scanning() {
            tokio::task::yield_now().await;
        }

        let second = manager.scan(None, &CancelSignal::new()).await.unwrap();
        assert_eq!(second.error, Some(ScanFailure::AlreadyRunning));

        cancel.cancel();
        let first = running.await.unwrap().unwrap();
        assert!(first.is_cancelled());
        assert!(!manager.is_scanning());
    }

    #[tokio::test]
    async fn test_cancelled_scan_skips_reconciliation() {
        let prober = Arc::new(GatedProber { gate: Notify::new() });
        let (manager, sink) = manager_with(prober, vec![eth0()], AppSettings::default());
        manager.add_device(Device::new("192.168.1.20")).await.unwrap();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let result = manager.scan(None, &cancel).await.unwrap();

        assert!(result.is_cancelled());
        let device = manager.find_device("192.168.1.20").await.unwrap().unwrap();
        assert_eq!(device.consecutive_missed_scans, 0);
        assert_eq!(
            kinds(&sink.events()),
            vec!["DeviceDiscovered", "ScanStarted", "ScanCompleted"]
        );
    }

    #[tokio::test]
    async fn test_add_device_validation() {
        let (manager, _sink) = manager_with(ScriptedProber::new(&[]), vec![], AppSettings::default());

        let err = manager.add_device(Device::new("fe80::1")).await.unwrap_err();
        assert!(matches!(err, DiscoverError::Validation(_)));

        manager.add_device(Device::new(" 10.0.0.4 ")).await.unwrap();
        let err = manager.add_device(Device::new("10.0.0.4")).await.unwrap_err();
        assert!(matches!(err, DiscoverError::DuplicateAddress(ip) if ip == "10.0.0.4"));
    }

    #[tokio::test]
    async fn test_update_device_restores_invariant() {
        let (manager, sink) = manager_with(ScriptedProber::new(&[]), vec![], AppSettings::default());
        let mut device = manager.add_device(Device::new("10.0.0.4")).await.unwrap();

        device.name = "Printer".to_string();
        device.is_online = true;
        device.consecutive_missed_scans = 3;
        let saved = manager.update_device(device).await.unwrap();

        assert_eq!(saved.consecutive_missed_scans, 0);
        assert_eq!(manager.find_device("printer").await.unwrap().unwrap().id, saved.id);
        assert_eq!(kinds(&sink.events()), vec!["DeviceDiscovered", "DeviceUpdated"]);
    }

    #[tokio::test]
    async fn test_find_device_by_id_and_prefix() {
        let (manager, _sink) = manager_with(ScriptedProber::new(&[]), vec![], AppSettings::default());
        let device = manager.add_device(Device::new("10.0.0.4")).await.unwrap();
        let id = device.id.to_string();

        assert_eq!(manager.find_device(&id).await.unwrap().unwrap().id, device.id);
        assert_eq!(manager.find_device(&id[..8]).await.unwrap().unwrap().id, device.id);
        assert!(manager.find_device("").await.unwrap().is_none());
        assert!(manager.find_device("10.0.0.99").await.unwrap().is_none());
        assert_eq!(manager.device(device.id).await.unwrap().unwrap().ip_address, "10.0.0.4");
    }

    #[tokio::test]
    async fn test_remove_device() {
        let (manager, sink) = manager_with(ScriptedProber::new(&[]), vec![], AppSettings::default());
        let device = manager.add_device(Device::new("10.0.0.4")).await.unwrap();

        assert!(manager.remove_device(device.id).await.unwrap());
        assert!(!manager.remove_device(device.id).await.unwrap());
        assert_eq!(kinds(&sink.events()), vec!["DeviceDiscovered", "DeviceRemoved"]);
    }

    #[tokio::test]
    async fn test_remove_missing_devices_ignores_auto_flag() {
        let settings = AppSettings {
            missed_scans_before_removal: 2,
            ..Default::default()
        };
        let prober = ScriptedProber::new(&["192.168.1.5", "192.168.1.6"]);
        let (manager, _sink) = manager_with(prober.clone(), vec![eth0()], settings);

        manager.scan(None, &CancelSignal::new()).await.unwrap();
        prober.set_alive(&["192.168.1.6"]);
        manager.scan(None, &CancelSignal::new()).await.unwrap();
        assert!(manager.missing_device_candidates().await.unwrap().is_empty());
        manager.scan(None, &CancelSignal::new()).await.unwrap();

        let candidates = manager.missing_device_candidates().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].ip_address, "192.168.1.5");

        let removed = manager.remove_missing_devices().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(manager.all_devices().await.unwrap().len(), 1);
        assert!(manager.remove_missing_devices().await.unwrap().is_empty());
    }
}
