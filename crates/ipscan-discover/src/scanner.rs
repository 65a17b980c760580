//! Bounded-concurrency ping sweep.
//!
//! Every host address of the subnet gets one probe. At most
//! `max_concurrency` probes are in flight: a task is only spawned once it
//! holds a semaphore permit, so memory stays flat even for a /8.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ipscan_core::subnet::{self, DEFAULT_MASK};
use ipscan_core::{
    CancelSignal, EventSink, NetworkInterfaceDescriptor, ProbeResult, ScanEvent, ScanFailure,
    ScanProgress, ScanResult, Subnet,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::probe::Prober;

/// Emit progress every this many completed probes.
const PROGRESS_EVERY: u64 = 10;

/// Sweeps subnets with a pluggable [`Prober`].
#[derive(Clone)]
pub struct NetworkScanner {
    prober: Arc<dyn Prober>,
}

impl NetworkScanner {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// Probe a single address. `None` if unreachable or cancelled.
    pub async fn probe(
        &self,
        addr: Ipv4Addr,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Option<ProbeResult> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.prober.probe(addr, timeout) => result,
        }
    }

    /// Sweep the subnet the interface sits on.
    ///
    /// `mask_override` replaces the interface's own mask; with neither, a /24
    /// is assumed.
    pub async fn scan(
        &self,
        iface: &NetworkInterfaceDescriptor,
        mask_override: Option<Ipv4Addr>,
        timeout: Duration,
        max_concurrency: usize,
        cancel: &CancelSignal,
        sink: Arc<dyn EventSink>,
    ) -> ScanResult {
        let Some(subnet) = Self::target_subnet(iface, mask_override) else {
            tracing::error!(interface = %iface.name, "Interface has no IPv4 address");
            let mut result = ScanResult::failed(ScanFailure::NoSourceAddress);
            result.interface_id = iface.id.clone();
            return result;
        };

        self.sweep(subnet, &iface.id, timeout, max_concurrency, cancel, sink)
            .await
    }

    /// The subnet [`NetworkScanner::scan`] would sweep for this interface,
    /// `None` if it has no IPv4 address.
    pub fn target_subnet(
        iface: &NetworkInterfaceDescriptor,
        mask_override: Option<Ipv4Addr>,
    ) -> Option<Subnet> {
        let source = iface.ipv4_address?;
        let mask = mask_override.or(iface.subnet_mask).unwrap_or(DEFAULT_MASK);
        Some(Subnet::from_ip_mask(source, mask))
    }

    /// Sweep an arbitrary CIDR, e.g. `"10.0.4.0/22"`.
    pub async fn scan_cidr(
        &self,
        cidr: &str,
        timeout: Duration,
        max_concurrency: usize,
        cancel: &CancelSignal,
        sink: Arc<dyn EventSink>,
    ) -> ScanResult {
        match subnet::parse_cidr(cidr) {
            Some(subnet) => {
                self.sweep(subnet, "", timeout, max_concurrency, cancel, sink)
                    .await
            }
            None => {
                tracing::error!(cidr, "Invalid CIDR notation");
                ScanResult::failed(ScanFailure::Other(format!(
                    "Invalid CIDR notation: {cidr}"
                )))
            }
        }
    }

    async fn sweep(
        &self,
        subnet: Subnet,
        interface_id: &str,
        timeout: Duration,
        max_concurrency: usize,
        cancel: &CancelSignal,
        sink: Arc<dyn EventSink>,
    ) -> ScanResult {
        let mut result = ScanResult::started(Some(subnet), interface_id);
        let shared = Arc::new(SweepState {
            total: u64::from(subnet.host_count()),
            scanned: AtomicU64::new(0),
            found: AtomicU64::new(0),
            discovered: Mutex::new(Vec::new()),
            progress_gate: StdMutex::new(()),
            sink,
        });

        tracing::info!(
            %subnet,
            total = shared.total,
            concurrency = max_concurrency.max(1),
            timeout_ms = timeout.as_millis() as u64,
            "Starting sweep"
        );

        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut stopped_early = false;

        for addr in subnet.hosts() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped_early = true;
                    break;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        stopped_early = true;
                        break;
                    }
                },
            };

            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            let prober = Arc::clone(&self.prober);
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    outcome = prober.probe(addr, timeout) => outcome,
                };
                shared.record(addr, outcome).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            log_join_error(joined);
        }

        result.end_time = chrono::Utc::now();
        result.total_addresses_scanned = shared.total;
        let completed = shared.scanned.load(Ordering::SeqCst);
        result.discovered_devices = std::mem::take(&mut *shared.discovered.lock().await);

        if stopped_early || cancel.is_cancelled() {
            result.error = Some(ScanFailure::Cancelled);
            tracing::warn!(
                %subnet,
                completed,
                total = shared.total,
                found = result.devices_found(),
                "Sweep cancelled"
            );
        } else {
            result.success = true;
            tracing::info!(
                %subnet,
                scanned = completed,
                found = result.devices_found(),
                duration_ms = result.duration().num_milliseconds(),
                "Sweep complete"
            );
        }

        result
    }
}

/// State shared by every probe task of one sweep.
struct SweepState {
    total: u64,
    scanned: AtomicU64,
    found: AtomicU64,
    discovered: Mutex<Vec<ProbeResult>>,
    /// Serializes progress emission so observers never see counts go back.
    progress_gate: StdMutex<()>,
    sink: Arc<dyn EventSink>,
}

impl SweepState {
    async fn record(&self, addr: Ipv4Addr, outcome: Option<ProbeResult>) {
        let hit = outcome.is_some();

        if let Some(probe) = outcome {
            self.found.fetch_add(1, Ordering::SeqCst);
            self.discovered.lock().await.push(probe.clone());
            self.sink.emit(ScanEvent::HostResponded(probe));
        }

        let done = self.scanned.fetch_add(1, Ordering::SeqCst) + 1;
        if hit || done % PROGRESS_EVERY == 0 || done == self.total {
            self.emit_progress(addr);
        }
    }

    fn emit_progress(&self, addr: Ipv4Addr) {
        let _gate = self
            .progress_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.sink.emit(ScanEvent::ScanProgress(ScanProgress {
            current_address: Some(addr),
            scanned_count: self.scanned.load(Ordering::SeqCst),
            total_count: self.total,
            devices_found: self.found.load(Ordering::SeqCst),
        }));
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            tracing::warn!(error = %e, "Probe task failed");
        }
    }
}
