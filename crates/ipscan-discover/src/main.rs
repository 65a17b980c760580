//! CLI entry point for the ipscan device inventory.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::{fmt, EnvFilter};

use ipscan_core::events::ChannelSink;
use ipscan_core::{subnet, CancelSignal, Device, EventSink, ProbeResult, ScanEvent};

use ipscan_discover::config::{load_settings, AppSettings, StaticSettings};
use ipscan_discover::interface::{NetworkInterfaceProvider, VpnClassifier};
use ipscan_discover::manager::DeviceManager;
use ipscan_discover::netif::SystemInterfaceProvider;
use ipscan_discover::probe::{IcmpProber, Prober};
use ipscan_discover::repository::JsonDeviceRepository;
use ipscan_discover::scanner::NetworkScanner;
use ipscan_discover::scheduler;

#[derive(Parser)]
#[command(name = "ipscan")]
#[command(about = "Discover and track devices on the local IPv4 network")]
struct Cli {
    /// Config file prefix (default: ipscan, i.e. ./ipscan.toml).
    #[arg(short, long, global = true, default_value = "ipscan")]
    config: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scan and update the inventory.
    Scan {
        /// Interface id to scan from (default: automatic).
        #[arg(short, long)]
        interface: Option<String>,

        /// Custom subnet in CIDR notation; its prefix sets the scan mask.
        #[arg(short, long)]
        subnet: Option<String>,

        /// Per-probe timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Maximum probes in flight.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print the result as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Scan periodically until interrupted.
    Watch {
        #[arg(short, long)]
        interface: Option<String>,

        /// Seconds between scans (default: from settings).
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List known devices.
    List {
        /// Include offline devices.
        #[arg(short, long, conflicts_with = "online")]
        offline: bool,

        /// Only online devices.
        #[arg(long)]
        online: bool,

        #[arg(long)]
        json: bool,
    },
    /// Show one device by id, id prefix, IP, or name.
    Show { device: String },
    /// Remove one device by id, id prefix, IP, or name.
    Remove { device: String },
    /// Remove devices that have missed too many scans.
    Prune,
    /// List network interfaces.
    Interfaces {
        /// Include down, loopback, and VPN interfaces.
        #[arg(long)]
        all: bool,
    },
    /// Print the effective settings.
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = load_settings(&cli.config)?;

    match cli.command {
        Command::Scan {
            interface,
            subnet: custom,
            timeout_ms,
            concurrency,
            json,
        } => {
            let mut settings = settings;
            if let Some(cidr) = custom {
                if subnet::parse_cidr(&cidr).is_none() {
                    anyhow::bail!("Invalid CIDR notation: {cidr}");
                }
                settings.subnet_mode = "custom".to_string();
                settings.custom_subnet = cidr;
            }
            if let Some(ms) = timeout_ms {
                settings.scan_timeout_ms = ms;
            }
            if let Some(n) = concurrency {
                settings.max_concurrent_scans = n;
            }
            run_scan(settings, interface.as_deref(), json).await
        }
        Command::Watch { interface, interval } => {
            let every = Duration::from_secs(interval.unwrap_or(settings.scan_interval_secs));
            run_watch(settings, interface.as_deref(), every).await
        }
        Command::List {
            offline,
            online,
            json,
        } => {
            let include_offline = !online && (offline || settings.show_offline_devices);
            let manager = query_manager(settings);
            let mut devices = manager
                .devices(if include_offline { None } else { Some(true) })
                .await?;
            devices.sort_by_key(ip_sort_key);

            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                print_device_table(&devices);
            }
            Ok(())
        }
        Command::Show { device } => {
            let manager = query_manager(settings);
            let found = manager
                .find_device(&device)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No device matches '{device}'"))?;
            print_device(&found);
            Ok(())
        }
        Command::Remove { device } => {
            let manager = query_manager(settings);
            let found = manager
                .find_device(&device)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No device matches '{device}'"))?;
            manager.remove_device(found.id).await?;
            println!("Removed {} ({})", found.display_name(), found.ip_address);
            Ok(())
        }
        Command::Prune => {
            let threshold = settings.missed_scans_before_removal;
            let manager = query_manager(settings);
            let removed = manager.remove_missing_devices().await?;
            for device in &removed {
                println!("Removed {} ({})", device.display_name(), device.ip_address);
            }
            println!(
                "{} device(s) removed after {threshold}+ missed scans",
                removed.len()
            );
            Ok(())
        }
        Command::Interfaces { all } => {
            print_interfaces(&settings, all);
            Ok(())
        }
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ── Wiring ────────────────────────────────────────────────────────

/// Stands in for ICMP in commands that never scan, so they work without
/// raw-socket privileges.
struct NoProbe;

#[async_trait]
impl Prober for NoProbe {
    async fn probe(&self, _addr: Ipv4Addr, _timeout: Duration) -> Option<ProbeResult> {
        None
    }
}

fn build_manager(
    settings: AppSettings,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn EventSink>,
) -> DeviceManager {
    let classifier = VpnClassifier::with_extra(&settings.extra_vpn_patterns);
    let repository = JsonDeviceRepository::open(&settings.inventory_path);

    DeviceManager::new(
        NetworkScanner::new(prober),
        Arc::new(SystemInterfaceProvider::new(classifier)),
        Arc::new(repository),
        Arc::new(StaticSettings::new(settings)),
        sink,
    )
}

fn query_manager(settings: AppSettings) -> DeviceManager {
    build_manager(settings, Arc::new(NoProbe), Arc::new(ipscan_core::events::NoopSink))
}

/// Cancel `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: CancelSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

async fn run_scan(settings: AppSettings, interface: Option<&str>, json: bool) -> anyhow::Result<()> {
    let prober = IcmpProber::new()?;
    let (sink, rx) = ChannelSink::new();
    let printer = tokio::spawn(print_events(rx, json));

    let manager = build_manager(settings, Arc::new(prober), Arc::new(sink));
    let cancel = CancelSignal::new();
    cancel_on_interrupt(cancel.clone());

    let outcome = manager.scan(interface, &cancel).await;
    drop(manager);
    printer.await?;

    let result = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    match result.error {
        None => Ok(()),
        Some(_) if result.is_cancelled() => Ok(()),
        Some(failure) => anyhow::bail!("{failure}"),
    }
}

async fn run_watch(settings: AppSettings, interface: Option<&str>, every: Duration) -> anyhow::Result<()> {
    let prober = IcmpProber::new()?;
    let run_immediately = settings.scan_on_startup;
    let (sink, rx) = ChannelSink::new();
    let printer = tokio::spawn(print_events(rx, false));

    let manager = build_manager(settings, Arc::new(prober), Arc::new(sink));
    let cancel = CancelSignal::new();
    cancel_on_interrupt(cancel.clone());

    let cycles = scheduler::run_periodic(&manager, every, interface, run_immediately, &cancel).await;
    drop(manager);
    printer.await?;

    println!("Stopped after {cycles} scan(s)");
    Ok(())
}

// ── Output ────────────────────────────────────────────────────────

async fn print_events(mut rx: UnboundedReceiver<ScanEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if quiet {
            continue;
        }
        match event {
            ScanEvent::ScanStarted {
                subnet,
                interface_name,
                total_addresses,
            } => {
                println!("Scanning {subnet} on {interface_name} ({total_addresses} addresses)");
            }
            ScanEvent::ScanProgress(progress) => {
                eprint!(
                    "\r  {:>3}%  {}/{} scanned, {} found",
                    progress.percent(),
                    progress.scanned_count,
                    progress.total_count,
                    progress.devices_found
                );
            }
            ScanEvent::HostResponded(_) => {}
            ScanEvent::DeviceDiscovered { device } => print_change("new", &device),
            ScanEvent::DeviceUpdated { device } if device.is_online => print_change("online", &device),
            ScanEvent::DeviceUpdated { device } => print_change("offline", &device),
            ScanEvent::DeviceRemoved { device } => print_change("removed", &device),
            ScanEvent::ScanCompleted {
                result,
                new_devices_found,
                devices_updated,
                devices_auto_removed,
            } => {
                eprintln!();
                match result.error_message() {
                    None => println!(
                        "Scan complete in {} ms: {} responding, {new_devices_found} new, \
                         {devices_updated} updated, {devices_auto_removed} removed",
                        result.duration().num_milliseconds(),
                        result.devices_found(),
                    ),
                    Some(reason) => println!("Scan failed: {reason}"),
                }
            }
        }
    }
}

fn print_change(label: &str, device: &Device) {
    eprint!("\r");
    println!("  {label:<8} {:<15} {}", device.ip_address, device.display_name());
}

fn ip_sort_key(device: &Device) -> (u32, String) {
    let numeric = device
        .ip_address
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .unwrap_or(u32::MAX);
    (numeric, device.ip_address.clone())
}

fn print_device_table(devices: &[Device]) {
    if devices.is_empty() {
        println!("No devices.");
        return;
    }

    println!(
        "{:<8}  {:<7}  {:<15}  {:<17}  {:<19}  NAME",
        "ID", "STATUS", "IP", "MAC", "LAST SEEN"
    );
    for device in devices {
        let id = device.id.to_string();
        println!(
            "{:<8}  {:<7}  {:<15}  {:<17}  {:<19}  {}",
            &id[..8],
            if device.is_online { "online" } else { "offline" },
            device.ip_address,
            device.mac_address.as_deref().unwrap_or("-"),
            device.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            device.display_name(),
        );
    }
}

fn print_device(device: &Device) {
    println!("{}", device.display_name());
    println!("  id:             {}", device.id);
    println!("  ip:             {}", device.ip_address);
    println!("  hostname:       {}", device.hostname.as_deref().unwrap_or("-"));
    println!("  mac:            {}", device.mac_address.as_deref().unwrap_or("-"));
    println!(
        "  status:         {}",
        if device.is_online { "online" } else { "offline" }
    );
    println!("  first seen:     {}", device.first_discovered.to_rfc3339());
    println!("  last seen:      {}", device.last_seen.to_rfc3339());
    println!("  missed scans:   {}", device.consecutive_missed_scans);
    if !device.notes.trim().is_empty() {
        println!("  notes:          {}", device.notes);
    }
}

fn print_interfaces(settings: &AppSettings, all: bool) {
    let provider = SystemInterfaceProvider::new(VpnClassifier::with_extra(&settings.extra_vpn_patterns));
    let default_id = provider
        .preferred_interface(settings.preferred_interface())
        .map(|iface| iface.id);
    let interfaces = if all {
        provider.list_interfaces()
    } else {
        provider.active_interfaces()
    };

    if interfaces.is_empty() {
        println!("No interfaces.");
        return;
    }

    for iface in interfaces {
        let marker = if default_id.as_deref() == Some(iface.id.as_str()) { "*" } else { " " };
        let address = match (iface.ipv4_address, iface.subnet_mask) {
            (Some(ip), Some(mask)) => format!("{ip}/{}", subnet::prefix_length(mask)),
            (Some(ip), None) => ip.to_string(),
            _ => "-".to_string(),
        };
        let gateway = iface
            .gateway
            .map(|gw| gw.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{marker} {:<16} {:<9} {:<4} {:<18} gw {:<15} {}",
            iface.name,
            iface.interface_type.to_string(),
            if iface.is_up { "up" } else { "down" },
            address,
            gateway,
            iface.mac_address,
        );
    }
}
