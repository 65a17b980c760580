//! Host interface enumeration via `pnet`.
//!
//! Linux extras (default gateway, link speed, wireless detection) come
//! from `/proc` and `/sys` and are simply absent elsewhere.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use ipscan_core::{InterfaceType, NetworkInterfaceDescriptor};
use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use pnet::util::MacAddr;

use crate::interface::{NetworkInterfaceProvider, VpnClassifier};

const ROUTE_TABLE: &str = "/proc/net/route";
const SYS_CLASS_NET: &str = "/sys/class/net";

const VIRTUAL_NAME_HINTS: &[&str] = &[
    "docker", "veth", "virbr", "br-", "vmnet", "vboxnet", "hyper-v", "vethernet", "vmware",
    "virtualbox", "wsl",
];

/// Interfaces as reported by the operating system.
#[derive(Debug, Clone, Default)]
pub struct SystemInterfaceProvider {
    classifier: VpnClassifier,
}

impl SystemInterfaceProvider {
    pub fn new(classifier: VpnClassifier) -> Self {
        Self { classifier }
    }

    fn describe(
        &self,
        iface: &NetworkInterface,
        gateways: &HashMap<String, Ipv4Addr>,
    ) -> NetworkInterfaceDescriptor {
        let ipv4 = iface.ips.iter().find_map(|net| match net {
            IpNetwork::V4(v4) if !v4.ip().is_unspecified() => Some(*v4),
            _ => None,
        });

        let hints = LinkHints {
            loopback: iface.is_loopback(),
            point_to_point: iface.is_point_to_point(),
            wireless: is_wireless(&iface.name),
            physical: is_physical(&iface.name),
        };

        NetworkInterfaceDescriptor {
            id: iface.name.clone(),
            name: iface.name.clone(),
            description: iface.description.clone(),
            interface_type: classify(&iface.name, &iface.description, hints, &self.classifier),
            ipv4_address: ipv4.map(|net| net.ip()),
            subnet_mask: ipv4.map(|net| net.mask()),
            gateway: gateways.get(&iface.name).copied(),
            mac_address: iface.mac.map(format_mac).unwrap_or_default(),
            is_up: iface.is_up(),
            speed: link_speed(&iface.name),
        }
    }
}

impl NetworkInterfaceProvider for SystemInterfaceProvider {
    fn list_interfaces(&self) -> Vec<NetworkInterfaceDescriptor> {
        let gateways = std::fs::read_to_string(ROUTE_TABLE)
            .map(|table| parse_default_gateways(&table))
            .unwrap_or_default();

        let interfaces: Vec<NetworkInterfaceDescriptor> = datalink::interfaces()
            .iter()
            .map(|iface| self.describe(iface, &gateways))
            .collect();

        tracing::debug!(count = interfaces.len(), "Enumerated network interfaces");
        interfaces
    }
}

// ── Classification ───────────────────────────────────────────────

/// Facts about a link that come from flags or sysfs rather than its name.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkHints {
    pub loopback: bool,
    pub point_to_point: bool,
    pub wireless: bool,
    pub physical: bool,
}

/// Coarse type of an interface. Tunnels (point-to-point links) count as VPN.
pub fn classify(
    name: &str,
    description: &str,
    hints: LinkHints,
    classifier: &VpnClassifier,
) -> InterfaceType {
    let lower = name.to_lowercase();

    if hints.loopback {
        InterfaceType::Loopback
    } else if hints.point_to_point || classifier.is_vpn(name, description) {
        InterfaceType::Vpn
    } else if hints.wireless || lower.starts_with("wl") || lower.contains("wi-fi") {
        InterfaceType::Wireless
    } else if VIRTUAL_NAME_HINTS.iter().any(|hint| lower.contains(hint)) {
        InterfaceType::Virtual
    } else if hints.physical || lower.starts_with("eth") || lower.starts_with("en") {
        InterfaceType::Ethernet
    } else {
        InterfaceType::Other
    }
}

/// `AA:BB:CC:DD:EE:FF`
pub fn format_mac(mac: MacAddr) -> String {
    let MacAddr(a, b, c, d, e, f) = mac;
    format!("{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{f:02X}")
}

// ── Linux sysfs/procfs ───────────────────────────────────────────

/// Default-route gateways per interface from `/proc/net/route` contents.
///
/// Addresses in that file are little-endian hex.
pub fn parse_default_gateways(table: &str) -> HashMap<String, Ipv4Addr> {
    let mut gateways = HashMap::new();

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [iface, destination, gateway, ..] = fields.as_slice() else {
            continue;
        };
        if *destination != "00000000" {
            continue;
        }
        let Ok(raw) = u32::from_str_radix(gateway, 16) else {
            continue;
        };
        let addr = Ipv4Addr::from(raw.swap_bytes());
        if !addr.is_unspecified() {
            gateways.entry(iface.to_string()).or_insert(addr);
        }
    }

    gateways
}

fn is_wireless(name: &str) -> bool {
    Path::new(SYS_CLASS_NET).join(name).join("wireless").exists()
}

fn is_physical(name: &str) -> bool {
    Path::new(SYS_CLASS_NET).join(name).join("device").exists()
}

/// Link speed in bits per second, 0 when unknown.
fn link_speed(name: &str) -> u64 {
    std::fs::read_to_string(Path::new(SYS_CLASS_NET).join(name).join("speed"))
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|mbps| *mbps > 0)
        .map(|mbps| mbps as u64 * 1_000_000)
        .unwrap_or(0)
}
