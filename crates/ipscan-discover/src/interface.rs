//! Network interface selection.
//!
//! Raw enumeration is the provider's job (see `netif` for the OS-backed
//! one). The selection policy on top of it lives here so every provider
//! picks the same default.

use ipscan_core::{InterfaceType, NetworkInterfaceDescriptor};

/// Source of host network interfaces.
pub trait NetworkInterfaceProvider: Send + Sync {
    /// Every interface the host reports, including down and loopback ones.
    fn list_interfaces(&self) -> Vec<NetworkInterfaceDescriptor>;

    fn get_by_id(&self, id: &str) -> Option<NetworkInterfaceDescriptor> {
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        self.list_interfaces().into_iter().find(|i| i.id == id)
    }

    /// Interfaces a scan could run from: up, with an IPv4 address,
    /// neither loopback nor VPN.
    fn active_interfaces(&self) -> Vec<NetworkInterfaceDescriptor> {
        self.list_interfaces()
            .into_iter()
            .filter(is_scannable)
            .collect()
    }

    fn default_interface(&self) -> Option<NetworkInterfaceDescriptor> {
        select_default(&self.active_interfaces())
    }

    /// The preferred interface if it exists and is up, else the default.
    fn preferred_interface(&self, preferred_id: Option<&str>) -> Option<NetworkInterfaceDescriptor> {
        if let Some(id) = preferred_id.map(str::trim).filter(|id| !id.is_empty()) {
            match self.get_by_id(id) {
                Some(iface) if iface.is_up => {
                    tracing::debug!(name = %iface.name, "Using preferred interface");
                    return Some(iface);
                }
                _ => tracing::warn!(
                    id,
                    "Preferred interface not found or not up, falling back to default"
                ),
            }
        }
        self.default_interface()
    }
}

fn is_scannable(iface: &NetworkInterfaceDescriptor) -> bool {
    iface.is_up && iface.ipv4_address.is_some() && !iface.is_loopback() && !iface.is_vpn()
}

/// Pick the interface most likely to face the LAN.
///
/// Interfaces with a gateway win, Ethernet before Wireless before anything
/// else. Without any gateway, Ethernet is preferred, then whatever is left.
pub fn select_default(active: &[NetworkInterfaceDescriptor]) -> Option<NetworkInterfaceDescriptor> {
    let candidates: Vec<&NetworkInterfaceDescriptor> =
        active.iter().filter(|i| is_scannable(i)).collect();
    let with_gateway: Vec<&NetworkInterfaceDescriptor> =
        candidates.iter().copied().filter(|i| i.has_gateway()).collect();

    fn of_type<'a>(
        list: &[&'a NetworkInterfaceDescriptor],
        ty: InterfaceType,
    ) -> Option<&'a NetworkInterfaceDescriptor> {
        list.iter().copied().find(|i| i.interface_type == ty)
    }

    if let Some(iface) = of_type(&with_gateway, InterfaceType::Ethernet)
        .or_else(|| of_type(&with_gateway, InterfaceType::Wireless))
        .or_else(|| with_gateway.first().copied())
    {
        tracing::info!(
            name = %iface.name,
            kind = %iface.interface_type,
            gateway = ?iface.gateway,
            "Selected default interface"
        );
        return Some(iface.clone());
    }

    if let Some(iface) = of_type(&candidates, InterfaceType::Ethernet).or_else(|| candidates.first().copied()) {
        tracing::warn!(
            name = %iface.name,
            kind = %iface.interface_type,
            "Selected default interface without a gateway"
        );
        return Some(iface.clone());
    }

    tracing::error!("No suitable network interface found");
    None
}

// ── VPN classification ───────────────────────────────────────────

const DEFAULT_VPN_PATTERNS: &[&str] = &[
    "tailscale",
    "wireguard",
    "wg",
    "openvpn",
    "tap-windows",
    "tap0901",
    "tun",
    "vpn",
    "pptp",
    "l2tp",
    "ipsec",
    "cisco anyconnect",
    "sonicwall",
    "fortinet",
    "palo alto",
    "globalprotect",
    "checkpoint",
    "nordvpn",
    "expressvpn",
    "protonvpn",
    "private internet access",
    "hamachi",
    "zerotier",
    "virtual private",
    "utun",
    "ppp",
];

/// Best-effort VPN detection by interface name/description.
///
/// This is a heuristic filter, not a security boundary. Patterns of three
/// characters or fewer (`wg`, `tun`, `ppp`) only match at the start of the
/// interface name; longer ones match anywhere in name or description.
#[derive(Debug, Clone)]
pub struct VpnClassifier {
    patterns: Vec<String>,
}

impl Default for VpnClassifier {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_VPN_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl VpnClassifier {
    /// Built-in patterns plus `extra`.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classifier = Self::default();
        classifier.patterns.extend(
            extra
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty()),
        );
        classifier
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_vpn(&self, name: &str, description: &str) -> bool {
        let name = name.to_lowercase();
        let description = description.to_lowercase();

        self.patterns.iter().any(|pattern| {
            if pattern.len() <= 3 {
                name.starts_with(pattern.as_str())
            } else {
                name.contains(pattern.as_str()) || description.contains(pattern.as_str())
            }
        })
    }
}

/// Fixed interface list.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces {
    interfaces: Vec<NetworkInterfaceDescriptor>,
}

impl StaticInterfaces {
    pub fn new(interfaces: Vec<NetworkInterfaceDescriptor>) -> Self {
        Self { interfaces }
    }
}

impl NetworkInterfaceProvider for StaticInterfaces {
    fn list_interfaces(&self) -> Vec<NetworkInterfaceDescriptor> {
        self.interfaces.clone()
    }
}
