//! Scan and inventory settings.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Subnet mode value meaning "use the interface's own mask".
pub const SUBNET_MODE_AUTO: &str = "auto";

/// Top-level settings.
///
/// Loaded from the `[scan]` section of `ipscan.toml`, overridden by
/// `IPSCAN`-prefixed environment variables.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AppSettings {
    /// Run a scan as soon as the watcher starts.
    #[serde(default = "default_true")]
    pub scan_on_startup: bool,

    /// `"auto"` to scan the interface's own subnet, anything else to use
    /// `custom_subnet`.
    #[serde(default = "default_subnet_mode")]
    pub subnet_mode: String,

    /// CIDR used when `subnet_mode` is not `"auto"`.
    #[serde(default)]
    pub custom_subnet: String,

    /// Interface to scan from; empty for automatic selection.
    #[serde(default)]
    pub preferred_interface_id: String,

    /// Per-probe timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub scan_timeout_ms: u64,

    /// Maximum probes in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_scans: usize,

    /// Delete devices after `missed_scans_before_removal` missed scans.
    #[serde(default)]
    pub auto_remove_missing_devices: bool,

    #[serde(default = "default_missed_scans")]
    pub missed_scans_before_removal: u32,

    /// Include offline devices in listings.
    #[serde(default = "default_true")]
    pub show_offline_devices: bool,

    /// Name/description substrings that mark an interface as a VPN, on top
    /// of the built-in list.
    #[serde(default)]
    pub extra_vpn_patterns: Vec<String>,

    /// Where the device inventory is stored.
    #[serde(default = "default_inventory_path")]
    pub inventory_path: String,

    /// Seconds between scans in watch mode.
    #[serde(default = "default_interval")]
    pub scan_interval_secs: u64,
}

impl AppSettings {
    /// The custom CIDR, if custom subnet mode is active.
    pub fn custom_cidr(&self) -> Option<&str> {
        let custom = self.custom_subnet.trim();
        if self.subnet_mode.trim().eq_ignore_ascii_case(SUBNET_MODE_AUTO) || custom.is_empty() {
            None
        } else {
            Some(custom)
        }
    }

    pub fn concurrency(&self) -> usize {
        self.max_concurrent_scans.max(1)
    }

    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn preferred_interface(&self) -> Option<&str> {
        Some(self.preferred_interface_id.trim()).filter(|id| !id.is_empty())
    }
}

fn default_true() -> bool {
    true
}

fn default_subnet_mode() -> String {
    SUBNET_MODE_AUTO.to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    100
}

fn default_missed_scans() -> u32 {
    5
}

fn default_inventory_path() -> String {
    "ipscan-devices.json".to_string()
}

fn default_interval() -> u64 {
    300
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            scan_on_startup: default_true(),
            subnet_mode: default_subnet_mode(),
            custom_subnet: String::new(),
            preferred_interface_id: String::new(),
            scan_timeout_ms: default_timeout_ms(),
            max_concurrent_scans: default_max_concurrent(),
            auto_remove_missing_devices: false,
            missed_scans_before_removal: default_missed_scans(),
            show_offline_devices: default_true(),
            extra_vpn_patterns: Vec::new(),
            inventory_path: default_inventory_path(),
            scan_interval_secs: default_interval(),
        }
    }
}

/// Load settings from `<file_prefix>.toml` and the environment.
///
/// A missing file or missing `[scan]` section yields defaults.
pub fn load_settings(file_prefix: &str) -> Result<AppSettings> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("IPSCAN")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<AppSettings>("scan") {
        Ok(settings) => Ok(settings),
        Err(config::ConfigError::NotFound(_)) => Ok(AppSettings::default()),
        Err(e) => Err(e.into()),
    }
}

// ── Provider ──────────────────────────────────────────────────────

/// Source of the current settings, read at the start of every scan.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> AppSettings;
}

/// Settings held in memory and replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticSettings {
    settings: RwLock<AppSettings>,
}

impl StaticSettings {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn replace(&self, settings: AppSettings) {
        match self.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> AppSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
