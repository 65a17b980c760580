//! Single-address reachability probes.
//!
//! The scanner only sees the [`Prober`] trait. [`IcmpProber`] is the real
//! implementation: an ICMP echo, then a best-effort reverse DNS lookup and
//! ARP cache read for hosts that answered.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ipscan_core::ProbeResult;
use surge_ping::{Client, Config, PingIdentifier, PingSequence};

use crate::error::{DiscoverError, Result};

const PING_PAYLOAD: [u8; 32] = [0u8; 32];

/// Upper bound on a reverse DNS lookup, independent of the probe timeout.
const DNS_TIMEOUT: Duration = Duration::from_secs(2);

const ARP_TABLE: &str = "/proc/net/arp";

/// Checks whether one address is reachable.
///
/// Implementations must return within roughly `timeout` and treat every
/// failure (unreachable, timed out, permission denied) as `None`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: Ipv4Addr, timeout: Duration) -> Option<ProbeResult>;
}

/// ICMP echo prober backed by `surge-ping`.
pub struct IcmpProber {
    client: Client,
    next_ident: AtomicU16,
    resolve_hostnames: bool,
    arp_table: Option<PathBuf>,
}

impl IcmpProber {
    /// Open the ICMP socket.
    ///
    /// Fails when the process may not open raw or datagram ICMP sockets
    /// (on Linux see `net.ipv4.ping_group_range` or `CAP_NET_RAW`).
    pub fn new() -> Result<Self> {
        let client = Client::new(&Config::default())
            .map_err(|e| DiscoverError::IcmpUnavailable(e.to_string()))?;

        let arp_table = Path::new(ARP_TABLE).exists().then(|| PathBuf::from(ARP_TABLE));

        Ok(Self {
            client,
            next_ident: AtomicU16::new(seed_ident()),
            resolve_hostnames: true,
            arp_table,
        })
    }

    /// Skip reverse DNS for responders.
    pub fn without_hostnames(mut self) -> Self {
        self.resolve_hostnames = false;
        self
    }

    async fn echo(&self, addr: Ipv4Addr, timeout: Duration) -> Option<Duration> {
        let ident = PingIdentifier(self.next_ident.fetch_add(1, Ordering::Relaxed));
        let started = Instant::now();

        let mut pinger = self.client.pinger(IpAddr::V4(addr), ident).await;
        pinger.timeout(timeout);

        match pinger.ping(PingSequence(0), &PING_PAYLOAD).await {
            Ok((_packet, rtt)) => Some(rtt.min(started.elapsed())),
            Err(e) => {
                tracing::trace!(%addr, error = %e, "No echo reply");
                None
            }
        }
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(&self, addr: Ipv4Addr, timeout: Duration) -> Option<ProbeResult> {
        let round_trip = self.echo(addr, timeout).await?;
        let mut result = ProbeResult::new(addr, round_trip);

        if self.resolve_hostnames {
            result.hostname = reverse_lookup(addr).await;
        }
        if let Some(table) = &self.arp_table {
            result.mac_address = arp_lookup(table, addr).await;
        }

        tracing::debug!(
            %addr,
            rtt_ms = round_trip.as_millis() as u64,
            hostname = ?result.hostname,
            "Host responded"
        );
        Some(result)
    }
}

fn seed_ident() -> u16 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % u32::from(u16::MAX)) as u16
}

// ── Enrichment ────────────────────────────────────────────────────

/// Reverse DNS for `addr`, `None` on failure or when the resolver just
/// echoes the address back.
pub async fn reverse_lookup(addr: Ipv4Addr) -> Option<String> {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&IpAddr::V4(addr)));

    match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
        Ok(Ok(Ok(hostname))) => {
            let hostname = hostname.trim_end_matches('.').to_string();
            (!hostname.is_empty() && hostname != addr.to_string()).then_some(hostname)
        }
        Ok(Ok(Err(_))) | Err(_) => None,
        Ok(Err(e)) => {
            tracing::warn!(%addr, error = %e, "DNS worker join failed");
            None
        }
    }
}

async fn arp_lookup(table: &Path, addr: Ipv4Addr) -> Option<String> {
    let contents = tokio::fs::read_to_string(table).await.ok()?;
    parse_arp_table(&contents, addr)
}

/// Find the hardware address for `addr` in `/proc/net/arp` contents.
///
/// Incomplete entries (all-zero address) are ignored. The result is
/// upper-cased and colon-separated.
pub fn parse_arp_table(contents: &str, addr: Ipv4Addr) -> Option<String> {
    let wanted = addr.to_string();

    contents.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let ip = fields.next()?;
        if ip != wanted {
            return None;
        }
        let mac = fields.nth(2)?;
        if mac == "00:00:00:00:00:00" || mac.split(':').count() != 6 {
            return None;
        }
        Some(mac.to_ascii_uppercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP_SAMPLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         a4:91:b1:0c:22:7e     *        eth0
192.168.1.23     0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.40     0x1         0x2         3c:22:fb:9a:10:01     *        wlan0
";

    #[test]
    fn test_parse_arp_table_finds_entry() {
        let mac = parse_arp_table(ARP_SAMPLE, Ipv4Addr::new(192, 168, 1, 40));
        assert_eq!(mac.as_deref(), Some("3C:22:FB:9A:10:01"));
    }

    #[test]
    fn test_parse_arp_table_skips_incomplete() {
        assert_eq!(parse_arp_table(ARP_SAMPLE, Ipv4Addr::new(192, 168, 1, 23)), None);
    }

    #[test]
    fn test_parse_arp_table_exact_match_only() {
        // 192.168.1.4 is a prefix of 192.168.1.40 and must not match it.
        assert_eq!(parse_arp_table(ARP_SAMPLE, Ipv4Addr::new(192, 168, 1, 4)), None);
        assert_eq!(parse_arp_table("", Ipv4Addr::new(192, 168, 1, 1)), None);
    }

    #[tokio::test]
    async fn test_arp_lookup_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arp");
        std::fs::write(&path, ARP_SAMPLE).unwrap();

        let mac = arp_lookup(&path, Ipv4Addr::new(192, 168, 1, 1)).await;
        assert_eq!(mac.as_deref(), Some("A4:91:B1:0C:22:7E"));

        let missing = arp_lookup(&dir.path().join("nope"), Ipv4Addr::new(192, 168, 1, 1)).await;
        assert_eq!(missing, None);
    }
}
