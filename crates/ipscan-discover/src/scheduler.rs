//! Periodic scanning.
//!
//! Runs a scan cycle on a fixed interval until cancelled. A failed cycle is
//! logged and the loop carries on; the next tick gets a fresh attempt.

use std::time::Duration;

use ipscan_core::CancelSignal;
use tokio::time::{interval, MissedTickBehavior};

use crate::manager::DeviceManager;

/// Scan every `every` until `cancel` fires. Returns the number of cycles
/// started.
///
/// The first cycle runs immediately when `run_immediately` is set, else
/// after one interval. Cancelling also aborts the cycle in progress.
pub async fn run_periodic(
    manager: &DeviceManager,
    every: Duration,
    interface_id: Option<&str>,
    run_immediately: bool,
    cancel: &CancelSignal,
) -> u64 {
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !run_immediately {
        ticker.tick().await;
    }

    tracing::info!(interval_secs = every.as_secs(), "Periodic scanning started");
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        cycles += 1;
        tracing::debug!(cycle = cycles, "Scheduled scan triggered");

        match manager.scan(interface_id, cancel).await {
            Ok(result) if result.success => {}
            Ok(result) if result.is_cancelled() => break,
            Ok(result) => {
                tracing::warn!(
                    cycle = cycles,
                    error = ?result.error_message(),
                    "Scheduled scan did not complete"
                );
            }
            Err(e) => {
                tracing::error!(cycle = cycles, error = %e, "Scheduled scan failed");
            }
        }
    }

    tracing::info!(cycles, "Periodic scanning stopped");
    cycles
}
