//! ipscan-discover: Ping-sweep device discovery for the ipscan inventory.
//!
//! Sweeps the local IPv4 subnet with bounded concurrency, reconciles the
//! responders against a persisted device inventory, and tracks each
//! device's online/offline history across scans.

pub mod config;
pub mod error;
pub mod interface;
pub mod manager;
pub mod netif;
pub mod probe;
pub mod reconcile;
pub mod repository;
pub mod scanner;
pub mod scheduler;
