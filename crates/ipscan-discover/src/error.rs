//! Error types for the ipscan-discover crate.

use ipscan_core::ValidationError;
use thiserror::Error;

use crate::repository::StorageError;

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("Another device already uses {0}")]
    DuplicateAddress(String),

    #[error("Failed to persist device inventory: {0}")]
    Storage(#[from] StorageError),

    #[error("ICMP probing unavailable: {0}")]
    IcmpUnavailable(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
