use thiserror::Error;

/// Rejected input to the subnet arithmetic and device model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Only IPv4 addresses are supported: {0}")]
    NotIpv4(String),

    #[error("Prefix length must be between 0 and 32, got {0}")]
    PrefixOutOfRange(u32),

    #[error("Malformed CIDR notation: {0}")]
    MalformedCidr(String),
}
