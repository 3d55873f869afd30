use thiserror::Error;

/// A caller request rejected before any probing started.
///
/// Every message starts with the name of the offending field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("host: must not be empty")]
    EmptyHost,
    #[error("host: {0:?} is not a valid hostname or IP address")]
    MalformedHost(String),
    #[error("ports: at least one port is required")]
    NoPorts,
    #[error("ports: {0} is out of range (1-65535)")]
    PortOutOfRange(i64),
    #[error("state: required (opened or closed)")]
    MissingState,
    #[error("state: unsupported value {0:?} (expected opened or closed)")]
    UnsupportedState(String),
    #[error("interval: must be 0 or more seconds, got {0}")]
    NegativeInterval(i64),
    #[error("retries: must be at least 1, got {0}")]
    InvalidRetries(i64),
}
