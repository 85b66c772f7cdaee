//! Error types for the tool layer

use thiserror::Error;

use crate::types::Tool;

/// Reasons a request is refused before anything is spawned.
///
/// The `Display` text is what the client sees in the rejection envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unsupported tool: {0}")]
    UnsupportedTool(String),
    #[error("empty target")]
    EmptyTarget,
    #[error("target too long")]
    TargetTooLong,
    #[error("invalid IPv4 address")]
    InvalidIpv4,
    #[error("invalid IPv6 address")]
    InvalidIpv6,
    #[error("invalid hostname")]
    InvalidHostname,
    #[error("hostname label too long")]
    LabelTooLong,
    #[error("invalid ping count")]
    InvalidPingCount,
    #[error("ping count must be between 1 and 10")]
    PingCountOutOfRange,
    #[error("invalid DNS record type")]
    InvalidRecordType,
    #[error("invalid max hops value")]
    InvalidMaxHops,
    #[error("max hops must be between 1 and 30")]
    MaxHopsOutOfRange,
}

/// Failures turning a validated request into a running process.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unsupported tool: {0}")]
    UnsupportedTool(Tool),
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to create {0} pipe")]
    Pipe(&'static str),
}
