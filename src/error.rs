//! Error types for the NAT engine.

use thiserror::Error;

/// Result type alias for NAT operations.
pub type Result<T> = std::result::Result<T, NatError>;

/// Errors produced while parsing or translating packets.
///
/// These cover malformed input only. A packet that parses but must not be
/// forwarded yields a drop verdict, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatError {
    /// Buffer too short to hold the named header.
    #[error("packet too short for {0} header")]
    Truncated(&'static str),

    /// The IP version field is not 4.
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    /// The IHL field is below 5 or larger than the buffer.
    #[error("invalid IPv4 header length")]
    InvalidHeaderLength,

    /// A string did not parse as a dotted-quad IPv4 address.
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),
}
