use thiserror::Error;

/// Errors that can occur in the streaming layer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (malformed packet, bad framing, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Substrate protocol byte is not the streaming protocol
    #[error("Unsupported substrate protocol: {0}")]
    UnsupportedProtocol(u8),

    /// Stream is closed
    #[error("Stream closed")]
    StreamClosed,

    /// No lease set is known for the remote destination
    #[error("Missing remote lease set")]
    MissingRemoteLeaseSet,

    /// Every lease of the remote destination has expired
    #[error("All remote leases are expired")]
    ExpiredLeases,

    /// The tunnel pool has no outbound tunnel to offer
    #[error("No outbound tunnels in the pool")]
    NoOutboundTunnel,

    /// Payload exceeds the advertised MTU
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),

    /// Key material error (generation, signing, persistence)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Timeout waiting for operation
    #[error("Operation timed out")]
    Timeout,

    /// The streaming engine has been stopped
    #[error("Streaming engine stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
