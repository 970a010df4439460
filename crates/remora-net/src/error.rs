//! Error types for connection operations.

use remora_types::Endpoint;

/// Errors that can occur on a node connection.
///
/// Timeouts and I/O failures are expected operational conditions — the
/// caller maps them to failed operations and failure-policy input, not
/// panics. [`NetError::Proto`] means the stream itself can no longer be
/// trusted.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// An underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Establishing the TCP connection exceeded the connect timeout.
    #[error("connect to {0} timed out")]
    ConnectTimeout(Endpoint),

    /// Waiting for response bytes exceeded the receive timeout.
    #[error("receive from {0} timed out")]
    ReceiveTimeout(Endpoint),

    /// A framing or compatibility violation in the byte stream.
    #[error("protocol error: {0}")]
    Proto(#[from] remora_proto::ProtoError),

    /// The server rejected the SASL handshake.
    #[error("authentication failed: {0}")]
    Auth(String),
}
