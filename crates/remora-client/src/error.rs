//! Error types for the client.
//!
//! Most runtime trouble is *not* an error here: timeouts, dead nodes,
//! and server-side statuses come back as
//! [`OperationResult`](crate::OperationResult) values. `ClientError` is
//! reserved for conditions the caller cannot retry through — bad
//! configuration and broken protocol framing.

/// Hard client failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration is structurally valid but unusable.
    #[error("config error: {0}")]
    Config(String),

    /// Topology discovery could not be started.
    #[error(transparent)]
    Topology(#[from] remora_topology::TopologyError),

    /// The byte stream violated the wire protocol; the connection was
    /// destroyed and the operation cannot be interpreted.
    #[error(transparent)]
    Protocol(#[from] remora_proto::ProtoError),

    /// A response arrived with a correlation id this client never sent
    /// on that connection. Framing can no longer be trusted.
    #[error("unexpected correlation id {actual:#010x} (expected {expected:#010x})")]
    CorrelationMismatch {
        /// The id the pending request carried.
        expected: u32,
        /// The id the response came back with.
        actual: u32,
    },
}
