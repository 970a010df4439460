//! Error type for codec failures.
//!
//! Every variant here is a framing or compatibility violation — a bug
//! on one side of the wire, never an expected operational condition.
//! Operational outcomes (miss, not-stored, wrong vbucket) travel as
//! [`Status`](crate::Status) values instead.

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The response's magic byte was not `0x81`.
    #[error("bad magic byte 0x{0:02x} in response header")]
    BadMagic(u8),

    /// The opcode byte is not one this client understands.
    #[error("unrecognized opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Header length fields disagree with each other.
    #[error("inconsistent header lengths: extras {extras} + key {key} exceed body {body}")]
    InconsistentLengths {
        /// Extras length from the header.
        extras: usize,
        /// Key length from the header.
        key: usize,
        /// Total body length from the header.
        body: usize,
    },

    /// The body handed to the decoder does not match the header.
    #[error("body length {actual} does not match header total {expected}")]
    BodyLengthMismatch {
        /// Total body length the header promised.
        expected: usize,
        /// Bytes actually supplied.
        actual: usize,
    },

    /// A field exceeds what its wire width can carry.
    #[error("{field} length {len} exceeds protocol limit {max}")]
    FieldTooLong {
        /// Which field overflowed.
        field: &'static str,
        /// Supplied length.
        len: usize,
        /// Maximum the wire field can express.
        max: usize,
    },

    /// A text-protocol line did not parse.
    #[error("malformed text response line: {0:?}")]
    MalformedTextLine(String),

    /// A text-protocol key or argument carried bytes the protocol
    /// cannot frame (spaces or control characters in a key).
    #[error("key {0:?} is not text-protocol safe")]
    UnsafeTextKey(String),
}
