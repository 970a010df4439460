//! Wire codecs for the memcached binary protocol and the legacy text
//! protocol.
//!
//! This crate is stateless: it turns operations into byte segments and
//! byte streams back into responses. Transport, pooling, and routing
//! live elsewhere.
//!
//! - [`Request`] / [`Response`] — the 24-byte-header binary protocol,
//!   all multi-byte fields big-endian.
//! - [`MultiGetBatch`] — pipelined quiet-get framing for multi-get.
//! - [`text`] — the newline-terminated ASCII fallback protocol.

mod binary;
mod error;
mod multiget;
pub mod text;

pub use binary::{
    Opcode, Request, Response, ResponseHeader, Status, HEADER_LEN, MAGIC_REQUEST, MAGIC_RESPONSE,
};
pub use error::ProtoError;
pub use multiget::MultiGetBatch;
