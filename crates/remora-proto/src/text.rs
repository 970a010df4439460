//! The legacy newline-terminated ASCII protocol.
//!
//! Commands are single `\r\n`-terminated lines (store commands carry a
//! data block after the command line); responses are lines too, with
//! multi-get replying `VALUE <key> <flags> <bytes> [cas]` blocks
//! followed by `END`. This transport exists as a fallback for servers
//! without binary support; framing mistakes are hard errors here just
//! like in the binary codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtoError;

/// Reject keys the text protocol cannot frame: whitespace or control
/// bytes would corrupt the command line.
fn check_key(key: &[u8]) -> Result<(), ProtoError> {
    if key.is_empty() || key.iter().any(|b| *b <= b' ' || *b == 0x7f) {
        return Err(ProtoError::UnsafeTextKey(
            String::from_utf8_lossy(key).into_owned(),
        ));
    }
    Ok(())
}

/// `get <key>\r\n`
pub fn encode_get(key: &[u8]) -> Result<Bytes, ProtoError> {
    check_key(key)?;
    let mut buf = BytesMut::with_capacity(key.len() + 7);
    buf.put_slice(b"get ");
    buf.put_slice(key);
    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

/// `gets <k1> <k2> ...\r\n` — multi-get with CAS values in replies.
pub fn encode_gets(keys: &[Bytes]) -> Result<Bytes, ProtoError> {
    let mut buf = BytesMut::new();
    buf.put_slice(b"gets");
    for key in keys {
        check_key(key)?;
        buf.put_u8(b' ');
        buf.put_slice(key);
    }
    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

/// A store verb for [`encode_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    /// Unconditional store.
    Set,
    /// Store if absent.
    Add,
    /// Store if present.
    Replace,
    /// Append to existing value.
    Append,
    /// Prepend to existing value.
    Prepend,
}

impl StoreVerb {
    fn word(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
        }
    }
}

/// `<verb> <key> <flags> <exptime> <bytes>\r\n<data>\r\n`
pub fn encode_store(
    verb: StoreVerb,
    key: &[u8],
    flags: u32,
    expiry: u32,
    data: &[u8],
) -> Result<Bytes, ProtoError> {
    check_key(key)?;
    let line = format!(" {} {} {}\r\n", flags, expiry, data.len());
    let mut buf = BytesMut::with_capacity(key.len() + line.len() + data.len() + 16);
    buf.put_slice(verb.word().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(key);
    buf.put_slice(line.as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

/// `delete <key>\r\n`
pub fn encode_delete(key: &[u8]) -> Result<Bytes, ProtoError> {
    check_key(key)?;
    let mut buf = BytesMut::with_capacity(key.len() + 10);
    buf.put_slice(b"delete ");
    buf.put_slice(key);
    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

/// `incr <key> <delta>\r\n` or `decr <key> <delta>\r\n`
pub fn encode_counter(key: &[u8], delta: u64, increment: bool) -> Result<Bytes, ProtoError> {
    check_key(key)?;
    let verb: &[u8] = if increment { b"incr " } else { b"decr " };
    let tail = format!(" {}\r\n", delta);
    let mut buf = BytesMut::with_capacity(key.len() + tail.len() + 5);
    buf.put_slice(verb);
    buf.put_slice(key);
    buf.put_slice(tail.as_bytes());
    Ok(buf.freeze())
}

/// `stats\r\n`
pub fn encode_stats() -> Bytes {
    Bytes::from_static(b"stats\r\n")
}

/// `flush_all\r\n`
pub fn encode_flush_all() -> Bytes {
    Bytes::from_static(b"flush_all\r\n")
}

/// `version\r\n`
pub fn encode_version() -> Bytes {
    Bytes::from_static(b"version\r\n")
}

/// One parsed text-protocol response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextResponse {
    /// `VALUE <key> <flags> <bytes> [cas]` — the `<bytes>` data block
    /// follows on the stream and must be read separately.
    Value {
        /// Echoed key.
        key: String,
        /// Stored flags.
        flags: u32,
        /// Length of the data block that follows.
        len: usize,
        /// CAS token (present only for `gets`).
        cas: Option<u64>,
    },
    /// `END` — terminates a get/gets/stats reply.
    End,
    /// `STORED`
    Stored,
    /// `NOT_STORED`
    NotStored,
    /// `EXISTS` — CAS conflict.
    Exists,
    /// `NOT_FOUND`
    NotFound,
    /// `DELETED`
    Deleted,
    /// `TOUCHED`
    Touched,
    /// `OK` — e.g. reply to `flush_all`.
    Ok,
    /// Numeric incr/decr reply.
    Counter(u64),
    /// `STAT <name> <value>`
    Stat {
        /// Statistic name.
        name: String,
        /// Statistic value, verbatim.
        value: String,
    },
    /// `VERSION <string>`
    Version(String),
    /// `ERROR`, `CLIENT_ERROR <msg>`, or `SERVER_ERROR <msg>`.
    Error(String),
}

/// Parse one response line (without its `\r\n` terminator).
pub fn parse_line(line: &str) -> Result<TextResponse, ProtoError> {
    let malformed = || ProtoError::MalformedTextLine(line.to_string());
    let mut words = line.split_ascii_whitespace();
    let head = words.next().ok_or_else(malformed)?;

    let resp = match head {
        "VALUE" => {
            let key = words.next().ok_or_else(malformed)?.to_string();
            let flags: u32 = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or_else(malformed)?;
            let len: usize = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or_else(malformed)?;
            let cas = match words.next() {
                Some(w) => Some(w.parse().map_err(|_| malformed())?),
                None => None,
            };
            TextResponse::Value {
                key,
                flags,
                len,
                cas,
            }
        }
        "END" => TextResponse::End,
        "STORED" => TextResponse::Stored,
        "NOT_STORED" => TextResponse::NotStored,
        "EXISTS" => TextResponse::Exists,
        "NOT_FOUND" => TextResponse::NotFound,
        "DELETED" => TextResponse::Deleted,
        "TOUCHED" => TextResponse::Touched,
        "OK" => TextResponse::Ok,
        "STAT" => {
            let name = words.next().ok_or_else(malformed)?.to_string();
            let value = words.collect::<Vec<_>>().join(" ");
            TextResponse::Stat { name, value }
        }
        "VERSION" => TextResponse::Version(words.collect::<Vec<_>>().join(" ")),
        "ERROR" => TextResponse::Error("ERROR".to_string()),
        "CLIENT_ERROR" | "SERVER_ERROR" => TextResponse::Error(line.to_string()),
        other => {
            // A bare number is an incr/decr reply.
            match other.parse::<u64>() {
                Ok(n) if words.next().is_none() => TextResponse::Counter(n),
                _ => return Err(malformed()),
            }
        }
    };
    Ok(resp)
}
