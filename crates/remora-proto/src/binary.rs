//! The memcached binary protocol.
//!
//! Every frame starts with a fixed 24-byte header:
//!
//! ```text
//! offset  field
//! 0       magic (0x80 request / 0x81 response)
//! 1       opcode
//! 2..4    key length (u16)
//! 4       extras length (u8)
//! 5       data type (always 0)
//! 6..8    vbucket index (requests) / status (responses) (u16)
//! 8..12   total body length (u32) = extras + key + value
//! 12..16  opaque (correlation id, echoed verbatim)
//! 16..24  CAS (u64)
//! ```
//!
//! All multi-byte fields are big-endian regardless of host byte order;
//! the `bytes` accessors used here are big-endian by definition. The
//! body is extras, then key, then value, each length implied by the
//! header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 24;
/// Magic byte opening every request.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Magic byte opening every response.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Operation codes understood by this client.
///
/// A closed set: one variant per opcode, consumed by a single encode
/// path and a single decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Fetch a value.
    Get = 0x00,
    /// Store unconditionally.
    Set = 0x01,
    /// Store only if absent.
    Add = 0x02,
    /// Store only if present.
    Replace = 0x03,
    /// Remove a key.
    Delete = 0x04,
    /// Add to a counter.
    Increment = 0x05,
    /// Subtract from a counter.
    Decrement = 0x06,
    /// Drop the whole cache.
    Flush = 0x08,
    /// Quiet get: no response at all on a miss.
    GetQ = 0x09,
    /// Does nothing; used as a pipeline terminator.
    Noop = 0x0a,
    /// Server version string.
    Version = 0x0b,
    /// Append bytes to an existing value.
    Append = 0x0e,
    /// Prepend bytes to an existing value.
    Prepend = 0x0f,
    /// Server statistics.
    Stat = 0x10,
    /// Update a key's expiry without touching the value.
    Touch = 0x1c,
    /// Fetch a value and update its expiry in one call.
    GetAndTouch = 0x1d,
    /// List SASL mechanisms the server accepts.
    SaslListMechs = 0x20,
    /// Start a SASL handshake.
    SaslAuth = 0x21,
    /// Continue a SASL handshake.
    SaslStep = 0x22,
    /// Cluster extension: query key persistence/replication state.
    Observe = 0x92,
    /// Cluster extension: wait for persistence/replication.
    Sync = 0x96,
}

impl Opcode {
    /// Decode an opcode byte. Unknown bytes are a compatibility error.
    pub fn from_u8(b: u8) -> Result<Self, ProtoError> {
        Ok(match b {
            0x00 => Self::Get,
            0x01 => Self::Set,
            0x02 => Self::Add,
            0x03 => Self::Replace,
            0x04 => Self::Delete,
            0x05 => Self::Increment,
            0x06 => Self::Decrement,
            0x08 => Self::Flush,
            0x09 => Self::GetQ,
            0x0a => Self::Noop,
            0x0b => Self::Version,
            0x0e => Self::Append,
            0x0f => Self::Prepend,
            0x10 => Self::Stat,
            0x1c => Self::Touch,
            0x1d => Self::GetAndTouch,
            0x20 => Self::SaslListMechs,
            0x21 => Self::SaslAuth,
            0x22 => Self::SaslStep,
            0x92 => Self::Observe,
            0x96 => Self::Sync,
            other => return Err(ProtoError::UnknownOpcode(other)),
        })
    }
}

/// Response status codes.
///
/// Zero is success; any other status means the body, if present, is a
/// human-readable ASCII message rather than a value. Codes this client
/// does not know are preserved in [`Status::Unknown`] so they can be
/// reported verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation succeeded.
    Success,
    /// The key does not exist.
    KeyNotFound,
    /// The key exists (or CAS mismatch on a conditional store).
    KeyExists,
    /// Value too large for the server.
    ValueTooLarge,
    /// The request was malformed from the server's point of view.
    InvalidArguments,
    /// Conditional store condition not met.
    NotStored,
    /// Increment/decrement on a non-numeric value.
    BadDelta,
    /// The addressed vbucket is not owned by this server; the client's
    /// routing is stale.
    NotMyVBucket,
    /// Authentication failed.
    AuthError,
    /// Authentication requires another SASL step.
    AuthContinue,
    /// The server does not implement this opcode.
    UnknownCommand,
    /// The server is out of memory.
    OutOfMemory,
    /// A status code not listed above.
    Unknown(u16),
}

impl Status {
    /// Decode a status field.
    pub fn from_u16(v: u16) -> Self {
        match v {
            0x0000 => Self::Success,
            0x0001 => Self::KeyNotFound,
            0x0002 => Self::KeyExists,
            0x0003 => Self::ValueTooLarge,
            0x0004 => Self::InvalidArguments,
            0x0005 => Self::NotStored,
            0x0006 => Self::BadDelta,
            0x0007 => Self::NotMyVBucket,
            0x0020 => Self::AuthError,
            0x0021 => Self::AuthContinue,
            0x0081 => Self::UnknownCommand,
            0x0082 => Self::OutOfMemory,
            other => Self::Unknown(other),
        }
    }

    /// Wire value of this status.
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::KeyNotFound => 0x0001,
            Self::KeyExists => 0x0002,
            Self::ValueTooLarge => 0x0003,
            Self::InvalidArguments => 0x0004,
            Self::NotStored => 0x0005,
            Self::BadDelta => 0x0006,
            Self::NotMyVBucket => 0x0007,
            Self::AuthError => 0x0020,
            Self::AuthContinue => 0x0021,
            Self::UnknownCommand => 0x0081,
            Self::OutOfMemory => 0x0082,
            Self::Unknown(v) => *v,
        }
    }

    /// True for status zero.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// One encoded request.
///
/// [`Request::segments`] emits the frame as an ordered list of byte
/// ranges (header, extras, key, value) so the transport can hand them
/// to a scatter/gather write without concatenating first.
#[derive(Debug, Clone)]
pub struct Request {
    /// Operation code.
    pub opcode: Opcode,
    /// VBucket index; zero for non-clustered servers.
    pub vbucket: u16,
    /// Correlation id, echoed back in the response. Must be unique
    /// among requests in flight on one connection.
    pub opaque: u32,
    /// CAS token for conditional stores; zero when unused.
    pub cas: u64,
    /// Operation-specific extra fields (flags, expiry, deltas).
    pub extras: Bytes,
    /// Wire key bytes.
    pub key: Bytes,
    /// Value payload.
    pub value: Bytes,
}

impl Request {
    /// Total body length: extras + key + value.
    pub fn total_body(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Encode the 24-byte header.
    pub fn header(&self) -> Result<[u8; HEADER_LEN], ProtoError> {
        if self.key.len() > u16::MAX as usize {
            return Err(ProtoError::FieldTooLong {
                field: "key",
                len: self.key.len(),
                max: u16::MAX as usize,
            });
        }
        if self.extras.len() > u8::MAX as usize {
            return Err(ProtoError::FieldTooLong {
                field: "extras",
                len: self.extras.len(),
                max: u8::MAX as usize,
            });
        }
        if self.total_body() > u32::MAX as usize {
            return Err(ProtoError::FieldTooLong {
                field: "body",
                len: self.total_body(),
                max: u32::MAX as usize,
            });
        }

        let mut hdr = [0u8; HEADER_LEN];
        let mut buf = &mut hdr[..];
        buf.put_u8(MAGIC_REQUEST);
        buf.put_u8(self.opcode as u8);
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0); // data type
        buf.put_u16(self.vbucket);
        buf.put_u32(self.total_body() as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        Ok(hdr)
    }

    /// The frame as ordered byte segments: header, extras, key, value.
    pub fn segments(&self) -> Result<[Bytes; 4], ProtoError> {
        let hdr = self.header()?;
        Ok([
            Bytes::copy_from_slice(&hdr),
            self.extras.clone(),
            self.key.clone(),
            self.value.clone(),
        ])
    }

    /// Append the whole frame to `buf`. Used to batch many requests
    /// into one write (pipelined multi-get).
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        let hdr = self.header()?;
        buf.reserve(HEADER_LEN + self.total_body());
        buf.put_slice(&hdr);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(())
    }

    fn bare(opcode: Opcode, opaque: u32) -> Self {
        Self {
            opcode,
            vbucket: 0,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    fn keyed(opcode: Opcode, key: Bytes, vbucket: u16, opaque: u32) -> Self {
        Self {
            key,
            vbucket,
            ..Self::bare(opcode, opaque)
        }
    }

    /// `get`.
    pub fn get(key: Bytes, vbucket: u16, opaque: u32) -> Self {
        Self::keyed(Opcode::Get, key, vbucket, opaque)
    }

    /// `getq` — quiet get, silent on miss. Only meaningful inside a
    /// pipeline terminated by something that always responds.
    pub fn getq(key: Bytes, vbucket: u16, opaque: u32) -> Self {
        Self::keyed(Opcode::GetQ, key, vbucket, opaque)
    }

    fn store(
        opcode: Opcode,
        key: Bytes,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
        vbucket: u16,
        opaque: u32,
    ) -> Self {
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u32(flags);
        extras.put_u32(expiry);
        Self {
            opcode,
            vbucket,
            opaque,
            cas,
            extras: extras.freeze(),
            key,
            value,
        }
    }

    /// `set` — store unconditionally (or CAS-conditionally when `cas`
    /// is nonzero).
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        key: Bytes,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
        vbucket: u16,
        opaque: u32,
    ) -> Self {
        Self::store(Opcode::Set, key, value, flags, expiry, cas, vbucket, opaque)
    }

    /// `add` — store only if the key does not exist.
    pub fn add(key: Bytes, value: Bytes, flags: u32, expiry: u32, vbucket: u16, opaque: u32) -> Self {
        Self::store(Opcode::Add, key, value, flags, expiry, 0, vbucket, opaque)
    }

    /// `replace` — store only if the key exists.
    #[allow(clippy::too_many_arguments)]
    pub fn replace(
        key: Bytes,
        value: Bytes,
        flags: u32,
        expiry: u32,
        cas: u64,
        vbucket: u16,
        opaque: u32,
    ) -> Self {
        Self::store(Opcode::Replace, key, value, flags, expiry, cas, vbucket, opaque)
    }

    /// `append` — concatenate onto an existing value. No extras.
    pub fn append(key: Bytes, value: Bytes, cas: u64, vbucket: u16, opaque: u32) -> Self {
        Self {
            value,
            cas,
            ..Self::keyed(Opcode::Append, key, vbucket, opaque)
        }
    }

    /// `prepend` — prefix onto an existing value. No extras.
    pub fn prepend(key: Bytes, value: Bytes, cas: u64, vbucket: u16, opaque: u32) -> Self {
        Self {
            value,
            cas,
            ..Self::keyed(Opcode::Prepend, key, vbucket, opaque)
        }
    }

    /// `delete`.
    pub fn delete(key: Bytes, cas: u64, vbucket: u16, opaque: u32) -> Self {
        Self {
            cas,
            ..Self::keyed(Opcode::Delete, key, vbucket, opaque)
        }
    }

    fn counter(
        opcode: Opcode,
        key: Bytes,
        delta: u64,
        initial: u64,
        expiry: u32,
        vbucket: u16,
        opaque: u32,
    ) -> Self {
        let mut extras = BytesMut::with_capacity(20);
        extras.put_u64(delta);
        extras.put_u64(initial);
        extras.put_u32(expiry);
        Self {
            extras: extras.freeze(),
            ..Self::keyed(opcode, key, vbucket, opaque)
        }
    }

    /// `incr` — add `delta` to a counter, seeding with `initial` if
    /// absent (expiry `0xffffffff` means "fail instead of seeding").
    pub fn increment(
        key: Bytes,
        delta: u64,
        initial: u64,
        expiry: u32,
        vbucket: u16,
        opaque: u32,
    ) -> Self {
        Self::counter(Opcode::Increment, key, delta, initial, expiry, vbucket, opaque)
    }

    /// `decr` — subtract `delta`, clamping at zero.
    pub fn decrement(
        key: Bytes,
        delta: u64,
        initial: u64,
        expiry: u32,
        vbucket: u16,
        opaque: u32,
    ) -> Self {
        Self::counter(Opcode::Decrement, key, delta, initial, expiry, vbucket, opaque)
    }

    fn expiry_op(opcode: Opcode, key: Bytes, expiry: u32, vbucket: u16, opaque: u32) -> Self {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(expiry);
        Self {
            extras: extras.freeze(),
            ..Self::keyed(opcode, key, vbucket, opaque)
        }
    }

    /// `touch` — reset a key's expiry.
    pub fn touch(key: Bytes, expiry: u32, vbucket: u16, opaque: u32) -> Self {
        Self::expiry_op(Opcode::Touch, key, expiry, vbucket, opaque)
    }

    /// `gat` — fetch and reset expiry in one round trip.
    pub fn get_and_touch(key: Bytes, expiry: u32, vbucket: u16, opaque: u32) -> Self {
        Self::expiry_op(Opcode::GetAndTouch, key, expiry, vbucket, opaque)
    }

    /// `noop` — always answered; the pipeline terminator.
    pub fn noop(opaque: u32) -> Self {
        Self::bare(Opcode::Noop, opaque)
    }

    /// `version`.
    pub fn version(opaque: u32) -> Self {
        Self::bare(Opcode::Version, opaque)
    }

    /// `stat` — empty key for general stats, or a named group.
    pub fn stats(group: Option<Bytes>, opaque: u32) -> Self {
        Self {
            key: group.unwrap_or_default(),
            ..Self::bare(Opcode::Stat, opaque)
        }
    }

    /// `flush` — discard everything on one server.
    pub fn flush(opaque: u32) -> Self {
        Self::bare(Opcode::Flush, opaque)
    }

    /// `observe` — cluster extension; the value carries
    /// `(vbucket u16, key length u16, key)` tuples.
    pub fn observe(keys: &[(u16, Bytes)], opaque: u32) -> Self {
        let mut value = BytesMut::new();
        for (vbucket, key) in keys {
            value.put_u16(*vbucket);
            value.put_u16(key.len() as u16);
            value.put_slice(key);
        }
        Self {
            value: value.freeze(),
            ..Self::bare(Opcode::Observe, opaque)
        }
    }

    /// `sync` — cluster extension; the value carries
    /// `(cas u64, vbucket u16, key length u16, key)` tuples.
    pub fn sync(keys: &[(u64, u16, Bytes)], opaque: u32) -> Self {
        let mut value = BytesMut::new();
        for (cas, vbucket, key) in keys {
            value.put_u64(*cas);
            value.put_u16(*vbucket);
            value.put_u16(key.len() as u16);
            value.put_slice(key);
        }
        Self {
            value: value.freeze(),
            ..Self::bare(Opcode::Sync, opaque)
        }
    }

    /// SASL mechanism listing.
    pub fn sasl_list_mechs(opaque: u32) -> Self {
        Self::bare(Opcode::SaslListMechs, opaque)
    }

    /// SASL handshake start: key = mechanism name, value = opaque auth
    /// bytes from the auth provider.
    pub fn sasl_auth(mechanism: Bytes, data: Bytes, opaque: u32) -> Self {
        Self {
            key: mechanism,
            value: data,
            ..Self::bare(Opcode::SaslAuth, opaque)
        }
    }

    /// SASL handshake continuation.
    pub fn sasl_step(mechanism: Bytes, data: Bytes, opaque: u32) -> Self {
        Self {
            key: mechanism,
            value: data,
            ..Self::bare(Opcode::SaslStep, opaque)
        }
    }
}

/// A parsed response header. The body must be read separately: exactly
/// [`ResponseHeader::total_body`] more bytes.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    /// Echoed operation code.
    pub opcode: Opcode,
    /// Key length within the body.
    pub key_len: usize,
    /// Extras length within the body.
    pub extras_len: usize,
    /// Response status.
    pub status: Status,
    /// Total body length (extras + key + value).
    pub total_body: usize,
    /// Echoed correlation id.
    pub opaque: u32,
    /// CAS token of the affected item.
    pub cas: u64,
}

impl ResponseHeader {
    /// Parse a fixed 24-byte header. Bad magic or an unknown opcode is
    /// a hard error: the stream can no longer be trusted.
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, ProtoError> {
        let mut buf = &raw[..];
        let magic = buf.get_u8();
        if magic != MAGIC_RESPONSE {
            return Err(ProtoError::BadMagic(magic));
        }
        let opcode = Opcode::from_u8(buf.get_u8())?;
        let key_len = buf.get_u16() as usize;
        let extras_len = buf.get_u8() as usize;
        let _data_type = buf.get_u8();
        let status = Status::from_u16(buf.get_u16());
        let total_body = buf.get_u32() as usize;
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        if extras_len + key_len > total_body {
            return Err(ProtoError::InconsistentLengths {
                extras: extras_len,
                key: key_len,
                body: total_body,
            });
        }

        Ok(Self {
            opcode,
            key_len,
            extras_len,
            status,
            total_body,
            opaque,
            cas,
        })
    }
}

/// One decoded response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Echoed operation code.
    pub opcode: Opcode,
    /// Response status; zero is success.
    pub status: Status,
    /// Echoed correlation id.
    pub opaque: u32,
    /// CAS token.
    pub cas: u64,
    /// Extras bytes (flags on gets, counter values elsewhere).
    pub extras: Bytes,
    /// Key bytes (stat names, getk echoes).
    pub key: Bytes,
    /// Value bytes — or an ASCII error message on nonzero status.
    pub value: Bytes,
}

impl Response {
    /// Assemble a response from its header and exactly-sized body.
    pub fn from_parts(header: ResponseHeader, mut body: Bytes) -> Result<Self, ProtoError> {
        if body.len() != header.total_body {
            return Err(ProtoError::BodyLengthMismatch {
                expected: header.total_body,
                actual: body.len(),
            });
        }
        let extras = body.split_to(header.extras_len);
        let key = body.split_to(header.key_len);
        Ok(Self {
            opcode: header.opcode,
            status: header.status,
            opaque: header.opaque,
            cas: header.cas,
            extras,
            key,
            value: body,
        })
    }

    /// True for status zero.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// On a failed response the body is a human-readable message.
    pub fn error_message(&self) -> Option<&str> {
        if self.is_success() || self.value.is_empty() {
            return None;
        }
        std::str::from_utf8(&self.value).ok()
    }

    /// Flags from a get-style response's 4-byte extras.
    pub fn flags(&self) -> u32 {
        if self.extras.len() >= 4 {
            let mut buf = &self.extras[..4];
            buf.get_u32()
        } else {
            0
        }
    }

    /// Counter value from an incr/decr response's 8-byte body.
    pub fn counter_value(&self) -> Option<u64> {
        if self.value.len() == 8 {
            let mut buf = &self.value[..];
            Some(buf.get_u64())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(req: &Request) -> Vec<u8> {
        let mut out = BytesMut::new();
        req.write_to(&mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_set_header_layout_byte_for_byte() {
        let req = Request::set(
            Bytes::from_static(b"foo"),
            Bytes::from_static(&[1, 2, 3]),
            0xdead_beef,
            0x0000_0e10,
            0x1122_3344_5566_7788,
            5,
            0xcafe_f00d,
        );
        let wire = encode(&req);

        // 24 header + 8 extras + 3 key + 3 value.
        assert_eq!(wire.len(), 38);
        assert_eq!(wire[0], MAGIC_REQUEST);
        assert_eq!(wire[1], 0x01); // set
        assert_eq!(&wire[2..4], &[0x00, 0x03]); // key length, big-endian
        assert_eq!(wire[4], 0x08); // extras length
        assert_eq!(wire[5], 0x00); // data type
        assert_eq!(&wire[6..8], &[0x00, 0x05]); // vbucket
        assert_eq!(&wire[8..12], &[0x00, 0x00, 0x00, 0x0e]); // body = 14
        assert_eq!(&wire[12..16], &[0xca, 0xfe, 0xf0, 0x0d]); // opaque
        assert_eq!(
            &wire[16..24],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]
        );
        assert_eq!(&wire[24..28], &[0xde, 0xad, 0xbe, 0xef]); // flags
        assert_eq!(&wire[28..32], &[0x00, 0x00, 0x0e, 0x10]); // expiry
        assert_eq!(&wire[32..35], b"foo");
        assert_eq!(&wire[35..38], &[1, 2, 3]);
    }

    #[test]
    fn test_segments_match_batched_encoding() {
        let req = Request::get(Bytes::from_static(b"user:42"), 0, 7);
        let segs = req.segments().unwrap();
        let concatenated: Vec<u8> = segs.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(concatenated, encode(&req));
        assert_eq!(segs[0].len(), HEADER_LEN);
        assert!(segs[1].is_empty()); // get has no extras
        assert_eq!(&segs[2][..], b"user:42");
        assert!(segs[3].is_empty());
    }

    #[test]
    fn test_counter_extras_layout() {
        let req = Request::increment(Bytes::from_static(b"hits"), 2, 10, 60, 0, 1);
        assert_eq!(req.extras.len(), 20);
        assert_eq!(&req.extras[..8], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&req.extras[8..16], &[0, 0, 0, 0, 0, 0, 0, 10]);
        assert_eq!(&req.extras[16..20], &[0, 0, 0, 60]);
    }

    fn synth_response(
        opcode: Opcode,
        status: u16,
        opaque: u32,
        cas: u64,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
    ) -> (ResponseHeader, Bytes) {
        let total = extras.len() + key.len() + value.len();
        let mut raw = BytesMut::new();
        raw.put_u8(MAGIC_RESPONSE);
        raw.put_u8(opcode as u8);
        raw.put_u16(key.len() as u16);
        raw.put_u8(extras.len() as u8);
        raw.put_u8(0);
        raw.put_u16(status);
        raw.put_u32(total as u32);
        raw.put_u32(opaque);
        raw.put_u64(cas);
        let hdr: [u8; HEADER_LEN] = raw[..].try_into().unwrap();
        let mut body = BytesMut::new();
        body.put_slice(extras);
        body.put_slice(key);
        body.put_slice(value);
        (ResponseHeader::parse(&hdr).unwrap(), body.freeze())
    }

    #[test]
    fn test_round_trip_set_then_success_response() {
        let opaque = 0x0badf00d;
        let req = Request::set(
            Bytes::from_static(b"foo"),
            Bytes::from_static(&[1, 2, 3]),
            0,
            0,
            0,
            0,
            opaque,
        );
        assert_eq!(req.total_body(), 14);

        let (hdr, body) = synth_response(Opcode::Set, 0, opaque, 42, &[], &[], &[]);
        let resp = Response::from_parts(hdr, body).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.opaque, opaque);
        assert_eq!(resp.cas, 42);
        assert!(resp.value.is_empty());
    }

    #[test]
    fn test_get_response_splits_extras_key_value() {
        let (hdr, body) = synth_response(
            Opcode::Get,
            0,
            1,
            9,
            &[0x00, 0x00, 0x00, 0x2a],
            b"",
            b"hello",
        );
        let resp = Response::from_parts(hdr, body).unwrap();
        assert_eq!(resp.flags(), 42);
        assert_eq!(&resp.value[..], b"hello");
    }

    #[test]
    fn test_error_status_carries_ascii_message() {
        let (hdr, body) = synth_response(Opcode::Get, 0x0001, 3, 0, &[], &[], b"Not found");
        let resp = Response::from_parts(hdr, body).unwrap();
        assert_eq!(resp.status, Status::KeyNotFound);
        assert_eq!(resp.error_message(), Some("Not found"));
    }

    #[test]
    fn test_not_my_vbucket_is_distinguishable() {
        let (hdr, body) = synth_response(Opcode::Set, 0x0007, 3, 0, &[], &[], b"");
        let resp = Response::from_parts(hdr, body).unwrap();
        assert_eq!(resp.status, Status::NotMyVBucket);
        assert!(!resp.is_success());
    }

    #[test]
    fn test_unknown_status_is_preserved() {
        assert_eq!(Status::from_u16(0x7777), Status::Unknown(0x7777));
        assert_eq!(Status::Unknown(0x7777).as_u16(), 0x7777);
    }

    #[test]
    fn test_bad_magic_is_a_hard_error() {
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = MAGIC_REQUEST; // a request magic where a response must be
        assert!(matches!(
            ResponseHeader::parse(&raw),
            Err(ProtoError::BadMagic(0x80))
        ));
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u8(MAGIC_RESPONSE);
        raw.put_u8(0x00);
        raw.put_u16(10); // key length 10...
        raw.put_u8(0);
        raw.put_u8(0);
        raw.put_u16(0);
        raw.put_u32(4); // ...but body only 4
        raw.put_u32(0);
        raw.put_u64(0);
        let hdr: [u8; HEADER_LEN] = raw[..].try_into().unwrap();
        assert!(matches!(
            ResponseHeader::parse(&hdr),
            Err(ProtoError::InconsistentLengths { .. })
        ));
    }

    #[test]
    fn test_body_length_mismatch_rejected() {
        let (hdr, _) = synth_response(Opcode::Get, 0, 1, 0, &[], &[], b"abcd");
        let short = Bytes::from_static(b"ab");
        assert!(matches!(
            Response::from_parts(hdr, short),
            Err(ProtoError::BodyLengthMismatch {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_counter_response_value() {
        let (hdr, body) = synth_response(
            Opcode::Increment,
            0,
            1,
            0,
            &[],
            &[],
            &[0, 0, 0, 0, 0, 0, 0, 12],
        );
        let resp = Response::from_parts(hdr, body).unwrap();
        assert_eq!(resp.counter_value(), Some(12));
    }

    #[test]
    fn test_observe_value_framing() {
        let req = Request::observe(&[(3, Bytes::from_static(b"k1"))], 1);
        assert_eq!(&req.value[..], &[0, 3, 0, 2, b'k', b'1']);
    }

    #[test]
    fn test_sync_value_framing() {
        let req = Request::sync(&[(0x0102, 3, Bytes::from_static(b"k1"))], 1);
        assert_eq!(
            &req.value[..],
            &[0, 0, 0, 0, 0, 0, 1, 2, 0, 3, 0, 2, b'k', b'1']
        );
        assert_eq!(req.total_body(), 14);
    }
}
