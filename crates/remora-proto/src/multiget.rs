//! Pipelined multi-get framing.
//!
//! For N keys the batch holds N quiet gets ([`Opcode::GetQ`]) followed
//! by one [`Opcode::Noop`] terminator, all encoded into one buffer for
//! a single batched write. GetQ produces no response on a miss, so the
//! reader cannot count responses; it reads until the terminator's
//! correlation id arrives, matching each hit back to its key through
//! the opaque table.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::binary::Request;
use crate::error::ProtoError;

/// One encoded multi-get pipeline for a single connection.
#[derive(Debug)]
pub struct MultiGetBatch {
    buf: Bytes,
    keys: Vec<Bytes>,
    by_opaque: HashMap<u32, usize>,
    terminator: u32,
}

impl MultiGetBatch {
    /// Build a batch for `keys`, each with its vbucket index (zero for
    /// non-clustered servers).
    ///
    /// Opaques are assigned sequentially from `first_opaque`; the
    /// caller must reserve `keys.len() + 1` ids on the connection so
    /// no concurrent request can collide with the pipeline.
    pub fn build(keys: &[(Bytes, u16)], first_opaque: u32) -> Result<Self, ProtoError> {
        let mut buf = BytesMut::new();
        let mut by_opaque = HashMap::with_capacity(keys.len());
        let mut key_list = Vec::with_capacity(keys.len());

        let mut opaque = first_opaque;
        for (index, (key, vbucket)) in keys.iter().enumerate() {
            Request::getq(key.clone(), *vbucket, opaque).write_to(&mut buf)?;
            by_opaque.insert(opaque, index);
            key_list.push(key.clone());
            opaque = opaque.wrapping_add(1);
        }
        let terminator = opaque;
        Request::noop(terminator).write_to(&mut buf)?;

        Ok(Self {
            buf: buf.freeze(),
            keys: key_list,
            by_opaque,
            terminator,
        })
    }

    /// The whole pipeline, ready for one write call.
    pub fn bytes(&self) -> Bytes {
        self.buf.clone()
    }

    /// The correlation id of the terminating noop.
    pub fn terminator_opaque(&self) -> u32 {
        self.terminator
    }

    /// Number of opaques this batch consumed (keys + terminator).
    pub fn opaque_span(&self) -> u32 {
        self.keys.len() as u32 + 1
    }

    /// Map a response's correlation id back to the requested key.
    pub fn key_for_opaque(&self, opaque: u32) -> Option<&Bytes> {
        self.by_opaque.get(&opaque).map(|i| &self.keys[*i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{HEADER_LEN, MAGIC_REQUEST, Opcode};

    #[test]
    fn test_batch_is_n_getq_plus_noop() {
        let keys = [
            (Bytes::from_static(b"k1"), 0u16),
            (Bytes::from_static(b"k2"), 0),
            (Bytes::from_static(b"k3"), 0),
        ];
        let batch = MultiGetBatch::build(&keys, 100).unwrap();
        let wire = batch.bytes();

        // 3 × (header + 2-byte key) + 1 bare noop header.
        assert_eq!(wire.len(), 3 * (HEADER_LEN + 2) + HEADER_LEN);

        // Walk the frames.
        let mut offset = 0;
        for expected in [Opcode::GetQ, Opcode::GetQ, Opcode::GetQ, Opcode::Noop] {
            assert_eq!(wire[offset], MAGIC_REQUEST);
            assert_eq!(wire[offset + 1], expected as u8);
            let key_len = u16::from_be_bytes([wire[offset + 2], wire[offset + 3]]) as usize;
            offset += HEADER_LEN + key_len;
        }
        assert_eq!(offset, wire.len());
    }

    #[test]
    fn test_opaque_table_recovers_keys() {
        let keys = [
            (Bytes::from_static(b"alpha"), 1u16),
            (Bytes::from_static(b"beta"), 2),
        ];
        let batch = MultiGetBatch::build(&keys, 7).unwrap();
        assert_eq!(batch.key_for_opaque(7).unwrap(), &keys[0].0);
        assert_eq!(batch.key_for_opaque(8).unwrap(), &keys[1].0);
        assert_eq!(batch.terminator_opaque(), 9);
        assert_eq!(batch.opaque_span(), 3);
        assert!(batch.key_for_opaque(9).is_none());
        assert!(batch.key_for_opaque(6).is_none());
    }

    #[test]
    fn test_opaques_wrap_without_collision() {
        let keys = [
            (Bytes::from_static(b"a"), 0u16),
            (Bytes::from_static(b"b"), 0),
        ];
        let batch = MultiGetBatch::build(&keys, u32::MAX).unwrap();
        assert!(batch.key_for_opaque(u32::MAX).is_some());
        assert!(batch.key_for_opaque(0).is_some());
        assert_eq!(batch.terminator_opaque(), 1);
    }

    #[test]
    fn test_empty_batch_is_just_the_terminator() {
        let batch = MultiGetBatch::build(&[], 5).unwrap();
        assert_eq!(batch.bytes().len(), HEADER_LEN);
        assert_eq!(batch.terminator_opaque(), 5);
        assert_eq!(batch.opaque_span(), 1);
    }
}
