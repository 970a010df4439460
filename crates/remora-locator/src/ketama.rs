//! Ketama-style consistent-hash ring.
//!
//! Each node contributes [`POINTS_PER_NODE`] positions on a u32 ring.
//! Positions come from blake3 digests of `"<endpoint>-<i>"`, four
//! little-endian 4-byte groups per digest — one digest yields four
//! ring keys, cutting the hashing work per node by 4x without hurting
//! distribution. The ring is one sorted array plus a parallel owner
//! array, rebuilt wholesale on every topology change.

use std::sync::Arc;

use remora_net::Node;
use tracing::debug;

use crate::hash_key;

/// Ring positions per node. 160 points keeps per-node ownership within
/// a few percent of even for realistic cluster sizes.
pub const POINTS_PER_NODE: usize = 160;

/// An immutable consistent-hash ring.
#[derive(Debug)]
pub struct KetamaRing {
    /// Sorted ring positions.
    keys: Vec<u32>,
    /// `owners[i]` serves positions ending at `keys[i]`.
    owners: Vec<Arc<Node>>,
    /// The node list the ring was built from.
    nodes: Vec<Arc<Node>>,
}

impl KetamaRing {
    /// Build a ring from a node list. O(n·points·log(n·points)).
    pub fn build(nodes: Vec<Arc<Node>>) -> Self {
        let mut pairs: Vec<(u32, usize)> = Vec::with_capacity(nodes.len() * POINTS_PER_NODE);

        for (index, node) in nodes.iter().enumerate() {
            let endpoint = node.endpoint().to_string();
            for chunk in 0..POINTS_PER_NODE / 4 {
                let digest = blake3::hash(format!("{endpoint}-{chunk}").as_bytes());
                let bytes = digest.as_bytes();
                for group in 0..4 {
                    let raw: [u8; 4] = bytes[group * 4..group * 4 + 4]
                        .try_into()
                        .expect("4 bytes");
                    pairs.push((u32::from_le_bytes(raw), index));
                }
            }
        }

        // Ties broken by node index so identical inputs always build
        // an identical ring.
        pairs.sort_unstable();

        let keys = pairs.iter().map(|(k, _)| *k).collect();
        let owners = pairs
            .iter()
            .map(|(_, i)| Arc::clone(&nodes[*i]))
            .collect();

        debug!(
            nodes = nodes.len(),
            points = nodes.len() * POINTS_PER_NODE,
            "built ketama ring"
        );
        Self {
            keys,
            owners,
            nodes,
        }
    }

    /// The node list the ring was built from, dead nodes included.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Resolve the node for `key`.
    ///
    /// The primary owner is the smallest ring key at or after the item
    /// hash (wrapping past the top of the ring). If that node is dead,
    /// the fallback is *not* the next ring neighbor — that would dump
    /// the whole dead node's arc onto one neighbor. Instead a
    /// deterministic secondary-hash sequence rehashes
    /// `"<attempt><key>"` through a fixed bit-mix and relocates, so a
    /// dead node's keys spread over the surviving ring, and the same
    /// key lands on the same fallback node for as long as the
    /// dead/alive set is unchanged.
    pub fn locate(&self, key: &[u8]) -> Option<Arc<Node>> {
        if self.keys.is_empty() {
            return None;
        }

        let primary_pos = self.position_for(hash_key(key));
        let primary = &self.owners[primary_pos];
        if primary.is_alive() {
            return Some(Arc::clone(primary));
        }

        for attempt in 1..=self.nodes.len() as u32 {
            let candidate = &self.owners[self.position_for(fallback_hash(attempt, key))];
            if candidate.is_alive() {
                return Some(Arc::clone(candidate));
            }
        }

        // Every rehash attempt landed on a dead node. Walk the ring
        // clockwise from the primary position — still deterministic
        // and stable for a fixed dead set.
        for offset in 1..self.keys.len() {
            let candidate = &self.owners[(primary_pos + offset) % self.keys.len()];
            if candidate.is_alive() {
                return Some(Arc::clone(candidate));
            }
        }

        None
    }

    /// Index of the smallest ring key ≥ `hash`, wrapping to the first
    /// entry when `hash` exceeds every ring key.
    fn position_for(&self, hash: u32) -> usize {
        let pos = self.keys.partition_point(|k| *k < hash);
        if pos == self.keys.len() {
            0
        } else {
            pos
        }
    }
}

/// Alternate item hash for fallback attempt `n`: hash the attempt
/// counter's decimal form prefixed onto the key, then scramble with a
/// fixed avalanche step so consecutive attempts diverge.
fn fallback_hash(attempt: u32, key: &[u8]) -> u32 {
    let mut input = Vec::with_capacity(key.len() + 10);
    input.extend_from_slice(attempt.to_string().as_bytes());
    input.extend_from_slice(key);
    let mut h = hash_key(&input);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h
}
