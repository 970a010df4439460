//! Key-to-node resolution.
//!
//! Two interchangeable strategies behind one closed enum:
//!
//! - [`KetamaRing`] — consistent hashing for plain memcached-style
//!   clusters; adding or removing a node remaps only a small fraction
//!   of keys.
//! - [`VBucketLocator`] — fixed-shard routing for clustered buckets
//!   that publish a vbucket map; the vbucket index also rides in every
//!   request header so servers can reject stale routing.
//!
//! A locator is immutable once built. Topology changes build a whole
//! new locator and swap it in; nothing here is ever patched in place.

mod ketama;
mod vbucket;

use std::sync::Arc;

use remora_net::Node;

pub use ketama::{KetamaRing, POINTS_PER_NODE};
pub use vbucket::VBucketLocator;

/// The configured locator strategy.
#[derive(Debug)]
pub enum Locator {
    /// Consistent-hash ring.
    Ketama(KetamaRing),
    /// VBucket map.
    VBucket(VBucketLocator),
}

impl Locator {
    /// Resolve the node that should serve `key`, skipping dead nodes
    /// deterministically. `None` when no live node remains.
    pub fn locate(&self, key: &[u8]) -> Option<Arc<Node>> {
        match self {
            Self::Ketama(ring) => ring.locate(key),
            Self::VBucket(map) => map.locate(key),
        }
    }

    /// All nodes this locator was built from, dead ones included.
    pub fn nodes(&self) -> &[Arc<Node>] {
        match self {
            Self::Ketama(ring) => ring.nodes(),
            Self::VBucket(map) => map.nodes(),
        }
    }

    /// The vbucket index for `key`, for vbucket-aware request headers.
    /// `None` in ketama mode.
    pub fn vbucket_index(&self, key: &[u8]) -> Option<u16> {
        match self {
            Self::Ketama(_) => None,
            Self::VBucket(map) => Some(map.vbucket_index(key)),
        }
    }

    /// Nodes currently considered alive.
    pub fn working_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes()
            .iter()
            .filter(|n| n.is_alive())
            .cloned()
            .collect()
    }
}

/// Hash a key to its 32-bit ring/vbucket position: the first four
/// bytes of its blake3 digest, little-endian.
pub fn hash_key(key: &[u8]) -> u32 {
    let digest = blake3::hash(key);
    let bytes: [u8; 4] = digest.as_bytes()[..4].try_into().expect("4 bytes");
    u32::from_le_bytes(bytes)
}
