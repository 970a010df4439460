//! VBucket-map locator for clustered buckets.
//!
//! Key ownership is decoupled from the raw hash: keys hash to one of a
//! fixed number of vbuckets, and the cluster-published map assigns
//! each vbucket a master plus replicas. The map row order is
//! `[master, replica...]`; `-1` marks an unassigned slot.

use std::sync::Arc;

use remora_net::Node;
use tracing::debug;

use crate::hash_key;

/// An immutable vbucket routing table.
#[derive(Debug)]
pub struct VBucketLocator {
    /// Nodes in server-list order — the map indexes this list.
    nodes: Vec<Arc<Node>>,
    /// Per-vbucket `[master, replica...]` node indices.
    map: Vec<Vec<i32>>,
}

impl VBucketLocator {
    /// Build from nodes in server-list order and the published map.
    pub fn build(nodes: Vec<Arc<Node>>, map: Vec<Vec<i32>>) -> Self {
        debug!(
            nodes = nodes.len(),
            vbuckets = map.len(),
            "built vbucket locator"
        );
        Self { nodes, map }
    }

    /// All nodes, in server-list order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Number of vbuckets.
    pub fn vbucket_count(&self) -> usize {
        self.map.len()
    }

    /// The vbucket owning `key`. Every request header carries this so
    /// the server can answer "not my vbucket" when routing is stale.
    pub fn vbucket_index(&self, key: &[u8]) -> u16 {
        if self.map.is_empty() {
            return 0;
        }
        (hash_key(key) as usize % self.map.len()) as u16
    }

    /// Resolve the node for `key`: the vbucket's master, falling back
    /// to replicas in map order when the master is dead or unassigned.
    pub fn locate(&self, key: &[u8]) -> Option<Arc<Node>> {
        if self.map.is_empty() || self.nodes.is_empty() {
            return None;
        }
        let row = &self.map[self.vbucket_index(key) as usize];
        for &index in row {
            if index < 0 {
                continue;
            }
            let Some(node) = self.nodes.get(index as usize) else {
                continue;
            };
            if node.is_alive() {
                return Some(Arc::clone(node));
            }
        }
        None
    }
}
