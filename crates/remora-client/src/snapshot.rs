//! Immutable cluster snapshots.
//!
//! A snapshot bundles the node set and the locator built over it.
//! Topology changes never patch a snapshot: a whole new one is built
//! and swapped in behind an `RwLock<Arc<_>>`, so request paths clone
//! one `Arc` and route against a consistent view for the rest of the
//! operation. Nodes surviving a rebuild are reused by endpoint, which
//! keeps their pools and liveness state across benign reconfigs.

use std::collections::HashMap;
use std::sync::Arc;

use remora_locator::{KetamaRing, Locator, VBucketLocator};
use remora_net::{Node, NodeEvent};
use remora_types::{AuthProvider, ClusterConfig, Endpoint, NodeStatus};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ClientConfig;

/// One immutable routing view of the cluster.
#[derive(Debug)]
pub struct ClusterSnapshot {
    locator: Locator,
    vbucket_aware: bool,
}

impl ClusterSnapshot {
    /// A snapshot with no nodes: every request reports no-node failure.
    pub(crate) fn empty() -> Self {
        Self {
            locator: Locator::Ketama(KetamaRing::build(Vec::new())),
            vbucket_aware: false,
        }
    }

    /// A ketama snapshot over a fixed node list (no discovery).
    pub(crate) fn from_static_nodes(nodes: Vec<Arc<Node>>) -> Self {
        Self {
            locator: Locator::Ketama(KetamaRing::build(nodes)),
            vbucket_aware: false,
        }
    }

    /// The locator routing requests under this snapshot.
    pub(crate) fn locator(&self) -> &Locator {
        &self.locator
    }

    /// All nodes in this snapshot, dead ones included.
    pub fn nodes(&self) -> &[Arc<Node>] {
        self.locator.nodes()
    }

    /// Whether requests under this snapshot carry vbucket indices.
    pub fn vbucket_aware(&self) -> bool {
        self.vbucket_aware
    }
}

/// Build the snapshot for a topology event.
///
/// `None` (no nodes available) produces the empty snapshot. Returns the
/// new snapshot plus the previous snapshot's nodes it did not carry
/// forward; the caller closes those after the swap.
pub(crate) fn build_snapshot(
    topology: Option<&ClusterConfig>,
    previous: &ClusterSnapshot,
    config: &ClientConfig,
    auth: Option<Arc<dyn AuthProvider>>,
    events: &broadcast::Sender<NodeEvent>,
) -> (ClusterSnapshot, Vec<Arc<Node>>) {
    let Some(topology) = topology else {
        return (ClusterSnapshot::empty(), previous.nodes().to_vec());
    };

    let mut survivors: HashMap<Endpoint, Arc<Node>> = previous
        .nodes()
        .iter()
        .map(|n| (n.endpoint().clone(), Arc::clone(n)))
        .collect();

    let mut take_node = |endpoint: Endpoint, healthy: bool| -> Arc<Node> {
        let node = survivors.remove(&endpoint).unwrap_or_else(|| {
            Node::new(
                endpoint,
                config.pool_config(),
                config.failure_policy(),
                auth.clone(),
                events.clone(),
            )
        });
        if !healthy {
            node.force_dead();
        }
        node
    };

    let health: HashMap<Endpoint, bool> = topology
        .nodes
        .iter()
        .filter_map(|n| {
            n.data_endpoint()
                .ok()
                .map(|e| (e, n.status == NodeStatus::Healthy))
        })
        .collect();

    let map = topology
        .vbucket_map
        .as_ref()
        .filter(|m| config.prefers_vbucket() && !m.vbucket_map.is_empty());

    let snapshot = match map {
        Some(map) => {
            // Positions matter: the map indexes the server list.
            let nodes: Vec<Arc<Node>> = map
                .server_list
                .iter()
                .map(|ep| take_node(ep.clone(), *health.get(ep).unwrap_or(&true)))
                .collect();
            info!(
                bucket = %topology.name,
                nodes = nodes.len(),
                vbuckets = map.vbucket_count(),
                "installing vbucket topology"
            );
            ClusterSnapshot {
                locator: Locator::VBucket(VBucketLocator::build(nodes, map.vbucket_map.clone())),
                vbucket_aware: true,
            }
        }
        None => {
            let mut nodes = Vec::new();
            for cluster_node in &topology.nodes {
                let Ok(endpoint) = cluster_node.data_endpoint() else {
                    warn!(
                        hostname = %cluster_node.hostname,
                        "skipping node with unparseable hostname"
                    );
                    continue;
                };
                let healthy = cluster_node.status == NodeStatus::Healthy;
                nodes.push(take_node(endpoint, healthy));
            }
            info!(
                bucket = %topology.name,
                nodes = nodes.len(),
                "installing ketama topology"
            );
            ClusterSnapshot {
                locator: Locator::Ketama(KetamaRing::build(nodes)),
                vbucket_aware: false,
            }
        }
    };

    (snapshot, survivors.into_values().collect())
}
