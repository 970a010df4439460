//! A cluster node: endpoint, connection pool, and liveness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use remora_proto::Request;
use remora_types::{AuthProvider, Endpoint};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::failure::FailurePolicy;
use crate::pool::{ConnectionPool, PoolConfig, PooledConnection};
use crate::Connection;

/// Liveness transitions, published so routing layers can rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The node's failure policy tripped; it is now excluded from
    /// primary selection.
    Failed(Endpoint),
    /// A resurrection probe succeeded; the node is back in service.
    Revived(Endpoint),
}

/// One cache node.
///
/// Created when a topology snapshot is (re)built and closed when a
/// newer snapshot supersedes it. The dead/alive flag is read by
/// request paths and written by the failure policy and the
/// resurrection prober; a stale read costs at most one doomed attempt.
pub struct Node {
    endpoint: Endpoint,
    pool: Arc<ConnectionPool>,
    alive: AtomicBool,
    policy: Box<dyn FailurePolicy>,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    /// Create a node with its own connection pool.
    pub fn new(
        endpoint: Endpoint,
        pool_config: PoolConfig,
        policy: Box<dyn FailurePolicy>,
        auth: Option<Arc<dyn AuthProvider>>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(endpoint.clone(), pool_config, auth);
        Arc::new(Self {
            endpoint,
            pool,
            alive: AtomicBool::new(true),
            policy,
            events,
        })
    }

    /// The node's network identity.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current liveness. Eventually consistent by design.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// This node's connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Check out a connection, or `None` when the node is dead or the
    /// pool has no capacity within the queue timeout.
    pub async fn acquire(&self) -> Option<PooledConnection> {
        if !self.is_alive() {
            return None;
        }
        self.pool.acquire().await
    }

    /// Feed one failed operation into the failure policy. Returns true
    /// when this call transitioned the node to dead.
    pub fn record_failure(&self) -> bool {
        if !self.policy.record_failure() {
            return false;
        }
        let transitioned = self.alive.swap(false, Ordering::AcqRel);
        if transitioned {
            warn!(endpoint = %self.endpoint, "node marked dead");
            let _ = self.events.send(NodeEvent::Failed(self.endpoint.clone()));
        }
        transitioned
    }

    /// Bring the node back into service, clearing failure history.
    /// Returns true when this call transitioned it back to alive.
    pub fn mark_alive(&self) -> bool {
        self.policy.reset();
        let transitioned = !self.alive.swap(true, Ordering::AcqRel);
        if transitioned {
            info!(endpoint = %self.endpoint, "node revived");
            let _ = self.events.send(NodeEvent::Revived(self.endpoint.clone()));
        }
        transitioned
    }

    /// Force the dead state without consulting the policy — used when
    /// topology reports a node unhealthy from the start.
    pub fn force_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Cheap liveness probe on a short-lived connection: connect, send
    /// a binary noop, expect a matching success response. Never touches
    /// the pool, so foreground traffic cannot be starved by probing.
    pub async fn probe(&self) -> bool {
        let config = self.pool.config();
        let mut conn = match Connection::connect(&self.endpoint, config.connect_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "probe connect failed");
                return false;
            }
        };
        let opaque = conn.next_opaque();
        if conn.send(&Request::noop(opaque)).await.is_err() {
            return false;
        }
        match conn.read_response(config.receive_timeout).await {
            Ok(resp) => resp.opaque == opaque && resp.is_success(),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "probe read failed");
                false
            }
        }
    }

    /// Close the node's pool. Called after a topology swap supersedes
    /// this node.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("endpoint", &self.endpoint)
            .field("alive", &self.is_alive())
            .finish()
    }
}
