//! Bounded per-node connection pool.
//!
//! The pool hands out at most `max` connections at a time; `acquire`
//! waits up to the queue timeout for capacity and returns `None` (not
//! an error) when it runs out of patience — a timed-out acquire is an
//! expected operational condition. Released connections go back to the
//! idle set only while healthy; anything that errored is destroyed.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use remora_types::{AuthProvider, Endpoint};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::connection::Connection;

/// Pool sizing and timeout knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections established up front by [`ConnectionPool::prefill`].
    pub min: usize,
    /// Hard cap on concurrently checked-out connections.
    pub max: usize,
    /// How long `acquire` waits for capacity.
    pub queue_timeout: Duration,
    /// TCP connect budget, separate from the receive timeout.
    pub connect_timeout: Duration,
    /// Per-read budget while waiting for a response.
    pub receive_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            queue_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(2),
        }
    }
}

/// A bounded set of live connections to one node.
pub struct ConnectionPool {
    endpoint: Endpoint,
    config: PoolConfig,
    idle: Mutex<Vec<Connection>>,
    /// Permits cap checked-out connections at `config.max`.
    permits: Arc<Semaphore>,
    auth: Option<Arc<dyn AuthProvider>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool. No connections are opened until first use or
    /// [`ConnectionPool::prefill`].
    pub fn new(
        endpoint: Endpoint,
        config: PoolConfig,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Arc<Self> {
        let max = config.max.max(1);
        Arc::new(Self {
            endpoint,
            config,
            idle: Mutex::new(Vec::with_capacity(max)),
            permits: Arc::new(Semaphore::new(max)),
            auth,
            closed: AtomicBool::new(false),
        })
    }

    /// The node this pool connects to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The pool's sizing and timeout configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Establish the configured minimum number of idle connections.
    /// Failures here are logged, not fatal: the pool lazily retries on
    /// demand.
    pub async fn prefill(self: &Arc<Self>) {
        for _ in 0..self.config.min {
            match self.open_connection().await {
                Ok(conn) => self.idle.lock().await.push(conn),
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "pool prefill failed");
                    break;
                }
            }
        }
    }

    /// Check out a connection, waiting up to the queue timeout.
    ///
    /// Returns `None` on timeout, on connect failure, or once the pool
    /// is closed. The returned guard gives the connection back to the
    /// idle set on [`PooledConnection::release`]; merely dropping the
    /// guard destroys the connection instead.
    pub async fn acquire(self: &Arc<Self>) -> Option<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let permit = match timeout(
            self.config.queue_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // Elapsed, or the semaphore was closed by `close`.
            _ => return None,
        };

        // Prefer an idle connection; open a fresh one otherwise.
        let idle = self.idle.lock().await.pop();
        let conn = match idle {
            Some(conn) => conn,
            None => match self.open_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(endpoint = %self.endpoint, error = %e, "connect failed");
                    return None;
                }
            },
        };

        Some(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Close the pool: refuse new acquires and drop all idle
    /// connections. Checked-out connections die when their guards go.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().await.clear();
    }

    /// Number of idle connections right now (test observability).
    pub async fn idle_len(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn open_connection(&self) -> Result<Connection, crate::NetError> {
        let mut conn = Connection::connect(&self.endpoint, self.config.connect_timeout).await?;
        if let Some(auth) = &self.auth {
            conn.authenticate(auth.as_ref(), self.config.receive_timeout)
                .await?;
        }
        Ok(conn)
    }

    async fn put_back(&self, mut conn: Connection) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        conn.reset();
        if conn.is_alive() {
            self.idle.lock().await.push(conn);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// A checked-out connection.
///
/// Call [`PooledConnection::release`] to return it to the pool after a
/// clean operation. Dropping the guard without releasing destroys the
/// connection — the right outcome for a connection that saw an error.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Return a healthy connection to the pool's idle set.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_alive() {
                self.pool.put_back(conn).await;
            }
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until release")
    }
}
