//! Connection handling for remora.
//!
//! One [`Node`] per cluster endpoint, each owning a bounded
//! [`ConnectionPool`] of live sockets. Liveness is decided by a
//! pluggable [`FailurePolicy`]; dead/alive transitions are published as
//! [`NodeEvent`]s on a broadcast channel so routing layers can react.

mod connection;
mod error;
mod failure;
mod node;
mod pool;

pub use connection::Connection;
pub use error::NetError;
pub use failure::{FailFast, FailurePolicy, WindowThrottle};
pub use node::{Node, NodeEvent};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
