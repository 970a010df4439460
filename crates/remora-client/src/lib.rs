//! A client for distributed key-value cache clusters speaking the
//! memcached binary protocol, with optional vbucket-aware routing for
//! clustered buckets.
//!
//! The client routes each key to a node through an immutable locator
//! snapshot (consistent-hash ring or vbucket map), runs operations
//! over bounded per-node connection pools, and follows cluster
//! topology through a streaming discovery feed. Failures are values:
//! expected trouble (timeouts, dead nodes, server statuses) comes back
//! as [`OperationResult`], while `Err` is reserved for broken framing
//! and bad configuration.

mod client;
mod config;
mod error;
mod result;
mod snapshot;
#[cfg(test)]
mod tests;

pub use client::{Client, ClientOptions};
pub use config::ClientConfig;
pub use error::ClientError;
pub use result::OperationResult;
pub use snapshot::ClusterSnapshot;
