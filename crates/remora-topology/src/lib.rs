//! Cluster-topology discovery.
//!
//! A [`TopologyWatcher`] holds a streaming HTTP connection to one of
//! the cluster's bootstrap URLs and turns the chunked body into
//! [`ClusterConfig`](remora_types::ClusterConfig) snapshots: each JSON
//! document on the stream is terminated by three consecutive empty
//! lines. Changed snapshots are broadcast as events; `None` means "no
//! nodes currently available".
//!
//! The [`WatcherRegistry`] deduplicates watchers across clients that
//! share the same bootstrap list and bucket. It is an explicit object
//! owned by the application, not a process-wide static.

mod error;
mod registry;
mod watcher;

pub use error::TopologyError;
pub use registry::WatcherRegistry;
pub use watcher::{TopologyEvent, TopologyWatcher, WatcherConfig, WatcherHandle};
