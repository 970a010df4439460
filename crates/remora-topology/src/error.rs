//! Error types for topology discovery.

/// Errors raised while setting up or running a topology watcher.
///
/// Stream-level failures are not errors: the watcher retries those
/// forever, cycling bootstrap URLs and emitting a `None` event when a
/// full pass fails.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// No bootstrap URLs were configured.
    #[error("no bootstrap urls configured")]
    NoBootstrapUrls,

    /// Building the HTTP client failed.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The watcher task stopped before delivering a first snapshot.
    #[error("watcher exited before the first snapshot")]
    StartupAborted,
}
