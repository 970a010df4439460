//! Watcher sharing across clients.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TopologyError;
use crate::watcher::{TopologyWatcher, WatcherConfig, WatcherHandle};

/// Deduplicates topology watchers: clients pointed at the same
/// bootstrap URL list share one streaming connection instead of each
/// opening their own. The registry is created and owned by the
/// application and handed to each client explicitly.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: Mutex<HashMap<String, Arc<WatcherHandle>>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the watcher for `config`, starting one if none exists yet.
    ///
    /// Holding the map lock across the start call keeps two concurrent
    /// callers from racing one watcher each for the same key.
    pub async fn obtain(
        &self,
        config: WatcherConfig,
    ) -> Result<Arc<WatcherHandle>, TopologyError> {
        let key = config.registry_key();
        let mut watchers = self.watchers.lock().await;
        if let Some(handle) = watchers.get(&key) {
            debug!(key, "reusing existing topology watcher");
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(TopologyWatcher::start(config).await?);
        watchers.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop a watcher from the registry and stop it.
    pub async fn release(&self, handle: &WatcherHandle) {
        self.watchers.lock().await.remove(handle.key());
        handle.shutdown().await;
    }

    /// Stop every registered watcher.
    pub async fn shutdown_all(&self) {
        let watchers: Vec<_> = self.watchers.lock().await.drain().collect();
        for (_, handle) in watchers {
            handle.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }
}
