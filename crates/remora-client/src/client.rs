//! The cluster client.
//!
//! A [`Client`] owns one routing snapshot behind an `RwLock<Arc<_>>`,
//! a topology event loop that swaps in new snapshots, and a
//! resurrection timer that probes dead nodes. Request paths clone the
//! snapshot `Arc` once and never hold the lock across I/O.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use remora_net::NetError;
use remora_proto::{MultiGetBatch, Opcode, Request, Response, Status};
use remora_topology::WatcherRegistry;
use remora_types::{
    AuthProvider, Endpoint, IdentityKeyTransformer, KeyTransformer, RawTranscoder, Transcoder,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::result::OperationResult;
use crate::snapshot::{build_snapshot, ClusterSnapshot};

/// Pluggable collaborators, defaulting to pass-through behavior.
pub struct ClientOptions {
    /// Application-key to wire-key transformation.
    pub key_transformer: Arc<dyn KeyTransformer>,
    /// Value encoding and flag handling.
    pub transcoder: Arc<dyn Transcoder>,
    /// SASL credentials; `None` for unauthenticated clusters.
    pub auth: Option<Arc<dyn AuthProvider>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key_transformer: Arc::new(IdentityKeyTransformer),
            transcoder: Arc::new(RawTranscoder),
            auth: None,
        }
    }
}

/// State shared between the client and its background tasks.
struct Shared {
    config: ClientConfig,
    snapshot: std::sync::RwLock<Arc<ClusterSnapshot>>,
    auth: Option<Arc<dyn AuthProvider>>,
    node_events: broadcast::Sender<remora_net::NodeEvent>,
}

impl Shared {
    fn new(config: ClientConfig, auth: Option<Arc<dyn AuthProvider>>) -> Self {
        let (node_events, _) = broadcast::channel(64);
        Self {
            config,
            snapshot: std::sync::RwLock::new(Arc::new(ClusterSnapshot::empty())),
            auth,
            node_events,
        }
    }

    fn snapshot(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock"))
    }

    /// Build and swap in the snapshot for a topology event, then close
    /// superseded nodes. In-flight requests keep their old `Arc` and
    /// finish against pools that stay open until those guards drop.
    async fn install(&self, topology: Option<&remora_types::ClusterConfig>) {
        let previous = self.snapshot();
        let (next, superseded) = build_snapshot(
            topology,
            &previous,
            &self.config,
            self.auth.clone(),
            &self.node_events,
        );
        *self.snapshot.write().expect("snapshot lock") = Arc::new(next);
        for node in superseded {
            debug!(endpoint = %node.endpoint(), "closing superseded node");
            node.close().await;
        }
    }
}

/// A distributed cache client.
pub struct Client {
    shared: Arc<Shared>,
    key_transformer: Arc<dyn KeyTransformer>,
    transcoder: Arc<dyn Transcoder>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect through topology discovery.
    ///
    /// Obtains a (possibly shared) watcher from the registry, installs
    /// the first snapshot before returning, and spawns the topology
    /// event loop plus the resurrection timer.
    pub async fn connect(
        config: ClientConfig,
        registry: &WatcherRegistry,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let watcher = registry.obtain(config.watcher_config()).await?;
        let shared = Arc::new(Shared::new(config, options.auth));

        // `start` only returns after a first delivery, so this is Some.
        let first = watcher.current().unwrap_or(None);
        shared.install(first.as_ref()).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = Self {
            shared: Arc::clone(&shared),
            key_transformer: options.key_transformer,
            transcoder: options.transcoder,
            shutdown_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        };

        let topology_task = tokio::spawn(topology_loop(
            Arc::clone(&shared),
            Arc::clone(&watcher),
            shutdown_rx.clone(),
        ));
        let probe_task = tokio::spawn(resurrection_loop(shared, shutdown_rx));
        client
            .tasks
            .lock()
            .expect("tasks lock")
            .extend([topology_task, probe_task]);
        Ok(client)
    }

    /// Build a client over a fixed node list, without discovery. The
    /// resurrection timer still runs; the node set never changes.
    pub fn with_nodes(
        endpoints: Vec<Endpoint>,
        config: ClientConfig,
        options: ClientOptions,
    ) -> Self {
        let shared = Arc::new(Shared::new(config, options.auth));
        {
            let nodes = endpoints
                .into_iter()
                .map(|endpoint| {
                    remora_net::Node::new(
                        endpoint,
                        shared.config.pool_config(),
                        shared.config.failure_policy(),
                        shared.auth.clone(),
                        shared.node_events.clone(),
                    )
                })
                .collect();
            *shared.snapshot.write().expect("snapshot lock") =
                Arc::new(ClusterSnapshot::from_static_nodes(nodes));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe_task = tokio::spawn(resurrection_loop(Arc::clone(&shared), shutdown_rx));
        Self {
            shared,
            key_transformer: options.key_transformer,
            transcoder: options.transcoder,
            shutdown_tx,
            tasks: std::sync::Mutex::new(vec![probe_task]),
        }
    }

    /// The current routing snapshot.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.shared.snapshot()
    }

    /// Liveness transitions of this client's nodes.
    pub fn node_events(&self) -> broadcast::Receiver<remora_net::NodeEvent> {
        self.shared.node_events.subscribe()
    }

    /// Stop background tasks and close every pool.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        for task in tasks {
            let abort = task.abort_handle();
            if timeout(Duration::from_secs(2), task).await.is_err() {
                abort.abort();
            }
        }
        let snapshot = self.shared.snapshot();
        for node in snapshot.nodes() {
            node.close().await;
        }
        info!("client shut down");
    }

    // -- single-key operations ---------------------------------------

    /// Fetch a value.
    pub async fn get(&self, key: &str) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        self.execute(&wire.clone(), move |vb, op| Request::get(wire, vb, op))
            .await
    }

    /// Store unconditionally, or CAS-conditionally when `cas` is
    /// nonzero.
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        expiry: u32,
        cas: u64,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        let (payload, flags) = self.transcoder.encode(value);
        let payload = Bytes::from(payload);
        self.execute(&wire.clone(), move |vb, op| {
            Request::set(wire, payload, flags, expiry, cas, vb, op)
        })
        .await
    }

    /// Store only if the key does not exist.
    pub async fn add(
        &self,
        key: &str,
        value: &[u8],
        expiry: u32,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        let (payload, flags) = self.transcoder.encode(value);
        let payload = Bytes::from(payload);
        self.execute(&wire.clone(), move |vb, op| {
            Request::add(wire, payload, flags, expiry, vb, op)
        })
        .await
    }

    /// Store only if the key exists.
    pub async fn replace(
        &self,
        key: &str,
        value: &[u8],
        expiry: u32,
        cas: u64,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        let (payload, flags) = self.transcoder.encode(value);
        let payload = Bytes::from(payload);
        self.execute(&wire.clone(), move |vb, op| {
            Request::replace(wire, payload, flags, expiry, cas, vb, op)
        })
        .await
    }

    /// Append raw bytes to an existing value. The transcoder is not
    /// involved: appending re-encoded fragments would corrupt framed
    /// encodings.
    pub async fn append(
        &self,
        key: &str,
        value: &[u8],
        cas: u64,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        let payload = Bytes::copy_from_slice(value);
        self.execute(&wire.clone(), move |vb, op| {
            Request::append(wire, payload, cas, vb, op)
        })
        .await
    }

    /// Prepend raw bytes to an existing value.
    pub async fn prepend(
        &self,
        key: &str,
        value: &[u8],
        cas: u64,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        let payload = Bytes::copy_from_slice(value);
        self.execute(&wire.clone(), move |vb, op| {
            Request::prepend(wire, payload, cas, vb, op)
        })
        .await
    }

    /// Remove a key.
    pub async fn delete(&self, key: &str, cas: u64) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        self.execute(&wire.clone(), move |vb, op| Request::delete(wire, cas, vb, op))
            .await
    }

    /// Add `delta` to a counter, seeding with `initial` when absent.
    pub async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        self.execute(&wire.clone(), move |vb, op| {
            Request::increment(wire, delta, initial, expiry, vb, op)
        })
        .await
    }

    /// Subtract `delta` from a counter, clamping at zero.
    pub async fn decrement(
        &self,
        key: &str,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        self.execute(&wire.clone(), move |vb, op| {
            Request::decrement(wire, delta, initial, expiry, vb, op)
        })
        .await
    }

    /// Reset a key's expiry without touching the value.
    pub async fn touch(&self, key: &str, expiry: u32) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        self.execute(&wire.clone(), move |vb, op| Request::touch(wire, expiry, vb, op))
            .await
    }

    /// Fetch a value and reset its expiry in one round trip.
    pub async fn get_and_touch(
        &self,
        key: &str,
        expiry: u32,
    ) -> Result<OperationResult, ClientError> {
        let wire = self.wire_key(key);
        self.execute(&wire.clone(), move |vb, op| {
            Request::get_and_touch(wire, expiry, vb, op)
        })
        .await
    }

    // -- multi-key and per-node operations ---------------------------

    /// Fetch many keys in parallel pipelined batches.
    ///
    /// Keys are grouped by owning node; each group goes out as one
    /// quiet-get pipeline on one connection, and groups run
    /// concurrently. Only hits appear in the result: a missing entry is
    /// a miss, a key with no live node, or a node that failed mid-fetch
    /// (its failure feeds that node's policy).
    pub async fn multi_get(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>, ClientError> {
        let snapshot = self.shared.snapshot();

        let mut groups: HashMap<Endpoint, (Arc<remora_net::Node>, Vec<(String, Bytes, u16)>)> =
            HashMap::new();
        for &key in keys {
            let wire = self.wire_key(key);
            let Some(node) = snapshot.locator().locate(&wire) else {
                continue;
            };
            let vbucket = snapshot.locator().vbucket_index(&wire).unwrap_or(0);
            groups
                .entry(node.endpoint().clone())
                .or_insert_with(|| (node, Vec::new()))
                .1
                .push((key.to_string(), wire, vbucket));
        }

        let fetches = groups.into_values().map(|(node, entries)| {
            let transcoder = Arc::clone(&self.transcoder);
            async move { fetch_batch(node, entries, transcoder).await }
        });

        let mut hits = HashMap::new();
        for result in futures::future::join_all(fetches).await {
            hits.extend(result?);
        }
        Ok(hits)
    }

    /// Collect statistics from every live node. `group` selects a
    /// named stats group; `None` asks for the general set.
    pub async fn stats(
        &self,
        group: Option<&str>,
    ) -> Result<HashMap<Endpoint, HashMap<String, String>>, ClientError> {
        let snapshot = self.shared.snapshot();
        let group = group.map(|g| Bytes::copy_from_slice(g.as_bytes()));
        let mut out = HashMap::new();

        for node in snapshot.locator().working_nodes() {
            let Some(mut conn) = node.acquire().await else {
                continue;
            };
            let opaque = conn.next_opaque();
            if conn.send(&Request::stats(group.clone(), opaque)).await.is_err() {
                node.record_failure();
                continue;
            }

            let receive_timeout = node.pool().config().receive_timeout;
            let mut entries = HashMap::new();
            let mut rejected = false;
            // The server streams one response per statistic and ends
            // the group with an empty-key response. A nonzero status
            // also ends the stream, but the fetch did not succeed and
            // the node must not be reported with partial entries.
            let complete = loop {
                match conn.read_response(receive_timeout).await {
                    Ok(resp) => {
                        if resp.opaque != opaque {
                            return Err(ClientError::CorrelationMismatch {
                                expected: opaque,
                                actual: resp.opaque,
                            });
                        }
                        if !resp.is_success() {
                            warn!(
                                endpoint = %node.endpoint(),
                                status = ?resp.status,
                                "stats request rejected"
                            );
                            rejected = true;
                            break true;
                        }
                        if resp.key.is_empty() {
                            break true;
                        }
                        entries.insert(
                            String::from_utf8_lossy(&resp.key).into_owned(),
                            String::from_utf8_lossy(&resp.value).into_owned(),
                        );
                    }
                    Err(NetError::Proto(e)) => return Err(e.into()),
                    Err(e) => {
                        warn!(endpoint = %node.endpoint(), error = %e, "stats read failed");
                        node.record_failure();
                        break false;
                    }
                }
            };
            if complete {
                conn.release().await;
                if !rejected {
                    out.insert(node.endpoint().clone(), entries);
                }
            }
        }
        Ok(out)
    }

    /// Discard everything on every live node.
    pub async fn flush(&self) -> Result<Vec<(Endpoint, OperationResult)>, ClientError> {
        self.fan_out(Request::flush).await
    }

    /// Server version string per live node.
    pub async fn versions(&self) -> Result<Vec<(Endpoint, String)>, ClientError> {
        let results = self.fan_out(Request::version).await?;
        Ok(results
            .into_iter()
            .filter_map(|(endpoint, result)| match result {
                OperationResult::Success { data, .. } => {
                    Some((endpoint, String::from_utf8_lossy(&data).into_owned()))
                }
                _ => None,
            })
            .collect())
    }

    // -- internals ---------------------------------------------------

    fn wire_key(&self, key: &str) -> Bytes {
        Bytes::from(self.key_transformer.transform(key))
    }

    /// Route one request by key and run it on the owning node.
    async fn execute(
        &self,
        wire_key: &Bytes,
        build: impl FnOnce(u16, u32) -> Request,
    ) -> Result<OperationResult, ClientError> {
        let snapshot = self.shared.snapshot();
        let Some(node) = snapshot.locator().locate(wire_key) else {
            return Ok(OperationResult::NoNode);
        };
        let vbucket = snapshot.locator().vbucket_index(wire_key).unwrap_or(0);
        self.dispatch(&node, move |opaque| build(vbucket, opaque))
            .await
    }

    /// Run one request/response exchange on a specific node.
    async fn dispatch(
        &self,
        node: &Arc<remora_net::Node>,
        build: impl FnOnce(u32) -> Request,
    ) -> Result<OperationResult, ClientError> {
        let Some(mut conn) = node.acquire().await else {
            return Ok(OperationResult::Failed(format!(
                "no connection available to {}",
                node.endpoint()
            )));
        };

        let opaque = conn.next_opaque();
        let request = build(opaque);
        if let Err(e) = conn.send(&request).await {
            node.record_failure();
            return Ok(OperationResult::Failed(e.to_string()));
        }

        let receive_timeout = node.pool().config().receive_timeout;
        let response = match conn.read_response(receive_timeout).await {
            Ok(resp) => resp,
            // Broken framing is a hard error; the dropped guard
            // destroys the connection.
            Err(NetError::Proto(e)) => return Err(e.into()),
            Err(e) => {
                node.record_failure();
                return Ok(OperationResult::Failed(e.to_string()));
            }
        };
        if response.opaque != opaque {
            return Err(ClientError::CorrelationMismatch {
                expected: opaque,
                actual: response.opaque,
            });
        }

        let result = interpret(&response, self.transcoder.as_ref());
        conn.release().await;
        Ok(result)
    }

    /// Run a key-less request on every live node.
    async fn fan_out(
        &self,
        build: fn(u32) -> Request,
    ) -> Result<Vec<(Endpoint, OperationResult)>, ClientError> {
        let snapshot = self.shared.snapshot();
        let mut results = Vec::new();
        for node in snapshot.locator().working_nodes() {
            let result = self.dispatch(&node, build).await?;
            results.push((node.endpoint().clone(), result));
        }
        Ok(results)
    }
}

/// Map a decoded response to an operation outcome.
fn interpret(response: &Response, transcoder: &dyn Transcoder) -> OperationResult {
    match response.status {
        Status::Success => match response.opcode {
            Opcode::Increment | Opcode::Decrement => match response.counter_value() {
                Some(value) => OperationResult::Counter(value),
                None => OperationResult::Failed("counter response without value".to_string()),
            },
            _ => {
                let flags = response.flags();
                OperationResult::Success {
                    cas: response.cas,
                    flags,
                    data: Bytes::from(transcoder.decode(&response.value, flags)),
                }
            }
        },
        Status::KeyNotFound => OperationResult::Miss,
        Status::KeyExists | Status::NotStored => OperationResult::NotStored,
        Status::NotMyVBucket => OperationResult::WrongVBucket,
        other => OperationResult::Failed(
            response
                .error_message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("server status {:#06x}", other.as_u16())),
        ),
    }
}

/// One node's share of a multi-get: a single pipelined batch.
///
/// Node-level failures return the hits gathered so far; protocol
/// violations are hard errors.
async fn fetch_batch(
    node: Arc<remora_net::Node>,
    entries: Vec<(String, Bytes, u16)>,
    transcoder: Arc<dyn Transcoder>,
) -> Result<HashMap<String, Bytes>, ClientError> {
    let Some(mut conn) = node.acquire().await else {
        return Ok(HashMap::new());
    };

    let wire: Vec<(Bytes, u16)> = entries
        .iter()
        .map(|(_, key, vbucket)| (key.clone(), *vbucket))
        .collect();
    // Reserve the whole opaque span up front so nothing else on this
    // connection can collide with the pipeline.
    let first = conn.reserve_opaques(wire.len() as u32 + 1);
    let batch = MultiGetBatch::build(&wire, first)?;
    let originals: HashMap<Bytes, String> = entries
        .into_iter()
        .map(|(original, key, _)| (key, original))
        .collect();

    if let Err(e) = conn.send_bytes(batch.bytes()).await {
        warn!(endpoint = %node.endpoint(), error = %e, "multi-get send failed");
        node.record_failure();
        return Ok(HashMap::new());
    }

    let receive_timeout = node.pool().config().receive_timeout;
    let mut hits = HashMap::new();
    loop {
        let response = match conn.read_response(receive_timeout).await {
            Ok(resp) => resp,
            Err(NetError::Proto(e)) => return Err(e.into()),
            Err(e) => {
                warn!(endpoint = %node.endpoint(), error = %e, "multi-get read failed");
                node.record_failure();
                return Ok(hits);
            }
        };
        if response.opaque == batch.terminator_opaque() {
            break;
        }
        let Some(key) = batch.key_for_opaque(response.opaque) else {
            return Err(ClientError::CorrelationMismatch {
                expected: batch.terminator_opaque(),
                actual: response.opaque,
            });
        };
        if response.is_success() {
            if let Some(original) = originals.get(key) {
                let flags = response.flags();
                hits.insert(
                    original.clone(),
                    Bytes::from(transcoder.decode(&response.value, flags)),
                );
            }
        }
    }

    conn.release().await;
    Ok(hits)
}

/// Apply every topology event to the shared snapshot.
async fn topology_loop(
    shared: Arc<Shared>,
    watcher: Arc<remora_topology::WatcherHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut events = watcher.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            event = events.recv() => match event {
                Ok(event) => shared.install(event.as_ref()).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed intermediate snapshots don't matter; only
                    // the latest view does.
                    warn!(skipped, "topology events lagged; resyncing");
                    if let Some(latest) = watcher.current() {
                        shared.install(latest.as_ref()).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Periodically probe dead nodes and revive the ones that answer.
///
/// Probes use short-lived connections outside the pools, so request
/// traffic is never starved by probing. A revived node is visible to
/// routing immediately; no locator rebuild is needed because locators
/// read liveness at lookup time.
async fn resurrection_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = shared.config.dead_timeout();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = sleep(period) => {}
        }
        let snapshot = shared.snapshot();
        for node in snapshot.nodes() {
            if node.is_alive() {
                continue;
            }
            if node.probe().await {
                node.mark_alive();
            } else {
                debug!(endpoint = %node.endpoint(), "resurrection probe failed");
            }
        }
    }
}
