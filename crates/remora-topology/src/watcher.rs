//! The streaming topology watcher.
//!
//! One long-lived HTTP GET per watcher, against the first reachable
//! bootstrap URL. The chunked body carries JSON cluster-config
//! documents, each terminated by three consecutive empty lines. The
//! watcher parses complete messages, drops duplicates, and broadcasts
//! the rest; a full pass with every URL unreachable broadcasts `None`
//! and sleeps for the dead timeout before trying again, forever.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use remora_types::ClusterConfig;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::TopologyError;

/// One topology event: a new snapshot, or `None` when no nodes are
/// currently available.
pub type TopologyEvent = Option<ClusterConfig>;

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Per-bucket streaming URLs, tried in order.
    pub bootstrap_urls: Vec<String>,
    /// Sleep between full passes once every URL has failed.
    pub dead_timeout: Duration,
    /// How long `shutdown` waits for the task before aborting it.
    pub join_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            bootstrap_urls: Vec::new(),
            dead_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl WatcherConfig {
    /// Registry key: watchers with the same URL list are shareable.
    pub(crate) fn registry_key(&self) -> String {
        self.bootstrap_urls.join("|")
    }
}

/// Watcher state machine, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherState {
    Idle,
    Connecting,
    Streaming,
    AllDead,
}

/// Spawns and owns the streaming task.
pub struct TopologyWatcher;

impl TopologyWatcher {
    /// Start watching. Returns only after the first snapshot — or the
    /// first declared failure — has been delivered, so callers never
    /// route against an unresolved topology.
    pub async fn start(config: WatcherConfig) -> Result<WatcherHandle, TopologyError> {
        if config.bootstrap_urls.is_empty() {
            return Err(TopologyError::NoBootstrapUrls);
        }
        // No overall request timeout: the streaming body is expected to
        // stay open indefinitely.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let (events, _) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (first_tx, first_rx) = oneshot::channel();
        let current = Arc::new(std::sync::RwLock::new(None));

        let mut task = WatcherTask {
            config: config.clone(),
            http,
            events: events.clone(),
            current: Arc::clone(&current),
            shutdown_rx,
            first_tx: Some(first_tx),
            last: None,
            state: WatcherState::Idle,
        };
        let join = tokio::spawn(async move { task.run().await });

        // Block start-up on the first delivery.
        if first_rx.await.is_err() {
            return Err(TopologyError::StartupAborted);
        }

        Ok(WatcherHandle {
            events,
            current,
            shutdown_tx,
            task: std::sync::Mutex::new(Some(join)),
            join_timeout: config.join_timeout,
            key: config.registry_key(),
        })
    }
}

/// Handle to a running watcher.
pub struct WatcherHandle {
    events: broadcast::Sender<TopologyEvent>,
    current: Arc<std::sync::RwLock<Option<TopologyEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
    key: String,
}

impl WatcherHandle {
    /// Subscribe to config-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// The most recently delivered event, if any has arrived yet.
    pub fn current(&self) -> Option<TopologyEvent> {
        self.current.read().expect("current lock").clone()
    }

    /// Registry key this watcher was started under.
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Stop the watcher: signal shutdown (which aborts an in-progress
    /// streaming read), wait up to the join timeout, then terminate
    /// the task forcefully if it still has not exited.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let join = self.task.lock().expect("task lock").take();
        if let Some(join) = join {
            let abort = join.abort_handle();
            if timeout(self.join_timeout, join).await.is_err() {
                warn!("topology watcher did not stop in time; aborting");
                abort.abort();
            }
        }
    }
}

struct WatcherTask {
    config: WatcherConfig,
    http: reqwest::Client,
    events: broadcast::Sender<TopologyEvent>,
    current: Arc<std::sync::RwLock<Option<TopologyEvent>>>,
    shutdown_rx: watch::Receiver<bool>,
    first_tx: Option<oneshot::Sender<()>>,
    last: Option<TopologyEvent>,
    state: WatcherState,
}

enum StreamOutcome {
    /// Shutdown requested.
    Stopped,
    /// The stream ended or failed after parsing `messages` documents.
    Ended { messages: usize },
}

impl WatcherTask {
    async fn run(&mut self) {
        loop {
            let mut pass_connected = false;
            let urls = self.config.bootstrap_urls.clone();
            for url in &urls {
                if *self.shutdown_rx.borrow() {
                    return;
                }
                self.set_state(WatcherState::Connecting);
                let response = match self.http.get(url).send().await {
                    Ok(r) if r.status().is_success() => r,
                    Ok(r) => {
                        warn!(url, status = %r.status(), "bootstrap url refused");
                        continue;
                    }
                    Err(e) => {
                        warn!(url, error = %e, "bootstrap url unreachable");
                        continue;
                    }
                };

                self.set_state(WatcherState::Streaming);
                info!(url, "streaming cluster topology");

                match self.consume_stream(response).await {
                    StreamOutcome::Stopped => return,
                    StreamOutcome::Ended { messages } => {
                        // A stream that died without one complete
                        // message counts as "no configuration", and as
                        // a failed URL: a flapping endpoint falls
                        // through to the dead-pass backoff instead of
                        // being reconnected in a tight loop.
                        if messages > 0 {
                            pass_connected = true;
                        } else {
                            self.deliver(None);
                        }
                    }
                }
            }

            if !pass_connected {
                self.set_state(WatcherState::AllDead);
                warn!("every bootstrap url failed; no topology available");
                self.deliver(None);
                tokio::select! {
                    _ = self.shutdown_rx.changed() => return,
                    _ = sleep(self.config.dead_timeout) => {}
                }
            }
        }
    }

    async fn consume_stream(&mut self, response: reqwest::Response) -> StreamOutcome {
        let mut stream = response.bytes_stream();
        let mut buf = BytesMut::new();
        let mut messages = 0usize;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return StreamOutcome::Stopped,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        for message in split_messages(&mut buf) {
                            messages += 1;
                            match serde_json::from_str::<ClusterConfig>(&message) {
                                Ok(config) => self.deliver(Some(config)),
                                Err(e) => {
                                    warn!(error = %e, "malformed cluster config document")
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "topology stream error");
                        return StreamOutcome::Ended { messages };
                    }
                    None => {
                        debug!("topology stream closed by server");
                        return StreamOutcome::Ended { messages };
                    }
                }
            }
        }
    }

    /// Deliver an event unless it equals the last one delivered.
    fn deliver(&mut self, event: TopologyEvent) {
        if self.last.as_ref() == Some(&event) {
            return;
        }
        self.last = Some(event.clone());
        *self.current.write().expect("current lock") = Some(event.clone());
        let _ = self.events.send(event);
        if let Some(first) = self.first_tx.take() {
            let _ = first.send(());
        }
    }

    fn set_state(&mut self, state: WatcherState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "watcher state change");
            self.state = state;
        }
    }
}

/// Split complete messages out of `buf`, leaving any partial trailing
/// message buffered. The discovery endpoint terminates each message
/// with three consecutive empty lines — the byte sequence `\n\n\n\n`
/// after the last content line.
fn split_messages(buf: &mut BytesMut) -> Vec<String> {
    const DELIMITER: &[u8] = b"\n\n\n\n";
    let mut out = Vec::new();
    loop {
        let Some(pos) = buf
            .windows(DELIMITER.len())
            .position(|window| window == DELIMITER)
        else {
            return out;
        };
        let message = buf.split_to(pos);
        buf.advance(DELIMITER.len());
        let text = String::from_utf8_lossy(&message);
        let text = text.trim();
        if !text.is_empty() {
            out.push(text.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CONFIG_ONE: &str = r#"{"name":"default","nodes":[{"hostname":"10.0.0.1:8091","ports":{"direct":11210},"status":"healthy"}]}"#;
    const CONFIG_TWO: &str = r#"{"name":"default","nodes":[{"hostname":"10.0.0.1:8091","ports":{"direct":11210},"status":"healthy"},{"hostname":"10.0.0.2:8091","ports":{"direct":11210},"status":"healthy"}]}"#;

    #[test]
    fn test_split_two_complete_messages_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"a\":1}\n\n\n\n{\"b\":2}\n\n\n\n");
        let messages = split_messages(&mut buf);
        assert_eq!(messages, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_message_stays_buffered() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"a\":1}\n\n\n\n{\"truncat");
        let messages = split_messages(&mut buf);
        assert_eq!(messages.len(), 1);
        assert_eq!(&buf[..], b"{\"truncat");
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"a\":1}\n\n");
        assert!(split_messages(&mut buf).is_empty());
        buf.extend_from_slice(b"\n\n");
        assert_eq!(split_messages(&mut buf), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_blank_messages_are_dropped() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\n\n\n\n\n\n\n\n");
        assert!(split_messages(&mut buf).is_empty());
    }

    /// Serve a canned chunked HTTP response with the given body, then
    /// hold the connection open.
    async fn spawn_stream_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    // Swallow the request head.
                    let mut scratch = [0u8; 1024];
                    let _ = stream.read(&mut scratch).await;

                    let head =
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ntransfer-encoding: chunked\r\n\r\n";
                    let chunk = format!("{:x}\r\n{}\r\n", body.len(), body);
                    if stream.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    if stream.write_all(chunk.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                    // Keep the stream open like a real discovery feed.
                    sleep(Duration::from_secs(60)).await;
                });
            }
        });
        format!("http://127.0.0.1:{port}/pools/default/bucketsStreaming/default")
    }

    fn test_config(url: String) -> WatcherConfig {
        WatcherConfig {
            bootstrap_urls: vec![url],
            dead_timeout: Duration::from_millis(50),
            join_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_watcher_delivers_first_snapshot_before_start_returns() {
        let body: &'static str =
            Box::leak(format!("{CONFIG_ONE}\n\n\n\n").into_boxed_str());
        let url = spawn_stream_server(body).await;
        let handle = TopologyWatcher::start(test_config(url)).await.unwrap();

        let current = handle.current().expect("first event delivered");
        let config = current.expect("a real snapshot, not all-dead");
        assert_eq!(config.nodes.len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_watcher_delivers_changed_snapshots_in_order() {
        let body: &'static str =
            Box::leak(format!("{CONFIG_ONE}\n\n\n\n{CONFIG_TWO}\n\n\n\n").into_boxed_str());
        let url = spawn_stream_server(body).await;
        let handle = TopologyWatcher::start(test_config(url)).await.unwrap();

        // Both documents arrive in one chunk; poll until the second
        // one is the current view.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(Some(config)) = handle.current() {
                if config.nodes.len() == 2 {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "second snapshot never arrived"
            );
            sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_snapshots_fire_one_event() {
        let body: &'static str =
            Box::leak(format!("{CONFIG_ONE}\n\n\n\n{CONFIG_ONE}\n\n\n\n").into_boxed_str());
        let url = spawn_stream_server(body).await;

        let handle = TopologyWatcher::start(test_config(url)).await.unwrap();
        let mut rx = handle.subscribe();
        // The first event was delivered before subscribe; the repeated
        // document must not produce a second one.
        sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        handle.shutdown().await;
    }

    /// Serve a 200 with an empty body and close, counting accepts.
    async fn spawn_flapping_server() -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut scratch = [0u8; 1024];
                    let _ = stream.read(&mut scratch).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        (format!("http://127.0.0.1:{port}/stream"), accepts)
    }

    #[tokio::test]
    async fn test_flapping_url_backs_off_between_passes() {
        use std::sync::atomic::Ordering;

        let (url, accepts) = spawn_flapping_server().await;
        let handle = TopologyWatcher::start(test_config(url)).await.unwrap();

        // A stream that ends without a single message counts as no
        // configuration.
        assert_eq!(handle.current(), Some(None));

        // With a 50ms dead timeout, 350ms allows for a handful of
        // passes. A tight reconnect loop would show hundreds.
        sleep(Duration::from_millis(350)).await;
        let count = accepts.load(Ordering::SeqCst);
        assert!(count <= 10, "reconnected {count} times in 350ms");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_all_urls_dead_delivers_none() {
        // Nothing listens on port 9; the pass fails entirely.
        let config = WatcherConfig {
            bootstrap_urls: vec!["http://127.0.0.1:9/stream".to_string()],
            dead_timeout: Duration::from_millis(50),
            join_timeout: Duration::from_secs(1),
        };
        let handle = TopologyWatcher::start(config).await.unwrap();
        assert_eq!(handle.current(), Some(None));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_bootstrap_list_is_an_error() {
        let err = TopologyWatcher::start(WatcherConfig::default()).await;
        assert!(matches!(err, Err(TopologyError::NoBootstrapUrls)));
    }
}
