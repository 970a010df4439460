//! In-process fake cache servers for client tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use remora_types::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::{Client, ClientConfig, ClientOptions};

#[derive(Debug, Clone)]
pub struct Entry {
    pub flags: u32,
    pub value: Vec<u8>,
    pub cas: u64,
}

pub type Store = Arc<Mutex<HashMap<Vec<u8>, Entry>>>;

/// A minimal binary-protocol cache server.
///
/// Implements enough of the command set for end-to-end client tests,
/// including quiet gets, counters, streamed stats, and vbucket
/// ownership checks. `take_down` makes it refuse new connections and
/// drop established ones, which looks like a crashed node.
pub struct FakeServer {
    pub endpoint: Endpoint,
    pub store: Store,
    down: Arc<AtomicBool>,
    stats_fail: Arc<AtomicBool>,
}

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test ...`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl FakeServer {
    pub async fn spawn() -> Self {
        Self::spawn_owning(None).await
    }

    /// Spawn a server that only accepts requests addressed to the
    /// given vbuckets, answering NotMyVBucket for the rest. `None`
    /// accepts everything.
    pub async fn spawn_owning(owned_vbuckets: Option<HashSet<u16>>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let down = Arc::new(AtomicBool::new(false));
        let stats_fail = Arc::new(AtomicBool::new(false));
        let cas_counter = Arc::new(AtomicU64::new(1));

        let server_store = store.clone();
        let server_down = down.clone();
        let server_stats_fail = stats_fail.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                if server_down.load(Ordering::Acquire) {
                    continue; // drop the connection on the floor
                }
                let store = server_store.clone();
                let down = server_down.clone();
                let stats_fail = server_stats_fail.clone();
                let cas_counter = cas_counter.clone();
                let owned = owned_vbuckets.clone();
                tokio::spawn(async move {
                    while let Some(req) = read_request(&mut stream).await {
                        if down.load(Ordering::Acquire) {
                            return;
                        }
                        let reply = handle(
                            &req,
                            &store,
                            &cas_counter,
                            owned.as_ref(),
                            stats_fail.load(Ordering::Acquire),
                        )
                        .await;
                        if let Some(bytes) = reply {
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            endpoint: Endpoint::new("127.0.0.1", port),
            store,
            down,
            stats_fail,
        }
    }

    /// Make stat requests come back with a nonzero status.
    pub fn fail_stats(&self) {
        self.stats_fail.store(true, Ordering::Release);
    }

    /// Simulate a crash: refuse new connections, kill existing ones.
    pub fn take_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub fn bring_up(&self) {
        self.down.store(false, Ordering::Release);
    }

    pub async fn put(&self, key: &[u8], flags: u32, value: &[u8]) {
        self.store.lock().await.insert(
            key.to_vec(),
            Entry {
                flags,
                value: value.to_vec(),
                cas: 1,
            },
        );
    }
}

struct ParsedRequest {
    opcode: u8,
    vbucket: u16,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> Option<ParsedRequest> {
    let mut hdr = [0u8; 24];
    stream.read_exact(&mut hdr).await.ok()?;
    assert_eq!(hdr[0], 0x80, "server saw a non-request magic");
    let opcode = hdr[1];
    let key_len = u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
    let extras_len = hdr[4] as usize;
    let vbucket = u16::from_be_bytes([hdr[6], hdr[7]]);
    let total = u32::from_be_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]) as usize;
    let opaque = u32::from_be_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]);
    let cas = u64::from_be_bytes(hdr[16..24].try_into().unwrap());
    let mut body = vec![0u8; total];
    stream.read_exact(&mut body).await.ok()?;
    let extras = body[..extras_len].to_vec();
    let key = body[extras_len..extras_len + key_len].to_vec();
    let value = body[extras_len + key_len..].to_vec();
    Some(ParsedRequest {
        opcode,
        vbucket,
        opaque,
        cas,
        extras,
        key,
        value,
    })
}

fn encode_response(
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let mut out = BytesMut::new();
    out.put_u8(0x81);
    out.put_u8(opcode);
    out.put_u16(key.len() as u16);
    out.put_u8(extras.len() as u8);
    out.put_u8(0);
    out.put_u16(status);
    out.put_u32((extras.len() + key.len() + value.len()) as u32);
    out.put_u32(opaque);
    out.put_u64(cas);
    out.put_slice(extras);
    out.put_slice(key);
    out.put_slice(value);
    out.to_vec()
}

async fn handle(
    req: &ParsedRequest,
    store: &Store,
    cas_counter: &AtomicU64,
    owned: Option<&HashSet<u16>>,
    stats_fail: bool,
) -> Option<Vec<u8>> {
    // Administrative opcodes skip the ownership check.
    let keyed = !matches!(req.opcode, 0x0a | 0x0b | 0x10 | 0x08);
    if keyed {
        if let Some(owned) = owned {
            if !owned.contains(&req.vbucket) {
                return Some(encode_response(req.opcode, 0x0007, req.opaque, 0, &[], &[], &[]));
            }
        }
    }

    let mut store = store.lock().await;
    let next_cas = || cas_counter.fetch_add(1, Ordering::Relaxed);

    let reply = match req.opcode {
        // get / getq / gat
        0x00 | 0x09 | 0x1d => match store.get(&req.key) {
            Some(entry) => {
                let extras = entry.flags.to_be_bytes();
                encode_response(req.opcode, 0, req.opaque, entry.cas, &extras, &[], &entry.value)
            }
            None if req.opcode == 0x09 => return None, // quiet miss
            None => encode_response(req.opcode, 0x0001, req.opaque, 0, &[], &[], b"Not found"),
        },
        // set / add / replace
        0x01 | 0x02 | 0x03 => {
            let exists = store.contains_key(&req.key);
            let conflict = match req.opcode {
                0x02 => exists,
                0x03 => !exists,
                _ => {
                    req.cas != 0
                        && store.get(&req.key).map(|e| e.cas) != Some(req.cas)
                }
            };
            if conflict {
                let status = if req.opcode == 0x03 { 0x0001 } else { 0x0002 };
                encode_response(req.opcode, status, req.opaque, 0, &[], &[], &[])
            } else {
                let flags = u32::from_be_bytes(req.extras[..4].try_into().unwrap());
                let cas = next_cas();
                store.insert(
                    req.key.clone(),
                    Entry {
                        flags,
                        value: req.value.clone(),
                        cas,
                    },
                );
                encode_response(req.opcode, 0, req.opaque, cas, &[], &[], &[])
            }
        }
        // delete
        0x04 => match store.remove(&req.key) {
            Some(_) => encode_response(req.opcode, 0, req.opaque, 0, &[], &[], &[]),
            None => encode_response(req.opcode, 0x0001, req.opaque, 0, &[], &[], &[]),
        },
        // incr / decr
        0x05 | 0x06 => {
            let delta = u64::from_be_bytes(req.extras[..8].try_into().unwrap());
            let initial = u64::from_be_bytes(req.extras[8..16].try_into().unwrap());
            let expiry = u32::from_be_bytes(req.extras[16..20].try_into().unwrap());
            // Parse the stored value out before mutating the store.
            let current: Option<Option<u64>> = store
                .get(&req.key)
                .map(|e| std::str::from_utf8(&e.value).ok().and_then(|s| s.parse().ok()));
            match current {
                None if expiry == u32::MAX => {
                    encode_response(req.opcode, 0x0001, req.opaque, 0, &[], &[], &[])
                }
                Some(None) => {
                    // Non-numeric value.
                    encode_response(req.opcode, 0x0006, req.opaque, 0, &[], &[], &[])
                }
                current => {
                    let updated = match current {
                        Some(Some(n)) if req.opcode == 0x05 => n + delta,
                        Some(Some(n)) => n.saturating_sub(delta),
                        _ => initial, // absent: seed, no delta applied
                    };
                    let cas = next_cas();
                    store.insert(
                        req.key.clone(),
                        Entry {
                            flags: 0,
                            value: updated.to_string().into_bytes(),
                            cas,
                        },
                    );
                    encode_response(req.opcode, 0, req.opaque, cas, &[], &[], &updated.to_be_bytes())
                }
            }
        }
        // append / prepend
        0x0e | 0x0f => match store.get_mut(&req.key) {
            Some(entry) => {
                if req.opcode == 0x0e {
                    entry.value.extend_from_slice(&req.value);
                } else {
                    let mut combined = req.value.clone();
                    combined.extend_from_slice(&entry.value);
                    entry.value = combined;
                }
                entry.cas = next_cas();
                encode_response(req.opcode, 0, req.opaque, entry.cas, &[], &[], &[])
            }
            None => encode_response(req.opcode, 0x0005, req.opaque, 0, &[], &[], &[]),
        },
        // touch
        0x1c => match store.get(&req.key) {
            Some(entry) => encode_response(req.opcode, 0, req.opaque, entry.cas, &[], &[], &[]),
            None => encode_response(req.opcode, 0x0001, req.opaque, 0, &[], &[], &[]),
        },
        // flush
        0x08 => {
            store.clear();
            encode_response(req.opcode, 0, req.opaque, 0, &[], &[], &[])
        }
        // noop
        0x0a => encode_response(req.opcode, 0, req.opaque, 0, &[], &[], &[]),
        // version
        0x0b => encode_response(req.opcode, 0, req.opaque, 0, &[], &[], b"1.6.0"),
        // stat: one response per statistic, empty key terminates
        0x10 if stats_fail => {
            encode_response(req.opcode, 0x0081, req.opaque, 0, &[], &[], b"busy")
        }
        0x10 => {
            let mut out = Vec::new();
            out.extend(encode_response(req.opcode, 0, req.opaque, 0, &[], b"pid", b"42"));
            out.extend(encode_response(
                req.opcode,
                0,
                req.opaque,
                0,
                &[],
                b"curr_items",
                store.len().to_string().as_bytes(),
            ));
            out.extend(encode_response(req.opcode, 0, req.opaque, 0, &[], &[], &[]));
            out
        }
        other => encode_response(other, 0x0081, req.opaque, 0, &[], &[], &[]),
    };
    Some(reply)
}

/// Client config with short timeouts and a fail-fast policy.
pub fn test_config() -> ClientConfig {
    ClientConfig::from_toml(
        r#"
[pool]
min = 0
max = 2
queue_timeout_ms = 100

[timeouts]
connect_ms = 1000
receive_ms = 1000
dead_ms = 100

[failure]
policy = "fail_fast"
"#,
    )
    .unwrap()
}

/// A discovery-less client over fixed endpoints.
pub fn static_client(endpoints: Vec<Endpoint>) -> Client {
    Client::with_nodes(endpoints, test_config(), ClientOptions::default())
}
