//! Shared types for remora.
//!
//! This crate defines the types used across the remora workspace:
//! node identity ([`Endpoint`]), cluster-topology snapshots
//! ([`ClusterConfig`], [`VBucketServerMap`]), and the pluggable
//! collaborator traits the client consumes but does not implement
//! ([`KeyTransformer`], [`Transcoder`], [`AuthProvider`]).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Error returned when an endpoint string cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint {input:?}: expected \"host:port\"")]
pub struct EndpointParseError {
    /// The string that failed to parse.
    pub input: String,
}

/// Network identity of a cache node: hostname (or IP) plus data port.
///
/// Two nodes are the same node exactly when their endpoints are equal;
/// topology rebuilds match surviving nodes by endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// Data (memcached) port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || EndpointParseError {
            input: s.to_string(),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(err)?;
        if host.is_empty() {
            return Err(err());
        }
        let port: u16 = port.parse().map_err(|_| err())?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Cluster topology snapshot
// ---------------------------------------------------------------------------

/// Health of a node as reported by the topology discovery feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Serving traffic.
    Healthy,
    /// Starting up; not yet serving reads.
    Warmup,
    /// Anything else the feed reports.
    #[serde(other)]
    Unhealthy,
}

/// One node entry in a cluster-config snapshot.
///
/// `hostname` carries the management port (`"host:8091"`); the data
/// port lives in `ports.direct`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterNode {
    /// `"host:management-port"` as reported by the feed.
    pub hostname: String,
    /// Per-protocol port numbers.
    pub ports: NodePorts,
    /// Health status.
    pub status: NodeStatus,
}

/// Port numbers advertised for a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodePorts {
    /// The binary/text cache data port.
    pub direct: u16,
}

impl ClusterNode {
    /// The endpoint requests should be sent to: the hostname's host
    /// part combined with the direct data port.
    pub fn data_endpoint(&self) -> Result<Endpoint, EndpointParseError> {
        let host = self
            .hostname
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(self.hostname.as_str());
        if host.is_empty() {
            return Err(EndpointParseError {
                input: self.hostname.clone(),
            });
        }
        Ok(Endpoint::new(host, self.ports.direct))
    }
}

/// The vbucket map of a clustered bucket.
///
/// `vbucket_map[i]` lists node indices into `server_list`: the master
/// first, then `num_replicas` replicas. An index of `-1` means that
/// slot is currently unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VBucketServerMap {
    /// Hash algorithm name advertised by the cluster.
    #[serde(rename = "hashAlgorithm", default)]
    pub hash_algorithm: String,
    /// Number of replica slots per vbucket.
    #[serde(rename = "numReplicas", default)]
    pub num_replicas: u16,
    /// Data endpoints in map order. Positions matter: the map indexes
    /// this list.
    #[serde(rename = "serverList")]
    pub server_list: Vec<Endpoint>,
    /// Per-vbucket rows of `[master, replica...]` indices.
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

impl VBucketServerMap {
    /// Number of vbuckets in the map.
    pub fn vbucket_count(&self) -> usize {
        self.vbucket_map.len()
    }

    /// Master node index for a vbucket, or `None` if unassigned.
    pub fn master(&self, vbucket: usize) -> Option<usize> {
        match self.vbucket_map.get(vbucket)?.first()? {
            i if *i >= 0 => Some(*i as usize),
            _ => None,
        }
    }

    /// Replica node indices for a vbucket, unassigned slots skipped.
    pub fn replicas(&self, vbucket: usize) -> Vec<usize> {
        match self.vbucket_map.get(vbucket) {
            Some(row) => row
                .iter()
                .skip(1)
                .filter(|i| **i >= 0)
                .map(|i| *i as usize)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// One immutable version of cluster topology, parsed from a single
/// JSON document on the discovery stream.
///
/// Snapshots are compared whole (`PartialEq`) for change detection and
/// are never patched; a changed cluster always delivers a new one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterConfig {
    /// Bucket name.
    #[serde(default)]
    pub name: String,
    /// All known nodes with health status.
    pub nodes: Vec<ClusterNode>,
    /// Present only for vbucket-aware (clustered) buckets.
    #[serde(rename = "vBucketServerMap", default)]
    pub vbucket_map: Option<VBucketServerMap>,
}

impl ClusterConfig {
    /// Data endpoints of healthy nodes, in feed order.
    ///
    /// Entries with unparseable hostnames are skipped.
    pub fn healthy_endpoints(&self) -> Vec<Endpoint> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Healthy)
            .filter_map(|n| n.data_endpoint().ok())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits (consumed, not implemented by the core)
// ---------------------------------------------------------------------------

/// Turns an application key into a wire-safe byte key.
///
/// The core hashes and routes whatever this returns; escaping or
/// hashing long keys is the implementor's business.
pub trait KeyTransformer: Send + Sync {
    /// Transform an application key into wire bytes.
    fn transform(&self, key: &str) -> Vec<u8>;
}

/// Passes keys through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityKeyTransformer;

impl KeyTransformer for IdentityKeyTransformer {
    fn transform(&self, key: &str) -> Vec<u8> {
        key.as_bytes().to_vec()
    }
}

/// Converts values to and from byte payloads plus numeric flags.
///
/// The flags travel with the value on the wire and come back on reads,
/// letting the transcoder pick a decoding.
pub trait Transcoder: Send + Sync {
    /// Encode a value into payload bytes and flags.
    fn encode(&self, value: &[u8]) -> (Vec<u8>, u32);
    /// Decode payload bytes using the stored flags.
    fn decode(&self, payload: &[u8], flags: u32) -> Vec<u8>;
}

/// Stores and returns raw bytes, flags always zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawTranscoder;

impl Transcoder for RawTranscoder {
    fn encode(&self, value: &[u8]) -> (Vec<u8>, u32) {
        (value.to_vec(), 0)
    }

    fn decode(&self, payload: &[u8], _flags: u32) -> Vec<u8> {
        payload.to_vec()
    }
}

/// Produces authentication payloads for the SASL handshake.
///
/// The core shuttles these bytes through the socket unexamined; payload
/// construction (PLAIN, CRAM-MD5, ...) lives behind this trait.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// SASL mechanism name, e.g. `"PLAIN"`.
    fn mechanism(&self) -> &str;
    /// Initial authentication bytes.
    async fn initial(&self) -> Vec<u8>;
    /// Response to a server continuation challenge.
    async fn respond(&self, challenge: &[u8]) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_and_display() {
        let e: Endpoint = "cache-1.internal:11211".parse().unwrap();
        assert_eq!(e.host, "cache-1.internal");
        assert_eq!(e.port, 11211);
        assert_eq!(e.to_string(), "cache-1.internal:11211");
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":11211".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_cluster_config_from_discovery_json() {
        let doc = r#"{
            "name": "default",
            "nodes": [
                {"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}, "status": "healthy"},
                {"hostname": "10.0.0.2:8091", "ports": {"direct": 11210}, "status": "unhealthy"}
            ],
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 1,
                "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                "vBucketMap": [[0, 1], [1, 0], [0, -1]]
            }
        }"#;
        let cfg: ClusterConfig = serde_json::from_str(doc).unwrap();
        assert_eq!(cfg.name, "default");
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.nodes[1].status, NodeStatus::Unhealthy);
        assert_eq!(
            cfg.healthy_endpoints(),
            vec![Endpoint::new("10.0.0.1", 11210)]
        );

        let map = cfg.vbucket_map.unwrap();
        assert_eq!(map.vbucket_count(), 3);
        assert_eq!(map.master(0), Some(0));
        assert_eq!(map.master(1), Some(1));
        assert_eq!(map.replicas(0), vec![1]);
        assert_eq!(map.replicas(2), Vec::<usize>::new());
    }

    #[test]
    fn test_cluster_config_without_vbucket_map() {
        let doc = r#"{
            "nodes": [
                {"hostname": "a:8091", "ports": {"direct": 11211}, "status": "healthy"}
            ]
        }"#;
        let cfg: ClusterConfig = serde_json::from_str(doc).unwrap();
        assert!(cfg.vbucket_map.is_none());
        assert_eq!(cfg.healthy_endpoints(), vec![Endpoint::new("a", 11211)]);
    }

    #[test]
    fn test_unknown_status_maps_to_unhealthy() {
        let doc = r#"{"hostname": "a:8091", "ports": {"direct": 1}, "status": "zombie"}"#;
        let node: ClusterNode = serde_json::from_str(doc).unwrap();
        assert_eq!(node.status, NodeStatus::Unhealthy);
    }

    #[test]
    fn test_snapshot_equality_drives_change_detection() {
        let doc = r#"{"nodes": [{"hostname": "a:8091", "ports": {"direct": 1}, "status": "healthy"}]}"#;
        let a: ClusterConfig = serde_json::from_str(doc).unwrap();
        let b: ClusterConfig = serde_json::from_str(doc).unwrap();
        assert_eq!(a, b);
    }
}
