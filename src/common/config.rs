//! Configuration for ringkv nodes

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID: the base URL other nodes use to reach this node
    pub node_id: String,

    /// Bind address for the HTTP API
    pub bind_addr: SocketAddr,

    /// Every node of the cluster, this one included
    pub cluster: Vec<String>,

    /// Logging level
    pub log_level: String,

    /// Local storage engine config
    pub storage: StorageConfig,

    /// Replication and partitioning config
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "http://127.0.0.1:8080".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cluster: Vec::new(),
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Load config from an optional TOML file, then `RINGKV__*` environment variables.
    ///
    /// Not validated: callers apply their overrides first, then call [`NodeConfig::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("RINGKV")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cluster")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Cluster membership, falling back to a single-node cluster of this node.
    pub fn members(&self) -> Vec<String> {
        if self.cluster.is_empty() {
            vec![self.node_id.clone()]
        } else {
            self.cluster.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if !self.cluster.is_empty() && !self.cluster.contains(&self.node_id) {
            return Err(crate::Error::InvalidConfig(format!(
                "node {} is not part of the cluster {:?}",
                self.node_id, self.cluster
            )));
        }
        if self.replication.partitions == 0 {
            return Err(crate::Error::InvalidConfig(
                "partitions must be positive".into(),
            ));
        }
        self.storage.validate()
    }
}

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the sorted-run files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// MemTable size that triggers a flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold_bytes: u64,

    /// Number of flush/compaction worker threads
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,

    /// How long close() waits for the workers before giving up on them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_flush_threshold() -> u64 {
    4 * 1024 * 1024
}
fn default_flush_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 1
}
fn default_shutdown_grace() -> u64 {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flush_threshold_bytes: default_flush_threshold(),
            flush_workers: default_flush_workers(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn flush_threshold_bytes(mut self, bytes: u64) -> Self {
        self.flush_threshold_bytes = bytes;
        self
    }

    pub fn flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Capacity of the flush queue: the backpressure bound.
    pub fn flush_queue_capacity(&self) -> usize {
        self.flush_workers + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold_bytes == 0 {
            return Err(crate::Error::InvalidConfig(
                "flush_threshold_bytes must be positive".into(),
            ));
        }
        if self.flush_workers == 0 {
            return Err(crate::Error::InvalidConfig(
                "flush_workers must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Per-replica request timeout
    #[serde(default = "default_replica_timeout")]
    pub replica_timeout_ms: u64,

    /// Number of virtual nodes on the ring
    #[serde(default = "default_partitions")]
    pub partitions: usize,
}

fn default_replica_timeout() -> u64 {
    1_000
}
fn default_partitions() -> usize {
    crate::cluster::ring::PARTITIONS_COUNT
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_timeout_ms: default_replica_timeout(),
            partitions: default_partitions(),
        }
    }
}

impl ReplicationConfig {
    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.members(), vec![config.node_id.clone()]);
        assert_eq!(config.storage.flush_threshold_bytes, 4 * 1024 * 1024);
        assert!(config.storage.flush_workers >= 2);
        assert_eq!(
            config.storage.flush_queue_capacity(),
            config.storage.flush_workers + 1
        );
        assert_eq!(config.replication.replica_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_builder() {
        let storage = StorageConfig::new("/tmp/ringkv")
            .flush_threshold_bytes(1024)
            .flush_workers(2)
            .shutdown_grace(Duration::from_millis(500));
        assert_eq!(storage.data_dir, PathBuf::from("/tmp/ringkv"));
        assert_eq!(storage.flush_threshold_bytes, 1024);
        assert_eq!(storage.flush_queue_capacity(), 3);
        assert_eq!(storage.shutdown_grace_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_storage_config() {
        assert!(StorageConfig::new("x").flush_workers(0).validate().is_err());
        assert!(StorageConfig::new("x")
            .flush_threshold_bytes(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_node_outside_cluster_rejected() {
        let config = NodeConfig {
            cluster: vec!["http://a:1".into(), "http://b:2".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
node_id = "http://127.0.0.1:9001"
bind_addr = "127.0.0.1:9001"
cluster = ["http://127.0.0.1:9001", "http://127.0.0.1:9002"]

[storage]
data_dir = "/var/lib/ringkv"
flush_threshold_bytes = 65536

[replication]
replica_timeout_ms = 250
"#
        )
        .unwrap();
        drop(file);

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.node_id, "http://127.0.0.1:9001");
        assert_eq!(config.cluster.len(), 2);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/ringkv"));
        assert_eq!(config.storage.flush_threshold_bytes, 65536);
        assert_eq!(config.replication.replica_timeout_ms, 250);
        assert_eq!(config.replication.partitions, 32);
    }
}
