//! Quorum coordination against scripted replicas

use bytes::Bytes;
use parking_lot::Mutex;
use ringkv::cluster::{
    GetOutcome, HashRing, QuorumCoordinator, ReplicaClient, ReplicaReply, ReplicationFactor,
    WriteOutcome,
};
use ringkv::storage::Engine;
use ringkv::{Error, Result, StorageConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ME: &str = "n0";
const NODES: [&str; 3] = ["n0", "n1", "n2"];
const TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone)]
enum Replica {
    Healthy(Arc<Engine>),
    Down,
    Slow,
    /// Answers 200 without a timestamp header.
    Malformed,
}

#[derive(Default)]
struct ScriptedClient {
    replicas: Mutex<HashMap<String, Replica>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn set(&self, node: &str, replica: Replica) {
        self.replicas.lock().insert(node.to_string(), replica);
    }

    fn replica(&self, node: &str) -> Replica {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replicas.lock().get(node).cloned().unwrap_or(Replica::Down)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn slow_reply() -> Result<ReplicaReply> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(ReplicaReply::new(500))
}

fn down() -> Result<ReplicaReply> {
    Err(Error::Http("connection refused".into()))
}

impl ReplicaClient for ScriptedClient {
    async fn get(&self, node: &str, key: &[u8]) -> Result<ReplicaReply> {
        match self.replica(node) {
            Replica::Healthy(engine) => Ok(match GetOutcome::from_cell(engine.get_cell(key)?) {
                GetOutcome::Found { value, timestamp } => {
                    ReplicaReply::new(200).with_timestamp(timestamp).with_body(value)
                }
                GetOutcome::NotFound {
                    timestamp: Some(timestamp),
                } => ReplicaReply::new(404).with_timestamp(timestamp),
                GetOutcome::NotFound { timestamp: None } => ReplicaReply::new(404),
            }),
            Replica::Down => down(),
            Replica::Slow => slow_reply().await,
            Replica::Malformed => Ok(ReplicaReply::new(200).with_body("no timestamp")),
        }
    }

    async fn put(&self, node: &str, key: &[u8], value: Bytes) -> Result<ReplicaReply> {
        match self.replica(node) {
            Replica::Healthy(engine) => {
                engine.upsert(Bytes::copy_from_slice(key), value)?;
                Ok(ReplicaReply::new(201))
            }
            Replica::Down => down(),
            Replica::Slow => slow_reply().await,
            Replica::Malformed => Ok(ReplicaReply::new(200)),
        }
    }

    async fn delete(&self, node: &str, key: &[u8]) -> Result<ReplicaReply> {
        match self.replica(node) {
            Replica::Healthy(engine) => {
                engine.remove(Bytes::copy_from_slice(key))?;
                Ok(ReplicaReply::new(202))
            }
            Replica::Down => down(),
            Replica::Slow => slow_reply().await,
            Replica::Malformed => Ok(ReplicaReply::new(200)),
        }
    }
}

struct Cluster {
    _dirs: Vec<TempDir>,
    engines: HashMap<&'static str, Arc<Engine>>,
    client: Arc<ScriptedClient>,
    coordinator: QuorumCoordinator<ScriptedClient>,
}

impl Cluster {
    /// Every node healthy, coordinated by `n0`.
    fn new() -> Self {
        let mut dirs = Vec::new();
        let mut engines = HashMap::new();
        for node in NODES {
            let dir = TempDir::new().unwrap();
            let engine = Engine::open(StorageConfig::new(dir.path()).flush_workers(1)).unwrap();
            engines.insert(node, Arc::new(engine));
            dirs.push(dir);
        }

        let client = Arc::new(ScriptedClient::default());
        for node in &NODES[1..] {
            client.set(node, Replica::Healthy(Arc::clone(&engines[node])));
        }
        let ring = Arc::new(HashRing::new(NODES, ME).unwrap());
        let coordinator =
            QuorumCoordinator::new(Arc::clone(&engines[ME]), ring, Arc::clone(&client), TIMEOUT);

        Self {
            _dirs: dirs,
            engines,
            client,
            coordinator,
        }
    }

    fn engine(&self, node: &str) -> &Arc<Engine> {
        &self.engines[node]
    }

    fn rf(ack: usize, from: usize) -> Option<ReplicationFactor> {
        Some(ReplicationFactor::new(ack, from).unwrap())
    }
}

#[tokio::test]
async fn test_write_then_read_all_replicas() {
    let cluster = Cluster::new();
    let key = Bytes::from_static(b"k");

    let outcome = cluster
        .coordinator
        .put(key.clone(), Bytes::from_static(b"v"), Cluster::rf(3, 3), false)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Created);
    for node in NODES {
        assert_eq!(cluster.engine(node).get(b"k").unwrap().unwrap(), "v");
    }

    let read = cluster.coordinator.get(key.clone(), None, false).await.unwrap();
    assert!(matches!(read, GetOutcome::Found { ref value, .. } if value == "v"));

    let outcome = cluster.coordinator.delete(key.clone(), None, false).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Accepted);
    let read = cluster.coordinator.get(key, Cluster::rf(3, 3), false).await.unwrap();
    assert!(matches!(read, GetOutcome::NotFound { timestamp: Some(_) }));
}

#[tokio::test]
async fn test_quorum_tolerates_one_slow_replica() {
    let cluster = Cluster::new();
    cluster.client.set("n2", Replica::Slow);

    let started = Instant::now();
    let outcome = cluster
        .coordinator
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), Cluster::rf(2, 3), false)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Created);
    assert!(started.elapsed() < Duration::from_secs(2));

    let read = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), Cluster::rf(2, 3), false)
        .await
        .unwrap();
    assert!(read.is_found());
}

#[tokio::test]
async fn test_quorum_fails_with_one_success() {
    let cluster = Cluster::new();
    cluster.client.set("n1", Replica::Down);
    cluster.client.set("n2", Replica::Slow);

    let started = Instant::now();
    let result = cluster
        .coordinator
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), Cluster::rf(2, 3), false)
        .await;
    assert!(matches!(
        result,
        Err(Error::Quorum {
            acks: 1,
            required: 2
        })
    ));
    // The slow replica is cut off by the per-request timeout.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unreachable_quorum_fails_fast() {
    let cluster = Cluster::new();
    cluster.client.set("n1", Replica::Down);
    cluster.client.set("n2", Replica::Down);

    let result = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), Cluster::rf(2, 3), false)
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Quorum { acks: 1, required: 2 }));
    assert_eq!(err.to_http_status().as_u16(), 504);
}

#[tokio::test]
async fn test_malformed_reply_counts_as_failure() {
    let cluster = Cluster::new();
    cluster.client.set("n1", Replica::Malformed);
    cluster.client.set("n2", Replica::Down);

    let result = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), Cluster::rf(2, 3), false)
        .await;
    assert!(matches!(result, Err(Error::Quorum { acks: 1, .. })));

    // A write answered with the wrong status is a failure too.
    let result = cluster
        .coordinator
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), Cluster::rf(2, 3), false)
        .await;
    assert!(matches!(result, Err(Error::Quorum { acks: 1, .. })));
}

#[tokio::test]
async fn test_read_returns_newest_replica_value() {
    let cluster = Cluster::new();
    cluster.engine("n0").upsert("k", "old").unwrap();
    cluster.engine("n1").upsert("k", "newer").unwrap();
    cluster.engine("n2").upsert("k", "newest").unwrap();

    let read = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), Cluster::rf(3, 3), false)
        .await
        .unwrap();
    assert!(matches!(read, GetOutcome::Found { ref value, .. } if value == "newest"));
}

#[tokio::test]
async fn test_newer_tombstone_hides_older_values() {
    let cluster = Cluster::new();
    cluster.engine("n0").upsert("k", "v").unwrap();
    cluster.engine("n1").upsert("k", "v").unwrap();
    cluster.engine("n2").remove("k").unwrap();

    let read = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), Cluster::rf(3, 3), false)
        .await
        .unwrap();
    assert!(matches!(read, GetOutcome::NotFound { timestamp: Some(_) }));
}

#[tokio::test]
async fn test_absent_everywhere() {
    let cluster = Cluster::new();
    let read = cluster
        .coordinator
        .get(Bytes::from_static(b"never"), None, false)
        .await
        .unwrap();
    assert_eq!(read, GetOutcome::NotFound { timestamp: None });
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let cluster = Cluster::new();

    let too_wide = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), Cluster::rf(2, 4), false)
        .await;
    assert!(matches!(too_wide, Err(Error::InvalidReplication(_))));

    let empty_key = cluster
        .coordinator
        .put(Bytes::new(), Bytes::from_static(b"v"), None, false)
        .await;
    assert!(matches!(empty_key, Err(Error::InvalidKey(_))));
    assert_eq!(cluster.client.calls(), 0);
}

#[tokio::test]
async fn test_proxied_requests_stay_local() {
    let cluster = Cluster::new();

    let outcome = cluster
        .coordinator
        .put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), None, true)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Created);
    assert_eq!(cluster.engine("n0").get(b"k").unwrap().unwrap(), "v");
    assert!(cluster.engine("n1").get(b"k").unwrap().is_none());

    let read = cluster
        .coordinator
        .get(Bytes::from_static(b"k"), None, true)
        .await
        .unwrap();
    assert!(read.is_found());
    assert_eq!(cluster.client.calls(), 0);
}

#[tokio::test]
async fn test_coordinator_outside_replica_set() {
    let cluster = Cluster::new();
    let ring = cluster.coordinator.ring();
    let key = (0..)
        .map(|i| format!("key-{}", i))
        .find(|k| ring.primary_for(k.as_bytes()) != ME)
        .unwrap();
    let owner = ring.primary_for(key.as_bytes());

    let outcome = cluster
        .coordinator
        .put(Bytes::from(key.clone()), Bytes::from_static(b"v"), Cluster::rf(1, 1), false)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Created);
    assert!(cluster.engine(ME).get(key.as_bytes()).unwrap().is_none());
    assert_eq!(
        cluster.engine(&owner).get(key.as_bytes()).unwrap().unwrap(),
        "v"
    );
}
