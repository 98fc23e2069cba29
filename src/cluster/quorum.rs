//! Quorum coordination of reads and writes
//!
//! The node that receives a client request coordinates it: it computes the
//! replica set from the ring, applies the operation locally if it is one of
//! the replicas, proxies it to the others and answers once `ack` replicas
//! succeeded. Once `from - ack + 1` replicas failed the quorum is out of reach
//! and the request fails without waiting for the rest.
//!
//! Remote requests run as detached tasks: after the coordinator has its
//! answer, stragglers still complete (a write keeps replicating) but their
//! results are ignored.

use crate::cluster::outcome::{GetOutcome, ReplicaReply, WriteOutcome};
use crate::cluster::replication::ReplicationFactor;
use crate::cluster::ring::{HashRing, NodeId};
use crate::common::{validate_key, Error, Result};
use crate::storage::Engine;
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Transport used to proxy a request to another replica.
///
/// Implementations mark the request as proxied so the replica applies it
/// locally instead of coordinating again.
pub trait ReplicaClient: Send + Sync + 'static {
    fn get(&self, node: &str, key: &[u8]) -> impl Future<Output = Result<ReplicaReply>> + Send;

    fn put(
        &self,
        node: &str,
        key: &[u8],
        value: Bytes,
    ) -> impl Future<Output = Result<ReplicaReply>> + Send;

    fn delete(&self, node: &str, key: &[u8]) -> impl Future<Output = Result<ReplicaReply>> + Send;
}

/// Success and failure counts of one fan-out.
struct Tally {
    required: usize,
    replicas: usize,
    acks: usize,
    failures: usize,
}

impl Tally {
    fn new(rf: ReplicationFactor, replicas: usize) -> Self {
        Self {
            required: rf.ack(),
            replicas,
            acks: 0,
            failures: 0,
        }
    }

    fn record<T>(&mut self, node: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.acks += 1;
                Some(value)
            }
            Err(e) => {
                if e.is_replica_failure() {
                    tracing::warn!("Replica {} failed: {}", node, e);
                } else {
                    tracing::error!("Replica {} failed: {}", node, e);
                }
                self.failures += 1;
                None
            }
        }
    }

    fn decided(&self) -> bool {
        self.acks >= self.required || self.failures + self.required > self.replicas
    }

    fn finish(&self) -> Result<()> {
        if self.acks >= self.required {
            Ok(())
        } else {
            Err(Error::Quorum {
                acks: self.acks,
                required: self.required,
            })
        }
    }
}

type Pending = FuturesUnordered<JoinHandle<(NodeId, Result<ReplicaReply>)>>;

pub struct QuorumCoordinator<C> {
    engine: Arc<Engine>,
    ring: Arc<HashRing>,
    client: Arc<C>,
    timeout: Duration,
}

impl<C: ReplicaClient> QuorumCoordinator<C> {
    pub fn new(engine: Arc<Engine>, ring: Arc<HashRing>, client: Arc<C>, timeout: Duration) -> Self {
        Self {
            engine,
            ring,
            client,
            timeout,
        }
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// `rf` if given, the cluster majority otherwise; checked against the cluster size.
    pub fn resolve(&self, rf: Option<ReplicationFactor>) -> Result<ReplicationFactor> {
        let nodes = self.ring.len();
        let rf = rf.unwrap_or_else(|| ReplicationFactor::quorum(nodes));
        rf.validate(nodes)?;
        Ok(rf)
    }

    pub async fn get(
        &self,
        key: Bytes,
        rf: Option<ReplicationFactor>,
        proxied: bool,
    ) -> Result<GetOutcome> {
        validate_key(&key)?;
        if proxied {
            return self.local_get(key).await;
        }
        let rf = self.resolve(rf)?;
        let replicas = self.ring.replicas(&key, rf.from())?;
        let mut tally = Tally::new(rf, replicas.len());

        let request_key = key.clone();
        let mut pending = self.spawn_remote(&replicas, move |client, node| {
            let key = request_key.clone();
            async move { client.get(&node, &key).await }
        });

        let mut outcomes = Vec::with_capacity(replicas.len());
        if self.is_replica(&replicas) {
            let local = self.local_get(key.clone()).await;
            outcomes.extend(tally.record(self.ring.me(), local));
        }
        while !tally.decided() {
            let Some((node, reply)) = next_reply(&mut pending).await else {
                break;
            };
            let outcome = reply.and_then(GetOutcome::from_reply);
            outcomes.extend(tally.record(&node, outcome));
        }

        tally.finish()?;
        Ok(GetOutcome::merge(outcomes))
    }

    pub async fn put(
        &self,
        key: Bytes,
        value: Bytes,
        rf: Option<ReplicationFactor>,
        proxied: bool,
    ) -> Result<WriteOutcome> {
        validate_key(&key)?;
        if proxied {
            return self.local_put(key, value).await;
        }
        let rf = self.resolve(rf)?;
        let replicas = self.ring.replicas(&key, rf.from())?;

        let (request_key, request_value) = (key.clone(), value.clone());
        let pending = self.spawn_remote(&replicas, move |client, node| {
            let (key, value) = (request_key.clone(), request_value.clone());
            async move { client.put(&node, &key, value).await }
        });

        let local = if self.is_replica(&replicas) {
            Some(self.local_put(key, value).await)
        } else {
            None
        };
        self.collect_writes(rf, replicas.len(), local, pending, WriteOutcome::Created)
            .await
    }

    pub async fn delete(
        &self,
        key: Bytes,
        rf: Option<ReplicationFactor>,
        proxied: bool,
    ) -> Result<WriteOutcome> {
        validate_key(&key)?;
        if proxied {
            return self.local_delete(key).await;
        }
        let rf = self.resolve(rf)?;
        let replicas = self.ring.replicas(&key, rf.from())?;

        let request_key = key.clone();
        let pending = self.spawn_remote(&replicas, move |client, node| {
            let key = request_key.clone();
            async move { client.delete(&node, &key).await }
        });

        let local = if self.is_replica(&replicas) {
            Some(self.local_delete(key).await)
        } else {
            None
        };
        self.collect_writes(rf, replicas.len(), local, pending, WriteOutcome::Accepted)
            .await
    }

    async fn collect_writes(
        &self,
        rf: ReplicationFactor,
        replicas: usize,
        local: Option<Result<WriteOutcome>>,
        mut pending: Pending,
        expected: WriteOutcome,
    ) -> Result<WriteOutcome> {
        let mut tally = Tally::new(rf, replicas);
        if let Some(local) = local {
            tally.record(self.ring.me(), local);
        }
        while !tally.decided() {
            let Some((node, reply)) = next_reply(&mut pending).await else {
                break;
            };
            let applied = reply.and_then(|reply| {
                if reply.status == expected.status() {
                    Ok(())
                } else {
                    Err(Error::Http(format!("replica answered {}", reply.status)))
                }
            });
            tally.record(&node, applied);
        }

        tally.finish()?;
        Ok(expected)
    }

    fn is_replica(&self, replicas: &[NodeId]) -> bool {
        replicas.iter().any(|node| self.ring.is_me(node))
    }

    /// Start one timed request per remote replica.
    fn spawn_remote<F, Fut>(&self, replicas: &[NodeId], request: F) -> Pending
    where
        F: Fn(Arc<C>, NodeId) -> Fut,
        Fut: Future<Output = Result<ReplicaReply>> + Send + 'static,
    {
        replicas
            .iter()
            .filter(|node| !self.ring.is_me(node))
            .map(|node| {
                let call = request(Arc::clone(&self.client), node.clone());
                let node = node.clone();
                let timeout = self.timeout;
                tokio::spawn(async move {
                    let reply = match tokio::time::timeout(timeout, call).await {
                        Ok(reply) => reply,
                        Err(_) => Err(Error::Timeout(format!("no answer within {:?}", timeout))),
                    };
                    (node, reply)
                })
            })
            .collect()
    }

    async fn local_get(&self, key: Bytes) -> Result<GetOutcome> {
        self.local(move |engine| engine.get_cell(&key).map(GetOutcome::from_cell))
            .await
    }

    async fn local_put(&self, key: Bytes, value: Bytes) -> Result<WriteOutcome> {
        self.local(move |engine| engine.upsert(key, value).map(|_| WriteOutcome::Created))
            .await
    }

    async fn local_delete(&self, key: Bytes) -> Result<WriteOutcome> {
        self.local(move |engine| engine.remove(key).map(|_| WriteOutcome::Accepted))
            .await
    }

    /// Run a storage operation off the async runtime.
    async fn local<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> Result<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|e| Error::Internal(format!("storage task failed: {}", e)))?
    }
}

async fn next_reply(pending: &mut Pending) -> Option<(NodeId, Result<ReplicaReply>)> {
    let joined = pending.next().await?;
    Some(joined.unwrap_or_else(|e| {
        (
            "unknown".to_string(),
            Err(Error::Internal(format!("replica task failed: {}", e))),
        )
    }))
}
