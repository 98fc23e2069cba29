//! Consistent hash ring
//!
//! The ring is split into a fixed number of evenly spaced virtual nodes
//! (partitions). Each vnode is owned by one physical node; initial ownership
//! is round-robin over the sorted member list. A key belongs to the first vnode
//! clockwise from its hash.
//!
//! Every node builds its ring independently, so placement must be a pure
//! function of membership. Membership changes go through a [`Rebalance`]
//! strategy; the default one is seeded from the node id and therefore gives
//! the same answer on every node.

use crate::common::{Error, Result};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use xxhash_rust::xxh3::xxh3_64;

/// Default number of virtual nodes on the ring
pub const PARTITIONS_COUNT: usize = 32;

/// Physical node identity (its base URL)
pub type NodeId = String;

/// Position of a key on the ring
pub fn token_of(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// How vnodes move when membership changes.
pub trait Rebalance: Send + Sync {
    /// Choose `count` of `tokens` for `node`, which just joined.
    fn claim(&self, node: &str, tokens: &[u64], count: usize) -> Vec<u64>;

    /// Choose a new owner for `token`, previously owned by `leaving`.
    fn adopt(&self, leaving: &str, token: u64, candidates: &[NodeId]) -> NodeId;
}

/// Deterministic reassignment: every node computes the same ring.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeededShuffle;

impl Rebalance for SeededShuffle {
    fn claim(&self, node: &str, tokens: &[u64], count: usize) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(xxh3_64(node.as_bytes()));
        let mut chosen = tokens.to_vec();
        chosen.shuffle(&mut rng);
        chosen.truncate(count);
        chosen
    }

    fn adopt(&self, leaving: &str, token: u64, candidates: &[NodeId]) -> NodeId {
        let mut rng = StdRng::seed_from_u64(xxh3_64(leaving.as_bytes()) ^ token);
        candidates[rng.gen_range(0..candidates.len())].clone()
    }
}

/// Uniformly random reassignment. Rings diverge across nodes; single-node use only.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomShuffle;

impl Rebalance for RandomShuffle {
    fn claim(&self, _node: &str, tokens: &[u64], count: usize) -> Vec<u64> {
        tokens
            .choose_multiple(&mut rand::thread_rng(), count)
            .copied()
            .collect()
    }

    fn adopt(&self, _leaving: &str, _token: u64, candidates: &[NodeId]) -> NodeId {
        candidates[rand::thread_rng().gen_range(0..candidates.len())].clone()
    }
}

/// A vnode and its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VNode {
    pub token: u64,
    pub owner: NodeId,
}

struct RingState {
    vnodes: BTreeMap<u64, NodeId>,
    nodes: BTreeSet<NodeId>,
}

pub struct HashRing {
    me: NodeId,
    state: RwLock<RingState>,
    strategy: Box<dyn Rebalance>,
}

impl HashRing {
    /// Build a ring with [`PARTITIONS_COUNT`] vnodes.
    pub fn new<I, S>(nodes: I, me: impl Into<NodeId>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Self::with_partitions(nodes, me, PARTITIONS_COUNT)
    }

    pub fn with_partitions<I, S>(nodes: I, me: impl Into<NodeId>, partitions: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().map(Into::into).collect();
        if nodes.is_empty() {
            return Err(Error::InvalidConfig("cluster has no nodes".into()));
        }
        if partitions == 0 {
            return Err(Error::InvalidConfig("partitions must be positive".into()));
        }

        let step = u64::MAX / partitions as u64;
        let vnodes = nodes
            .iter()
            .cycle()
            .take(partitions)
            .enumerate()
            .map(|(i, owner)| (i as u64 * step, owner.clone()))
            .collect();

        Ok(Self {
            me: me.into(),
            state: RwLock::new(RingState { vnodes, nodes }),
            strategy: Box::new(SeededShuffle),
        })
    }

    /// Replace the reassignment strategy used by `add_node`/`remove_node`.
    pub fn with_strategy(mut self, strategy: impl Rebalance + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Owner of the first vnode at or clockwise after the key's token.
    pub fn primary_for(&self, key: &[u8]) -> NodeId {
        let token = token_of(key);
        let state = self.state.read();
        state
            .vnodes
            .range(token..)
            .chain(state.vnodes.range(..token))
            .map(|(_, owner)| owner.clone())
            .next()
            .unwrap_or_else(|| self.me.clone())
    }

    /// First `count` distinct owners walking clockwise from the key's token.
    ///
    /// May return fewer than `count` nodes if some members own no vnode.
    pub fn replicas(&self, key: &[u8], count: usize) -> Result<Vec<NodeId>> {
        let token = token_of(key);
        let state = self.state.read();
        if count > state.nodes.len() {
            return Err(Error::InvalidReplication(format!(
                "{} replicas requested from {} nodes",
                count,
                state.nodes.len()
            )));
        }

        let mut owners: Vec<NodeId> = Vec::with_capacity(count);
        for (_, owner) in state.vnodes.range(token..).chain(state.vnodes.range(..token)) {
            if owners.len() == count {
                break;
            }
            if !owners.contains(owner) {
                owners.push(owner.clone());
            }
        }
        Ok(owners)
    }

    /// Add a member and hand it `partitions / members` vnodes. False if already present.
    pub fn add_node(&self, node: impl Into<NodeId>) -> bool {
        let node = node.into();
        let mut state = self.state.write();
        if !state.nodes.insert(node.clone()) {
            return false;
        }
        let count = state.vnodes.len() / state.nodes.len();
        let tokens: Vec<u64> = state.vnodes.keys().copied().collect();
        for token in self.strategy.claim(&node, &tokens, count) {
            state.vnodes.insert(token, node.clone());
        }
        tracing::info!("Node {} joined the ring with {} vnodes", node, count);
        true
    }

    /// Remove a member, giving its vnodes to the others. False if absent or last.
    pub fn remove_node(&self, node: &str) -> bool {
        let mut state = self.state.write();
        if !state.nodes.contains(node) || state.nodes.len() == 1 {
            return false;
        }
        state.nodes.remove(node);
        let candidates: Vec<NodeId> = state.nodes.iter().cloned().collect();
        let orphaned: Vec<u64> = state
            .vnodes
            .iter()
            .filter(|(_, owner)| owner.as_str() == node)
            .map(|(token, _)| *token)
            .collect();
        for token in &orphaned {
            let owner = self.strategy.adopt(node, *token, &candidates);
            state.vnodes.insert(*token, owner);
        }
        tracing::info!(
            "Node {} left the ring, {} vnodes reassigned",
            node,
            orphaned.len()
        );
        true
    }

    /// Members, sorted.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.state.read().nodes.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn is_me(&self, node: &str) -> bool {
        self.me == node
    }

    /// Vnodes in token order.
    pub fn vnodes(&self) -> Vec<VNode> {
        self.state
            .read()
            .vnodes
            .iter()
            .map(|(token, owner)| VNode {
                token: *token,
                owner: owner.clone(),
            })
            .collect()
    }

    /// Number of vnodes owned by `node`.
    pub fn owned_by(&self, node: &str) -> usize {
        self.state
            .read()
            .vnodes
            .values()
            .filter(|owner| owner.as_str() == node)
            .count()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("HashRing")
            .field("me", &self.me)
            .field("nodes", &state.nodes)
            .field("partitions", &state.vnodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(nodes: &[&str]) -> HashRing {
        HashRing::new(nodes.iter().copied(), nodes[0]).unwrap()
    }

    #[test]
    fn test_round_robin_assignment() {
        let ring = ring(&["c", "a", "b"]);
        let owners: Vec<NodeId> = ring.vnodes().into_iter().map(|v| v.owner).collect();
        assert_eq!(owners.len(), PARTITIONS_COUNT);
        assert_eq!(&owners[..4], &["a", "b", "c", "a"]);
        assert_eq!(ring.owned_by("a"), 11);
        assert_eq!(ring.owned_by("b"), 11);
        assert_eq!(ring.owned_by("c"), 10);
    }

    #[test]
    fn test_tokens_evenly_spaced() {
        let ring = HashRing::with_partitions(["a"], "a", 4).unwrap();
        let tokens: Vec<u64> = ring.vnodes().iter().map(|v| v.token).collect();
        let step = u64::MAX / 4;
        assert_eq!(tokens, vec![0, step, 2 * step, 3 * step]);
    }

    #[test]
    fn test_empty_cluster_rejected() {
        assert!(HashRing::new(Vec::<String>::new(), "a").is_err());
        assert!(HashRing::with_partitions(["a"], "a", 0).is_err());
    }

    #[test]
    fn test_replicas_distinct_and_led_by_primary() {
        let ring = ring(&["a", "b", "c", "d"]);
        for i in 0..100 {
            let key = format!("key-{}", i);
            let replicas = ring.replicas(key.as_bytes(), 3).unwrap();
            assert_eq!(replicas.len(), 3);
            assert_eq!(replicas[0], ring.primary_for(key.as_bytes()));
            let unique: BTreeSet<_> = replicas.iter().collect();
            assert_eq!(unique.len(), 3);
        }
        assert!(ring.replicas(b"k", 5).is_err());
        assert!(ring.replicas(b"k", 0).unwrap().is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let ring = ring(&["a", "b"]);
        assert!(ring.add_node("c"));
        assert!(ring.owned_by("a") > 0);
        assert!(ring.owned_by("b") > 0);
        assert!(!ring.add_node("c"));
        assert_eq!(ring.owned_by("c"), PARTITIONS_COUNT / 3);
        assert_eq!(ring.len(), 3);

        assert!(ring.remove_node("c"));
        assert!(!ring.remove_node("c"));
        assert_eq!(ring.owned_by("c"), 0);
        assert!(ring.owned_by("a") > 0);
        assert!(ring.owned_by("b") > 0);
        assert_eq!(ring.owned_by("a") + ring.owned_by("b"), PARTITIONS_COUNT);
    }

    #[test]
    fn test_last_node_stays() {
        let ring = ring(&["a"]);
        assert!(!ring.remove_node("a"));
        assert_eq!(ring.primary_for(b"anything"), "a");
    }

    #[test]
    fn test_seeded_rebalance_is_deterministic() {
        let left = ring(&["a", "b", "c"]);
        let right = HashRing::new(["c", "b", "a"], "b").unwrap();
        left.add_node("d");
        right.add_node("d");
        left.remove_node("a");
        right.remove_node("a");
        assert_eq!(left.vnodes(), right.vnodes());
    }

    #[test]
    fn test_random_strategy_keeps_counts() {
        let ring = ring(&["a", "b"]).with_strategy(RandomShuffle);
        assert!(ring.add_node("c"));
        assert_eq!(ring.owned_by("c"), PARTITIONS_COUNT / 3);
        assert!(ring.remove_node("a"));
        assert_eq!(ring.owned_by("a"), 0);
    }
}
