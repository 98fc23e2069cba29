//! Replication layer: key placement and quorum coordination

pub mod outcome;
pub mod quorum;
pub mod replication;
pub mod ring;

pub use outcome::{GetOutcome, ReplicaReply, WriteOutcome};
pub use quorum::{QuorumCoordinator, ReplicaClient};
pub use replication::ReplicationFactor;
pub use ring::{HashRing, NodeId, RandomShuffle, Rebalance, SeededShuffle, VNode, PARTITIONS_COUNT};
