//! # ringkv
//!
//! A replicated key-value store built from:
//! - an LSM storage engine per node (MemTable, background flush, sorted runs, compaction)
//! - a consistent-hash ring with virtual nodes for key placement
//! - tunable `ack/from` quorums for reads, writes and deletes
//! - an HTTP API; any node coordinates any request
//!
//! ## Architecture
//!
//! ```text
//!            client
//!              │ HTTP /v0/entity?id=k&replicas=2/3
//! ┌────────────▼────────────┐
//! │   Coordinating node     │  ring.replicas(k, 3)
//! │   QuorumCoordinator     ├──────────────┬──────────────┐
//! └────────────┬────────────┘   X-OK-Proxy │              │
//!              │ local                     │              │
//! ┌────────────▼────────────┐   ┌─────────▼──────┐   ┌───▼────────────┐
//! │ Engine                  │   │ Replica B      │   │ Replica C      │
//! │  MemTable ─► flush pool │   │  (Engine)      │   │  (Engine)      │
//! │  sorted runs on disk    │   └────────────────┘   └────────────────┘
//! └─────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! ringkv-node serve \
//!   --id http://127.0.0.1:8080 \
//!   --bind 127.0.0.1:8080 \
//!   --data ./node-1 \
//!   --cluster http://127.0.0.1:8080,http://127.0.0.1:8081,http://127.0.0.1:8082
//! ```
//!
//! ### Use the CLI
//! ```bash
//! ringkv put my-key --value hello --replicas 2/3
//! ringkv get my-key
//! ringkv delete my-key
//! ringkv range a c
//! ringkv compact
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use cluster::{HashRing, QuorumCoordinator, ReplicationFactor};
pub use common::{Error, NodeConfig, Result, StorageConfig};
pub use server::NodeServer;
pub use storage::Engine;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
