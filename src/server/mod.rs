//! HTTP node: API handlers, replica transport and server lifecycle

pub mod client;
pub mod http;
pub mod server;

pub use client::HttpReplicaClient;
pub use http::{create_router, NodeState, PROXY_HEADER, TIMESTAMP_HEADER};
pub use server::NodeServer;
