//! Common utilities and types shared across ringkv

pub mod config;
pub mod error;
pub mod utils;

pub use config::{NodeConfig, ReplicationConfig, StorageConfig};
pub use error::{Error, Result};
pub use utils::{crc32, format_bytes, parse_duration, timestamp_now_micros, validate_key};
