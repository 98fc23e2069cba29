//! Replication factor `ack/from`

use crate::common::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Contact `from` replicas, succeed once `ack` of them agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationFactor {
    ack: usize,
    from: usize,
}

impl ReplicationFactor {
    /// Requires `1 <= ack <= from`.
    pub fn new(ack: usize, from: usize) -> Result<Self> {
        if ack == 0 || from < ack {
            return Err(Error::InvalidReplication(format!("{}/{}", ack, from)));
        }
        Ok(Self { ack, from })
    }

    /// Majority of a cluster of `nodes`: `(nodes / 2 + 1) / nodes`.
    pub fn quorum(nodes: usize) -> Self {
        let from = nodes.max(1);
        Self {
            ack: from / 2 + 1,
            from,
        }
    }

    /// Parse `"ack/from"`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidReplication(s.to_string());
        let (ack, from) = s.split_once('/').ok_or_else(invalid)?;
        let ack = ack.trim().parse().map_err(|_| invalid())?;
        let from = from.trim().parse().map_err(|_| invalid())?;
        Self::new(ack, from)
    }

    /// Check that a cluster of `nodes` can serve this factor.
    pub fn validate(&self, nodes: usize) -> Result<()> {
        if self.from > nodes {
            return Err(Error::InvalidReplication(format!(
                "{} exceeds cluster size {}",
                self, nodes
            )));
        }
        Ok(())
    }

    pub fn ack(&self) -> usize {
        self.ack
    }

    pub fn from(&self) -> usize {
        self.from
    }
}

impl FromStr for ReplicationFactor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ReplicationFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ack, self.from)
    }
}
