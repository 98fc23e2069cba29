//! What replicas answer and what the coordinator makes of it

use crate::common::{Error, Result};
use crate::storage::Cell;
use bytes::Bytes;

/// Result of a read, as seen by one replica or merged across several.
///
/// Timestamps are write times (always positive). A `NotFound` with a
/// timestamp is a deletion; without one the key was never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Found { value: Bytes, timestamp: i64 },
    NotFound { timestamp: Option<i64> },
}

impl GetOutcome {
    pub fn from_cell(cell: Option<Cell>) -> Self {
        match cell {
            None => GetOutcome::NotFound { timestamp: None },
            Some(cell) => {
                let timestamp = cell.write_time();
                match cell.into_value() {
                    Some(value) => GetOutcome::Found { value, timestamp },
                    None => GetOutcome::NotFound {
                        timestamp: Some(timestamp),
                    },
                }
            }
        }
    }

    /// Decode a replica's reply to a proxied GET.
    ///
    /// 200 must carry a timestamp. 404 carries one only for deleted keys.
    pub fn from_reply(reply: ReplicaReply) -> Result<Self> {
        match (reply.status, reply.timestamp) {
            (200, Some(timestamp)) => Ok(GetOutcome::Found {
                value: reply.body,
                timestamp,
            }),
            (200, None) => Err(Error::Protocol("200 without timestamp".into())),
            (404, timestamp) => Ok(GetOutcome::NotFound { timestamp }),
            (status, _) => Err(Error::Http(format!("replica answered {}", status))),
        }
    }

    pub fn timestamp(&self) -> Option<i64> {
        match self {
            GetOutcome::Found { timestamp, .. } => Some(*timestamp),
            GetOutcome::NotFound { timestamp } => *timestamp,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, GetOutcome::Found { .. })
    }

    /// Newest of the outcomes. A deletion wins a timestamp tie; `NotFound`
    /// without timestamp only wins when nothing else was seen.
    pub fn merge(outcomes: impl IntoIterator<Item = GetOutcome>) -> GetOutcome {
        let mut newest = GetOutcome::NotFound { timestamp: None };
        for outcome in outcomes {
            let Some(timestamp) = outcome.timestamp() else {
                continue;
            };
            let replace = match newest.timestamp() {
                None => true,
                Some(current) => {
                    timestamp > current || (timestamp == current && !outcome.is_found())
                }
            };
            if replace {
                newest = outcome;
            }
        }
        newest
    }
}

/// Result of a successful replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// PUT acknowledged by a quorum
    Created,
    /// DELETE acknowledged by a quorum
    Accepted,
}

impl WriteOutcome {
    /// Status a replica answers with when it applied the write.
    pub fn status(&self) -> u16 {
        match self {
            WriteOutcome::Created => 201,
            WriteOutcome::Accepted => 202,
        }
    }
}

/// Raw answer of a replica to a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaReply {
    pub status: u16,
    pub timestamp: Option<i64>,
    pub body: Bytes,
}

impl ReplicaReply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            timestamp: None,
            body: Bytes::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}
