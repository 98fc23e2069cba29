//! Versioned cells and rows
//!
//! A cell is a `(timestamp, payload)` pair. The sign of the timestamp encodes
//! liveness: positive for a value, negative for a tombstone. `abs(timestamp)`
//! is the logical write time and is never 0.

use bytes::Bytes;
use std::cmp::Ordering;

/// Generation carried by rows of in-memory tables. Outranks every sorted run.
pub const MEMTABLE_GENERATION: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    timestamp: i64,
    value: Bytes,
}

impl Cell {
    /// A live value written at `timestamp` (must be positive).
    pub fn live(timestamp: i64, value: Bytes) -> Self {
        debug_assert!(timestamp > 0, "live cell needs a positive timestamp");
        Self {
            timestamp: timestamp.abs().max(1),
            value,
        }
    }

    /// A deletion marker written at `timestamp`.
    pub fn tombstone(timestamp: i64) -> Self {
        Self {
            timestamp: -timestamp.abs().max(1),
            value: Bytes::new(),
        }
    }

    /// Rebuild a cell from its signed on-disk timestamp.
    pub fn from_signed(timestamp: i64, value: Bytes) -> crate::Result<Self> {
        match timestamp.cmp(&0) {
            Ordering::Greater => Ok(Self { timestamp, value }),
            Ordering::Less => Ok(Self::tombstone(timestamp)),
            Ordering::Equal => Err(crate::Error::Corrupted("cell with zero timestamp".into())),
        }
    }

    /// Signed timestamp as stored on disk.
    pub fn signed_timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Logical write time, `abs(timestamp)`.
    pub fn write_time(&self) -> i64 {
        self.timestamp.abs()
    }

    pub fn is_tombstone(&self) -> bool {
        self.timestamp < 0
    }

    /// Payload of a live cell, `None` for a tombstone.
    pub fn value(&self) -> Option<&Bytes> {
        if self.is_tombstone() {
            None
        } else {
            Some(&self.value)
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        if self.is_tombstone() {
            None
        } else {
            Some(self.value)
        }
    }
}

/// A key with its cell, tagged with the generation of the table it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Bytes,
    pub cell: Cell,
    pub generation: u64,
}

impl Row {
    pub fn new(key: Bytes, cell: Cell, generation: u64) -> Self {
        Self {
            key,
            cell,
            generation,
        }
    }

    /// Bytes this row occupies in a sorted run.
    pub fn flushed_size(&self) -> u64 {
        flushed_size(self.key.len(), self.cell.value().map(Bytes::len))
    }
}

/// `key_len:u32 | key | timestamp:i64 | [value_len:u64 | value]`
pub fn flushed_size(key_len: usize, value_len: Option<usize>) -> u64 {
    let base = 4 + key_len as u64 + 8;
    match value_len {
        Some(len) => base + 8 + len as u64,
        None => base,
    }
}

/// Merge order: key ascending, then write time descending, then generation descending.
///
/// The first row of a key group under this order is the newest version of that key.
pub fn merge_order(a: &Row, b: &Row) -> Ordering {
    a.key
        .cmp(&b.key)
        .then_with(|| b.cell.write_time().cmp(&a.cell.write_time()))
        .then_with(|| b.generation.cmp(&a.generation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &'static [u8], cell: Cell, generation: u64) -> Row {
        Row::new(Bytes::from_static(key), cell, generation)
    }

    #[test]
    fn test_tombstone_sign() {
        let cell = Cell::tombstone(42);
        assert!(cell.is_tombstone());
        assert_eq!(cell.signed_timestamp(), -42);
        assert_eq!(cell.write_time(), 42);
        assert!(cell.value().is_none());

        let live = Cell::live(42, Bytes::from_static(b"v"));
        assert!(!live.is_tombstone());
        assert_eq!(live.value().unwrap().as_ref(), b"v");
    }

    #[test]
    fn test_zero_timestamp_rejected() {
        assert!(Cell::from_signed(0, Bytes::new()).is_err());
        assert!(Cell::from_signed(-7, Bytes::new()).unwrap().is_tombstone());
    }

    #[test]
    fn test_flushed_size() {
        let live = row(b"abc", Cell::live(1, Bytes::from_static(b"12345")), 0);
        assert_eq!(live.flushed_size(), 4 + 3 + 8 + 8 + 5);
        let dead = row(b"abc", Cell::tombstone(1), 0);
        assert_eq!(dead.flushed_size(), 4 + 3 + 8);
    }

    #[test]
    fn test_merge_order() {
        let newer = row(b"k", Cell::live(20, Bytes::new()), 1);
        let older = row(b"k", Cell::live(10, Bytes::new()), 9);
        assert_eq!(merge_order(&newer, &older), Ordering::Less);

        // Equal write time: the newer generation comes first.
        let mem = row(b"k", Cell::tombstone(10), MEMTABLE_GENERATION);
        let disk = row(b"k", Cell::live(10, Bytes::new()), 3);
        assert_eq!(merge_order(&mem, &disk), Ordering::Less);

        let a = row(b"a", Cell::live(1, Bytes::new()), 0);
        assert_eq!(merge_order(&a, &mem), Ordering::Less);
    }
}
