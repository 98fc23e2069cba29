//! The sorted-table capability shared by MemTables and sorted runs

use crate::common::Result;
use crate::storage::cell::Row;
use bytes::Bytes;

/// Ascending, finite stream of rows. I/O failures surface as `Err` items.
pub type RowIter = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Anything iterable in key order with a generation number.
pub trait SortedTable: Send + Sync {
    /// Rows with `key >= from`, ascending, one row per key.
    fn iter_from(&self, from: &[u8]) -> Result<RowIter>;

    /// Sum of the flushed-encoding sizes of the rows.
    fn size_in_bytes(&self) -> u64;

    /// Recency of the table; higher is newer.
    fn generation(&self) -> u64;
}

/// A table that accepts writes. Only MemTables implement this.
pub trait MutableTable: SortedTable {
    fn upsert(&self, key: Bytes, value: Bytes);

    fn remove(&self, key: Bytes);
}
