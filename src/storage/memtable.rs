//! In-memory sorted table
//!
//! Backed by a lock-free skip list so writers only need the pool's shared
//! lock. Iterators are lazy cursors over the shared map: they observe writes
//! that land after creation but stay ascending.

use crate::common::{timestamp_now_micros, Result};
use crate::storage::cell::{flushed_size, Cell, Row, MEMTABLE_GENERATION};
use crate::storage::table::{MutableTable, RowIter, SortedTable};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

const WRITE_STRIPES: usize = 32;

#[derive(Debug, Default)]
pub struct MemTable {
    map: Arc<SkipMap<Bytes, Cell>>,
    size: AtomicI64,
    /// Serializes writers of the same key so the replaced cell is the one measured.
    stripes: [Mutex<()>; WRITE_STRIPES],
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest cell for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<Cell> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
        self.size.store(0, Ordering::Release);
    }

    fn put(&self, key: Bytes, cell: Cell) {
        let added = flushed_size(key.len(), cell.value().map(Bytes::len)) as i64;
        let _stripe = self.stripes[xxh3_64(&key) as usize % WRITE_STRIPES].lock();
        let replaced = self
            .map
            .get(&key[..])
            .map(|entry| flushed_size(entry.key().len(), entry.value().value().map(Bytes::len)))
            .unwrap_or(0) as i64;
        self.map.insert(key, cell);
        self.size.fetch_add(added - replaced, Ordering::AcqRel);
    }
}

impl SortedTable for MemTable {
    fn iter_from(&self, from: &[u8]) -> Result<RowIter> {
        Ok(Box::new(MemTableIter {
            map: Arc::clone(&self.map),
            cursor: Bound::Included(Bytes::copy_from_slice(from)),
        }))
    }

    fn size_in_bytes(&self) -> u64 {
        self.size.load(Ordering::Acquire).max(0) as u64
    }

    fn generation(&self) -> u64 {
        MEMTABLE_GENERATION
    }
}

impl MutableTable for MemTable {
    fn upsert(&self, key: Bytes, value: Bytes) {
        self.put(key, Cell::live(timestamp_now_micros(), value));
    }

    fn remove(&self, key: Bytes) {
        self.put(key, Cell::tombstone(timestamp_now_micros()));
    }
}

/// Cursor that re-seeks past the last yielded key on every step.
struct MemTableIter {
    map: Arc<SkipMap<Bytes, Cell>>,
    cursor: Bound<Bytes>,
}

impl Iterator for MemTableIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, cell) = {
            let entry = match &self.cursor {
                Bound::Included(key) => self.map.lower_bound(Bound::Included(&key[..])),
                Bound::Excluded(key) => self.map.lower_bound(Bound::Excluded(&key[..])),
                Bound::Unbounded => self.map.front(),
            }?;
            (entry.key().clone(), entry.value().clone())
        };
        self.cursor = Bound::Excluded(key.clone());
        Some(Ok(Row::new(key, cell, MEMTABLE_GENERATION)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(table: &MemTable, from: &[u8]) -> Vec<Vec<u8>> {
        table
            .iter_from(from)
            .unwrap()
            .map(|row| row.unwrap().key.to_vec())
            .collect()
    }

    #[test]
    fn test_upsert_and_get() {
        let table = MemTable::new();
        table.upsert(Bytes::from_static(b"k"), Bytes::from_static(b"v1"));
        table.upsert(Bytes::from_static(b"k"), Bytes::from_static(b"v2"));

        let cell = table.get(b"k").unwrap();
        assert_eq!(cell.value().unwrap().as_ref(), b"v2");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let table = MemTable::new();
        table.upsert(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        table.remove(Bytes::from_static(b"k"));
        assert!(table.get(b"k").unwrap().is_tombstone());

        // Removing a key that was never written still records a tombstone.
        table.remove(Bytes::from_static(b"ghost"));
        assert!(table.get(b"ghost").unwrap().is_tombstone());
    }

    #[test]
    fn test_size_tracks_overwrites() {
        let table = MemTable::new();
        table.upsert(Bytes::from_static(b"key"), Bytes::from(vec![0u8; 100]));
        assert_eq!(table.size_in_bytes(), 4 + 3 + 8 + 8 + 100);

        table.upsert(Bytes::from_static(b"key"), Bytes::from(vec![0u8; 10]));
        assert_eq!(table.size_in_bytes(), 4 + 3 + 8 + 8 + 10);

        table.remove(Bytes::from_static(b"key"));
        assert_eq!(table.size_in_bytes(), 4 + 3 + 8);

        table.remove(Bytes::from_static(b"key"));
        assert_eq!(table.size_in_bytes(), 4 + 3 + 8);

        table.clear();
        assert_eq!(table.size_in_bytes(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_size_exact_under_concurrent_overwrites() {
        let table = MemTable::new();
        std::thread::scope(|scope| {
            for writer in 0..8usize {
                let table = &table;
                scope.spawn(move || {
                    for i in 0..2000usize {
                        let len = (writer * 7 + i) % 64;
                        table.upsert(Bytes::from_static(b"k"), Bytes::from(vec![0u8; len]));
                    }
                });
            }
        });

        let last = table.get(b"k").unwrap();
        assert_eq!(
            table.size_in_bytes(),
            flushed_size(1, last.value().map(Bytes::len))
        );
    }

    #[test]
    fn test_iter_from() {
        let table = MemTable::new();
        for key in ["d", "a", "c", "b"] {
            table.upsert(Bytes::from(key), Bytes::from_static(b"x"));
        }
        assert_eq!(keys(&table, b""), vec![b"a", b"b", b"c", b"d"]);
        assert_eq!(keys(&table, b"b"), vec![b"b", b"c", b"d"]);
        assert_eq!(keys(&table, b"bb"), vec![b"c", b"d"]);
        assert!(keys(&table, b"z").is_empty());
    }

    #[test]
    fn test_iterator_sees_later_writes_ahead_of_cursor() {
        let table = MemTable::new();
        table.upsert(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        table.upsert(Bytes::from_static(b"c"), Bytes::from_static(b"3"));

        let mut iter = table.iter_from(b"").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key.as_ref(), b"a");
        table.upsert(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(iter.next().unwrap().unwrap().key.as_ref(), b"b");
        assert_eq!(iter.next().unwrap().unwrap().key.as_ref(), b"c");
        assert!(iter.next().is_none());
    }
}
