//! K-way merge of sorted tables
//!
//! `combine` opens one cursor per table, `collapse` merges them and keeps the
//! newest row of every key. The merge is a single forward pass holding at most
//! one pending row per source.

use crate::common::{Error, Result};
use crate::storage::cell::{merge_order, Row};
use crate::storage::table::{RowIter, SortedTable};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Open a cursor at `from` on every table. Order of `tables` breaks ties, first wins.
pub fn combine(tables: &[Arc<dyn SortedTable>], from: &[u8]) -> Result<Vec<RowIter>> {
    tables.iter().map(|table| table.iter_from(from)).collect()
}

/// Merge ascending sources into one ascending stream with unique keys.
pub fn collapse(sources: Vec<RowIter>) -> Collapse {
    let mut merge = Collapse {
        heap: BinaryHeap::with_capacity(sources.len()),
        sources,
        last_key: None,
        error: None,
    };
    for source in 0..merge.sources.len() {
        merge.refill(source);
    }
    merge
}

/// Drop tombstones, leaving only live rows.
pub fn live<I>(rows: I) -> impl Iterator<Item = Result<Row>>
where
    I: Iterator<Item = Result<Row>>,
{
    rows.filter(|row| !matches!(row, Ok(row) if row.cell.is_tombstone()))
}

struct HeapEntry {
    row: Row,
    source: usize,
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: the row that merges first must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        merge_order(&other.row, &self.row).then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// Iterator returned by [`collapse`]. Ends after the first error it yields.
pub struct Collapse {
    heap: BinaryHeap<HeapEntry>,
    sources: Vec<RowIter>,
    last_key: Option<Bytes>,
    error: Option<Error>,
}

impl Collapse {
    fn refill(&mut self, source: usize) {
        if self.error.is_some() {
            return;
        }
        match self.sources[source].next() {
            Some(Ok(row)) => self.heap.push(HeapEntry { row, source }),
            Some(Err(e)) => self.error = Some(e),
            None => {}
        }
    }
}

impl Iterator for Collapse {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.error.take() {
                self.heap.clear();
                self.sources.clear();
                return Some(Err(e));
            }

            let HeapEntry { row, source } = self.heap.pop()?;
            self.refill(source);

            if self.last_key.as_ref() == Some(&row.key) {
                continue;
            }
            // A refill error only concerns keys after this one; it surfaces on the next call.
            self.last_key = Some(row.key.clone());
            return Some(Ok(row));
        }
    }
}
