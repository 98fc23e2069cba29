//! Storage engine facade
//!
//! Opens a data directory, recovers the sorted runs found there and serves
//! point reads, range scans, writes and compaction on top of the MemTable pool.

use crate::common::{validate_key, Result, StorageConfig};
use crate::storage::cell::{Cell, Row};
use crate::storage::flush::MemTablePool;
use crate::storage::merge;
use crate::storage::sstable::{SortedRun, TMP_EXTENSION};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Point-in-time counters of the engine's tables.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub active_rows: usize,
    pub active_bytes: u64,
    pub pending_tables: usize,
    pub pending_bytes: u64,
    pub runs: usize,
    pub run_bytes: u64,
    pub next_generation: u64,
    pub compactions_in_flight: usize,
    pub closed: bool,
}

pub struct Engine {
    dir: PathBuf,
    pool: MemTablePool,
}

impl Engine {
    /// Open (or create) the engine in `config.data_dir`.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let runs = discover_runs(&config.data_dir)?;
        let next_generation = runs.keys().next_back().map(|g| g + 1).unwrap_or(0);

        tracing::info!(
            "Opened storage in {} ({} runs, next generation {})",
            config.data_dir.display(),
            runs.len(),
            next_generation
        );

        let pool = MemTablePool::start(&config, runs, next_generation)?;
        Ok(Self {
            dir: config.data_dir,
            pool,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    /// Current value of `key`; `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.get_cell(key)?.and_then(Cell::into_value))
    }

    /// Newest cell of `key`, tombstones included.
    pub fn get_cell(&self, key: &[u8]) -> Result<Option<Cell>> {
        let mut rows = merge::collapse(self.pool.snapshot(key)?);
        match rows.next() {
            Some(Ok(row)) if row.key == key => Ok(Some(row.cell)),
            Some(Err(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Live pairs with `from <= key < to`, ascending. `to = None` scans to the end.
    ///
    /// The scan is lazy: files are opened now, rows are read as the iterator advances.
    pub fn range(&self, from: &[u8], to: Option<&[u8]>) -> Result<Range> {
        let rows = merge::collapse(self.pool.snapshot(from)?);
        Ok(Range {
            rows: Box::new(merge::live(rows)),
            to: to.map(Bytes::copy_from_slice),
            done: false,
        })
    }

    pub fn upsert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        self.pool.upsert(key, value.into())
    }

    /// Record a tombstone for `key`, whether or not it exists.
    pub fn remove(&self, key: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        self.pool.remove(key)
    }

    /// Merge every table into a single run, in the background.
    pub fn compact(&self) -> Result<()> {
        self.pool.compact()
    }

    /// Flush the last MemTable and stop the background workers.
    pub fn close(&self) -> Result<()> {
        self.pool.close()
    }

    pub fn stats(&self) -> EngineStats {
        self.pool.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.pool.close() {
            tracing::error!("Failed to close storage in {}: {}", self.dir.display(), e);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("dir", &self.dir).finish()
    }
}

/// Lazy range scan returned by [`Engine::range`].
pub struct Range {
    rows: Box<dyn Iterator<Item = Result<Row>> + Send>,
    to: Option<Bytes>,
    done: bool,
}

impl Iterator for Range {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let row = match self.rows.next()? {
                Ok(row) => row,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if matches!(&self.to, Some(to) if row.key >= *to) {
                self.done = true;
                return None;
            }
            if let Some(value) = row.cell.into_value() {
                return Some(Ok((row.key, value)));
            }
        }
        None
    }
}

/// Load every run in `dir`, clearing leftovers of interrupted writes.
fn discover_runs(dir: &Path) -> Result<BTreeMap<u64, Arc<SortedRun>>> {
    let mut runs = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!("Ignoring non UTF-8 file {}", path.display());
            continue;
        };

        if path.extension().is_some_and(|ext| ext == TMP_EXTENSION) {
            tracing::warn!("Removing incomplete run {}", path.display());
            fs::remove_file(&path)?;
            continue;
        }
        match SortedRun::parse_generation(name) {
            Some(generation) => {
                let run = SortedRun::open(&path, generation)?;
                runs.insert(generation, Arc::new(run));
            }
            None => tracing::warn!("Ignoring unrelated file {}", path.display()),
        }
    }
    Ok(runs)
}
