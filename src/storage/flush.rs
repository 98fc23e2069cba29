//! MemTable pool and background flushing
//!
//! The pool owns every table of the engine: the active MemTable, frozen
//! MemTables waiting for their flush, and the sorted runs on disk. One
//! reader-writer lock guards that set:
//!
//! - writers and readers take it shared (a write lands in whichever table is
//!   active while it holds the lock, so a swap never loses it),
//! - swaps, compaction scheduling, flush completion and close take it exclusive.
//!
//! Frozen tables are handed to a fixed set of worker threads through a bounded
//! queue. A full queue blocks the writer that triggered the swap, which is the
//! engine's backpressure. Jobs are always enqueued after the lock is released.

use crate::common::{format_bytes, Error, Result, StorageConfig};
use crate::storage::cell::flushed_size;
use crate::storage::engine::EngineStats;
use crate::storage::memtable::MemTable;
use crate::storage::merge;
use crate::storage::sstable::SortedRun;
use crate::storage::table::{MutableTable, RowIter, SortedTable};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Work for the flush workers.
pub enum FlushJob {
    /// Persist a frozen MemTable.
    Normal { generation: u64, rows: RowIter },
    /// Persist the collapsed contents of every table as a single run.
    Compaction { generation: u64, rows: RowIter },
    /// Persist the last MemTable. Sent once, by `close`.
    Shutdown { generation: u64, rows: RowIter },
}

impl FlushJob {
    pub fn generation(&self) -> u64 {
        match self {
            FlushJob::Normal { generation, .. }
            | FlushJob::Compaction { generation, .. }
            | FlushJob::Shutdown { generation, .. } => *generation,
        }
    }
}

impl std::fmt::Debug for FlushJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            FlushJob::Normal { .. } => "Normal",
            FlushJob::Compaction { .. } => "Compaction",
            FlushJob::Shutdown { .. } => "Shutdown",
        };
        f.debug_struct(kind)
            .field("generation", &self.generation())
            .finish()
    }
}

struct TableSet {
    active: Arc<MemTable>,
    /// Frozen MemTables by the generation their run will get.
    pending: BTreeMap<u64, Arc<MemTable>>,
    runs: BTreeMap<u64, Arc<SortedRun>>,
    next_generation: u64,
    /// Generations of compactions written but not yet installed.
    compacting: BTreeSet<u64>,
    /// Generation of the last installed compaction. Anything below it is
    /// contained in that compaction's run.
    watermark: u64,
    closed: bool,
    /// Taken by shutdown. A job built under the lock leaves with its own clone.
    queue: Option<Sender<FlushJob>>,
}

impl TableSet {
    /// Every table, newest first.
    fn tables(&self) -> Vec<Arc<dyn SortedTable>> {
        let mut tables: Vec<Arc<dyn SortedTable>> =
            Vec::with_capacity(1 + self.pending.len() + self.runs.len());
        tables.push(self.active.clone());
        for table in self.pending.values().rev() {
            tables.push(table.clone());
        }
        for run in self.runs.values().rev() {
            tables.push(run.clone());
        }
        tables
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Replace the active table with an empty one and queue the old one as pending.
    fn freeze(&mut self) -> (u64, Arc<MemTable>) {
        let generation = self.allocate_generation();
        let frozen = std::mem::replace(&mut self.active, Arc::new(MemTable::new()));
        self.pending.insert(generation, frozen.clone());
        (generation, frozen)
    }
}

/// A job paired with the queue handle it was created with.
///
/// Workers only stop once every handle is gone, so a job that got one is
/// always processed, even if the pool closes before it is sent.
struct Submission {
    job: FlushJob,
    queue: Sender<FlushJob>,
}

impl Submission {
    /// Blocks while the queue is full.
    fn send(self) -> Result<()> {
        self.queue.send(self.job).map_err(|e| {
            tracing::error!(
                "Flush queue disconnected, generation {} stays in memory",
                e.into_inner().generation()
            );
            Error::Closed
        })
    }
}

/// State shared between the pool and its workers.
struct Shared {
    dir: PathBuf,
    threshold: u64,
    tables: RwLock<TableSet>,
    /// Failure of the final flush, reported by `close`.
    shutdown_error: Mutex<Option<Error>>,
}

impl Shared {
    fn is_full(&self, active: &MemTable, incoming: u64) -> bool {
        !active.is_empty() && active.size_in_bytes() + incoming >= self.threshold
    }

    /// Freeze the active table if `incoming` more bytes would reach the threshold.
    fn freeze_if_full(&self, incoming: u64) -> Result<Option<Submission>> {
        {
            let tables = self.tables.read();
            if tables.closed {
                return Err(Error::Closed);
            }
            if !self.is_full(&tables.active, incoming) {
                return Ok(None);
            }
        }

        let mut tables = self.tables.write();
        let Some(queue) = tables.queue.clone() else {
            return Err(Error::Closed);
        };
        // Another writer may have swapped while we waited for the lock.
        if !self.is_full(&tables.active, incoming) {
            return Ok(None);
        }
        let (generation, frozen) = tables.freeze();
        tracing::debug!(
            "Froze MemTable as generation {} ({} rows, {} bytes)",
            generation,
            frozen.len(),
            frozen.size_in_bytes()
        );
        Ok(Some(Submission {
            job: FlushJob::Normal {
                generation,
                rows: frozen.iter_from(&[])?,
            },
            queue,
        }))
    }

    fn schedule_compaction(&self) -> Result<Submission> {
        let mut tables = self.tables.write();
        let Some(queue) = tables.queue.clone() else {
            return Err(Error::Closed);
        };
        let sources = merge::combine(&tables.tables(), &[])?;
        let generation = tables.allocate_generation();
        tables.compacting.insert(generation);
        tracing::info!(
            "Scheduled compaction {} over {} tables",
            generation,
            sources.len()
        );
        Ok(Submission {
            job: FlushJob::Compaction {
                generation,
                rows: Box::new(merge::collapse(sources)),
            },
            queue,
        })
    }

    /// Mark the pool closed and freeze the last table. `None` if already closed.
    fn shutdown(&self) -> Result<Option<Submission>> {
        let mut tables = self.tables.write();
        let Some(queue) = tables.queue.take() else {
            return Ok(None);
        };
        tables.closed = true;
        let (generation, frozen) = tables.freeze();
        Ok(Some(Submission {
            job: FlushJob::Shutdown {
                generation,
                rows: frozen.iter_from(&[])?,
            },
            queue,
        }))
    }

    fn handle(&self, job: FlushJob) {
        match job {
            FlushJob::Normal { generation, rows } => {
                let result = self.write_run(generation, rows);
                self.finish_flush(generation, result);
            }
            FlushJob::Shutdown { generation, rows } => match self.write_run(generation, rows) {
                Ok(run) => {
                    tracing::info!(
                        "Final MemTable flushed ({} rows)",
                        run.as_ref().map(SortedRun::len).unwrap_or(0)
                    );
                    self.finish_flush(generation, Ok(run));
                }
                Err(e) => {
                    tracing::error!("Final flush of generation {} failed: {}", generation, e);
                    *self.shutdown_error.lock() = Some(e);
                }
            },
            FlushJob::Compaction { generation, rows } => {
                let result = self.write_run(generation, rows);
                self.finish_compaction(generation, result);
            }
        }
    }

    fn write_run(&self, generation: u64, rows: RowIter) -> Result<Option<SortedRun>> {
        let path = self.dir.join(SortedRun::file_name(generation));
        SortedRun::write(&path, generation, rows)
    }

    fn finish_flush(&self, generation: u64, result: Result<Option<SortedRun>>) {
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                // The table stays pending, so its rows remain readable.
                tracing::error!("Flush of generation {} failed: {}", generation, e);
                return;
            }
        };

        let mut tables = self.tables.write();
        tables.pending.remove(&generation);
        let Some(run) = run else {
            return;
        };
        if generation < tables.watermark {
            tracing::debug!(
                "Generation {} already compacted into {}, dropping its run",
                generation,
                tables.watermark
            );
            remove_run_file(run.path());
            return;
        }
        tracing::debug!(
            "Flushed generation {} ({} rows, {})",
            generation,
            run.len(),
            format_bytes(run.size_in_bytes())
        );
        tables.runs.insert(generation, Arc::new(run));
    }

    fn finish_compaction(&self, generation: u64, result: Result<Option<SortedRun>>) {
        let mut tables = self.tables.write();
        tables.compacting.remove(&generation);

        let run = match result {
            Ok(run) => run,
            Err(e) => {
                tracing::error!("Compaction {} failed: {}", generation, e);
                return;
            }
        };
        if generation < tables.watermark {
            // A later compaction already covers everything this one read.
            if let Some(run) = run {
                remove_run_file(run.path());
            }
            return;
        }

        let kept = tables.runs.split_off(&generation);
        let superseded = std::mem::replace(&mut tables.runs, kept);
        tables.pending.retain(|pending, _| *pending > generation);
        let size = run.as_ref().map_or(0, |run| run.size_in_bytes());
        if let Some(run) = run {
            tables.runs.insert(generation, Arc::new(run));
        }
        tables.watermark = generation;

        for run in superseded.values() {
            remove_run_file(run.path());
        }
        tracing::info!(
            "Compaction {} installed ({}), replaced {} runs",
            generation,
            format_bytes(size),
            superseded.len()
        );
    }

    fn stats(&self) -> EngineStats {
        let tables = self.tables.read();
        EngineStats {
            active_rows: tables.active.len(),
            active_bytes: tables.active.size_in_bytes(),
            pending_tables: tables.pending.len(),
            pending_bytes: tables.pending.values().map(|t| t.size_in_bytes()).sum(),
            runs: tables.runs.len(),
            run_bytes: tables.runs.values().map(|r| r.size_in_bytes()).sum(),
            next_generation: tables.next_generation,
            compactions_in_flight: tables.compacting.len(),
            closed: tables.closed,
        }
    }
}

fn remove_run_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("Failed to delete run {}: {}", path.display(), e);
    }
}

/// Sends the worker id when the worker exits, panics included.
struct ExitGuard {
    id: usize,
    exited: Sender<usize>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.exited.send(self.id);
    }
}

fn run_worker(id: usize, shared: Arc<Shared>, jobs: Receiver<FlushJob>, exited: Sender<usize>) {
    let _guard = ExitGuard { id, exited };
    tracing::debug!("Flush worker {} started", id);
    // Ends once every sender is gone and the queue is drained.
    for job in jobs.iter() {
        shared.handle(job);
    }
    tracing::debug!("Flush worker {} stopped", id);
}

/// Owner of the engine's tables and flush workers.
pub struct MemTablePool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exited: Receiver<usize>,
    grace: Duration,
}

impl MemTablePool {
    /// Start the pool over the runs found on disk.
    pub fn start(
        config: &StorageConfig,
        runs: BTreeMap<u64, Arc<SortedRun>>,
        next_generation: u64,
    ) -> Result<Self> {
        let (queue, jobs) = crossbeam_channel::bounded(config.flush_queue_capacity());
        let shared = Arc::new(Shared {
            dir: config.data_dir.clone(),
            threshold: config.flush_threshold_bytes,
            tables: RwLock::new(TableSet {
                active: Arc::new(MemTable::new()),
                pending: BTreeMap::new(),
                runs,
                next_generation,
                compacting: BTreeSet::new(),
                watermark: 0,
                closed: false,
                queue: Some(queue),
            }),
            shutdown_error: Mutex::new(None),
        });

        let (exit_tx, exited) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(config.flush_workers);
        for id in 0..config.flush_workers {
            let shared = Arc::clone(&shared);
            let jobs = jobs.clone();
            let exit_tx = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ringkv-flush-{}", id))
                .spawn(move || run_worker(id, shared, jobs, exit_tx))?;
            workers.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            exited,
            grace: config.shutdown_grace_duration(),
        })
    }

    pub fn upsert(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.make_room(flushed_size(key.len(), Some(value.len())))?;
        let tables = self.shared.tables.read();
        if tables.closed {
            return Err(Error::Closed);
        }
        tables.active.upsert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: Bytes) -> Result<()> {
        self.make_room(flushed_size(key.len(), None))?;
        let tables = self.shared.tables.read();
        if tables.closed {
            return Err(Error::Closed);
        }
        tables.active.remove(key);
        Ok(())
    }

    /// Cursors at `from` over every table, newest first.
    pub fn snapshot(&self, from: &[u8]) -> Result<Vec<RowIter>> {
        let tables = self.shared.tables.read();
        merge::combine(&tables.tables(), from)
    }

    /// Queue a full compaction.
    pub fn compact(&self) -> Result<()> {
        self.shared.schedule_compaction()?.send()
    }

    /// Flush the last MemTable and stop the workers. Idempotent.
    ///
    /// Fails if the final flush failed; the MemTable then stays in memory only.
    pub fn close(&self) -> Result<()> {
        let Some(submission) = self.shared.shutdown()? else {
            return Ok(());
        };
        tracing::info!("Closing storage engine in {}", self.shared.dir.display());
        submission.send()?;
        self.await_workers()?;
        match self.shared.shutdown_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats()
    }

    fn make_room(&self, incoming: u64) -> Result<()> {
        match self.shared.freeze_if_full(incoming)? {
            Some(submission) => submission.send(),
            None => Ok(()),
        }
    }

    fn await_workers(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + self.grace;
        let mut running = handles.len();
        while running > 0 {
            match self.exited.recv_deadline(deadline) {
                Ok(_) => running -= 1,
                Err(_) => {
                    tracing::warn!(
                        "{} flush workers still busy after {:?}, abandoning them",
                        running,
                        self.grace
                    );
                    return Err(Error::Timeout(format!(
                        "{} flush workers did not stop",
                        running
                    )));
                }
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Flush worker panicked");
            }
        }
        Ok(())
    }
}
