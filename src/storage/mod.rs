//! Local LSM storage engine
//!
//! Writes land in an in-memory [`MemTable`]. Full tables are frozen and written
//! by background workers as immutable [`SortedRun`] files; reads merge every
//! table newest-first. [`Engine::compact`] folds all tables into one run.

pub mod cell;
pub mod engine;
pub mod flush;
pub mod memtable;
pub mod merge;
pub mod sstable;
pub mod table;

pub use cell::{Cell, Row};
pub use engine::{Engine, EngineStats, Range};
pub use flush::{FlushJob, MemTablePool};
pub use memtable::MemTable;
pub use sstable::SortedRun;
pub use table::{MutableTable, RowIter, SortedTable};
